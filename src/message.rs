//! Message section model and the pluggable section codec.
//!
//! The engine never parses AMQP described types itself; it consumes a
//! [`SectionCodec`] that can decode the next section from a byte slice and
//! encode a section back to bytes. [`BincodeSectionCodec`] is the default
//! used by tests and in-process peers.
//!
//! [`Message`] is a lazy view over a completed delivery's payload: a section
//! is decoded the first time an accessor needs it and cached; a decode
//! failure is terminal for the whole view.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frames::{FieldValue, Fields};

/// Transport and durability hints carried at the head of a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub durable: bool,
    pub priority: u8,
    pub ttl_millis: Option<u32>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

/// Immutable application-assigned message metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub message_id: Option<String>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub group_id: Option<String>,
}

/// One decoded message section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Section {
    Header(Header),
    DeliveryAnnotations(Fields),
    MessageAnnotations(Fields),
    Properties(Properties),
    ApplicationProperties(Fields),
    Data(Bytes),
    AmqpValue(FieldValue),
    AmqpSequence(Vec<FieldValue>),
    Footer(Fields),
}

impl Section {
    /// Whether this section is one of the body kinds.
    #[must_use]
    pub const fn is_body(&self) -> bool {
        matches!(
            self,
            Section::Data(_) | Section::AmqpValue(_) | Section::AmqpSequence(_)
        )
    }
}

/// Errors raised by a [`SectionCodec`].
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CodecError {
    /// The bytes did not decode to a valid section.
    #[error("malformed section: {0}")]
    Malformed(String),
    /// A section could not be encoded.
    #[error("failed to encode section: {0}")]
    Encode(String),
}

impl From<CodecError> for crate::error::EngineError {
    fn from(error: CodecError) -> Self { crate::error::EngineError::Decode(error.to_string()) }
}

/// Decode and encode message sections.
///
/// Implementations are shared across the session task and application
/// threads, hence `Send + Sync`.
pub trait SectionCodec: Send + Sync {
    /// Decode the next section from the front of `bytes`.
    ///
    /// Returns the section and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] when the bytes are not a valid
    /// section.
    fn decode_next(&self, bytes: &[u8]) -> Result<(Section, usize), CodecError>;

    /// Encode a section to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] when the section cannot be encoded.
    fn encode(&self, section: &Section) -> Result<Vec<u8>, CodecError>;
}

/// Default codec backed by `bincode`'s serde integration.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeSectionCodec;

impl SectionCodec for BincodeSectionCodec {
    fn decode_next(&self, bytes: &[u8]) -> Result<(Section, usize), CodecError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|err| CodecError::Malformed(err.to_string()))
    }

    fn encode(&self, section: &Section) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(section, bincode::config::standard())
            .map_err(|err| CodecError::Encode(err.to_string()))
    }
}

/// Encode `sections` back-to-back into one payload.
///
/// # Errors
///
/// Returns the first [`CodecError`] raised by the codec.
pub fn encode_sections(
    codec: &dyn SectionCodec,
    sections: &[Section],
) -> Result<Bytes, CodecError> {
    let mut buffer = Vec::new();
    for section in sections {
        buffer.extend_from_slice(&codec.encode(section)?);
    }
    Ok(Bytes::from(buffer))
}

/// Lazily decoded view over a completed delivery payload.
///
/// Sections are decoded front-to-back on demand and cached. The first decode
/// failure poisons the view: every subsequent accessor returns the same
/// error.
pub struct Message {
    raw: Bytes,
    cursor: usize,
    sections: Vec<Section>,
    failed: Option<CodecError>,
    codec: Arc<dyn SectionCodec>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("raw_len", &self.raw.len())
            .field("decoded", &self.sections.len())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Message {
    /// Wrap `raw` payload bytes with the codec used to decode them.
    #[must_use]
    pub fn new(raw: Bytes, codec: Arc<dyn SectionCodec>) -> Self {
        Self {
            raw,
            cursor: 0,
            sections: Vec::new(),
            failed: None,
            codec,
        }
    }

    fn exhausted(&self) -> bool { self.cursor >= self.raw.len() }

    /// Decode one more section into the cache.
    ///
    /// Returns `false` once the payload is exhausted.
    fn decode_one(&mut self) -> Result<bool, CodecError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.exhausted() {
            return Ok(false);
        }
        match self.codec.decode_next(&self.raw[self.cursor..]) {
            Ok((section, consumed)) => {
                // A zero-length decode would loop forever; treat as malformed.
                if consumed == 0 {
                    let err = CodecError::Malformed("section consumed no bytes".to_owned());
                    self.failed = Some(err.clone());
                    return Err(err);
                }
                self.cursor += consumed;
                self.sections.push(section);
                Ok(true)
            }
            Err(err) => {
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    fn find<P>(&mut self, predicate: P) -> Result<Option<usize>, CodecError>
    where
        P: Fn(&Section) -> bool,
    {
        loop {
            if let Some(index) = self.sections.iter().position(&predicate) {
                return Ok(Some(index));
            }
            if !self.decode_one()? {
                return Ok(None);
            }
        }
    }

    /// The message header, if present.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CodecError`] if any section fails to decode.
    pub fn header(&mut self) -> Result<Option<&Header>, CodecError> {
        let index = self.find(|s| matches!(s, Section::Header(_)))?;
        Ok(index.map(|i| match &self.sections[i] {
            Section::Header(header) => header,
            _ => unreachable!("index located a header section"),
        }))
    }

    /// The message properties, if present.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CodecError`] if any section fails to decode.
    pub fn properties(&mut self) -> Result<Option<&Properties>, CodecError> {
        let index = self.find(|s| matches!(s, Section::Properties(_)))?;
        Ok(index.map(|i| match &self.sections[i] {
            Section::Properties(properties) => properties,
            _ => unreachable!("index located a properties section"),
        }))
    }

    /// Message annotations, if present.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CodecError`] if any section fails to decode.
    pub fn message_annotations(&mut self) -> Result<Option<&Fields>, CodecError> {
        let index = self.find(|s| matches!(s, Section::MessageAnnotations(_)))?;
        Ok(index.map(|i| match &self.sections[i] {
            Section::MessageAnnotations(fields) => fields,
            _ => unreachable!("index located a message-annotations section"),
        }))
    }

    /// Application properties, if present.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CodecError`] if any section fails to decode.
    pub fn application_properties(&mut self) -> Result<Option<&Fields>, CodecError> {
        let index = self.find(|s| matches!(s, Section::ApplicationProperties(_)))?;
        Ok(index.map(|i| match &self.sections[i] {
            Section::ApplicationProperties(fields) => fields,
            _ => unreachable!("index located an application-properties section"),
        }))
    }

    /// The first body section.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CodecError`] if any section fails to decode.
    pub fn body(&mut self) -> Result<Option<&Section>, CodecError> {
        let index = self.find(Section::is_body)?;
        Ok(index.map(|i| &self.sections[i]))
    }

    /// The footer, if present.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CodecError`] if any section fails to decode.
    pub fn footer(&mut self) -> Result<Option<&Fields>, CodecError> {
        let index = self.find(|s| matches!(s, Section::Footer(_)))?;
        Ok(index.map(|i| match &self.sections[i] {
            Section::Footer(fields) => fields,
            _ => unreachable!("index located a footer section"),
        }))
    }

    /// Decode and return every section in payload order.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`CodecError`] if any section fails to decode.
    pub fn sections(&mut self) -> Result<&[Section], CodecError> {
        while self.decode_one()? {}
        Ok(&self.sections)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::{
        BincodeSectionCodec,
        Header,
        Message,
        Properties,
        Section,
        SectionCodec,
        encode_sections,
    };
    use crate::frames::{FieldValue, Fields};

    fn sample_payload() -> Bytes {
        let props = Properties {
            subject: Some("greeting".to_owned()),
            ..Properties::default()
        };
        let mut app = Fields::new();
        app.insert("key".to_owned(), FieldValue::from("value"));
        encode_sections(
            &BincodeSectionCodec,
            &[
                Section::Header(Header::default()),
                Section::Properties(props),
                Section::ApplicationProperties(app),
                Section::Data(Bytes::from_static(b"hello")),
                Section::Footer(Fields::new()),
            ],
        )
        .expect("encode sample message")
    }

    #[test]
    fn sections_decode_lazily_and_cache() {
        let mut message = Message::new(sample_payload(), Arc::new(BincodeSectionCodec));

        let body = message.body().expect("decode").expect("body present");
        assert_eq!(body, &Section::Data(Bytes::from_static(b"hello")));

        // Earlier sections were decoded on the way to the body and are
        // served from the cache.
        let props = message
            .properties()
            .expect("decode")
            .expect("properties present");
        assert_eq!(props.subject.as_deref(), Some("greeting"));
        assert!(message.footer().expect("decode").is_some());
    }

    #[test]
    fn decode_failure_is_terminal() {
        let mut raw = sample_payload().to_vec();
        raw.truncate(raw.len() - 3);
        raw.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        let mut message = Message::new(Bytes::from(raw), Arc::new(BincodeSectionCodec));

        assert!(message.sections().is_err());
        assert!(message.footer().is_err());
        assert!(message.body().is_err());
    }

    #[test]
    fn missing_sections_yield_none() {
        let payload = encode_sections(
            &BincodeSectionCodec,
            &[Section::Data(Bytes::from_static(b"only-body"))],
        )
        .expect("encode");
        let mut message = Message::new(payload, Arc::new(BincodeSectionCodec));
        assert!(message.header().expect("decode").is_none());
        assert!(message.footer().expect("decode").is_none());
        assert!(message.body().expect("decode").is_some());
    }

    #[test]
    fn codec_round_trips_every_section_kind() {
        let sections = [
            Section::Header(Header::default()),
            Section::DeliveryAnnotations(Fields::new()),
            Section::MessageAnnotations(Fields::new()),
            Section::Properties(Properties::default()),
            Section::ApplicationProperties(Fields::new()),
            Section::Data(Bytes::from_static(b"abc")),
            Section::AmqpValue(FieldValue::Ulong(7)),
            Section::AmqpSequence(vec![FieldValue::Bool(true)]),
            Section::Footer(Fields::new()),
        ];
        for section in &sections {
            let encoded = BincodeSectionCodec.encode(section).expect("encode");
            let (decoded, consumed) = BincodeSectionCodec
                .decode_next(&encoded)
                .expect("decode");
            assert_eq!(&decoded, section);
            assert_eq!(consumed, encoded.len());
        }
    }
}
