//! Shared harness driving a `SessionEngine` through in-memory frame
//! channels, playing the remote peer.
#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use linkflow::{
    Attach,
    ConnectionOptions,
    DeliveryTag,
    Detach,
    Disposition,
    Flow,
    LinkHandle,
    Receiver,
    ReceiverOptions,
    Role,
    Session,
    SessionEngine,
    SessionFrame,
    SessionOptions,
    SessionTransport,
    Terminus,
    Transfer,
};
use tokio::sync::mpsc;

pub struct Peer {
    pub session: Session,
    pub to_engine: mpsc::Sender<SessionFrame>,
    pub from_engine: mpsc::Receiver<SessionFrame>,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn engine(options: SessionOptions) -> Peer {
    engine_with(ConnectionOptions::default(), options)
}

pub fn engine_with(connection: ConnectionOptions, options: SessionOptions) -> Peer {
    init_tracing();
    let (in_tx, in_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(64);
    let transport = SessionTransport {
        inbound: in_rx,
        outbound: out_tx,
    };
    let (engine, session) = SessionEngine::new(transport, connection, options);
    tokio::spawn(engine.run());
    Peer {
        session,
        to_engine: in_tx,
        from_engine: out_rx,
    }
}

impl Peer {
    pub async fn feed(&self, frame: SessionFrame) {
        self.to_engine.send(frame).await.expect("engine running");
    }

    pub async fn next_frame(&mut self) -> SessionFrame {
        tokio::time::timeout(Duration::from_secs(2), self.from_engine.recv())
            .await
            .expect("frame within deadline")
            .expect("engine running")
    }

    pub fn no_frame(&mut self) {
        assert!(
            self.from_engine.try_recv().is_err(),
            "expected no outbound frame"
        );
    }

    pub async fn expect_attach(&mut self) -> Attach {
        match self.next_frame().await {
            SessionFrame::Attach(attach) => attach,
            other => panic!("expected attach, got {}", other.kind()),
        }
    }

    pub async fn expect_flow(&mut self) -> Flow {
        match self.next_frame().await {
            SessionFrame::Flow(flow) => flow,
            other => panic!("expected flow, got {}", other.kind()),
        }
    }

    pub async fn expect_transfer(&mut self) -> Transfer {
        match self.next_frame().await {
            SessionFrame::Transfer(transfer) => transfer,
            other => panic!("expected transfer, got {}", other.kind()),
        }
    }

    pub async fn expect_disposition(&mut self) -> Disposition {
        match self.next_frame().await {
            SessionFrame::Disposition(disposition) => disposition,
            other => panic!("expected disposition, got {}", other.kind()),
        }
    }

    pub async fn expect_detach(&mut self) -> Detach {
        match self.next_frame().await {
            SessionFrame::Detach(detach) => detach,
            other => panic!("expected detach, got {}", other.kind()),
        }
    }

    /// Read the engine's attach and answer it from the peer side.
    ///
    /// Returns the engine's attach; the peer's mirror uses `remote` as its
    /// handle.
    pub async fn answer_attach(&mut self, remote: u32) -> Attach {
        let attach = self.expect_attach().await;
        let reply = Attach {
            name: attach.name.clone(),
            handle: LinkHandle(remote),
            role: attach.role.remote(),
            source: attach
                .source
                .clone()
                .or_else(|| Some(Terminus::with_address("peer"))),
            target: attach.target.clone(),
            initial_delivery_count: match attach.role {
                Role::Receiver => Some(0),
                Role::Sender => None,
            },
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        };
        self.feed(SessionFrame::Attach(reply)).await;
        attach
    }

    /// Open a receiver, complete the attach handshake, and swallow the
    /// initial credit flow when one is advertised.
    pub async fn open_attached_receiver(
        &mut self,
        address: &str,
        options: ReceiverOptions,
        remote: u32,
    ) -> Receiver {
        let credited = options.credit_window.is_some();
        let mut receiver = self
            .session
            .open_receiver(address, options)
            .await
            .expect("attach queued");
        self.answer_attach(remote).await;
        receiver.attached().await.expect("attach completed");
        if credited {
            let flow = self.expect_flow().await;
            assert!(flow.link_credit.is_some());
        }
        receiver
    }

    /// Grant the engine's sender link credit and outgoing window.
    pub async fn grant_sender(&self, remote: u32, credit: u32, window: u32) {
        self.feed(SessionFrame::Flow(link_flow(remote, credit, window)))
            .await;
    }
}

/// Peer flow granting `credit` to the engine's sender and opening `window`
/// outgoing frames.
pub fn link_flow(remote: u32, credit: u32, window: u32) -> Flow {
    Flow {
        next_incoming_id: Some(0),
        incoming_window: window,
        next_outgoing_id: 0,
        outgoing_window: 0,
        handle: Some(LinkHandle(remote)),
        delivery_count: Some(0),
        link_credit: Some(credit),
        available: None,
        drain: false,
        echo: false,
        properties: None,
    }
}

/// Transfer frame from the peer's sender.
pub fn transfer(
    remote: u32,
    delivery_id: Option<u32>,
    payload: &[u8],
    more: bool,
    settled: bool,
) -> SessionFrame {
    SessionFrame::Transfer(Transfer {
        handle: LinkHandle(remote),
        delivery_id,
        delivery_tag: delivery_id.map(|id| DeliveryTag(Bytes::copy_from_slice(&id.to_be_bytes()))),
        message_format: delivery_id.map(|_| 0),
        settled,
        more,
        aborted: false,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Aborting transfer frame for the currently open delivery.
pub fn aborted_transfer(remote: u32) -> SessionFrame {
    SessionFrame::Transfer(Transfer {
        handle: LinkHandle(remote),
        delivery_id: None,
        delivery_tag: None,
        message_format: None,
        settled: false,
        more: false,
        aborted: true,
        payload: Bytes::new(),
    })
}
