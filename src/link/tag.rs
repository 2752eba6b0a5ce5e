//! Delivery tag generation.

use crate::frames::DeliveryTag;

/// Monotonic delivery tag generator.
///
/// Tags are the counter value encoded as eight big-endian bytes, matching
/// the common client default. Uniqueness only matters within the set of
/// unsettled deliveries on one link, so wrap-around is acceptable.
#[derive(Debug, Default)]
pub struct DeliveryTagGenerator {
    next: u64,
}

impl DeliveryTagGenerator {
    /// Produce the next tag.
    pub fn next_tag(&mut self) -> DeliveryTag {
        let tag = DeliveryTag::from(self.next.to_be_bytes().to_vec());
        self.next = self.next.wrapping_add(1);
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::DeliveryTagGenerator;

    #[test]
    fn tags_are_sequential_big_endian() {
        let mut tags = DeliveryTagGenerator::default();
        assert_eq!(tags.next_tag().as_slice(), &[0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(tags.next_tag().as_slice(), &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(tags.next_tag().as_slice(), &[0, 0, 0, 0, 0, 0, 0, 2]);
    }
}
