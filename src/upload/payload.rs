//! One request body's worth of records.
//!
//! The request body is a JSON array, so every payload pays for its opening
//! and closing bracket, and every record pays for one separator.

use crate::error::Result;
use crate::upload::budget::SizeTracker;
use bytes::Bytes;

/// Framing cost on each side of the payload (`[` and `]`)
pub const PAYLOAD_FRAMING_OVERHEAD: usize = 1;

/// Framing cost of an empty payload
pub const PAYLOAD_FRAMING_BYTES: usize = 2 * PAYLOAD_FRAMING_OVERHEAD;

/// Separator cost per record (`,`)
pub const RECORD_SEPARATOR_OVERHEAD: usize = 1;

/// Bounded buffer of encoded records and their identifiers.
#[derive(Debug, Clone)]
pub struct Payload {
    tracker: SizeTracker,
    records: Vec<Bytes>,
    ids: Vec<String>,
}

impl Payload {
    pub fn new(max_bytes: usize, max_records: usize, margin: f64) -> Self {
        Self {
            tracker: SizeTracker::new(max_bytes, max_records, margin),
            records: Vec::new(),
            ids: Vec::new(),
        }
    }

    /// An empty payload with the same limits.
    pub fn fresh(&self) -> Self {
        let mut tracker = self.tracker.clone();
        tracker.reset();
        Self {
            tracker,
            records: Vec::new(),
            ids: Vec::new(),
        }
    }

    pub fn can_fit(&self, delta: usize) -> bool {
        self.tracker.can_fit(delta)
    }

    /// Append a record and report whether the payload should be flushed now.
    ///
    /// Fails if the record does not fit; callers must check with
    /// [`can_fit`](Self::can_fit) first.
    pub fn add_and_estimate_if_full(
        &mut self,
        delta: usize,
        record: Bytes,
        id: String,
    ) -> Result<bool> {
        let full = self.tracker.add_and_estimate_if_full(delta)?;
        self.records.push(record);
        self.ids.push(id);
        Ok(full)
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
        self.records.clear();
        self.ids.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn byte_count(&self) -> usize {
        self.tracker.byte_count()
    }

    pub fn max_bytes(&self) -> usize {
        self.tracker.max_bytes()
    }

    pub fn records(&self) -> &[Bytes] {
        &self.records
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn into_parts(self) -> (Vec<Bytes>, Vec<String>) {
        (self.records, self.ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_payload_counts_framing() {
        let payload = Payload::new(100, 10, 0.5);
        assert_eq!(payload.byte_count(), PAYLOAD_FRAMING_BYTES);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_can_fit_boundary() {
        let payload = Payload::new(100, 10, 0.5);
        assert!(payload.can_fit(100 - PAYLOAD_FRAMING_BYTES));
        assert!(!payload.can_fit(100 - PAYLOAD_FRAMING_BYTES + 1));
    }

    #[test]
    fn test_can_fit_respects_record_limit() {
        let mut payload = Payload::new(100, 1, 0.5);
        payload
            .add_and_estimate_if_full(5, Bytes::from_static(b"abcd"), "a".into())
            .unwrap();
        assert!(!payload.can_fit(1));
    }

    #[test]
    fn test_add_when_full_fails_loudly() {
        let mut payload = Payload::new(10, 10, 0.5);
        assert!(payload
            .add_and_estimate_if_full(9, Bytes::from_static(b"x"), "a".into())
            .is_err());
        assert!(payload.is_empty());
    }

    #[test]
    fn test_reset_and_fresh() {
        let mut payload = Payload::new(100, 10, 0.5);
        payload
            .add_and_estimate_if_full(5, Bytes::from_static(b"abcd"), "a".into())
            .unwrap();
        let fresh = payload.fresh();
        assert!(fresh.is_empty());
        assert_eq!(fresh.byte_count(), PAYLOAD_FRAMING_BYTES);
        assert_eq!(fresh.max_bytes(), 100);
        assert_eq!(payload.len(), 1);

        payload.reset();
        assert!(payload.is_empty());
        assert!(payload.ids().is_empty());
        assert_eq!(payload.byte_count(), PAYLOAD_FRAMING_BYTES);
    }

    proptest! {
        #[test]
        fn prop_counts_stay_within_limits(
            max_bytes in 8usize..512,
            max_records in 1usize..16,
            sizes in proptest::collection::vec(1usize..64, 0..64),
        ) {
            let mut payload = Payload::new(max_bytes, max_records, 0.5);
            for (i, size) in sizes.into_iter().enumerate() {
                if payload.can_fit(size) {
                    payload
                        .add_and_estimate_if_full(size, Bytes::new(), i.to_string())
                        .unwrap();
                } else {
                    prop_assert!(payload.add_and_estimate_if_full(size, Bytes::new(), i.to_string()).is_err());
                }
                prop_assert!(payload.byte_count() <= max_bytes.max(PAYLOAD_FRAMING_BYTES));
                prop_assert!(payload.len() <= max_records);
                prop_assert_eq!(payload.ids().len(), payload.records().len());
            }
        }
    }
}
