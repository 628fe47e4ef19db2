//! Byte/record accounting.
//!
//! A payload and a batch are both bounded buffers, so both use
//! [`SizeTracker`]. [`admit`] is the single place that weighs the two budgets
//! against an incoming record.

use crate::error::{Error, Result};
use crate::upload::payload::{Payload, PAYLOAD_FRAMING_BYTES};

/// Running byte/record totals against fixed limits.
#[derive(Debug, Clone)]
pub struct SizeTracker {
    byte_count: usize,
    record_count: usize,
    max_bytes: usize,
    max_records: usize,
    /// Smallest record delta seen so far; drives the "nearly full" estimate
    smallest_record: Option<usize>,
    /// Fraction of `smallest_record` that must still fit for the buffer to
    /// count as not full
    margin: f64,
}

impl SizeTracker {
    pub fn new(max_bytes: usize, max_records: usize, margin: f64) -> Self {
        Self {
            byte_count: PAYLOAD_FRAMING_BYTES,
            record_count: 0,
            max_bytes,
            max_records,
            smallest_record: None,
            margin,
        }
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn can_fit(&self, delta: usize) -> bool {
        self.record_count < self.max_records
            && self
                .byte_count
                .checked_add(delta)
                .is_some_and(|total| total <= self.max_bytes)
    }

    /// Account for one more record of `delta` bytes and report whether the
    /// buffer should now be considered full.
    ///
    /// "Full" is an estimate: the buffer is full when a record of
    /// `margin * smallest_record` bytes would no longer fit.
    pub fn add_and_estimate_if_full(&mut self, delta: usize) -> Result<bool> {
        if !self.can_fit(delta) {
            return Err(Error::PayloadOverflow {
                records: self.record_count,
                bytes: self.byte_count,
                delta,
            });
        }

        self.byte_count += delta;
        self.record_count += 1;

        let smallest = match self.smallest_record {
            Some(s) if s <= delta => s,
            _ => delta,
        };
        self.smallest_record = Some(smallest);

        let headroom = (smallest as f64 * self.margin) as usize;
        Ok(!self.can_fit(headroom))
    }

    pub fn reset(&mut self) {
        self.byte_count = PAYLOAD_FRAMING_BYTES;
        self.record_count = 0;
    }
}

/// Batch-level accounting kept by the uploader across payloads.
#[derive(Debug, Clone)]
pub struct BatchBudget {
    tracker: SizeTracker,
    /// Server does not batch: batch limits no longer apply
    unlimited: bool,
    /// A record was accounted since the last commit
    needs_commit: bool,
}

impl BatchBudget {
    pub fn new(max_bytes: usize, max_records: usize, margin: f64) -> Self {
        Self {
            tracker: SizeTracker::new(max_bytes, max_records, margin),
            unlimited: false,
            needs_commit: false,
        }
    }

    pub fn set_unlimited(&mut self, unlimited: bool) {
        self.unlimited = unlimited;
    }

    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    pub fn needs_commit(&self) -> bool {
        self.needs_commit
    }

    pub fn record_count(&self) -> usize {
        self.tracker.record_count()
    }

    pub fn byte_count(&self) -> usize {
        self.tracker.byte_count()
    }

    pub fn can_fit(&self, delta: usize) -> bool {
        self.unlimited || self.tracker.can_fit(delta)
    }

    pub fn add_and_estimate_if_full(&mut self, delta: usize) -> Result<bool> {
        self.needs_commit = true;
        if self.unlimited {
            // Keep totals honest for logging, but never report full.
            if self.tracker.can_fit(delta) {
                self.tracker.add_and_estimate_if_full(delta)?;
            }
            return Ok(false);
        }
        self.tracker.add_and_estimate_if_full(delta)
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
        self.needs_commit = false;
    }
}

/// Outcome of weighing a record against the payload and batch budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Room in both the payload and the batch
    Fits,
    /// Payload is (or would be) full; the batch still has headroom
    PayloadFull,
    /// Batch is estimated full after the record was added
    BatchFull,
    /// Record would push the batch past its limits
    WouldOverflowBatch,
}

/// Decide where a record of `delta` bytes goes, before adding it.
///
/// Only [`Admission::Fits`], [`Admission::PayloadFull`] and
/// [`Admission::WouldOverflowBatch`] are returned here; [`Admission::BatchFull`]
/// comes from [`accept`].
pub fn admit(payload: &Payload, batch: &BatchBudget, delta: usize) -> Admission {
    let fits_batch = batch.can_fit(delta);
    let fits_payload = payload.can_fit(delta);

    match (fits_batch, fits_payload) {
        (true, true) => Admission::Fits,
        (true, false) => Admission::PayloadFull,
        (false, _) => Admission::WouldOverflowBatch,
    }
}

/// Add a record to both budgets and report which one, if any, is now full.
///
/// A full batch wins over a full payload: committing also flushes the payload.
pub fn accept(
    payload: &mut Payload,
    batch: &mut BatchBudget,
    delta: usize,
    bytes: bytes::Bytes,
    id: String,
) -> Result<Admission> {
    let payload_full = payload.add_and_estimate_if_full(delta, bytes, id)?;
    let batch_full = batch.add_and_estimate_if_full(delta)?;

    Ok(if batch_full {
        Admission::BatchFull
    } else if payload_full {
        Admission::PayloadFull
    } else {
        Admission::Fits
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_tracker_estimates_full_by_record_count() {
        let mut tracker = SizeTracker::new(1_000, 2, 0.5);
        assert!(!tracker.add_and_estimate_if_full(10).unwrap());
        assert!(tracker.add_and_estimate_if_full(10).unwrap());
        assert!(tracker.add_and_estimate_if_full(10).is_err());
    }

    #[test]
    fn test_tracker_estimates_full_by_margin() {
        // 2 framing + 40 = 42; half of the smallest record (20) still fits at 62 <= 65
        let mut tracker = SizeTracker::new(65, 100, 0.5);
        assert!(!tracker.add_and_estimate_if_full(40).unwrap());
        // 42 + 20 = 62; smallest is now 20, half is 10, 72 > 65 -> full
        assert!(tracker.add_and_estimate_if_full(20).unwrap());
    }

    #[test]
    fn test_tracker_reset() {
        let mut tracker = SizeTracker::new(100, 10, 0.5);
        tracker.add_and_estimate_if_full(30).unwrap();
        tracker.reset();
        assert_eq!(tracker.byte_count(), PAYLOAD_FRAMING_BYTES);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unlimited_batch_never_full() {
        let mut batch = BatchBudget::new(10, 1, 0.5);
        batch.set_unlimited(true);
        assert!(batch.can_fit(1_000));
        assert!(!batch.add_and_estimate_if_full(5).unwrap());
        assert!(!batch.add_and_estimate_if_full(5).unwrap());
        assert!(batch.needs_commit());
    }

    #[test]
    fn test_admit_decisions() {
        let mut payload = Payload::new(100, 1, 0.5);
        let mut batch = BatchBudget::new(1_000, 10, 0.5);
        assert_eq!(admit(&payload, &batch, 10), Admission::Fits);

        let outcome =
            accept(&mut payload, &mut batch, 10, Bytes::from_static(b"x"), "a".into()).unwrap();
        assert_eq!(outcome, Admission::PayloadFull);
        assert_eq!(admit(&payload, &batch, 10), Admission::PayloadFull);

        let small_batch = BatchBudget::new(5, 10, 0.5);
        assert_eq!(
            admit(&Payload::new(100, 5, 0.5), &small_batch, 10),
            Admission::WouldOverflowBatch
        );
    }

    #[test]
    fn test_accept_prefers_batch_full() {
        let mut payload = Payload::new(100, 2, 0.5);
        let mut batch = BatchBudget::new(1_000, 2, 0.5);
        accept(&mut payload, &mut batch, 5, Bytes::from_static(b"a"), "a".into()).unwrap();
        let outcome =
            accept(&mut payload, &mut batch, 5, Bytes::from_static(b"b"), "b".into()).unwrap();
        assert_eq!(outcome, Admission::BatchFull);
    }
}
