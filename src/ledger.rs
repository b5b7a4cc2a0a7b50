//! Reservation ledger: tracked metadata for every live reservation.
//!
//! Every platform keeps a ledger of `{range, state, token}` records so that
//! `commit` and `free` can be validated before their parameters ever reach a
//! kernel call (a mismatched free size can crash the process outright on
//! some kernels). On the capability kernel the ledger additionally carries
//! the opaque kernel reservation token, because that platform has no native
//! reserve/commit distinction and the ledger *is* the emulation.
//!
//! Records never overlap, and their union is exactly the currently-reserved
//! address space. Freeing a strict sub-range of a record splits it into up
//! to two leftover records (head and/or tail), which stay independently
//! freeable.
//!
//! The collection is an owned `Vec` behind a single `Mutex`, replacing the
//! pointer-chained list this design descends from: no aliasing, no manual
//! splicing, and splits are plain remove/insert operations.

use std::sync::Mutex;

use crate::error::{contract_violation, Result};

/// A half-open address range: `(base, len)` in bytes.
pub(crate) type Range = (usize, usize);

/// Lifecycle state of a tracked region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionState {
    /// Address space is claimed but has no guaranteed backing.
    Reserved,
    /// A commit covered the whole record; backing is guaranteed.
    ///
    /// Advisory only: the kernel owns real page state, and a partial commit
    /// leaves the record `Reserved`. Validation never depends on this.
    Committed,
}

/// One tracked reservation.
#[derive(Debug)]
pub(crate) struct Record<T> {
    pub base: usize,
    pub len: usize,
    pub state: RegionState,
    /// Opaque kernel reservation token (`()` where the kernel tracks
    /// reservations itself).
    pub token: T,
}

impl<T> Record<T> {
    fn end(&self) -> usize {
        self.base + self.len
    }

    // Caller-supplied ranges are untrusted; a length that overflows past the
    // end of the address space cannot match anything.
    fn contains(&self, base: usize, len: usize) -> bool {
        match base.checked_add(len) {
            Some(end) => self.base <= base && end <= self.end(),
            None => false,
        }
    }

    fn overlaps(&self, base: usize, len: usize) -> bool {
        match base.checked_add(len) {
            Some(end) => self.base < end && base < self.end(),
            None => false,
        }
    }
}

/// The record removed by a free, plus the leftover sub-ranges that must be
/// re-tracked (and, on the capability kernel, re-reserved).
#[derive(Debug)]
pub(crate) struct FreePlan<T> {
    pub record: Record<T>,
    /// Leftover range below the freed sub-range, if any.
    pub head: Option<Range>,
    /// Leftover range above the freed sub-range, if any.
    pub tail: Option<Range>,
}

/// Mutex-guarded collection of reservation records.
pub(crate) struct Ledger<T> {
    records: Mutex<Vec<Record<T>>>,
}

impl<T> Ledger<T> {
    pub(crate) const fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Track a new reservation. The range must not overlap any record.
    pub(crate) fn insert(&self, base: usize, len: usize, state: RegionState, token: T) {
        let mut records = self.records.lock().unwrap();
        debug_assert!(
            !records.iter().any(|r| r.overlaps(base, len)),
            "overlapping reservation insert at {base:#x}+{len:#x}"
        );
        records.push(Record {
            base,
            len,
            state,
            token,
        });
    }

    /// Validate that `[base, base+len)` lies wholly inside one record.
    pub(crate) fn check_contains(&self, base: usize, len: usize) -> Result<()> {
        let records = self.records.lock().unwrap();
        if records.iter().any(|r| r.contains(base, len)) {
            Ok(())
        } else {
            Err(contract_violation(format!(
                "range {base:#x}+{len:#x} is not inside any tracked reservation"
            )))
        }
    }

    /// Mark the record covering `[base, base+len)` as committed if the
    /// commit spans the whole record.
    pub(crate) fn mark_committed(&self, base: usize, len: usize) {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.iter_mut().find(|r| r.contains(base, len)) {
            if r.base == base && r.len == len {
                r.state = RegionState::Committed;
            }
        }
    }

    /// Remove the record covering `[base, base+len)` and compute the
    /// leftover head/tail ranges.
    ///
    /// A range that straddles record boundaries, or was never reserved, is
    /// a caller contract error; nothing is removed in that case.
    pub(crate) fn take_covering(&self, base: usize, len: usize) -> Result<FreePlan<T>> {
        let mut records = self.records.lock().unwrap();

        let Some(idx) = records.iter().position(|r| r.contains(base, len)) else {
            let overlapping = records.iter().any(|r| r.overlaps(base, len));
            return Err(contract_violation(if overlapping {
                format!("free of {base:#x}+{len:#x} straddles reservation boundaries")
            } else {
                format!("free of {base:#x}+{len:#x} which was never reserved")
            }));
        };

        let record = records.swap_remove(idx);
        let head = (record.base < base).then(|| (record.base, base - record.base));
        let tail = (base + len < record.end()).then(|| (base + len, record.end() - (base + len)));

        Ok(FreePlan { record, head, tail })
    }

    /// Put a record back after a failed kernel call, so tracking still
    /// matches reality.
    pub(crate) fn restore(&self, record: Record<T>) {
        self.records.lock().unwrap().push(record);
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<Range> {
        let mut v: Vec<Range> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.base, r.len))
            .collect();
        v.sort_unstable();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: usize = 4096;

    fn ledger_with(ranges: &[Range]) -> Ledger<u32> {
        let ledger = Ledger::new();
        for (i, &(base, len)) in ranges.iter().enumerate() {
            ledger.insert(base, len, RegionState::Reserved, i as u32);
        }
        ledger
    }

    #[test]
    fn exact_free_removes_record() {
        let ledger = ledger_with(&[(0x10000, 3 * P)]);
        let plan = ledger.take_covering(0x10000, 3 * P).unwrap();
        assert_eq!(plan.record.token, 0);
        assert!(plan.head.is_none());
        assert!(plan.tail.is_none());
        assert!(ledger.ranges().is_empty());
    }

    #[test]
    fn middle_free_splits_into_head_and_tail() {
        let base = 0x10000;
        let ledger = ledger_with(&[(base, 3 * P)]);

        let plan = ledger.take_covering(base + P, P).unwrap();
        assert_eq!(plan.head, Some((base, P)));
        assert_eq!(plan.tail, Some((base + 2 * P, P)));

        // Caller re-inserts the leftovers with fresh tokens.
        ledger.insert(base, P, RegionState::Reserved, 10);
        ledger.insert(base + 2 * P, P, RegionState::Reserved, 11);
        assert_eq!(ledger.ranges(), vec![(base, P), (base + 2 * P, P)]);

        // Both leftovers are independently freeable.
        assert!(ledger.take_covering(base, P).is_ok());
        assert!(ledger.take_covering(base + 2 * P, P).is_ok());
        assert!(ledger.ranges().is_empty());
    }

    #[test]
    fn head_free_leaves_tail_only() {
        let base = 0x40000;
        let ledger = ledger_with(&[(base, 4 * P)]);
        let plan = ledger.take_covering(base, P).unwrap();
        assert!(plan.head.is_none());
        assert_eq!(plan.tail, Some((base + P, 3 * P)));
    }

    #[test]
    fn tail_free_leaves_head_only() {
        let base = 0x40000;
        let ledger = ledger_with(&[(base, 4 * P)]);
        let plan = ledger.take_covering(base + 3 * P, P).unwrap();
        assert_eq!(plan.head, Some((base, 3 * P)));
        assert!(plan.tail.is_none());
    }

    #[test]
    fn repeated_partial_frees_of_one_reservation() {
        let base = 0x100000;
        let ledger = ledger_with(&[(base, 8 * P)]);

        // Free pages 2..4, re-track the leftovers.
        let plan = ledger.take_covering(base + 2 * P, 2 * P).unwrap();
        ledger.insert(plan.head.unwrap().0, plan.head.unwrap().1, RegionState::Reserved, 1);
        ledger.insert(plan.tail.unwrap().0, plan.tail.unwrap().1, RegionState::Reserved, 2);

        // Free page 6 out of the tail leftover.
        let plan = ledger.take_covering(base + 6 * P, P).unwrap();
        assert_eq!(plan.head, Some((base + 4 * P, 2 * P)));
        assert_eq!(plan.tail, Some((base + 7 * P, P)));
    }

    #[test]
    fn untracked_free_is_a_contract_violation() {
        let ledger = ledger_with(&[(0x10000, P)]);
        let err = ledger.take_covering(0x90000, P).unwrap_err();
        assert!(matches!(err, crate::Error::ContractViolation(_)));
        // Nothing was removed.
        assert_eq!(ledger.ranges(), vec![(0x10000, P)]);
    }

    #[test]
    fn straddling_free_is_a_contract_violation() {
        let ledger = ledger_with(&[(0x10000, P), (0x10000 + P, P)]);
        let err = ledger.take_covering(0x10000, 2 * P).unwrap_err();
        assert!(matches!(err, crate::Error::ContractViolation(_)));
        assert_eq!(ledger.ranges().len(), 2);
    }

    #[test]
    fn commit_validation_and_state() {
        let base = 0x20000;
        let ledger = ledger_with(&[(base, 2 * P)]);

        assert!(ledger.check_contains(base, P).is_ok());
        assert!(ledger.check_contains(base, 2 * P).is_ok());
        assert!(ledger.check_contains(base + P, 2 * P).is_err());

        // Partial commit keeps the record Reserved.
        ledger.mark_committed(base, P);
        let plan = ledger.take_covering(base, 2 * P).unwrap();
        assert_eq!(plan.record.state, RegionState::Reserved);

        // Whole-record commit marks it Committed.
        ledger.insert(base, 2 * P, RegionState::Reserved, 9);
        ledger.mark_committed(base, 2 * P);
        let plan = ledger.take_covering(base, 2 * P).unwrap();
        assert_eq!(plan.record.state, RegionState::Committed);
    }

    #[test]
    fn overflowing_length_is_rejected_not_wrapped() {
        let ledger = ledger_with(&[(0x10000, P)]);

        // base + len wraps around the address space; a wrapped end must not
        // be mistaken for containment.
        let err = ledger.take_covering(0x10000, usize::MAX - 2 * P).unwrap_err();
        assert!(matches!(err, crate::Error::ContractViolation(_)));
        assert!(ledger.check_contains(0x10000, usize::MAX).is_err());
        assert_eq!(ledger.ranges(), vec![(0x10000, P)]);
    }

    #[test]
    fn restore_after_failed_kernel_call() {
        let ledger = ledger_with(&[(0x30000, P)]);
        let plan = ledger.take_covering(0x30000, P).unwrap();
        assert!(ledger.ranges().is_empty());
        ledger.restore(plan.record);
        assert_eq!(ledger.ranges(), vec![(0x30000, P)]);
    }
}
