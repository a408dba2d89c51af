//! Fault-injection campaign results (spec.md §6), grounded in
//! `original_source/fi_test.py`'s `insert_result`/`inject_faults` shape: one
//! row per `(bit_index, cycle, fault kind)` trial, classified into the
//! outcome taxonomy its `except` chain encodes.

use crate::error::CoreError;
use crate::fault::{FaultKind, FaultSpec};

/// Classification of a single fault-injection trial, mirroring the
/// `fi_result` strings `original_source/fi_test.py`'s `inject_faults` writes
/// (`target_meet`, `no_effect`, `pc_out_of_bound`, `seg_fault`,
/// `misaligned_access`, `ill_inst`, `funct_violation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiOutcome {
    /// The run completed but diverged from the golden (fault-free) result.
    TargetMeet,
    /// The run completed and matched the golden result.
    NoEffect,
    /// Raised [`CoreError::PcOutOfBound`].
    PcOutOfBound,
    /// Raised [`CoreError::SegmentationFault`].
    SegFault,
    /// Raised [`CoreError::InstructionAddressMisaligned`].
    MisalignedAccess,
    /// Raised [`CoreError::IllegalInstruction`].
    IllInst,
    /// Raised [`CoreError::InvalidWidth`] or [`CoreError::FunctioningViolation`];
    /// the harness's catch-all for anything else that stopped the run.
    FunctViolation,
}

impl FiOutcome {
    /// Classifies a simulator error into its outcome bucket, following
    /// `original_source/fi_test.py`'s `except` ordering (each named
    /// exception type gets its own bucket; everything else falls into
    /// `funct_violation`).
    pub fn from_error(err: &CoreError) -> Self {
        match err {
            CoreError::PcOutOfBound { .. } => FiOutcome::PcOutOfBound,
            CoreError::SegmentationFault { .. } => FiOutcome::SegFault,
            CoreError::InstructionAddressMisaligned { .. } => FiOutcome::MisalignedAccess,
            CoreError::IllegalInstruction { .. } => FiOutcome::IllInst,
            CoreError::InvalidWidth { .. } | CoreError::FunctioningViolation(_) => {
                FiOutcome::FunctViolation
            }
        }
    }

    /// Classifies a completed (non-error) run by comparing its observed
    /// result against the golden, fault-free result.
    pub fn from_comparison(matches_golden: bool) -> Self {
        if matches_golden {
            FiOutcome::NoEffect
        } else {
            FiOutcome::TargetMeet
        }
    }
}

/// One row of a fault-injection campaign, matching the columns
/// `original_source/fi_test.py`'s `insert_result` writes per program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiRun {
    pub bit_index: u32,
    pub cycle: u64,
    pub kind: FaultKind,
    pub outcome: FiOutcome,
}

impl FiRun {
    pub fn new(fault: &FaultSpec, outcome: FiOutcome) -> Self {
        FiRun {
            bit_index: fault.bit_index,
            cycle: fault.cycle,
            kind: fault.kind,
            outcome,
        }
    }
}

/// Where fault-injection results land. `original_source/fi_test.py` uses
/// SQLite, which is out of scope here (spec.md §1); an in-memory sink
/// covers everything this crate needs, with the trait seam left open for a
/// persistent backend later.
pub trait ResultSink {
    fn record(&mut self, run: FiRun);
}

/// The only [`ResultSink`] this crate ships: an in-memory run log.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub runs: Vec<FiRun>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Counts rows with the given outcome, e.g. for a quick campaign
    /// summary (`target_meet` count per bit index).
    pub fn count(&self, outcome: FiOutcome) -> usize {
        self.runs.iter().filter(|r| r.outcome == outcome).count()
    }
}

impl ResultSink for MemorySink {
    fn record(&mut self, run: FiRun) {
        self.runs.push(run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;

    fn spec(bit_index: u32) -> FaultSpec {
        FaultSpec {
            cycle: 3,
            bit_index,
            num_bits: 1,
            kind: FaultKind::Flip,
        }
    }

    #[test]
    fn error_classification_matches_taxonomy() {
        assert_eq!(
            FiOutcome::from_error(&CoreError::PcOutOfBound { pc: 0 }),
            FiOutcome::PcOutOfBound
        );
        assert_eq!(
            FiOutcome::from_error(&CoreError::SegmentationFault { addr: 0 }),
            FiOutcome::SegFault
        );
        assert_eq!(
            FiOutcome::from_error(&CoreError::InstructionAddressMisaligned { pc: 0 }),
            FiOutcome::MisalignedAccess
        );
        assert_eq!(
            FiOutcome::from_error(&CoreError::IllegalInstruction { pc: 0, inst: 0 }),
            FiOutcome::IllInst
        );
        assert_eq!(
            FiOutcome::from_error(&CoreError::InvalidWidth { width: 3 }),
            FiOutcome::FunctViolation
        );
        assert_eq!(
            FiOutcome::from_error(&CoreError::FunctioningViolation("loop".into())),
            FiOutcome::FunctViolation
        );
    }

    #[test]
    fn memory_sink_counts_by_outcome() {
        let mut sink = MemorySink::new();
        sink.record(FiRun::new(&spec(0), FiOutcome::NoEffect));
        sink.record(FiRun::new(&spec(1), FiOutcome::TargetMeet));
        sink.record(FiRun::new(&spec(2), FiOutcome::TargetMeet));
        assert_eq!(sink.count(FiOutcome::TargetMeet), 2);
        assert_eq!(sink.count(FiOutcome::NoEffect), 1);
        assert_eq!(sink.count(FiOutcome::SegFault), 0);
    }
}
