//! Shared context for a transform run.
//!
//! Carries the settings every optional pass consults, the cooperative
//! cancellation flag, and the step log the driver appends to before each
//! pass. The step log is the observability surface the test suite and any
//! debugging UI read; a failing method's record names the last step plus
//! the block being worked on.

use std::cell::Cell;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{settings::DecompilerSettings, Error, Result};

/// One observability record, written before the named pass runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMarker {
    /// Pass name.
    pub pass: &'static str,
    /// Zero-based position in the run.
    pub ordinal: usize,
}

/// Context threaded through every pass of one method's pipeline run.
pub struct TransformContext {
    /// Settings gating the optional recovery passes.
    pub settings: DecompilerSettings,
    cancelled: Arc<AtomicBool>,
    steps: Vec<StepMarker>,
    current_block: Cell<usize>,
}

impl TransformContext {
    /// Creates a context with its own (never-signalled) cancellation flag.
    #[must_use]
    pub fn new(settings: DecompilerSettings) -> Self {
        Self {
            settings,
            cancelled: Arc::new(AtomicBool::new(false)),
            steps: Vec::new(),
            current_block: Cell::new(0),
        }
    }

    /// Uses a shared cancellation flag; raising it aborts the current
    /// method at the next pass or block boundary.
    #[must_use]
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// The shared cancellation flag, for handing to long-running engines.
    #[must_use]
    pub fn cancellation_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    /// Polls for cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the flag is raised.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Records a step marker before a pass runs.
    pub(crate) fn record_step(&mut self, pass: &'static str) {
        let ordinal = self.steps.len();
        self.steps.push(StepMarker { pass, ordinal });
    }

    /// The step markers recorded so far.
    #[must_use]
    pub fn steps(&self) -> &[StepMarker] {
        &self.steps
    }

    /// Notes which block a block-local pass is working on, for failure
    /// attribution.
    pub fn set_current_block(&self, block_index: usize) {
        self.current_block.set(block_index);
    }

    /// The block index last noted by a pass.
    #[must_use]
    pub fn current_block(&self) -> usize {
        self.current_block.get()
    }
}
