//! Modeled interrupt flag
//!
//! On the real machine atomicity inside the kernel comes from disabling
//! interrupts; `Begin_Int_Atomic`/`End_Int_Atomic` pairs scope it. Here
//! the flag is explicit kernel state with the same discipline: paired
//! save/restore, and assertions at the entry points that require a
//! particular state. The page-fault path re-enables interrupts around
//! page-file I/O exactly where the real handler does.

/// The single-processor interrupt-enable flag.
#[derive(Debug)]
pub struct IntState {
    enabled: bool,
}

impl IntState {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Disable interrupts, returning the previous state for the
    /// matching [`end_atomic`](Self::end_atomic).
    pub fn begin_atomic(&mut self) -> bool {
        let iflag = self.enabled;
        self.enabled = false;
        iflag
    }

    /// Restore the state saved by [`begin_atomic`](Self::begin_atomic).
    pub fn end_atomic(&mut self, iflag: bool) {
        assert!(!self.enabled, "end_atomic outside an atomic section");
        self.enabled = iflag;
    }

    /// Unconditional enable, for the I/O windows inside the fault
    /// handler. Must currently be disabled.
    pub fn enable(&mut self) {
        assert!(!self.enabled);
        self.enabled = true;
    }

    /// Unconditional disable on return from an I/O window.
    pub fn disable(&mut self) {
        assert!(self.enabled);
        self.enabled = false;
    }
}

impl Default for IntState {
    fn default() -> Self {
        Self::new()
    }
}
