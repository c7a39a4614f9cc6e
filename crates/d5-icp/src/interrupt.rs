//! Process-wide interrupt flag.
//!
//! Writable from an OS signal handler; workers poll it between loop
//! iterations, so cancellation is best-effort (a worker may finish one
//! more prune before observing it).

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Request cancellation of every running check.
pub fn request_interrupt() {
    INTERRUPTED.store(true, Ordering::Release);
}

/// Clear the flag before a new check.
pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::Release);
}

/// True iff cancellation was requested.
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        clear_interrupt();
        assert!(!is_interrupted());
        request_interrupt();
        assert!(is_interrupted());
        clear_interrupt();
        assert!(!is_interrupted());
    }
}
