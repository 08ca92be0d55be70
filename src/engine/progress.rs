// src/engine/progress.rs

//! Progress reporting contract shared by all transactions
//!
//! Every operation accepts a sink receiving `(action, package snapshot,
//! percentage)` events. Percentages are monotonically non-decreasing within
//! one operation but may restart at 0 between sub-phases (download vs.
//! install). Snapshots are copies; a sink can never observe half-mutated
//! records. Callbacks run synchronously on the calling thread, from inside
//! the download and install loops.

use crate::pkg::PackageInfo;

/// What the engine is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Download,
    Install,
    Remove,
}

/// One progress report
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub action: Action,
    pub package: Option<PackageInfo>,
    /// 0-100 within the current operation
    pub percent: u8,
}

/// Caller-supplied progress callback
pub type ProgressSink<'a> = &'a mut dyn FnMut(&ProgressEvent);

/// Rescale a collaborator's fractional 0-100 progress into the
/// `[start, end]` slice of the overall operation
pub fn rescale(start: u8, end: u8, pct: u8) -> u8 {
    let span = end.saturating_sub(start) as u32;
    start + (span * pct.min(100) as u32 / 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_bounds() {
        assert_eq!(rescale(0, 75, 0), 0);
        assert_eq!(rescale(0, 75, 100), 75);
        assert_eq!(rescale(25, 50, 50), 37);
        // clamped above 100
        assert_eq!(rescale(0, 75, 200), 75);
        // degenerate slice stays put
        assert_eq!(rescale(40, 40, 99), 40);
    }
}
