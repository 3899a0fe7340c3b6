//! Sizing of the receive window, i.e. how many bytes the receiver allows the transmitter to send
//!  ahead of the receiver's current offset.
//!
//! This is a slow start / congestion avoidance discipline like TCP's, but measured in multiples
//!  of the maximum chunk size and driven by the receiver, since the receiver is the side that
//!  advertises the window:
//!
//! * every window extension doubles the multiplier during slow start and adds one during
//!    congestion avoidance
//! * a detected loss (a gap in received offsets) halves the multiplier and switches to
//!    congestion avoidance for the rest of the session

use std::cmp::{max, min};
use tracing::{debug, trace};

use crate::safe_converter::SafeCast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    SlowStart,
    CongestionAvoidance,
}

#[derive(Debug)]
pub struct ReceiveWindow {
    max_chunk_size_bytes: u32,
    max_window_size_bytes: u64,
    extend_window_divisor: u32,
    multiplier: u32,
    phase: WindowPhase,
}

impl ReceiveWindow {
    pub fn new(max_chunk_size_bytes: u32, max_window_size_bytes: u64, extend_window_divisor: u32) -> ReceiveWindow {
        assert!(max_chunk_size_bytes > 0);
        assert!(extend_window_divisor > 0);

        ReceiveWindow {
            max_chunk_size_bytes,
            max_window_size_bytes,
            extend_window_divisor,
            multiplier: 1,
            phase: WindowPhase::SlowStart,
        }
    }

    pub fn phase(&self) -> WindowPhase {
        self.phase
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    pub fn window_size(&self) -> u64 {
        let max_chunk_size_bytes: u64 = self.max_chunk_size_bytes.safe_cast();
        let multiplier: u64 = self.multiplier.safe_cast();
        min(max_chunk_size_bytes * multiplier, self.max_window_size_bytes)
    }

    /// The receiver extends the window once the part still outstanding has shrunk to
    ///  `window_size / extend_window_divisor`
    pub fn should_extend(&self, remaining_in_window: u64) -> bool {
        let divisor: u64 = self.extend_window_divisor.safe_cast();
        remaining_in_window <= self.window_size() / divisor
    }

    pub fn on_window_extended(&mut self) {
        if self.window_size() >= self.max_window_size_bytes {
            trace!("window is at its maximum of {} bytes - no adjustment", self.max_window_size_bytes);
            return;
        }

        self.multiplier = match self.phase {
            WindowPhase::SlowStart => self.multiplier.saturating_mul(2),
            WindowPhase::CongestionAvoidance => self.multiplier.saturating_add(1),
        };
        debug!("extended window multiplier to {} ({:?})", self.multiplier, self.phase);
    }

    pub fn on_loss(&mut self) {
        self.multiplier = max(1, self.multiplier / 2);
        self.phase = WindowPhase::CongestionAvoidance;
        debug!("loss -> reducing window multiplier to {}", self.multiplier);
    }
}
