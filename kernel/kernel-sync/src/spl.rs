//! Software interrupt-priority level (SPL).
//!
//! The machine model reloads its TLB in software, so the reload sequence
//! must not be re-entered by an interrupt taken halfway through. Rather than
//! touching hardware interrupt flags, the kernel tracks a per-processor
//! priority level: [`SplState::raise`] lifts it to *high* and returns a
//! guard that restores the previous level on drop, mirroring the classic
//! `spl = splhigh(); ...; splx(spl)` pairing as RAII.
//!
//! Code that must run at high priority can assert [`SplState::is_high`].

use core::sync::atomic::{AtomicU8, Ordering};

const IPL_LOW: u8 = 0;
const IPL_HIGH: u8 = 1;

/// Interrupt-priority state for one processor.
pub struct SplState {
    level: AtomicU8,
}

impl SplState {
    /// New state at low priority (interrupts admitted).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            level: AtomicU8::new(IPL_LOW),
        }
    }

    /// Raise to high priority; the previous level is restored when the
    /// returned guard drops. Nests: an inner raise keeps the level high
    /// until the outermost guard is gone.
    #[must_use]
    pub fn raise(&self) -> SplGuard<'_> {
        let prev = self.level.swap(IPL_HIGH, Ordering::Acquire);
        SplGuard { state: self, prev }
    }

    /// Whether the priority is currently high.
    #[must_use]
    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::Relaxed) == IPL_HIGH
    }
}

impl Default for SplState {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`SplState::raise`]; restores the saved level on
/// drop.
pub struct SplGuard<'a> {
    state: &'a SplState,
    prev: u8,
}

impl Drop for SplGuard<'_> {
    fn drop(&mut self) {
        self.state.level.store(self.prev, Ordering::Release);
    }
}
