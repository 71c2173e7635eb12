//! # Kernel synchronization primitives
//!
//! Two small building blocks used throughout the VM core:
//!
//! - [`SpinLock`], a blocking mutual-exclusion primitive with an RAII guard.
//!   Page tables and page-table entries each embed one.
//! - [`SplState`]/[`SplGuard`], a software interrupt-priority level. Code
//!   that programs the TLB raises the priority for the duration of the
//!   critical section so an interrupt cannot re-enter the reload path.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
pub mod spl;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use spl::{SplGuard, SplState};
