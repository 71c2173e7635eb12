//! # Physical Frame Allocation
//!
//! The physical-memory side of the VM core, in two layers:
//!
//! - [`BitmapFrameAlloc`] tracks which frames of a physical range are free
//!   or in use (one bit per frame) and implements the
//!   [`FrameAlloc`](kernel_vmem::FrameAlloc) contract the VM core consumes.
//! - [`FrameBank`] owns the page-aligned storage standing in for that
//!   physical range and implements
//!   [`PhysMapper`](kernel_vmem::PhysMapper), turning a physical address
//!   into a usable pointer at a fixed offset, the way a direct map does.
//!
//! Keeping the two apart mirrors the machine: the allocator only does
//! bookkeeping and never touches frame contents, while the bank is the
//! memory itself. Tests and the early-boot kernel wire the same pair
//! together.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod frame_bank;
mod frame_bitmap;

pub use frame_bank::FrameBank;
pub use frame_bitmap::BitmapFrameAlloc;
