//! # Kernel Configuration
//!
//! Compile-time configuration shared across the kernel crates. This crate is
//! the authoritative source for the user address-space layout; keeping the
//! numbers in one place prevents configuration drift between the VM core,
//! the syscall layer, and the ELF loader.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
