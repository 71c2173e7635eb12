//! # User Memory Layout
//!
//! The user virtual address space is the low 2 GiB of the 32-bit range.
//! The stack sits at the very top and grows downward; the heap begins just
//! above the highest ELF-defined segment and grows upward; file mappings are
//! placed in the gap between the two.
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  ELF segments (text, data, …)   │
//!             ├─────────────────────────────────┤
//!             │  heap (grows upward)            │
//!             ├─────────────────────────────────┤
//!             │  mapped files (grow downward)   │
//!             ├─────────────────────────────────┤
//!             │  stack (STACK_PAGES)            │
//! USERSTACK   └─────────────────────────────────┘
//! ```

use kernel_memory_addresses::PAGE_SIZE;

/// Initial user stack pointer; one past the highest user-addressable byte.
pub const USERSTACK: u32 = 0x8000_0000;

/// Number of pages reserved for the user stack, ending at [`USERSTACK`].
pub const STACK_PAGES: u32 = 18;

/// Pages given to the heap when it is first defined.
pub const INITIAL_HEAP_PAGES: u32 = 1;

const _: () = {
    assert!(USERSTACK % PAGE_SIZE == 0);
    assert!(STACK_PAGES >= 1);
    assert!(INITIAL_HEAP_PAGES >= 1);
};
