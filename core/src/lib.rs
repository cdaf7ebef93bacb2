//! Platform-independent policy and arithmetic shared by the `passvisor`
//! hypervisor binary.
//!
//! Everything in this crate is pure: no MSR reads, no raw physical-memory
//! access, no inline assembly. The binary crate owns the mechanism (reading
//! an MSR, walking a real page table in guest memory) and calls into this
//! crate for the policy decision (what cache type two MTRR ranges combine
//! to, which MMIO hook a faulting address belongs to, how to decode an
//! instruction's length). That split is what lets this logic run under
//! `cargo test` on the host instead of only inside a UEFI guest.

#![no_std]
#![warn(
    future_incompatible,
    let_underscore,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    unused,
    missing_docs,
    unreachable_pub
)]

extern crate alloc;

pub mod cache;
pub mod config;
pub mod error;
pub mod interp;
pub mod mmio;
pub mod pagewalk;
pub mod shadow;

pub use error::{VmmError, VmmResult};
