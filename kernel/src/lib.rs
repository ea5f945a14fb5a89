//! The TadpoleOS kernel library.
//!
//! The crate is `no_std` when built for a bare-metal target and a plain
//! `std` crate on the host, so the whole virtual-memory core can be
//! exercised by `cargo test` without an emulator.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod sync;
pub mod vm;
