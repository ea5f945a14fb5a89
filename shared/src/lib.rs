//! Constants and helpers shared between the kernel and its tooling.

#![no_std]

pub mod mem;
pub mod sizes;
