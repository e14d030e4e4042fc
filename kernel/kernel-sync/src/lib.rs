//! # Kernel synchronization primitives
//!
//! A busy-waiting mutual-exclusion lock for short critical sections. Nothing
//! here blocks or sleeps; a contended acquisition spins until the holder
//! releases.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
