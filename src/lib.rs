#![cfg_attr(feature = "nightly", feature(core_intrinsics))]

//! A cache-line conscious hash set with incremental resizing.
//!
//! Elements live in fixed-size buckets of seven slots whose occupancy bits
//! and hash tags share the first eight bytes, so a lookup filters candidates
//! with a single cache line load before touching any element slot. Table
//! resizes are amortized over subsequent operations while both the old and
//! the new table stay live.

/// Process-wide runtime toggles
pub mod config;
/// Crate error type
pub mod error;
/// The hash set and its raw table
pub mod set;

/// Set of compiler hints
mod hint;

pub use crate::config::{
    hash_bytes, resize_policy, set_hash_function_seed, set_resize_policy, ResizePolicy,
};
pub use crate::error::{OveError, Result};
pub use crate::set::cursor::next_cursor;
pub use crate::set::{
    FindPosition, Hashset, Iter, Position, SafeIter, SelfKeyed, SetType, TwoPhasePop,
};
