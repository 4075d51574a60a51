//! Storage Primitives
//!
//! The building blocks the database is composed from. None of them knows
//! about commands or clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Dict<V>                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐       ┌─────────┐       │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │  ...  │ Shard N │       │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │       │ RwLock  │       │
//! │  └─────────┘ └─────────┘ └─────────┘       └─────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │ LockTable   [slot 0][slot 1][slot 2] ... [slot M]            │
//! │             key -> fnv32(key) & (M-1), acquired in ascending │
//! │             slot order, released in descending order         │
//! └──────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │ TimeWheel   ring of slots, one tick per interval,            │
//! │             driven by a background Tokio task                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Dict` and `LockTable` share the same hash so the mapping from key to
//! shard and from key to slot is a bitmask, never a modulo.

pub mod dict;
pub mod lock;
pub mod timewheel;
pub mod value;

pub use dict::Dict;
pub use lock::{BatchGuard, LockTable};
pub use timewheel::TimeWheel;
pub use value::DataValue;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a hash of `key`.
#[inline]
pub fn fnv32(key: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &b in key {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Rounds a requested table size up to a power of two, minimum 16.
pub fn compute_capacity(requested: usize) -> usize {
    requested.max(16).next_power_of_two()
}
