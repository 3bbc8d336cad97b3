use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use siphasher::sip::SipHasher13;

/// Process-wide resize policy, consulted whenever a set decides whether to
/// grow or shrink.
///
/// `Avoid` raises the grow threshold and lowers the shrink threshold. It is
/// meant to be flipped briefly around sections where resizing would be
/// harmful (e.g. while table memory is being copied elsewhere); callers that
/// flip it own the discipline of restoring it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResizePolicy {
    Allow,
    Avoid,
}

impl Default for ResizePolicy {
    fn default() -> Self {
        ResizePolicy::Allow
    }
}

static RESIZE_POLICY: AtomicU8 = AtomicU8::new(0);

/// Sets the process-wide resize policy.
pub fn set_resize_policy(policy: ResizePolicy) {
    RESIZE_POLICY.store(policy as u8, Ordering::Relaxed);
}

/// Returns the current process-wide resize policy.
pub fn resize_policy() -> ResizePolicy {
    match RESIZE_POLICY.load(Ordering::Relaxed) {
        0 => ResizePolicy::Allow,
        _ => ResizePolicy::Avoid,
    }
}

// The 16-byte seed of the stock hash function, stored as the two SipHash
// keys. All zeroes until a seed is installed.
static HASH_SEED_K0: AtomicU64 = AtomicU64::new(0);
static HASH_SEED_K1: AtomicU64 = AtomicU64::new(0);

/// Installs the 16-byte seed used by [`hash_bytes`] and the seeded
/// descriptors. Intended to be called once at process start, before any set
/// is populated; changing the seed while sets are live makes their stored
/// elements unreachable.
pub fn set_hash_function_seed(seed: [u8; 16]) {
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&seed[..8]);
    k1.copy_from_slice(&seed[8..]);
    HASH_SEED_K0.store(u64::from_le_bytes(k0), Ordering::Relaxed);
    HASH_SEED_K1.store(u64::from_le_bytes(k1), Ordering::Relaxed);
}

pub(crate) fn seeded_hasher() -> SipHasher13 {
    SipHasher13::new_with_keys(
        HASH_SEED_K0.load(Ordering::Relaxed),
        HASH_SEED_K1.load(Ordering::Relaxed),
    )
}

/// Hashes a byte string with the seeded stock hash function (SipHash-1-3).
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut hasher = seeded_hasher();
    hasher.write(data);
    hasher.finish()
}
