//! Deterministic MinHash sketching over user-id sets.
//!
//! A signature vector `S[i]` for an item is the element-wise minimum, across
//! the item's observed users, of `P` independent universal-hash permutations
//! applied to each user id. Two items with high Jaccard similarity between
//! their user sets are expected to agree on many signature bands.

use rand::{RngCore, SeedableRng};
use rand::rngs::SmallRng;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

/// Opaque identifier of a user who interacted with an item.
pub type UserId = i64;

/// Default number of independent hash bands in a signature vector.
pub const DEFAULT_BANDS: usize = 128;

// Fixed so that every process in a deployment draws the same permutation
// coefficients for a given band count.
const PERMUTATION_SEED: u64 = 0x5EC0_DED_B17E_5EED;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SketchError {
    #[error("minhash_union requires at least one user")]
    EmptyUserSet,
}

/// The `(A, B)` coefficients of `P` universal hash functions.
#[derive(Clone)]
pub struct Permutations {
    pub a: Arc<[u64]>,
    pub b: Arc<[u64]>,
}

fn permutation_cache() -> &'static RwLock<HashMap<usize, Permutations>> {
    static CACHE: OnceLock<RwLock<HashMap<usize, Permutations>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns the deterministic `(A[P], B[P])` permutation coefficients, memoized
/// per process so repeated calls with the same `p` are cheap.
pub fn permutations(p: usize) -> Permutations {
    if let Some(found) = permutation_cache().read().unwrap().get(&p) {
        return found.clone();
    }

    let mut rng = SmallRng::seed_from_u64(PERMUTATION_SEED);
    let a: Vec<u64> = (0..p).map(|_| rng.next_u64()).collect();
    let b: Vec<u64> = (0..p).map(|_| rng.next_u64()).collect();
    let perms = Permutations {
        a: a.into(),
        b: b.into(),
    };

    permutation_cache()
        .write()
        .unwrap()
        .insert(p, perms.clone());
    perms
}

/// Little-endian uint32 of the first 4 bytes of `SHA1(utf8(user))`, widened to
/// `u64` for the universal-hash multiplication below.
fn user_prefix(user: UserId) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(user.to_string().as_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64
}

/// Computes the `P`-band MinHash of a single user id. `h_b(u) = (A[b]*x + B[b])
/// mod 2**64`, where wrapping arithmetic on `u64` gives the modulus for free.
pub fn minhash(user: UserId, p: usize) -> Vec<u64> {
    let perms = permutations(p);
    let x = user_prefix(user);
    (0..p)
        .map(|b| perms.a[b].wrapping_mul(x).wrapping_add(perms.b[b]))
        .collect()
}

/// Computes the signature of an item from its observed user set: the
/// element-wise minimum of `minhash(u, p)` over every `u` in `users`.
/// Fails on an empty set — there is no meaningful sketch for zero users.
pub fn minhash_union<I>(users: I, p: usize) -> Result<Vec<u64>, SketchError>
where
    I: IntoIterator<Item = UserId>,
{
    let mut iter = users.into_iter();
    let first = iter.next().ok_or(SketchError::EmptyUserSet)?;
    let mut acc = minhash(first, p);
    for u in iter {
        let h = minhash(u, p);
        for b in 0..p {
            if h[b] < acc[b] {
                acc[b] = h[b];
            }
        }
    }
    Ok(acc)
}

/// The bands where `old[b] > new[b]`, in ascending order, together with their
/// old and new values. Bands that are unchanged or only improved by `new`
/// being larger are excluded — they require no secondary-index mutation.
#[derive(Debug, PartialEq, Eq)]
pub struct SketchDiff {
    pub bands: Vec<usize>,
    pub old_vals: Vec<u64>,
    pub new_vals: Vec<u64>,
}

impl SketchDiff {
    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

/// Identifies which posting lists must move when a sketch is updated from
/// `old` to `new`. Only bands that strictly decreased are reported; ties are
/// excluded because the posting-list membership does not change.
pub fn diff(old: &[u64], new: &[u64]) -> SketchDiff {
    let len = old.len().min(new.len());
    let mut bands = Vec::new();
    let mut old_vals = Vec::new();
    let mut new_vals = Vec::new();

    for b in 0..len {
        if old[b] > new[b] {
            bands.push(b);
            old_vals.push(old[b]);
            new_vals.push(new[b]);
        }
    }

    SketchDiff {
        bands,
        old_vals,
        new_vals,
    }
}
