use rand::{rngs::StdRng, SeedableRng};

/// Construct a deterministic RNG from a fixed seed.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Seeded when a seed is given, otherwise drawn from OS entropy.
pub fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => seeded_rng(seed),
        None => StdRng::from_entropy(),
    }
}

/// Derive an independent stream for `salt` (an epoch, a worker) from a base seed.
pub fn derive_seed(seed: u64, salt: u64) -> u64 {
    seed ^ salt.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
