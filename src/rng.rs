use rand::SeedableRng;
use rand::rngs::StdRng;

/// 64-bit finalizer used to spread seed material before it reaches the PRNG.
const fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn hash_label(label: &str) -> u64 {
    let mut acc = 0xcbf2_9ce4_8422_2325u64;
    for byte in label.bytes() {
        acc ^= u64::from(byte);
        acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
    }
    acc
}

/// Deterministic per-run random state. Every transformation site derives its
/// own generator from (seed, value salt, pass label, pass iteration, site
/// key), so outcomes do not depend on visit order or worker scheduling.
#[derive(Debug, Clone, Copy)]
pub struct Determinism {
    seed: u64,
    value_salt: u64,
}

impl Determinism {
    pub const fn new(seed: u64, value_salt: u64) -> Self {
        Self { seed, value_salt }
    }

    pub const fn seed(&self) -> u64 {
        self.seed
    }

    pub const fn value_salt(&self) -> u64 {
        self.value_salt
    }

    pub fn site_rng(&self, pass: &str, iteration: u32, site: u64) -> StdRng {
        let mut state = mix64(self.seed ^ hash_label(pass));
        state = mix64(state ^ self.value_salt.rotate_left(17));
        state = mix64(state ^ (u64::from(iteration) << 32) ^ site);
        StdRng::seed_from_u64(state)
    }

    /// Generator for run-scoped decisions that have no single site (name
    /// stems, junk bodies, builtin alias styles).
    pub fn pass_rng(&self, pass: &str, iteration: u32) -> StdRng {
        self.site_rng(pass, iteration, u64::MAX)
    }

    /// Salt baked into a string helper, derived from the value salt and the
    /// helper's pool index.
    pub const fn helper_salt(&self, index: usize) -> u64 {
        mix64(self.value_salt ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_site_rng_is_reproducible() {
        let det = Determinism::new(42, 23);
        let a: u64 = det.site_rng("strings", 0, 7).r#gen();
        let b: u64 = det.site_rng("strings", 0, 7).r#gen();
        assert_eq!(a, b);
    }

    #[test]
    fn test_site_rng_varies_by_site_and_pass() {
        let det = Determinism::new(42, 23);
        let a: u64 = det.site_rng("strings", 0, 7).r#gen();
        let b: u64 = det.site_rng("strings", 0, 8).r#gen();
        let c: u64 = det.site_rng("ints", 0, 7).r#gen();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_helper_salt_varies_by_index() {
        let det = Determinism::new(1, 99);
        assert_ne!(det.helper_salt(0), det.helper_salt(1));
    }
}
