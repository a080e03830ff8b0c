use xxhash_rust::xxh3::xxh3_64;

/// Source of the server address list. The router asks on every call, so a
/// provider may return a changing fleet; pools for addresses that
/// disappear simply stop being used.
pub trait Servers: Send + Sync {
    fn list(&self) -> Vec<String>;
}

/// A fixed address list.
pub struct StaticServers(Vec<String>);

impl StaticServers {
    pub fn new(addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(addrs.into_iter().map(Into::into).collect())
    }
}

impl Servers for StaticServers {
    fn list(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl Servers for Vec<String> {
    fn list(&self) -> Vec<String> {
        self.clone()
    }
}

/// Maps a key to an index into `addrs`. Called with at least one address.
pub trait Selector: Send + Sync {
    fn select(&self, key: &[u8], addrs: &[String]) -> usize;
}

impl<F> Selector for F
where
    F: Fn(&[u8], &[String]) -> usize + Send + Sync,
{
    fn select(&self, key: &[u8], addrs: &[String]) -> usize {
        self(key, addrs)
    }
}

/// Jump consistent hash over a 64-bit xxh3 of the key: O(1) memory and
/// only ~1/n of keys move when the fleet grows or shrinks by one.
pub struct JumpHashSelector;

impl Selector for JumpHashSelector {
    fn select(&self, key: &[u8], addrs: &[String]) -> usize {
        jump_hash(xxh3_64(key), addrs.len())
    }
}

/// The legacy mapping: CRC32 of the key modulo the server count. Kept for
/// fleets that must agree with older clients; remaps ~half the keys on any
/// fleet change.
pub struct Crc32Selector;

impl Selector for Crc32Selector {
    fn select(&self, key: &[u8], addrs: &[String]) -> usize {
        crc32fast::hash(key) as usize % addrs.len()
    }
}

/// Lamping & Veach's jump consistent hash.
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let buckets = buckets as i64;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * ((1u64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64)))
            as i64;
    }
    b as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_hash_single_bucket() {
        for key in 0..100u64 {
            assert_eq!(jump_hash(key, 1), 0);
        }
    }

    #[test]
    fn jump_hash_stays_in_range() {
        for n in 1..20usize {
            for key in 0..1000u64 {
                assert!(jump_hash(key.wrapping_mul(0x9E37_79B9_7F4A_7C15), n) < n);
            }
        }
    }

    fn addrs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{i}:11211")).collect()
    }

    #[test]
    fn jump_hash_is_deterministic() {
        let selector = JumpHashSelector;
        let fleet = addrs(7);
        assert_eq!(selector.select(b"user:123", &fleet), selector.select(b"user:123", &fleet));
    }

    #[test]
    fn jump_hash_moves_few_keys_on_growth() {
        let mut moved = 0;
        let total = 10_000u64;
        for key in 0..total {
            if jump_hash(key, 10) != jump_hash(key, 11) {
                moved += 1;
            }
        }
        // ~1/11 of keys should move; allow generous slack
        assert!(moved < total / 6, "{moved} keys moved");
    }

    #[test]
    fn jump_hash_spreads_keys() {
        let n = 8usize;
        let mut histogram = vec![0u32; n];
        for key in 0..8000u64 {
            histogram[jump_hash(key.wrapping_mul(0x9E37_79B9_7F4A_7C15), n)] += 1;
        }
        for &count in &histogram {
            assert!((500..1500).contains(&count), "unbalanced: {histogram:?}");
        }
    }

    #[test]
    fn crc32_matches_modulo() {
        let selector = Crc32Selector;
        let expected = crc32fast::hash(b"user:123") as usize % 3;
        assert_eq!(selector.select(b"user:123", &addrs(3)), expected);
    }

    #[test]
    fn closure_selectors_work() {
        let selector = |_: &[u8], fleet: &[String]| fleet.len() - 1;
        assert_eq!(selector.select(b"anything", &addrs(4)), 3);
    }
}
