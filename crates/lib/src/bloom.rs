use serde::{Deserialize, Serialize};

/// Lowest bit count a filter is sized to, regardless of row count.
const MIN_BITS: u64 = 64;

/// A bloom filter over the values of one indexed column.
///
/// Membership hashing is double hashing over a blake3 digest of the value's
/// portable rendering, so the serialized filter means the same thing to every
/// peer. Serialized as `{"k": .., "m": .., "bits": base64}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    k: u32,
    m: u64,
    #[serde(with = "base64_bytes")]
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Size a filter for `items` expected entries at false-positive
    /// probability `fp_rate`.
    pub fn with_capacity(items: usize, fp_rate: f64) -> Self {
        let n = items.max(1) as f64;
        let p = fp_rate.clamp(1e-6, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(MIN_BITS as f64) as u64;
        let k = ((m as f64 / n) * ln2).round().max(1.0) as u32;
        BloomFilter {
            k,
            m,
            bits: vec![0u8; m.div_ceil(8) as usize],
        }
    }

    fn bit_positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let digest = blake3::hash(item);
        let raw = digest.as_bytes();
        let h1 = u64::from_le_bytes(raw[0..8].try_into().unwrap());
        let h2 = u64::from_le_bytes(raw[8..16].try_into().unwrap());
        let m = self.m;
        (0..self.k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    pub fn insert(&mut self, item: &[u8]) {
        let positions: Vec<u64> = self.bit_positions(item).collect();
        for pos in positions {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    /// False positives possible, false negatives not.
    pub fn contains(&self, item: &[u8]) -> bool {
        self.bit_positions(item)
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(de::Error::custom)
    }
}
