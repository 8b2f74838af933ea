//! Count classification. Raw hit counters from the coverage map are reduced
//! to a small bucket set so that traces from different runs stay comparable.

/// Selects which bucket encoding the classifier emits.
///
/// `Human` yields ordinal bucket numbers 0 through 8 for display-oriented
/// traces. `Binary` yields one-hot bit values so buckets from several runs
/// can be OR-combined by downstream tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifyMode {
    #[default]
    Human,
    Binary,
}

fn bucket_index(count: u8) -> u8 {
    match count {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4..=7 => 4,
        8..=15 => 5,
        16..=31 => 6,
        32..=127 => 7,
        128..=255 => 8,
    }
}

fn byte_table(mode: ClassifyMode) -> [u8; 256] {
    let mut table = [0u8; 256];
    for (count, slot) in table.iter_mut().enumerate() {
        let bucket = bucket_index(count as u8);
        *slot = match mode {
            ClassifyMode::Human => bucket,
            ClassifyMode::Binary => {
                if bucket == 0 {
                    0
                } else {
                    1 << (bucket - 1)
                }
            }
        };
    }
    table
}

/// Deterministic lookup tables built once at startup.
///
/// Classification runs over the whole map after every execution, so each
/// slot must cost one table load. The paired table classifies two slots per
/// lookup; it is keyed by the native-endian `u16` value of two adjacent map
/// bytes and preserves byte positions on any host endianness.
pub struct Classifier {
    edges_only: bool,
    byte_lookup: [u8; 256],
    pair_lookup: Box<[u16]>,
}

impl Classifier {
    pub fn new(mode: ClassifyMode, edges_only: bool) -> Self {
        let byte_lookup = byte_table(mode);
        let mut pair_lookup = vec![0u16; 1 << 16].into_boxed_slice();
        for (value, slot) in pair_lookup.iter_mut().enumerate() {
            let [a, b] = (value as u16).to_ne_bytes();
            *slot = u16::from_ne_bytes([byte_lookup[a as usize], byte_lookup[b as usize]]);
        }
        Self {
            edges_only,
            byte_lookup,
            pair_lookup,
        }
    }

    pub fn lookup_byte(&self, raw: u8) -> u8 {
        self.byte_lookup[raw as usize]
    }

    pub fn lookup_pair(&self, raw: u16) -> u16 {
        self.pair_lookup[raw as usize]
    }

    /// Rewrites every slot of `map` with its classified value.
    ///
    /// The map is walked in 64-bit words; all-zero words are skipped without
    /// touching the tables, the common case for sparse bitmaps. Edges-only
    /// collapses any nonzero count to 1 instead of consulting the tables.
    pub fn classify_in_place(&self, map: &mut [u8]) {
        let mut words = map.chunks_exact_mut(8);
        for word in words.by_ref() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(word);
            if u64::from_ne_bytes(raw) == 0 {
                continue;
            }
            if self.edges_only {
                for slot in word.iter_mut() {
                    if *slot != 0 {
                        *slot = 1;
                    }
                }
            } else {
                for half in word.chunks_exact_mut(2) {
                    let raw = u16::from_ne_bytes([half[0], half[1]]);
                    half.copy_from_slice(&self.pair_lookup[raw as usize].to_ne_bytes());
                }
            }
        }
        for slot in words.into_remainder() {
            *slot = if self.edges_only {
                u8::from(*slot != 0)
            } else {
                self.byte_lookup[*slot as usize]
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: [u8; 9] = [0, 1, 2, 3, 4, 8, 16, 32, 128];

    #[test]
    fn human_table_buckets_are_monotone_across_thresholds() {
        let classifier = Classifier::new(ClassifyMode::Human, false);
        let mut last_bucket = 0;
        for raw in 0..=255u8 {
            let bucket = classifier.lookup_byte(raw);
            assert!(
                bucket >= last_bucket,
                "bucket regressed at raw count {raw}: {bucket} < {last_bucket}"
            );
            last_bucket = bucket;
        }
        for (index, &threshold) in THRESHOLDS.iter().enumerate() {
            assert_eq!(classifier.lookup_byte(threshold), index as u8);
        }
        assert_eq!(classifier.lookup_byte(255), 8);
    }

    #[test]
    fn binary_table_emits_one_hot_buckets() {
        let classifier = Classifier::new(ClassifyMode::Binary, false);
        assert_eq!(classifier.lookup_byte(0), 0);
        for raw in 1..=255u8 {
            let bucket = classifier.lookup_byte(raw);
            assert_eq!(bucket.count_ones(), 1, "raw count {raw} not one-hot");
        }
        for (index, &threshold) in THRESHOLDS.iter().enumerate().skip(1) {
            assert_eq!(classifier.lookup_byte(threshold), 1 << (index - 1));
        }
    }

    #[test]
    fn pair_table_matches_byte_table_for_all_pairs() {
        let classifier = Classifier::new(ClassifyMode::Binary, false);
        for value in 0..=u16::MAX {
            let [a, b] = value.to_ne_bytes();
            let expected = u16::from_ne_bytes([
                classifier.lookup_byte(a),
                classifier.lookup_byte(b),
            ]);
            assert_eq!(classifier.lookup_pair(value), expected, "pair {value:#06x}");
        }
    }

    #[test]
    fn edges_only_collapses_every_nonzero_count_to_one() {
        let classifier = Classifier::new(ClassifyMode::Human, true);
        let mut map: Vec<u8> = (0..=255u8).collect();
        classifier.classify_in_place(&mut map);
        assert_eq!(map[0], 0);
        assert!(map[1..].iter().all(|&b| b == 1));
    }

    #[test]
    fn classify_in_place_matches_per_byte_lookup() {
        let classifier = Classifier::new(ClassifyMode::Human, false);
        let mut map = vec![0u8; 4096];
        map[0] = 1;
        map[1] = 200;
        map[9] = 3;
        map[100] = 17;
        map[4095] = 255;
        let expected: Vec<u8> = map.iter().map(|&b| classifier.lookup_byte(b)).collect();
        classifier.classify_in_place(&mut map);
        assert_eq!(map, expected);
    }

    #[test]
    fn all_zero_map_stays_untouched() {
        let classifier = Classifier::new(ClassifyMode::Binary, false);
        let mut map = vec![0u8; 1024];
        classifier.classify_in_place(&mut map);
        assert!(map.iter().all(|&b| b == 0));
    }
}
