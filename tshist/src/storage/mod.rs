pub mod disk;
pub mod engine;
pub mod memory;
pub mod txn;

use std::ops::Bound;

/// Maps keys to a value position and length in the disk engine's log file.
/// A BTreeMap keeps the keys ordered for range scans and compaction.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// Returns the key range covering exactly the keys starting with `prefix`.
pub(crate) fn prefix_range(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(prefix.to_vec());
    let end = match prefix.iter().rposition(|b| *b != 0xff) {
        Some(i) => Bound::Excluded(
            prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect(),
        ),
        None => Bound::Unbounded,
    };
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_bumps_last_byte() {
        let (start, end) = prefix_range(b"ab");
        assert_eq!(start, Bound::Included(b"ab".to_vec()));
        assert_eq!(end, Bound::Excluded(b"ac".to_vec()));
    }

    #[test]
    fn prefix_range_skips_trailing_ff() {
        let (_, end) = prefix_range(&[0x61, 0xff]);
        assert_eq!(end, Bound::Excluded(vec![0x62]));
        let (_, end) = prefix_range(&[0xff, 0xff]);
        assert_eq!(end, Bound::Unbounded);
    }

    /// Drives an engine through the access patterns the repository layers
    /// on top of it: row upserts, tombstones, and ordered scans over table
    /// keyspaces. Invoked once per engine implementation.
    macro_rules! engine_suite {
        ($build:expr) => {
            use crate::error::CResult;
            use crate::keys;

            #[test]
            fn upsert_and_lookup() -> CResult<()> {
                let mut engine = $build;
                let row = keys::registry("tsh", 1);

                assert_eq!(engine.get(&row)?, None);
                engine.set(&row, b"alpha".to_vec())?;
                engine.set(&keys::regname("tsh", "alpha"), 1u64.to_be_bytes().to_vec())?;
                assert_eq!(engine.get(&row)?, Some(b"alpha".to_vec()));

                // an upsert replaces the row wholesale
                engine.set(&row, b"alpha, renamed".to_vec())?;
                assert_eq!(engine.get(&row)?, Some(b"alpha, renamed".to_vec()));
                assert_eq!(
                    engine.get(&keys::regname("tsh", "alpha"))?,
                    Some(1u64.to_be_bytes().to_vec())
                );

                // empty keys and empty values are both legal
                engine.set(b"", vec![])?;
                assert_eq!(engine.get(b"")?, Some(vec![]));
                Ok(())
            }

            #[test]
            fn deletes_are_idempotent() -> CResult<()> {
                let mut engine = $build;
                let first = keys::chunk("tsh", "prices", 1);
                let second = keys::chunk("tsh", "prices", 2);

                engine.set(&first, vec![1])?;
                engine.set(&second, vec![2])?;
                engine.delete(&first)?;
                assert_eq!(engine.get(&first)?, None);
                assert_eq!(engine.get(&second)?, Some(vec![2]));

                // deleting again, or deleting the never-written, changes
                // nothing
                engine.delete(&first)?;
                engine.delete(b"never written")?;
                assert_eq!(engine.get(&first)?, None);
                assert_eq!(engine.get(&second)?, Some(vec![2]));
                Ok(())
            }

            #[test]
            fn scans_follow_id_order() -> CResult<()> {
                let mut engine = $build;
                // chunk ids are big-endian in the key, so id order is key
                // order no matter the insertion order
                for id in [3u64, 1, 4, 2] {
                    engine.set(&keys::chunk("tsh", "prices", id), vec![id as u8])?;
                }

                let prefix = keys::chunk_prefix("tsh", "prices");
                let forward: Vec<u8> = engine
                    .scan_prefix(&prefix)
                    .map(|item| item.map(|(_, value)| value[0]))
                    .collect::<CResult<_>>()?;
                assert_eq!(forward, vec![1, 2, 3, 4]);

                // walking back from the newest id is how the latest
                // revision is found
                let backward: Vec<u8> = engine
                    .scan_prefix(&prefix)
                    .rev()
                    .map(|item| item.map(|(_, value)| value[0]))
                    .collect::<CResult<_>>()?;
                assert_eq!(backward, vec![4, 3, 2, 1]);

                // a bounded id range stays inside its bounds
                let middle: Vec<u8> = engine
                    .scan(keys::chunk("tsh", "prices", 2)..=keys::chunk("tsh", "prices", 3))
                    .map(|item| item.map(|(_, value)| value[0]))
                    .collect::<CResult<_>>()?;
                assert_eq!(middle, vec![2, 3]);
                Ok(())
            }

            #[test]
            fn prefix_scans_stay_inside_their_keyspace() -> CResult<()> {
                let mut engine = $build;
                // two series whose names share a prefix, plus the same
                // table in another keyspace
                engine.set(&keys::revision("tsh", "power", 1), vec![1])?;
                engine.set(&keys::revision("tsh", "power.fr", 1), vec![2])?;
                engine.set(&keys::chunk("tsh", "power", 1), vec![3])?;

                let hits = engine
                    .scan_prefix(&keys::revision_prefix("tsh", "power"))
                    .collect::<CResult<Vec<_>>>()?;
                assert_eq!(hits.len(), 1);
                assert_eq!(hits[0].1, vec![1]);

                // keys ending in 0xff must not leak into the next prefix
                engine.set(b"\xff\xff", vec![9])?;
                let all_ff = engine.scan_prefix(b"\xff").collect::<CResult<Vec<_>>>()?;
                assert_eq!(all_ff, vec![(b"\xff\xff".to_vec(), vec![9])]);
                Ok(())
            }

            #[test]
            fn agrees_with_an_ordered_map() -> CResult<()> {
                use rand::{Rng, SeedableRng};

                let mut rng = rand::rngs::StdRng::seed_from_u64(0x7485);
                let mut engine = $build;
                let mut oracle = std::collections::BTreeMap::new();

                // keys come from a small pool of realistic row keys, so
                // overwrites, re-deletes and prefix scans actually hit
                let tables = ["prices", "load", "wind"];
                let pool: Vec<Vec<u8>> = tables
                    .iter()
                    .flat_map(|table| (0..40u64).map(move |id| keys::chunk("tsh", table, id)))
                    .collect();

                for _ in 0..2000 {
                    let key = pool[rng.gen_range(0..pool.len())].clone();
                    match rng.gen_range(0..10u8) {
                        0..=4 => {
                            let value: Vec<u8> =
                                (0..rng.gen_range(1usize..=16)).map(|_| rng.gen()).collect();
                            engine.set(&key, value.clone())?;
                            oracle.insert(key, value);
                        }
                        5..=6 => {
                            engine.delete(&key)?;
                            oracle.remove(&key);
                        }
                        7..=8 => {
                            assert_eq!(engine.get(&key)?, oracle.get(&key).cloned());
                        }
                        _ => {
                            let table = tables[rng.gen_range(0..tables.len())];
                            let prefix = keys::chunk_prefix("tsh", table);
                            let got =
                                engine.scan_prefix(&prefix).collect::<CResult<Vec<_>>>()?;
                            let want: Vec<_> = oracle
                                .iter()
                                .filter(|(key, _)| key.starts_with(&prefix))
                                .map(|(key, value)| (key.clone(), value.clone()))
                                .collect();
                            assert_eq!(got, want);
                        }
                    }
                }

                // and the end states agree wholesale
                let state = engine.scan(..).collect::<CResult<Vec<_>>>()?;
                let want: Vec<_> =
                    oracle.iter().map(|(key, value)| (key.clone(), value.clone())).collect();
                assert_eq!(state, want);
                Ok(())
            }
        };
    }

    pub(super) use engine_suite; // export for use in submodules
}
