use std::collections::BTreeMap;
use std::sync::MutexGuard;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::prefix_range;

/// A storage transaction.
///
/// The transaction holds the engine mutex for its whole lifetime, so
/// transactions are fully serialized: writes of a committed transaction are
/// visible to the next one in their entirety or not at all, and sequence
/// allocation is strictly monotonic across transactions.
///
/// Writes are buffered in an ordered overlay and only applied to the engine
/// on commit; reads and scans merge the overlay over the engine state, so a
/// transaction sees its own writes. Dropping or rolling back discards the
/// overlay, leaving the engine untouched.
pub struct Txn<'a, E: Engine> {
    /// Exclusive access to the locked engine.
    engine: MutexGuard<'a, E>,

    /// Buffered writes, None marking a deletion.
    buf: BTreeMap<Vec<u8>, Option<Vec<u8>>>,

    /// True once committed or rolled back; all further use is rejected.
    done: bool,
}

impl<'a, E: Engine> Txn<'a, E> {
    pub(crate) fn new(engine: MutexGuard<'a, E>) -> Self {
        Self { engine, buf: BTreeMap::new(), done: false }
    }

    fn live(&self) -> CResult<()> {
        if self.done {
            return Err(Error::TxRequired);
        }
        Ok(())
    }

    /// Applies the buffered writes to the engine and flushes it. The
    /// transaction can not be used afterwards.
    pub fn commit(&mut self) -> CResult<()> {
        self.live()?;
        self.done = true;
        for (key, value) in std::mem::take(&mut self.buf) {
            match value {
                Some(value) => self.engine.set(&key, value)?,
                None => self.engine.delete(&key)?,
            }
        }
        self.engine.flush()
    }

    /// Discards the buffered writes. The transaction can not be used
    /// afterwards. Dropping an uncommitted transaction has the same effect.
    pub fn rollback(&mut self) -> CResult<()> {
        self.live()?;
        self.done = true;
        self.buf.clear();
        Ok(())
    }

    pub(crate) fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.live()?;
        if let Some(value) = self.buf.get(key) {
            return Ok(value.clone());
        }
        self.engine.get(key)
    }

    pub(crate) fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.live()?;
        self.buf.insert(key.to_vec(), Some(value));
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.live()?;
        self.buf.insert(key.to_vec(), None);
        Ok(())
    }

    /// Returns all key/value pairs starting with `prefix`, in key order,
    /// with the overlay merged over the engine state.
    pub(crate) fn scan_prefix(&mut self, prefix: &[u8]) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.live()?;
        let range = prefix_range(prefix);

        let stored: Vec<(Vec<u8>, Vec<u8>)> =
            self.engine.scan((range.0.clone(), range.1.clone())).collect::<CResult<_>>()?;
        let overlay: Vec<(Vec<u8>, Option<Vec<u8>>)> =
            self.buf.range(range).map(|(k, v)| (k.clone(), v.clone())).collect();

        let mut merged = Vec::with_capacity(stored.len() + overlay.len());
        let mut stored = stored.into_iter().peekable();
        let mut overlay = overlay.into_iter().peekable();
        loop {
            let order = match (stored.peek(), overlay.peek()) {
                (None, None) => break,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some((sk, _)), Some((ok, _))) => sk.cmp(ok),
            };
            match order {
                std::cmp::Ordering::Less => merged.push(stored.next().unwrap()),
                std::cmp::Ordering::Equal | std::cmp::Ordering::Greater => {
                    // The overlay wins on equal keys, and buffered
                    // deletions drop the stored pair.
                    if order == std::cmp::Ordering::Equal {
                        stored.next();
                    }
                    if let (key, Some(value)) = overlay.next().unwrap() {
                        merged.push((key, value));
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Allocates the next value of the sequence stored at `key`, starting
    /// at 1. Monotonicity across transactions follows from transaction
    /// serialization.
    pub(crate) fn next_id(&mut self, key: &[u8]) -> CResult<u64> {
        let next = self.current_id(key)? + 1;
        self.set(key, next.to_be_bytes().to_vec())?;
        Ok(next)
    }

    /// Reads a sequence without advancing it; 0 if never allocated.
    pub(crate) fn current_id(&mut self, key: &[u8]) -> CResult<u64> {
        Ok(self
            .get(key)?
            .map(|raw| {
                if raw.len() != 8 {
                    return Err(Error::Corrupt(format!("bad sequence value at {:?}", key)));
                }
                Ok(BigEndian::read_u64(&raw))
            })
            .transpose()?
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::memory::Memory;
    use std::sync::Mutex;

    fn with_txn<T>(engine: &Mutex<Memory>, f: impl FnOnce(&mut Txn<Memory>) -> T) -> T {
        let mut txn = Txn::new(engine.lock().unwrap());
        f(&mut txn)
    }

    #[test]
    fn commit_applies_rollback_discards() -> CResult<()> {
        let engine = Mutex::new(Memory::new());

        with_txn(&engine, |txn| -> CResult<()> {
            txn.set(b"a", vec![1])?;
            txn.set(b"b", vec![2])?;
            txn.commit()
        })?;

        with_txn(&engine, |txn| -> CResult<()> {
            txn.set(b"a", vec![9])?;
            txn.delete(b"b")?;
            // Uncommitted changes are visible to the transaction itself.
            assert_eq!(txn.get(b"a")?, Some(vec![9]));
            assert_eq!(txn.get(b"b")?, None);
            txn.rollback()
        })?;

        with_txn(&engine, |txn| -> CResult<()> {
            assert_eq!(txn.get(b"a")?, Some(vec![1]));
            assert_eq!(txn.get(b"b")?, Some(vec![2]));
            Ok(())
        })
    }

    #[test]
    fn finished_txn_is_rejected() -> CResult<()> {
        let engine = Mutex::new(Memory::new());
        let mut txn = Txn::new(engine.lock().unwrap());
        txn.commit()?;
        assert_eq!(txn.get(b"a"), Err(Error::TxRequired));
        assert_eq!(txn.set(b"a", vec![1]), Err(Error::TxRequired));
        assert_eq!(txn.commit(), Err(Error::TxRequired));
        Ok(())
    }

    #[test]
    fn scan_prefix_merges_overlay() -> CResult<()> {
        let engine = Mutex::new(Memory::new());
        with_txn(&engine, |txn| -> CResult<()> {
            txn.set(b"k/a", vec![1])?;
            txn.set(b"k/b", vec![2])?;
            txn.set(b"k/c", vec![3])?;
            txn.set(b"other", vec![9])?;
            txn.commit()
        })?;

        with_txn(&engine, |txn| -> CResult<()> {
            txn.set(b"k/b", vec![20])?; // override
            txn.delete(b"k/c")?; // delete
            txn.set(b"k/d", vec![4])?; // new
            assert_eq!(
                txn.scan_prefix(b"k/")?,
                vec![
                    (b"k/a".to_vec(), vec![1]),
                    (b"k/b".to_vec(), vec![20]),
                    (b"k/d".to_vec(), vec![4]),
                ]
            );
            Ok(())
        })
    }

    #[test]
    fn sequences_are_monotonic() -> CResult<()> {
        let engine = Mutex::new(Memory::new());
        with_txn(&engine, |txn| -> CResult<()> {
            assert_eq!(txn.current_id(b"seq")?, 0);
            assert_eq!(txn.next_id(b"seq")?, 1);
            assert_eq!(txn.next_id(b"seq")?, 2);
            txn.commit()
        })?;
        // A rolled back allocation is not persisted.
        with_txn(&engine, |txn| -> CResult<()> {
            assert_eq!(txn.next_id(b"seq")?, 3);
            txn.rollback()
        })?;
        with_txn(&engine, |txn| -> CResult<()> {
            assert_eq!(txn.next_id(b"seq")?, 3);
            Ok(())
        })
    }
}
