use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::KeyDir;

const PUT: u8 = 1;
const DEL: u8 = 0;
/// Bytes before the key: tag + key length, plus the value length for puts.
const PUT_HEADER: u64 = 9;
const DEL_HEADER: u64 = 5;

/// A log-structured key/value engine: frames are appended to a single file
/// and an in-memory keydir maps each live key to where its current value
/// sits, so all live keys must fit in memory. Deletions append a tombstone
/// frame; replaced values and tombstones pile up in the file until
/// `compact()` rewrites it from the keydir.
///
/// A frame is laid out as:
///
/// - a tag byte, 1 for a put and 0 for a tombstone,
/// - the key length as a big-endian u32,
/// - the value length as a big-endian u32 (puts only),
/// - the key bytes, then the value bytes (puts only).
pub struct DiskLog {
    path: PathBuf,
    /// The log file, held under an exclusive lock.
    file: std::fs::File,
    /// Live keys mapped to their value offset and length.
    keydir: KeyDir,
}

/// A frame decoded during replay.
enum Frame {
    Put { key: Vec<u8>, at: u64, len: u32 },
    Del { key: Vec<u8> },
}

impl DiskLog {
    /// Opens or creates the log at `path`, locks it, and rebuilds the
    /// keydir by replaying every frame. A torn frame at the end of the
    /// file (an interrupted write) is dropped; a damaged frame anywhere
    /// else is an error.
    pub fn new(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()?;

        let mut engine = Self { path, file, keydir: KeyDir::new() };
        engine.keydir = engine.replay()?;
        Ok(engine)
    }

    /// Replays the log into a fresh keydir, then chops off whatever
    /// trailing bytes did not form a whole frame.
    fn replay(&mut self) -> CResult<KeyDir> {
        let end = self.file.metadata()?.len();
        let mut keydir = KeyDir::new();
        let mut offset = self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.file);

        while offset < end {
            let Some((frame, next)) = read_frame(&mut reader, offset, end)? else {
                break;
            };
            match frame {
                Frame::Put { key, at, len } => {
                    keydir.insert(key, (at, len));
                }
                Frame::Del { key } => {
                    keydir.remove(&key);
                }
            }
            offset = next;
        }
        drop(reader);

        if offset < end {
            log::warn!("dropping {} bytes of torn frames at offset {}", end - offset, offset);
            self.file.set_len(offset)?;
        }
        Ok(keydir)
    }

    /// Appends a put frame, returning the offset and length of the value.
    fn append_put(&mut self, key: &[u8], value: &[u8]) -> CResult<(u64, u32)> {
        let at = self.file.seek(SeekFrom::End(0))?;
        let mut frame = Vec::with_capacity(PUT_HEADER as usize + key.len() + value.len());
        frame.push(PUT);
        frame.extend_from_slice(&(key.len() as u32).to_be_bytes());
        frame.extend_from_slice(&(value.len() as u32).to_be_bytes());
        frame.extend_from_slice(key);
        frame.extend_from_slice(value);
        self.file.write_all(&frame)?;
        Ok((at + PUT_HEADER + key.len() as u64, value.len() as u32))
    }

    fn append_del(&mut self, key: &[u8]) -> CResult<()> {
        self.file.seek(SeekFrom::End(0))?;
        let mut frame = Vec::with_capacity(DEL_HEADER as usize + key.len());
        frame.push(DEL);
        frame.extend_from_slice(&(key.len() as u32).to_be_bytes());
        frame.extend_from_slice(key);
        Ok(self.file.write_all(&frame)?)
    }

    fn read_at(file: &mut std::fs::File, (at, len): (u64, u32)) -> CResult<Vec<u8>> {
        let mut value = vec![0; len as usize];
        file.seek(SeekFrom::Start(at))?;
        file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Rewrites the log with one put frame per live key and swaps it in,
    /// shedding stale values and tombstones.
    pub fn compact(&mut self) -> CResult<()> {
        let tmp_path = self.path.with_extension("compacting");
        let tmp = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut rebuilt = KeyDir::new();
        let mut offset = 0u64;
        let mut writer = BufWriter::new(&tmp);
        for (key, slot) in &self.keydir {
            let value = Self::read_at(&mut self.file, *slot)?;
            writer.write_all(&[PUT])?;
            writer.write_all(&(key.len() as u32).to_be_bytes())?;
            writer.write_all(&(value.len() as u32).to_be_bytes())?;
            writer.write_all(key)?;
            writer.write_all(&value)?;

            let at = offset + PUT_HEADER + key.len() as u64;
            rebuilt.insert(key.clone(), (at, value.len() as u32));
            offset = at + value.len() as u64;
        }
        writer.flush()?;
        drop(writer);
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;
        tmp.try_lock_exclusive()?;
        self.file = tmp;
        self.keydir = rebuilt;
        Ok(())
    }
}

/// Reads the frame starting at `offset`, returning it together with the
/// offset of the next frame. None means the remaining bytes do not hold a
/// whole frame, which only a torn tail write produces. An unknown tag
/// means the log is damaged, and that is never silently dropped.
fn read_frame(reader: &mut impl Read, offset: u64, end: u64) -> CResult<Option<(Frame, u64)>> {
    let mut header = [0u8; DEL_HEADER as usize];
    if !fill(reader, &mut header)? {
        return Ok(None);
    }
    let key_len = u32::from_be_bytes(header[1..].try_into().expect("sized above")) as u64;

    match header[0] {
        DEL => {
            let next = offset + DEL_HEADER + key_len;
            if next > end {
                return Ok(None);
            }
            let mut key = vec![0; key_len as usize];
            reader.read_exact(&mut key)?;
            Ok(Some((Frame::Del { key }, next)))
        }
        PUT => {
            let mut len_buf = [0u8; 4];
            if !fill(reader, &mut len_buf)? {
                return Ok(None);
            }
            let len = u32::from_be_bytes(len_buf);
            let at = offset + PUT_HEADER + key_len;
            let next = at + len as u64;
            if next > end {
                return Ok(None);
            }
            let mut key = vec![0; key_len as usize];
            reader.read_exact(&mut key)?;
            // the value is not needed here, only its location
            std::io::copy(&mut reader.by_ref().take(len as u64), &mut std::io::sink())?;
            Ok(Some((Frame::Put { key, at, len }, next)))
        }
        tag => {
            Err(Error::Corrupt(format!("unknown log frame tag {} at offset {}", tag, offset)))
        }
    }
}

/// read_exact, except a clean end-of-file reports false.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> CResult<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

impl std::fmt::Display for DiskLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "disklog")
    }
}

impl Engine for DiskLog {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        match self.keydir.get(key).copied() {
            Some(slot) => Ok(Some(Self::read_at(&mut self.file, slot)?)),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let slot = self.append_put(key, &value)?;
        self.keydir.insert(key.to_vec(), slot);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        if self.keydir.remove(key).is_some() {
            self.append_del(key)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        let Self { file, keydir, .. } = self;
        ScanIterator { inner: keydir.range(range), file }
    }
}

pub struct ScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, (u64, u32)>,
    file: &'a mut std::fs::File,
}

impl<'a> ScanIterator<'a> {
    fn map(&mut self, (key, slot): (&Vec<u8>, &(u64, u32))) -> <Self as Iterator>::Item {
        Ok((key.clone(), DiskLog::read_at(self.file, *slot)?))
    }
}

impl<'a> Iterator for ScanIterator<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl<'a> DoubleEndedIterator for ScanIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::storage::tests::engine_suite!(DiskLog::new(
        tempdir::TempDir::new("tshist")?.path().join("tsdb")
    )?);

    #[test]
    fn reopen_preserves_state() -> CResult<()> {
        let dir = tempdir::TempDir::new("tshist")?;
        let path = dir.path().join("tsdb");

        let mut engine = DiskLog::new(path.clone())?;
        engine.set(b"b", vec![1])?;
        engine.set(b"b", vec![2])?;
        engine.set(b"c", vec![3])?;
        engine.delete(b"c")?;
        engine.set(b"d", vec![4])?;
        engine.flush()?;
        drop(engine);

        let mut engine = DiskLog::new(path)?;
        assert_eq!(engine.get(b"b")?, Some(vec![2]));
        assert_eq!(engine.get(b"c")?, None);
        assert_eq!(engine.get(b"d")?, Some(vec![4]));
        Ok(())
    }

    #[test]
    fn compact_drops_garbage() -> CResult<()> {
        let dir = tempdir::TempDir::new("tshist")?;
        let path = dir.path().join("tsdb");

        let mut engine = DiskLog::new(path.clone())?;
        for i in 0..10u8 {
            engine.set(b"key", vec![i])?;
        }
        engine.set(b"other", vec![42])?;
        engine.delete(b"other")?;
        engine.flush()?;

        let before = std::fs::metadata(&path)?.len();
        engine.compact()?;
        let after = std::fs::metadata(&engine.path)?.len();
        assert!(after < before);
        assert_eq!(engine.get(b"key")?, Some(vec![9]));
        assert_eq!(engine.get(b"other")?, None);

        // The compacted file must still replay correctly.
        engine.flush()?;
        drop(engine);
        let mut engine = DiskLog::new(path)?;
        assert_eq!(engine.get(b"key")?, Some(vec![9]));
        Ok(())
    }

    #[test]
    fn torn_tail_is_truncated() -> CResult<()> {
        let dir = tempdir::TempDir::new("tshist")?;
        let path = dir.path().join("tsdb");

        let mut engine = DiskLog::new(path.clone())?;
        engine.set(b"a", vec![1])?;
        engine.set(b"b", vec![2])?;
        engine.flush()?;
        drop(engine);

        // Chop a few bytes off the last frame, as an interrupted write
        // would.
        let len = std::fs::metadata(&path)?.len();
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 2)?;
        drop(file);

        let mut engine = DiskLog::new(path)?;
        assert_eq!(engine.get(b"a")?, Some(vec![1]));
        assert_eq!(engine.get(b"b")?, None);
        Ok(())
    }

    #[test]
    fn damaged_frames_are_an_error() -> CResult<()> {
        let dir = tempdir::TempDir::new("tshist")?;
        let path = dir.path().join("tsdb");

        let mut engine = DiskLog::new(path.clone())?;
        engine.set(b"a", vec![1])?;
        engine.flush()?;
        drop(engine);

        // An unknown tag in the middle of the log is damage, not a torn
        // tail, and must not be silently dropped.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[7, 0, 0, 0, 1, b'x'])?;
        file.write_all(&[DEL, 0, 0, 0, 1, b'a'])?;
        drop(file);

        assert!(matches!(DiskLog::new(path), Err(Error::Corrupt(_))));
        Ok(())
    }
}
