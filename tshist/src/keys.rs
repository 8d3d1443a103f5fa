//! Byte-key layout of the persisted tables over the key/value engine.
//!
//! Every key starts with the length-prefixed namespace followed by a tag
//! byte selecting the keyspace. Numeric ids are big-endian so that scans
//! yield rows in id order; strings are length-prefixed so composed keys
//! cannot collide.

use byteorder::{BigEndian, ByteOrder};

const SEQ: u8 = 0x00;
const REGISTRY: u8 = 0x01;
const REGNAME: u8 = 0x02;
const CHANGESET: u8 = 0x03;
const CSET_SERIES: u8 = 0x04;
const REVISION: u8 = 0x05;
const CHUNK: u8 = 0x06;

fn root(ns: &str, tag: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + ns.len() + 1);
    push_str(&mut key, ns);
    key.push(tag);
    key
}

fn push_str(key: &mut Vec<u8>, s: &str) {
    key.extend_from_slice(&(s.len() as u32).to_be_bytes());
    key.extend_from_slice(s.as_bytes());
}

fn push_id(key: &mut Vec<u8>, id: u64) {
    key.extend_from_slice(&id.to_be_bytes());
}

/// A named sequence, e.g. the changeset id allocator.
pub fn seq(ns: &str, kind: &str) -> Vec<u8> {
    let mut key = root(ns, SEQ);
    push_str(&mut key, kind);
    key
}

/// A per-series sequence (revision and chunk id allocators).
pub fn table_seq(ns: &str, kind: &str, table: &str) -> Vec<u8> {
    let mut key = seq(ns, kind);
    push_str(&mut key, table);
    key
}

pub fn registry(ns: &str, id: u64) -> Vec<u8> {
    let mut key = root(ns, REGISTRY);
    push_id(&mut key, id);
    key
}

pub fn registry_prefix(ns: &str) -> Vec<u8> {
    root(ns, REGISTRY)
}

/// Series name -> registry id index.
pub fn regname(ns: &str, name: &str) -> Vec<u8> {
    let mut key = root(ns, REGNAME);
    push_str(&mut key, name);
    key
}

pub fn changeset(ns: &str, id: u64) -> Vec<u8> {
    let mut key = root(ns, CHANGESET);
    push_id(&mut key, id);
    key
}

/// Changeset <-> series link rows.
pub fn cset_series(ns: &str, cset: u64, serie: u64) -> Vec<u8> {
    let mut key = root(ns, CSET_SERIES);
    push_id(&mut key, cset);
    push_id(&mut key, serie);
    key
}

pub fn cset_series_prefix(ns: &str) -> Vec<u8> {
    root(ns, CSET_SERIES)
}

pub fn revision(ns: &str, table: &str, id: u64) -> Vec<u8> {
    let mut key = revision_prefix(ns, table);
    push_id(&mut key, id);
    key
}

pub fn revision_prefix(ns: &str, table: &str) -> Vec<u8> {
    let mut key = root(ns, REVISION);
    push_str(&mut key, table);
    key
}

pub fn chunk(ns: &str, table: &str, id: u64) -> Vec<u8> {
    let mut key = chunk_prefix(ns, table);
    push_id(&mut key, id);
    key
}

pub fn chunk_prefix(ns: &str, table: &str) -> Vec<u8> {
    let mut key = root(ns, CHUNK);
    push_str(&mut key, table);
    key
}

/// Extracts the trailing (cset, serie) id pair of a link row key.
pub fn tail_id_pair(key: &[u8]) -> (u64, u64) {
    let n = key.len();
    (BigEndian::read_u64(&key[n - 16..n - 8]), BigEndian::read_u64(&key[n - 8..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspaces_do_not_collide() {
        let keys = vec![
            seq("tsh", "changeset"),
            table_seq("tsh", "chunk", "prices"),
            registry("tsh", 1),
            regname("tsh", "prices"),
            changeset("tsh", 1),
            cset_series("tsh", 1, 1),
            revision("tsh", "prices", 1),
            chunk("tsh", "prices", 1),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn ids_scan_in_order() {
        let mut keys: Vec<_> = [3u64, 1, 10, 2].iter().map(|&i| chunk("tsh", "t", i)).collect();
        keys.sort();
        let expect: Vec<_> = [1u64, 2, 3, 10].iter().map(|&i| chunk("tsh", "t", i)).collect();
        assert_eq!(keys, expect);
    }

    #[test]
    fn namespaces_are_isolated() {
        assert_ne!(registry("tsh", 1), registry("other", 1));
        // A namespace which is a prefix of another cannot produce
        // overlapping keys thanks to the length prefix.
        assert_ne!(registry("ts", 1), registry("tsh", 1));
    }

    #[test]
    fn id_round_trip() {
        assert_eq!(tail_id_pair(&cset_series("tsh", 7, 9)), (7, 9));
    }
}
