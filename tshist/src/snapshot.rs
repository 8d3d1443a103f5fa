//! Chunked snapshot store.
//!
//! Each revision of a series is materialized as a chain of immutable chunks:
//! the revision row points at a head chunk, and following `parent` links
//! walks back to the root, oldest data last. Chunks never overlap and are
//! strictly ordered (`parent.cend < child.cstart`), so a revision's full
//! series is the concatenation of its chain walked oldest first. Successive
//! revisions share every chunk below the point where they diverge, which is
//! what keeps revision storage compact.

use std::collections::{BTreeSet, HashMap};

use serde_derive::{Deserialize, Serialize};

use crate::codec;
use crate::diff;
use crate::error::{CResult, Error};
use crate::keys;
use crate::registry::SeriesMeta;
use crate::series::{Series, ValueKind};
use crate::storage::engine::Engine;
use crate::storage::txn::Txn;
use crate::tsio::{load_changeset, RevisionRow};

/// An immutable, compressed slice of a series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ChunkRow {
    pub id: u64,
    pub parent: Option<u64>,
    /// Inclusive value date span of this chunk.
    pub cstart: i64,
    pub cend: i64,
    #[serde(with = "serde_bytes")]
    pub chunk: Vec<u8>,
}

/// Filters selecting which revision head a read resolves to.
pub(crate) enum CsetFilter {
    /// The latest revision.
    Any,
    /// The latest revision whose changeset insertion date is at most this.
    InsertionAtMost(i64),
    /// The revision written by this exact changeset.
    Exact(u64),
}

/// Per-series access to the chunk keyspace.
pub(crate) struct Snapshot {
    ns: String,
    table: String,
    kind: ValueKind,
    tzaware: bool,
    max_bucket: usize,
    min_bucket: usize,
}

impl Snapshot {
    pub fn new(
        ns: &str,
        table: &str,
        meta: &SeriesMeta,
        max_bucket: usize,
        min_bucket: usize,
    ) -> Self {
        Self {
            ns: ns.to_string(),
            table: table.to_string(),
            kind: meta.value_kind(),
            tzaware: meta.tzaware,
            max_bucket,
            min_bucket,
        }
    }

    fn load(&self, txn: &mut Txn<impl Engine>, id: u64) -> CResult<ChunkRow> {
        let raw = txn
            .get(&keys::chunk(&self.ns, &self.table, id))?
            .ok_or_else(|| Error::Corrupt(format!("missing chunk {} of {}", id, self.table)))?;
        bincode::deserialize(&raw)
            .map_err(|err| Error::Corrupt(format!("chunk {} of {}: {}", id, self.table, err)))
    }

    /// Splits `ts` into buckets of at most `max_bucket` points and chains
    /// them onto `parent`, returning the id of the new head.
    pub fn insert_buckets(
        &self,
        txn: &mut Txn<impl Engine>,
        mut parent: Option<u64>,
        ts: &Series,
    ) -> CResult<u64> {
        let seq = keys::table_seq(&self.ns, "chunk", &self.table);
        for bucket in ts.buckets(self.max_bucket) {
            let id = txn.next_id(&seq)?;
            let row = ChunkRow {
                id,
                parent,
                cstart: bucket.min_index().expect("buckets are never empty"),
                cend: bucket.max_index().expect("buckets are never empty"),
                chunk: codec::serialize(&bucket)?,
            };
            txn.set(&keys::chunk(&self.ns, &self.table, id), bincode::serialize(&row)?)?;
            parent = Some(id);
        }
        parent.ok_or_else(|| Error::Internal("no buckets inserted from an empty series".into()))
    }

    /// Writes the first revision's chain. The root chunk has no parent.
    pub fn create(&self, txn: &mut Txn<impl Engine>, ts: &Series) -> CResult<u64> {
        self.insert_buckets(txn, None, ts)
    }

    /// Writes a new revision on top of head `head` from a non-empty diff,
    /// returning the new head.
    ///
    /// Only the chunks overlapping the diff span are loaded. A diff lying
    /// strictly past the loaded tail extends the chain in place (provided
    /// the tail is fat enough that we are not growing a chain of midget
    /// chunks); anything else patches the loaded window and re-buckets it,
    /// chaining onto the deepest untouched chunk.
    pub fn update(&self, txn: &mut Txn<impl Engine>, head: u64, diff: &Series) -> CResult<u64> {
        let diff_start =
            diff.min_index().ok_or_else(|| Error::BadInput("empty diff".into()))?;
        let loaded = self.rawchunks(txn, head, Some(diff_start))?;
        let old = self.series_of(&loaded)?;

        let old_tail = old.max_index().expect("loaded chunks are never empty");
        if old.len() >= self.min_bucket && diff_start > old_tail {
            // append fast path: every existing chunk is shared by reference
            self.insert_buckets(txn, Some(head), diff)
        } else {
            let parent = loaded[0].parent;
            let patched = diff::patch(&old, diff)?;
            self.insert_buckets(txn, parent, &patched)
        }
    }

    /// Walks the chain from `head` towards the root, stopping below the
    /// first parent whose span ends before `from`. Rows are returned oldest
    /// first; the head itself is always included.
    pub fn rawchunks(
        &self,
        txn: &mut Txn<impl Engine>,
        head: u64,
        from: Option<i64>,
    ) -> CResult<Vec<ChunkRow>> {
        let mut rows = vec![self.load(txn, head)?];
        while let Some(parent) = rows.last().expect("non-empty").parent {
            let row = self.load(txn, parent)?;
            if let Some(from) = from {
                if row.cend < from {
                    break;
                }
            }
            rows.push(row);
        }
        rows.reverse();
        Ok(rows)
    }

    fn series_of(&self, rows: &[ChunkRow]) -> CResult<Series> {
        let payloads: Vec<&[u8]> = rows.iter().map(|row| row.chunk.as_slice()).collect();
        codec::deserialize(&payloads, self.kind, self.tzaware)
    }

    /// Reconstructs the series at `head`, sliced to `[from, to]`.
    pub fn chunk(
        &self,
        txn: &mut Txn<impl Engine>,
        head: u64,
        from: Option<i64>,
        to: Option<i64>,
    ) -> CResult<Series> {
        let rows = self.rawchunks(txn, head, from)?;
        Ok(self.series_of(&rows)?.slice(from, to))
    }

    /// All revision rows of the series, ascending by revision id.
    pub fn revisions(&self, txn: &mut Txn<impl Engine>) -> CResult<Vec<RevisionRow>> {
        txn.scan_prefix(&keys::revision_prefix(&self.ns, &self.table))?
            .into_iter()
            .map(|(_, raw)| {
                bincode::deserialize(&raw).map_err(|err| {
                    Error::Corrupt(format!("revision row of {}: {}", self.table, err))
                })
            })
            .collect()
    }

    /// Resolves the latest revision satisfying `filter` and reconstructs
    /// its snapshot over `[from, to]`. None when no revision matches.
    pub fn find(
        &self,
        txn: &mut Txn<impl Engine>,
        filter: CsetFilter,
        from: Option<i64>,
        to: Option<i64>,
    ) -> CResult<Option<(u64, Series)>> {
        let revisions = self.revisions(txn)?;
        for row in revisions.into_iter().rev() {
            let selected = match filter {
                CsetFilter::Any => true,
                CsetFilter::Exact(cset) => row.cset == cset,
                CsetFilter::InsertionAtMost(idate) => {
                    let cset = load_changeset(txn, &self.ns, row.cset)?.ok_or_else(|| {
                        Error::Corrupt(format!("dangling changeset {} of {}", row.cset, self.table))
                    })?;
                    cset.insertion_date <= idate
                }
            };
            if selected {
                let ts = self.chunk(txn, row.snapshot, from, to)?;
                return Ok(Some((row.cset, ts)));
            }
        }
        Ok(None)
    }

    /// The latest snapshot over `[from, to]`, if any revision exists.
    pub fn last(
        &self,
        txn: &mut Txn<impl Engine>,
        from: Option<i64>,
        to: Option<i64>,
    ) -> CResult<Option<Series>> {
        Ok(self.find(txn, CsetFilter::Any, from, to)?.map(|(_, ts)| ts))
    }

    /// One deduplicated walk over the union of the chains of several heads.
    /// Parents whose span ends before `from` are left out, which later
    /// stops per-head reassembly at the right place.
    fn all_chunks(
        &self,
        txn: &mut Txn<impl Engine>,
        heads: &[u64],
        from: Option<i64>,
    ) -> CResult<HashMap<u64, ChunkRow>> {
        let mut map: HashMap<u64, ChunkRow> = HashMap::new();
        for &head in heads {
            let mut cursor = Some(head);
            let mut at_head = true;
            while let Some(id) = cursor {
                if map.contains_key(&id) {
                    break;
                }
                let row = self.load(txn, id)?;
                if !at_head {
                    if let Some(from) = from {
                        if row.cend < from {
                            break;
                        }
                    }
                }
                cursor = row.parent;
                map.insert(id, row);
                at_head = false;
            }
        }
        Ok(map)
    }

    /// Reconstructs the snapshot of every requested changeset in one walk,
    /// positionally aligned with `csets`. O(distinct chunks) instead of
    /// O(heads × depth).
    pub fn find_all(
        &self,
        txn: &mut Txn<impl Engine>,
        csets: &[Option<u64>],
        from: Option<i64>,
        to: Option<i64>,
    ) -> CResult<Vec<Option<Series>>> {
        let wanted: BTreeSet<u64> = csets.iter().flatten().copied().collect();
        let heads: HashMap<u64, u64> = self
            .revisions(txn)?
            .into_iter()
            .filter(|row| wanted.contains(&row.cset))
            .map(|row| (row.cset, row.snapshot))
            .collect();
        let head_ids: Vec<u64> = heads.values().copied().collect();
        let chunks = self.all_chunks(txn, &head_ids, from)?;

        let mut out = Vec::with_capacity(csets.len());
        for cset in csets {
            let Some(head) = cset.and_then(|c| heads.get(&c)) else {
                out.push(None);
                continue;
            };
            let mut rows: Vec<&ChunkRow> = Vec::new();
            let mut cursor = Some(*head);
            while let Some(id) = cursor {
                let Some(row) = chunks.get(&id) else { break };
                rows.push(row);
                cursor = row.parent;
            }
            rows.reverse();
            let payloads: Vec<&[u8]> = rows.iter().map(|row| row.chunk.as_slice()).collect();
            let ts = codec::deserialize(&payloads, self.kind, self.tzaware)?;
            out.push(Some(ts.slice(from, to)));
        }
        Ok(out)
    }

    /// All chunk rows of the series, ascending by id.
    pub fn chunk_rows(&self, txn: &mut Txn<impl Engine>) -> CResult<Vec<ChunkRow>> {
        txn.scan_prefix(&keys::chunk_prefix(&self.ns, &self.table))?
            .into_iter()
            .map(|(_, raw)| {
                bincode::deserialize(&raw)
                    .map_err(|err| Error::Corrupt(format!("chunk row of {}: {}", self.table, err)))
            })
            .collect()
    }

    /// The ids of chunks reachable from no revision head. Garbage chunks
    /// appear when revisions are stripped.
    pub fn garbage(&self, txn: &mut Txn<impl Engine>) -> CResult<BTreeSet<u64>> {
        let heads: Vec<u64> =
            self.revisions(txn)?.into_iter().map(|row| row.snapshot).collect();
        let reachable = self.all_chunks(txn, &heads, None)?;
        Ok(self
            .chunk_rows(txn)?
            .into_iter()
            .map(|row| row.id)
            .filter(|id| !reachable.contains_key(id))
            .collect())
    }

    /// Deletes every unreachable chunk.
    pub fn reclaim(&self, txn: &mut Txn<impl Engine>) -> CResult<()> {
        let garbage = self.garbage(txn)?;
        for &id in &garbage {
            txn.delete(&keys::chunk(&self.ns, &self.table, id))?;
        }
        log::info!("reclaimed {} chunks of {}", garbage.len(), self.table);
        Ok(())
    }
}
