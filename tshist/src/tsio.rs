//! The revision log and the public repository API.
//!
//! [`Tsio`] owns a storage engine and exposes the whole operation surface:
//! versioned insertion, point-in-time reads, history enumeration, staircase
//! queries, and the administrative operations (rename, delete, strip,
//! metadata updates, log, info). Every operation runs inside a [`Txn`];
//! `in_txn` opens, commits and rolls back one for you.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::diff;
use crate::error::{CResult, Error};
use crate::keys;
use crate::registry::{Caches, SeriesMeta};
use crate::series::{naive_to_ns, ns_to_naive, ns_to_utc, utc_to_ns, Series, ValueKind, Values};
use crate::snapshot::{CsetFilter, Snapshot};
use crate::storage::engine::Engine;
use crate::storage::txn::Txn;

/// Repository options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Options {
    /// Keyspace namespace; several repositories can share one engine.
    pub namespace: String,
    /// Maximum number of points per chunk.
    pub max_bucket: usize,
    /// Tail size under which an append rewrites the tail instead of
    /// chaining new chunks, so young series do not degenerate into long
    /// chains of tiny chunks.
    pub min_bucket: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { namespace: "tsh".into(), max_bucket: 250, min_bucket: 10 }
    }
}

/// A changeset row: one globally monotonic id per recorded revision event,
/// possibly spanning several series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ChangesetRow {
    pub author: String,
    /// UTC nanoseconds.
    pub insertion_date: i64,
    /// JSON-encoded metadata map.
    pub meta: Option<String>,
}

impl ChangesetRow {
    pub fn meta_map(&self) -> CResult<serde_json::Map<String, serde_json::Value>> {
        match &self.meta {
            None => Ok(serde_json::Map::new()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| Error::Corrupt(format!("changeset metadata: {}", err))),
        }
    }
}

/// A per-series revision row binding a changeset to a snapshot head.
/// `tsstart`/`tsend` bound the whole logical series at this revision, not
/// the diff that produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RevisionRow {
    pub id: u64,
    pub cset: u64,
    pub snapshot: u64,
    pub tsstart: i64,
    pub tsend: i64,
}

pub(crate) fn load_changeset<E: Engine>(
    txn: &mut Txn<E>,
    ns: &str,
    id: u64,
) -> CResult<Option<ChangesetRow>> {
    let Some(raw) = txn.get(&keys::changeset(ns, id))? else {
        return Ok(None);
    };
    Ok(Some(
        bincode::deserialize(&raw)
            .map_err(|err| Error::Corrupt(format!("changeset {}: {}", id, err)))?,
    ))
}

/// An explicit changeset scope for multi-series atomic revisions: open one,
/// pass it to several `insert_with` calls, and every touched series gets
/// revised under the same changeset id. Atomicity comes from the enclosing
/// transaction.
pub struct ChangesetHandle {
    id: u64,
}

impl ChangesetHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

enum CsetSpec<'a> {
    New {
        author: &'a str,
        meta: Option<&'a serde_json::Map<String, serde_json::Value>>,
        idate: Option<DateTime<Utc>>,
    },
    Existing(u64),
}

/// How `changeset_at` matches the requested date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    Strict,
    Before,
    After,
}

/// The value date span of a series at its latest revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub tzaware: bool,
}

/// History selection options. Insertion date bounds select revisions, value
/// date bounds select revisions by span overlap and slice the results, the
/// delta options window each snapshot around its insertion date, and
/// `diffmode` returns successive diffs instead of full snapshots.
#[derive(Clone, Debug, Default)]
pub struct HistoryOpts {
    pub from_insertion_date: Option<DateTime<Utc>>,
    pub to_insertion_date: Option<DateTime<Utc>>,
    pub from_value_date: Option<NaiveDateTime>,
    pub to_value_date: Option<NaiveDateTime>,
    pub deltabefore: Option<Duration>,
    pub deltaafter: Option<Duration>,
    pub diffmode: bool,
    pub(crate) keep_nulls: bool,
}

/// Changeset log selection options. A zero limit means no limit; a non-zero
/// limit keeps the most recent entries.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub limit: usize,
    pub names: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub from_rev: Option<u64>,
    pub to_rev: Option<u64>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub rev: u64,
    pub author: String,
    pub date: DateTime<Utc>,
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// The sorted names of every series touched by the changeset.
    pub names: Vec<String>,
}

/// Global repository statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct Info {
    pub series_count: usize,
    pub changeset_count: u64,
    pub series_names: Vec<String>,
}

/// A versioned time-series repository over a storage engine.
pub struct Tsio<E: Engine> {
    pub(crate) engine: Mutex<E>,
    pub(crate) opts: Options,
    pub(crate) caches: Mutex<Caches>,
    /// Serializes first-creations of a series.
    create_lock: Mutex<()>,
}

impl<E: Engine> Tsio<E> {
    pub fn new(engine: E) -> Self {
        Self::with_options(engine, Options::default())
    }

    pub fn with_options(engine: E, opts: Options) -> Self {
        Self {
            engine: Mutex::new(engine),
            opts,
            caches: Mutex::new(Caches::default()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Opens a transaction. It holds the engine for its whole lifetime, so
    /// transactions from other handles on this repository wait.
    pub fn begin(&self) -> CResult<Txn<'_, E>> {
        Ok(Txn::new(self.engine.lock()?))
    }

    /// Runs `f` inside a fresh transaction, committing on success and
    /// rolling back on error.
    pub fn in_txn<T>(&self, f: impl FnOnce(&mut Txn<E>) -> CResult<T>) -> CResult<T> {
        let mut txn = self.begin()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = txn.rollback();
                // registry caches may hold entries read from the discarded
                // overlay
                let _ = self.reset_caches();
                Err(err)
            }
        }
    }

    fn ns(&self) -> &str {
        &self.opts.namespace
    }

    fn snapshot(&self, table: &str, meta: &SeriesMeta) -> Snapshot {
        Snapshot::new(self.ns(), table, meta, self.opts.max_bucket, self.opts.min_bucket)
    }

    // insertion

    /// Records a new revision of `name` under a fresh changeset. Returns
    /// the computed diff, or None when the insertion changes nothing (in
    /// which case no changeset is allocated). The series is created on
    /// first sight.
    pub fn insert(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        newts: &Series,
        author: &str,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
        insertion_date: Option<DateTime<Utc>>,
    ) -> CResult<Option<Series>> {
        self.insert_inner(txn, name, newts, CsetSpec::New { author, meta: metadata, idate: insertion_date })
    }

    /// Like `insert`, but records the revision under an already-open
    /// changeset, grouping several series into one atomic revision.
    pub fn insert_with(
        &self,
        txn: &mut Txn<E>,
        cs: &ChangesetHandle,
        name: &str,
        newts: &Series,
    ) -> CResult<Option<Series>> {
        self.insert_inner(txn, name, newts, CsetSpec::Existing(cs.id))
    }

    /// Allocates a changeset for use with `insert_with`.
    pub fn open_changeset(
        &self,
        txn: &mut Txn<E>,
        author: &str,
        insertion_date: Option<DateTime<Utc>>,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> CResult<ChangesetHandle> {
        Ok(ChangesetHandle { id: self.new_changeset(txn, author, insertion_date, metadata)? })
    }

    fn insert_inner(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        newts: &Series,
        cset: CsetSpec,
    ) -> CResult<Option<Series>> {
        if name.is_empty() {
            return Err(Error::BadInput("empty series name".into()));
        }
        if newts.is_empty() {
            return Ok(None);
        }
        match self.serie_tablename(txn, name)? {
            None => self.create(txn, name, newts, cset),
            Some(table) => self.update(txn, &table, name, newts, cset),
        }
    }

    fn create(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        newts: &Series,
        cset: CsetSpec,
    ) -> CResult<Option<Series>> {
        // chop off the unwanted null edges; a series of nothing but nulls
        // is not created at all
        let Some((start, end)) = newts.start_end() else {
            return Ok(None);
        };
        let newts = newts.slice(Some(start), Some(end));

        let _guard = self.create_lock.lock()?;
        let meta = SeriesMeta::for_series(&newts);
        let table = self.make_tablename(txn, name)?;
        let regid = self.register_serie(txn, name, &table, &meta)?;
        let csid = self.resolve_cset(txn, &cset)?;

        let head = self.snapshot(&table, &meta).create(txn, &newts)?;
        self.insert_revision(txn, &table, csid, head, start, end)?;
        txn.set(&keys::cset_series(self.ns(), csid, regid), vec![])?;

        log::info!("first insertion of {} (size={}) at changeset {}", name, newts.len(), csid);
        Ok(Some(newts.drop_nulls()))
    }

    fn update(
        &self,
        txn: &mut Txn<E>,
        table: &str,
        name: &str,
        newts: &Series,
        cset: CsetSpec,
    ) -> CResult<Option<Series>> {
        let meta = self
            .metadata(txn, name)?
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;
        if newts.start_end().is_some() {
            // an all-null insertion is an erasure attempt and skips the
            // type gate, failing later on the erasure check
            if newts.kind() != meta.value_kind() {
                return Err(Error::TypeMismatch(format!(
                    "inserting {} into {}, which holds {}",
                    newts.kind().value_type(),
                    name,
                    meta.value_type
                )));
            }
            if newts.tzaware() != meta.tzaware {
                return Err(Error::TypeMismatch(format!(
                    "incompatible index types for {}",
                    name
                )));
            }
        }

        let snap = self.snapshot(table, &meta);
        let base = snap.last(txn, newts.min_index(), newts.max_index())?;
        let d = diff::diff(base.as_ref(), newts)?;
        if d.is_empty() {
            log::info!("no difference in {} (for a series of size {})", name, newts.len());
            return Ok(None);
        }

        let prev = snap
            .revisions(txn)?
            .pop()
            .ok_or_else(|| Error::Internal(format!("{} has no revisions", name)))?;
        let (newts_start, newts_end) = newts.start_end().unwrap_or((prev.tsstart, prev.tsend));
        let mut start = newts_start.min(prev.tsstart);
        let mut end = newts_end.max(prev.tsend);
        if d.first_is_null() || d.last_is_null() {
            // we might be shrinking, so look at the whole patched series;
            // shrinkers have a slow path
            let full = snap
                .last(txn, None, None)?
                .ok_or_else(|| Error::Internal(format!("{} has no snapshot", name)))?;
            let patched = diff::patch(&full, &d)?.drop_nulls();
            if patched.is_empty() {
                return Err(Error::EmptyErasure);
            }
            if d.first_is_null() {
                start = patched.min_index().expect("non-empty");
            }
            if d.last_is_null() {
                end = patched.max_index().expect("non-empty");
            }
        }

        let csid = self.resolve_cset(txn, &cset)?;
        let head = snap.update(txn, prev.snapshot, &d)?;
        self.insert_revision(txn, table, csid, head, start, end)?;
        let regid = self
            .name_to_regid(txn, name)?
            .ok_or_else(|| Error::Internal(format!("{} is not registered", name)))?;
        txn.set(&keys::cset_series(self.ns(), csid, regid), vec![])?;

        log::info!("inserted diff (size={}) for {} at changeset {}", d.len(), name, csid);
        Ok(Some(d))
    }

    fn insert_revision(
        &self,
        txn: &mut Txn<E>,
        table: &str,
        cset: u64,
        snapshot: u64,
        tsstart: i64,
        tsend: i64,
    ) -> CResult<()> {
        let id = txn.next_id(&keys::table_seq(self.ns(), "revision", table))?;
        let row = RevisionRow { id, cset, snapshot, tsstart, tsend };
        txn.set(&keys::revision(self.ns(), table, id), bincode::serialize(&row)?)
    }

    fn resolve_cset(&self, txn: &mut Txn<E>, spec: &CsetSpec) -> CResult<u64> {
        match spec {
            CsetSpec::Existing(id) => Ok(*id),
            CsetSpec::New { author, meta, idate } => {
                self.new_changeset(txn, author, *idate, *meta)
            }
        }
    }

    fn new_changeset(
        &self,
        txn: &mut Txn<E>,
        author: &str,
        insertion_date: Option<DateTime<Utc>>,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> CResult<u64> {
        let idate = match insertion_date {
            Some(date) => utc_to_ns(&date)?,
            None => utc_to_ns(&Utc::now())?,
        };
        let id = txn.next_id(&keys::seq(self.ns(), "changeset"))?;
        let row = ChangesetRow {
            author: author.to_string(),
            insertion_date: idate,
            meta: metadata.map(serde_json::to_string).transpose()?,
        };
        txn.set(&keys::changeset(self.ns(), id), bincode::serialize(&row)?)?;
        Ok(id)
    }

    // reads

    /// Computes the series of a given name: the latest revision, or with
    /// `revision_date`, the latest revision recorded at or before it.
    /// Returns None for unknown series and empty results.
    pub fn get(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        revision_date: Option<DateTime<Utc>>,
        from_value_date: Option<NaiveDateTime>,
        to_value_date: Option<NaiveDateTime>,
    ) -> CResult<Option<Series>> {
        let Some(table) = self.serie_tablename(txn, name)? else {
            return Ok(None);
        };
        let meta = self
            .metadata(txn, name)?
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;
        let filter = match revision_date {
            Some(date) => CsetFilter::InsertionAtMost(utc_to_ns(&date)?),
            None => CsetFilter::Any,
        };
        let from = from_value_date.map(|t| naive_to_ns(&t)).transpose()?;
        let to = to_value_date.map(|t| naive_to_ns(&t)).transpose()?;

        let Some((_, ts)) = self.snapshot(&table, &meta).find(txn, filter, from, to)? else {
            return Ok(None);
        };
        let ts = ts.drop_nulls();
        if ts.is_empty() {
            return Ok(None);
        }
        Ok(Some(ts))
    }

    pub fn exists(&self, txn: &mut Txn<E>, name: &str) -> CResult<bool> {
        Ok(self.serie_tablename(txn, name)?.is_some())
    }

    /// All series names, sorted.
    pub fn list_series(&self, txn: &mut Txn<E>) -> CResult<Vec<String>> {
        let mut names: Vec<String> =
            self.all_registry_rows(txn)?.into_iter().map(|row| row.seriename).collect();
        names.sort();
        Ok(names)
    }

    /// The history of a series: a map from insertion date to the snapshot
    /// (or diff, with `diffmode`) recorded at that date. None for unknown
    /// series; an empty map when no revision matches the selection.
    pub fn history(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        opts: &HistoryOpts,
    ) -> CResult<Option<BTreeMap<DateTime<Utc>, Series>>> {
        let Some(table) = self.serie_tablename(txn, name)? else {
            return Ok(None);
        };
        let meta = self
            .metadata(txn, name)?
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;
        let snap = self.snapshot(&table, &meta);

        let from_v = opts.from_value_date.map(|t| naive_to_ns(&t)).transpose()?;
        let to_v = opts.to_value_date.map(|t| naive_to_ns(&t)).transpose()?;
        let from_i = opts.from_insertion_date.map(|t| utc_to_ns(&t)).transpose()?;
        let to_i = opts.to_insertion_date.map(|t| utc_to_ns(&t)).transpose()?;

        let revisions = snap.revisions(txn)?;
        let mut revs: Vec<(u64, i64)> = Vec::new();
        for row in &revisions {
            let cs = load_changeset(txn, self.ns(), row.cset)?.ok_or_else(|| {
                Error::Corrupt(format!("dangling changeset {} of {}", row.cset, name))
            })?;
            if from_i.map_or(false, |f| cs.insertion_date < f)
                || to_i.map_or(false, |t| cs.insertion_date > t)
            {
                continue;
            }
            if (from_v.is_some() || to_v.is_some())
                && !closed_overlaps(from_v, to_v, row.tsstart, row.tsend)
            {
                continue;
            }
            revs.push((row.cset, cs.insertion_date));
        }
        revs.sort_by_key(|&(cset, _)| cset);
        if revs.is_empty() {
            return Ok(Some(BTreeMap::new()));
        }

        // one slot per selected revision; diffmode prepends the state the
        // first selected revision applies to
        let mut slots: Vec<(Option<u64>, Option<i64>)> =
            revs.iter().map(|&(cset, idate)| (Some(cset), Some(idate))).collect();
        if opts.diffmode {
            let first = revs[0].0;
            let previous = revisions.iter().rev().find(|row| row.cset < first).map(|row| row.cset);
            slots.insert(0, (previous, None));
        }

        let series: Vec<Option<Series>> =
            if opts.deltabefore.is_some() || opts.deltaafter.is_some() {
                let mut out = Vec::with_capacity(slots.len());
                for &(cset, idate) in &slots {
                    let (Some(cset), Some(idate)) = (cset, idate) else {
                        out.push(None);
                        continue;
                    };
                    let from = opts
                        .deltabefore
                        .map(|delta| duration_ns(&delta).map(|ns| idate - ns))
                        .transpose()?;
                    let to = opts
                        .deltaafter
                        .map(|delta| duration_ns(&delta).map(|ns| idate + ns))
                        .transpose()?;
                    out.push(snap.find(txn, CsetFilter::Exact(cset), from, to)?.map(|(_, ts)| ts));
                }
                out
            } else {
                let csets: Vec<Option<u64>> = slots.iter().map(|&(cset, _)| cset).collect();
                snap.find_all(txn, &csets, from_v, to_v)?
            };

        let mut result = BTreeMap::new();
        if opts.diffmode {
            for i in 1..slots.len() {
                let idate = slots[i].1.expect("selected revisions carry a date");
                let Some(current) = &series[i] else { continue };
                let entry = match &series[i - 1] {
                    // scanning the whole history: the first revision is a
                    // diff against nothing
                    None => current.clone(),
                    Some(previous) => diff::diff(Some(previous), current)?,
                };
                result.insert(ns_to_utc(idate), entry);
            }
        } else {
            for (slot, ts) in slots.iter().zip(series) {
                let (Some(_), Some(idate)) = slot else { continue };
                let Some(ts) = ts else { continue };
                let ts = if opts.keep_nulls { ts } else { ts.drop_nulls() };
                result.insert(ns_to_utc(*idate), ts);
            }
        }
        Ok(Some(result))
    }

    /// Computes a series whose value dates are bounded to be `delta` after
    /// the insertion dates, keeping the most recent eligible value for each
    /// value date.
    pub fn staircase(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        delta: Duration,
        from_value_date: Option<NaiveDateTime>,
        to_value_date: Option<NaiveDateTime>,
    ) -> CResult<Option<Series>> {
        let history = self.history(
            txn,
            name,
            &HistoryOpts {
                deltabefore: Some(-delta),
                from_value_date,
                to_value_date,
                keep_nulls: true,
                ..Default::default()
            },
        )?;
        let Some(history) = history else {
            return Ok(None);
        };
        let meta = self
            .metadata(txn, name)?
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;

        // ascending insertion dates, so the latest revision covering a
        // value date wins
        let values = match meta.value_kind() {
            ValueKind::Float => {
                let mut acc: BTreeMap<i64, f64> = BTreeMap::new();
                for ts in history.values() {
                    for (vdate, value) in ts.iter_float() {
                        acc.insert(vdate, value);
                    }
                }
                let (index, values): (Vec<i64>, Vec<f64>) = acc.into_iter().unzip();
                Series::trusted(index, Values::Float(values), meta.tzaware)
            }
            ValueKind::Text => {
                let mut acc: BTreeMap<i64, Option<String>> = BTreeMap::new();
                for ts in history.values() {
                    for (vdate, value) in ts.iter_text() {
                        acc.insert(vdate, value.map(String::from));
                    }
                }
                let (index, values): (Vec<i64>, Vec<Option<String>>) = acc.into_iter().unzip();
                Series::trusted(index, Values::Text(values), meta.tzaware)
            }
        };

        let from = from_value_date.map(|t| naive_to_ns(&t)).transpose()?;
        let to = to_value_date.map(|t| naive_to_ns(&t)).transpose()?;
        Ok(Some(values.drop_nulls().slice(from, to)))
    }

    /// The insertion dates of a series' revisions, ascending by changeset.
    pub fn insertion_dates(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        from_date: Option<DateTime<Utc>>,
        to_date: Option<DateTime<Utc>>,
    ) -> CResult<Vec<DateTime<Utc>>> {
        let mut stamps = self.revision_stamps(txn, name)?;
        stamps.sort_by_key(|&(cset, _)| cset);
        let from = from_date.map(|t| utc_to_ns(&t)).transpose()?;
        let to = to_date.map(|t| utc_to_ns(&t)).transpose()?;
        Ok(stamps
            .into_iter()
            .filter(|&(_, idate)| {
                from.map_or(true, |f| idate >= f) && to.map_or(true, |t| idate <= t)
            })
            .map(|(_, idate)| ns_to_utc(idate))
            .collect())
    }

    pub fn latest_insertion_date(
        &self,
        txn: &mut Txn<E>,
        name: &str,
    ) -> CResult<Option<DateTime<Utc>>> {
        Ok(self
            .revision_stamps(txn, name)?
            .into_iter()
            .map(|(_, idate)| idate)
            .max()
            .map(ns_to_utc))
    }

    /// The changeset of a series matching `revision_date`: the exact one,
    /// the latest at or before, or the earliest at or after.
    pub fn changeset_at(
        &self,
        txn: &mut Txn<E>,
        name: &str,
        revision_date: DateTime<Utc>,
        mode: SearchMode,
    ) -> CResult<Option<u64>> {
        if !self.exists(txn, name)? {
            return Err(Error::UnknownSeries(name.to_string()));
        }
        let mut stamps = self.revision_stamps(txn, name)?;
        stamps.sort_by_key(|&(cset, _)| cset);
        let at = utc_to_ns(&revision_date)?;
        let found = match mode {
            SearchMode::Strict => stamps.iter().find(|&&(_, idate)| idate == at),
            SearchMode::Before => stamps.iter().rev().find(|&&(_, idate)| idate <= at),
            SearchMode::After => stamps.iter().find(|&&(_, idate)| idate >= at),
        };
        Ok(found.map(|&(cset, _)| cset))
    }

    /// (changeset, insertion date) for every revision of the series.
    fn revision_stamps(&self, txn: &mut Txn<E>, name: &str) -> CResult<Vec<(u64, i64)>> {
        let Some(table) = self.serie_tablename(txn, name)? else {
            return Ok(vec![]);
        };
        let rows = self.revision_rows(txn, &table)?;
        let mut stamps = Vec::with_capacity(rows.len());
        for row in rows {
            let cs = load_changeset(txn, self.ns(), row.cset)?.ok_or_else(|| {
                Error::Corrupt(format!("dangling changeset {} of {}", row.cset, name))
            })?;
            stamps.push((row.cset, cs.insertion_date));
        }
        Ok(stamps)
    }

    fn revision_rows(&self, txn: &mut Txn<E>, table: &str) -> CResult<Vec<RevisionRow>> {
        txn.scan_prefix(&keys::revision_prefix(self.ns(), table))?
            .into_iter()
            .map(|(_, raw)| {
                bincode::deserialize(&raw)
                    .map_err(|err| Error::Corrupt(format!("revision row of {}: {}", table, err)))
            })
            .collect()
    }

    /// The value date span of the series at its latest revision. Unlike the
    /// other readers, raises on unknown series.
    pub fn interval(&self, txn: &mut Txn<E>, name: &str) -> CResult<Interval> {
        let Some(table) = self.serie_tablename(txn, name)? else {
            return Err(Error::UnknownSeries(name.to_string()));
        };
        let last = self
            .revision_rows(txn, &table)?
            .pop()
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;
        let meta = self
            .metadata(txn, name)?
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;
        Ok(Interval {
            start: ns_to_naive(last.tsstart),
            end: ns_to_naive(last.tsend),
            tzaware: meta.tzaware,
        })
    }

    pub fn changeset_metadata(
        &self,
        txn: &mut Txn<E>,
        csid: u64,
    ) -> CResult<Option<serde_json::Map<String, serde_json::Value>>> {
        load_changeset(txn, self.ns(), csid)?.map(|row| row.meta_map()).transpose()
    }

    // administrative operations

    /// Unregisters a series and drops its revision and chunk keyspaces.
    /// Changesets keep ghost entries, marked in their metadata, since
    /// cleaning them up would be costly.
    pub fn delete(&self, txn: &mut Txn<E>, name: &str) -> CResult<()> {
        let Some(table) = self.serie_tablename(txn, name)? else {
            log::info!("not deleting unknown series {}", name);
            return Ok(());
        };
        let regid = self
            .name_to_regid(txn, name)?
            .ok_or_else(|| Error::Internal(format!("{} is not registered", name)))?;

        let msg = format!("belonged to deleted series `{}`", name);
        let csets: BTreeSet<u64> =
            self.revision_rows(txn, &table)?.into_iter().map(|row| row.cset).collect();
        for &cset in &csets {
            self.mark_changeset(txn, cset, &msg)?;
            txn.delete(&keys::cset_series(self.ns(), cset, regid))?;
        }

        for (key, _) in txn.scan_prefix(&keys::revision_prefix(self.ns(), &table))? {
            txn.delete(&key)?;
        }
        for (key, _) in txn.scan_prefix(&keys::chunk_prefix(self.ns(), &table))? {
            txn.delete(&key)?;
        }
        txn.delete(&keys::table_seq(self.ns(), "revision", &table))?;
        txn.delete(&keys::table_seq(self.ns(), "chunk", &table))?;
        txn.delete(&keys::registry(self.ns(), regid))?;
        txn.delete(&keys::regname(self.ns(), name))?;

        self.reset_caches()?;
        log::info!("deleted series {} ({} changesets marked)", name, csets.len());
        Ok(())
    }

    /// Wipes the revisions of `name` recorded by changeset `csid` and every
    /// later one, marks the stripped changesets, detaches them from the
    /// series, and reclaims the now-unreachable chunks.
    pub fn strip(&self, txn: &mut Txn<E>, name: &str, csid: u64) -> CResult<()> {
        let Some(table) = self.serie_tablename(txn, name)? else {
            return Err(Error::UnknownSeries(name.to_string()));
        };

        for (key, raw) in txn.scan_prefix(&keys::revision_prefix(self.ns(), &table))? {
            let row: RevisionRow = bincode::deserialize(&raw)
                .map_err(|err| Error::Corrupt(format!("revision row of {}: {}", table, err)))?;
            if row.cset >= csid {
                txn.delete(&key)?;
            }
        }

        let stripped = self.log(
            txn,
            &LogFilter {
                names: Some(vec![name.to_string()]),
                from_rev: Some(csid),
                ..Default::default()
            },
        )?;
        if stripped.is_empty() {
            return Err(Error::BadInput(format!(
                "nothing to strip from `{}` at changeset {}",
                name, csid
            )));
        }
        let regid = self
            .name_to_regid(txn, name)?
            .ok_or_else(|| Error::Internal(format!("{} is not registered", name)))?;
        for entry in &stripped {
            self.mark_changeset(txn, entry.rev, &format!("got stripped from {}", entry.rev))?;
            txn.delete(&keys::cset_series(self.ns(), entry.rev, regid))?;
        }

        let meta = self
            .metadata(txn, name)?
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;
        self.snapshot(&table, &meta).reclaim(txn)?;
        log::info!("stripped {} revisions of {} from changeset {}", stripped.len(), name, csid);
        Ok(())
    }

    fn mark_changeset(&self, txn: &mut Txn<E>, csid: u64, msg: &str) -> CResult<()> {
        let Some(mut row) = load_changeset(txn, self.ns(), csid)? else {
            return Err(Error::Corrupt(format!("dangling changeset {}", csid)));
        };
        let mut meta = row.meta_map()?;
        meta.insert("tshist.info".to_string(), serde_json::Value::String(msg.to_string()));
        row.meta = Some(serde_json::to_string(&meta)?);
        txn.set(&keys::changeset(self.ns(), csid), bincode::serialize(&row)?)
    }

    /// The ids of chunks of `name` no revision references anymore.
    pub fn garbage(&self, txn: &mut Txn<E>, name: &str) -> CResult<BTreeSet<u64>> {
        let (table, meta) = self.table_and_meta(txn, name)?;
        self.snapshot(&table, &meta).garbage(txn)
    }

    /// Deletes the unreachable chunks of `name`.
    pub fn reclaim(&self, txn: &mut Txn<E>, name: &str) -> CResult<()> {
        let (table, meta) = self.table_and_meta(txn, name)?;
        self.snapshot(&table, &meta).reclaim(txn)
    }

    fn table_and_meta(&self, txn: &mut Txn<E>, name: &str) -> CResult<(String, SeriesMeta)> {
        let Some(table) = self.serie_tablename(txn, name)? else {
            return Err(Error::UnknownSeries(name.to_string()));
        };
        let meta = self
            .metadata(txn, name)?
            .ok_or_else(|| Error::UnknownSeries(name.to_string()))?;
        Ok((table, meta))
    }

    /// The changeset log, ascending by id: who recorded what and when.
    pub fn log(&self, txn: &mut Txn<E>, filter: &LogFilter) -> CResult<Vec<LogEntry>> {
        let names_by_id: HashMap<u64, String> = self
            .all_registry_rows(txn)?
            .into_iter()
            .map(|row| (row.id, row.seriename))
            .collect();

        let mut by_cset: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for (key, _) in txn.scan_prefix(&keys::cset_series_prefix(self.ns()))? {
            let (cset, serie) = keys::tail_id_pair(&key);
            if let Some(name) = names_by_id.get(&serie) {
                by_cset.entry(cset).or_default().push(name.clone());
            }
        }

        let from_date = filter.from_date.map(|t| utc_to_ns(&t)).transpose()?;
        let to_date = filter.to_date.map(|t| utc_to_ns(&t)).transpose()?;
        let mut entries = Vec::new();
        for (cset, mut names) in by_cset {
            if filter.from_rev.map_or(false, |f| cset < f)
                || filter.to_rev.map_or(false, |t| cset > t)
            {
                continue;
            }
            if let Some(selection) = &filter.names {
                if !names.iter().any(|name| selection.contains(name)) {
                    continue;
                }
            }
            let row = load_changeset(txn, self.ns(), cset)?
                .ok_or_else(|| Error::Corrupt(format!("dangling changeset {}", cset)))?;
            if let Some(authors) = &filter.authors {
                if !authors.contains(&row.author) {
                    continue;
                }
            }
            if from_date.map_or(false, |f| row.insertion_date < f)
                || to_date.map_or(false, |t| row.insertion_date > t)
            {
                continue;
            }
            names.sort();
            entries.push(LogEntry {
                rev: cset,
                author: row.author.clone(),
                date: ns_to_utc(row.insertion_date),
                meta: row.meta_map()?,
                names,
            });
        }
        if filter.limit > 0 && entries.len() > filter.limit {
            entries.drain(..entries.len() - filter.limit);
        }
        Ok(entries)
    }

    /// Global statistics on the repository.
    pub fn info(&self, txn: &mut Txn<E>) -> CResult<Info> {
        let mut names: Vec<String> =
            self.all_registry_rows(txn)?.into_iter().map(|row| row.seriename).collect();
        names.sort();
        Ok(Info {
            series_count: names.len(),
            changeset_count: txn.current_id(&keys::seq(self.ns(), "changeset"))?,
            series_names: names,
        })
    }
}

/// Closed overlap of the query window with a revision span, the right edge
/// widened by one microsecond so a window ending exactly on `tsend` still
/// matches.
fn closed_overlaps(from: Option<i64>, to: Option<i64>, tsstart: i64, tsend: i64) -> bool {
    let from = from.unwrap_or(i64::MIN);
    let to = to.unwrap_or(i64::MAX);
    from < tsend.saturating_add(1_000) && tsstart < to
}

fn duration_ns(delta: &Duration) -> CResult<i64> {
    delta
        .num_nanoseconds()
        .ok_or_else(|| Error::BadInput(format!("delta out of nanosecond range: {}", delta)))
}
