//! `tshist` is a versioned time-series storage engine: it records every
//! revision of every named series, answers "what did this series look like
//! as of that date", and keeps storage compact by writing each revision as
//! a diff against its predecessor plus a chunked snapshot structure sharing
//! unchanged chunks between revisions.
//!
//! Storage goes through a pluggable ordered key/value [`storage::engine::Engine`];
//! [`storage::memory::Memory`] keeps everything in a BTreeMap and
//! [`storage::disk::DiskLog`] persists to an append-only log file. Every
//! operation runs inside a serialized, all-or-nothing transaction.
//!
//! ## Getting started
//!
//! ```rust
//! use tshist::{Series, Tsio};
//! use tshist::storage::memory::Memory;
//!
//! fn main() -> tshist::CResult<()> {
//!     let tsh = Tsio::new(Memory::new());
//!     let day = 86_400 * 1_000_000_000i64;
//!
//!     tsh.in_txn(|txn| {
//!         let ts = Series::from_floats(vec![(0, 1.0), (day, 2.0), (2 * day, 3.0)])?;
//!         tsh.insert(txn, "prices", &ts, "alice", None, None)?;
//!
//!         // a second insertion only records the differences
//!         let edit = Series::from_floats(vec![(day, 20.0), (3 * day, 4.0)])?;
//!         let diff = tsh.insert(txn, "prices", &edit, "alice", None, None)?.unwrap();
//!         assert_eq!(diff.len(), 2);
//!
//!         let current = tsh.get(txn, "prices", None, None, None)?.unwrap();
//!         assert_eq!(current.len(), 4);
//!         Ok(())
//!     })
//! }
//! ```

pub mod codec;
pub mod diff;
pub mod error;
pub(crate) mod keys;
pub mod registry;
pub mod series;
pub(crate) mod snapshot;
pub mod storage;
pub mod tsio;
pub mod util;

pub use error::{CResult, Error};
pub use registry::SeriesMeta;
pub use series::{Series, ValueKind, Values};
pub use tsio::{
    ChangesetHandle, HistoryOpts, Info, Interval, LogEntry, LogFilter, Options, SearchMode, Tsio,
};
