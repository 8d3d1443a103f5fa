//! Batch administrative helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::CResult;
use crate::series::Series;
use crate::storage::engine::Engine;
use crate::tsio::Tsio;

/// Runs `func` over `args` on at most `maxthreads` worker threads at a
/// time. Meant for coarse administrative batches, not hot paths.
pub fn run_parallel<A, F>(maxthreads: usize, func: F, args: &[A])
where
    A: Sync,
    F: Fn(&A) + Sync,
{
    let maxthreads = maxthreads.max(1);
    let func = &func;
    std::thread::scope(|scope| {
        for wave in args.chunks(maxthreads) {
            let handles: Vec<_> = wave
                .iter()
                .map(|arg| {
                    log::debug!("worker started");
                    scope.spawn(move || func(arg))
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    log::error!("worker panicked");
                }
            }
        }
    });
}

/// Deletes a batch of series, one transaction each, skipping unknown names.
pub fn delete_many<E: Engine>(tsh: &Tsio<E>, names: &[&str]) -> CResult<()> {
    for name in names {
        tsh.in_txn(|txn| {
            if !tsh.exists(txn, name)? {
                log::info!("skipping unknown series {}", name);
                return Ok(());
            }
            tsh.delete(txn, name)
        })?;
    }
    Ok(())
}

/// Collapses consecutive identical snapshots out of a history map, keeping
/// the first occurrence of each run.
pub fn pruned_history(
    hist: BTreeMap<DateTime<Utc>, Series>,
) -> BTreeMap<DateTime<Utc>, Series> {
    let mut pruned = BTreeMap::new();
    let mut current: Option<Series> = None;
    for (idate, ts) in hist {
        if current.as_ref() != Some(&ts) {
            current = Some(ts.clone());
            pruned.insert(idate, ts);
        }
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::ns_to_utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_parallel_visits_every_arg() {
        let counter = AtomicUsize::new(0);
        let args: Vec<usize> = (0..17).collect();
        run_parallel(4, |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }, &args);
        assert_eq!(counter.load(Ordering::SeqCst), 17);
    }

    #[test]
    fn pruned_history_collapses_runs() {
        let a = Series::from_floats(vec![(1, 1.0)]).unwrap();
        let b = Series::from_floats(vec![(1, 2.0)]).unwrap();
        let hist = BTreeMap::from([
            (ns_to_utc(1), a.clone()),
            (ns_to_utc(2), a.clone()),
            (ns_to_utc(3), b.clone()),
            (ns_to_utc(4), b.clone()),
            (ns_to_utc(5), a.clone()),
        ]);
        let pruned = pruned_history(hist);
        assert_eq!(
            pruned.keys().copied().collect::<Vec<_>>(),
            vec![ns_to_utc(1), ns_to_utc(3), ns_to_utc(5)]
        );
    }

    #[test]
    fn delete_many_skips_unknown() -> CResult<()> {
        use crate::storage::memory::Memory;
        let tsh = Tsio::new(Memory::new());
        tsh.in_txn(|txn| {
            tsh.insert(txn, "a", &Series::from_floats(vec![(1, 1.0)])?, "test", None, None)?;
            tsh.insert(txn, "b", &Series::from_floats(vec![(1, 1.0)])?, "test", None, None)?;
            Ok(())
        })?;
        delete_many(&tsh, &["a", "missing", "b"])?;
        tsh.in_txn(|txn| {
            assert!(tsh.list_series(txn)?.is_empty());
            Ok(())
        })
    }
}
