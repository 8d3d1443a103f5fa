//! Diff/patch algebra over series.
//!
//! A diff is the minimal sparse series transforming a base revision into the
//! next one: entries at new value dates carry insertions, entries at shared
//! value dates carry overrides, and null values mark deletions of points
//! present in the base. `patch(base, diff(base, other))` reproduces `other`
//! up to null stripping and float precision.

use crate::error::{CResult, Error};
use crate::series::{Series, Values};

/// Absolute tolerance under which two float values are considered equal, as
/// calibrated against production data. Revisit should magnitudes get
/// pathological (denormals, very large values).
pub const PRECISION: f64 = 1e-14;

fn float_eq(a: &f64, b: &f64) -> bool {
    (a.is_nan() && b.is_nan()) || (a - b).abs() <= PRECISION
}

fn text_eq(a: &Option<String>, b: &Option<String>) -> bool {
    a == b
}

/// Computes the diff transforming `base` into `other`.
///
/// Entries of `other` at value dates present in `base` are retained iff the
/// value changed; entries at new value dates are retained iff non-null
/// (inserting a new null is a no-op). With no base, the diff is `other`
/// without its nulls. An empty diff means the insertion is a no-op.
pub fn diff(base: Option<&Series>, other: &Series) -> CResult<Series> {
    let Some(base) = base else {
        return Ok(other.drop_nulls());
    };
    if base.kind() != other.kind() {
        return Err(Error::TypeMismatch(format!(
            "cannot diff {} against {}",
            other.kind().value_type(),
            base.kind().value_type()
        )));
    }
    let base = base.drop_nulls();
    if base.is_empty() {
        return Ok(other.drop_nulls());
    }

    let (index, values) = match (base.values(), other.values()) {
        (Values::Float(bv), Values::Float(ov)) => {
            let (index, values) =
                diff_merge(base.index(), bv, other.index(), ov, |v| v.is_nan(), float_eq);
            (index, Values::Float(values))
        }
        (Values::Text(bv), Values::Text(ov)) => {
            let (index, values) =
                diff_merge(base.index(), bv, other.index(), ov, |v| v.is_none(), text_eq);
            (index, Values::Text(values))
        }
        _ => unreachable!("kinds checked above"),
    };
    Ok(Series::trusted(index, values, other.tzaware()))
}

/// Applies a diff to a base: the result index is the union of both indices,
/// diff values overriding base values. Null entries remain present; callers
/// strip them for external consumption. Total by construction.
pub fn patch(base: &Series, diff: &Series) -> CResult<Series> {
    if base.kind() != diff.kind() {
        return Err(Error::TypeMismatch(format!(
            "cannot patch {} with {}",
            base.kind().value_type(),
            diff.kind().value_type()
        )));
    }
    let (index, values) = match (base.values(), diff.values()) {
        (Values::Float(bv), Values::Float(dv)) => {
            let (index, values) = patch_merge(base.index(), bv, diff.index(), dv);
            (index, Values::Float(values))
        }
        (Values::Text(bv), Values::Text(dv)) => {
            let (index, values) = patch_merge(base.index(), bv, diff.index(), dv);
            (index, Values::Text(values))
        }
        _ => unreachable!("kinds checked above"),
    };
    Ok(Series::trusted(index, values, base.tzaware() || diff.tzaware()))
}

/// Single pass over both sorted indices, keeping the `other` entries that
/// change the base.
fn diff_merge<T: Clone>(
    base_index: &[i64],
    base_values: &[T],
    other_index: &[i64],
    other_values: &[T],
    is_null: impl Fn(&T) -> bool,
    eq: impl Fn(&T, &T) -> bool,
) -> (Vec<i64>, Vec<T>) {
    let mut index = Vec::new();
    let mut values = Vec::new();
    let mut b = 0;
    for (o, &t) in other_index.iter().enumerate() {
        while b < base_index.len() && base_index[b] < t {
            b += 1;
        }
        let keep = if b < base_index.len() && base_index[b] == t {
            // overlap: retained iff the value differs
            !eq(&base_values[b], &other_values[o])
        } else {
            // new value date: retained iff non-null
            !is_null(&other_values[o])
        };
        if keep {
            index.push(t);
            values.push(other_values[o].clone());
        }
    }
    (index, values)
}

/// Union merge of both sorted indices, the diff winning on shared dates.
fn patch_merge<T: Clone>(
    base_index: &[i64],
    base_values: &[T],
    diff_index: &[i64],
    diff_values: &[T],
) -> (Vec<i64>, Vec<T>) {
    let mut index = Vec::with_capacity(base_index.len() + diff_index.len());
    let mut values = Vec::with_capacity(base_index.len() + diff_index.len());
    let (mut b, mut d) = (0, 0);
    while b < base_index.len() || d < diff_index.len() {
        if d >= diff_index.len() || (b < base_index.len() && base_index[b] < diff_index[d]) {
            index.push(base_index[b]);
            values.push(base_values[b].clone());
            b += 1;
        } else {
            if b < base_index.len() && base_index[b] == diff_index[d] {
                b += 1;
            }
            index.push(diff_index[d]);
            values.push(diff_values[d].clone());
            d += 1;
        }
    }
    (index, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CResult;
    use pretty_assertions::assert_eq;

    fn s(pairs: Vec<(i64, f64)>) -> Series {
        Series::from_floats(pairs).unwrap()
    }

    #[test]
    fn no_base_strips_nulls() -> CResult<()> {
        let other = s(vec![(1, 1.0), (2, f64::NAN), (3, 3.0)]);
        let d = diff(None, &other)?;
        assert_eq!(d.index(), &[1, 3]);
        Ok(())
    }

    #[test]
    fn overrides_insertions_deletions() -> CResult<()> {
        let base = s(vec![(1, 1.0), (2, 2.0), (3, 3.0)]);
        let other = s(vec![
            (1, 1.0),        // unchanged, dropped
            (2, 20.0),       // override
            (3, f64::NAN),   // deletion of an existing point
            (4, 4.0),        // insertion
            (5, f64::NAN),   // new null, dropped
        ]);
        let d = diff(Some(&base), &other)?;
        assert_eq!(d.index(), &[2, 3, 4]);
        assert!(d.values().is_null(1));

        let patched = patch(&base, &d)?;
        assert_eq!(patched.index(), &[1, 2, 3, 4]);
        assert_eq!(patched.drop_nulls(), other.drop_nulls());
        Ok(())
    }

    #[test]
    fn patch_of_own_diff_restores() -> CResult<()> {
        let base = s(vec![(1, 1.0), (2, 2.0), (4, 4.0)]);
        let other = s(vec![(2, 2.5), (3, 3.0), (4, 4.0)]);
        let d = diff(Some(&base), &other)?;
        let patched = patch(&base, &d)?;
        // base dates absent from `other` persist: patch only sees the diff
        assert_eq!(patched.index(), &[1, 2, 3, 4]);
        assert_eq!(patched.slice(Some(2), None).drop_nulls(), other);
        Ok(())
    }

    #[test]
    fn self_diff_is_empty() -> CResult<()> {
        let ts = s(vec![(1, 1.0), (2, f64::NAN), (3, 3.0)]);
        assert!(diff(Some(&ts), &ts)?.is_empty());
        Ok(())
    }

    #[test]
    fn patch_with_empty_diff_is_identity() -> CResult<()> {
        let ts = s(vec![(1, 1.0), (2, 2.0)]);
        let empty = Series::empty(crate::series::ValueKind::Float);
        assert_eq!(patch(&ts, &empty)?, ts);
        Ok(())
    }

    #[test]
    fn diff_is_asymmetric() -> CResult<()> {
        let a = s(vec![(1, 1.0)]);
        let b = s(vec![(2, 2.0)]);
        let ab = diff(Some(&a), &b)?;
        let ba = diff(Some(&b), &a)?;
        assert_ne!(ab, ba);
        Ok(())
    }

    #[test]
    fn float_tolerance() -> CResult<()> {
        let base = s(vec![(1, 1.0)]);
        let within = s(vec![(1, 1.0 + 5e-15)]);
        assert!(diff(Some(&base), &within)?.is_empty());
        let beyond = s(vec![(1, 1.0 + 5e-14)]);
        assert_eq!(diff(Some(&base), &beyond)?.len(), 1);
        Ok(())
    }

    #[test]
    fn null_base_entries_are_ignored() -> CResult<()> {
        // A null in the base is not a value: re-sending a null there is a
        // no-op, sending a value is an insertion.
        let base = s(vec![(1, f64::NAN), (2, 2.0)]);
        let other = s(vec![(1, f64::NAN), (2, 2.0)]);
        assert!(diff(Some(&base), &other)?.is_empty());

        let other = s(vec![(1, 1.0), (2, 2.0)]);
        let d = diff(Some(&base), &other)?;
        assert_eq!(d.index(), &[1]);
        Ok(())
    }

    #[test]
    fn text_diffs() -> CResult<()> {
        let base = Series::from_texts(vec![
            (1, Some("a".into())),
            (2, Some("b".into())),
        ])?;
        let other = Series::from_texts(vec![
            (1, Some("a".into())),
            (2, None),
            (3, Some("c".into())),
        ])?;
        let d = diff(Some(&base), &other)?;
        assert_eq!(d.index(), &[2, 3]);
        let patched = patch(&base, &d)?;
        assert_eq!(patched.drop_nulls().index(), &[1, 3]);
        Ok(())
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let base = s(vec![(1, 1.0)]);
        let other = Series::from_texts(vec![(1, Some("a".into()))]).unwrap();
        assert!(matches!(diff(Some(&base), &other), Err(Error::TypeMismatch(_))));
        assert!(matches!(patch(&base, &other), Err(Error::TypeMismatch(_))));
    }
}
