//! The time-indexed sequence container.
//!
//! A [`Series`] is an ordered sequence of `(value_date, value)` pairs with a
//! homogeneous value type. Value dates are UTC-naive nanoseconds since the
//! epoch; timezone awareness is carried as a flag and handled as metadata
//! only. Null values are legal and encode deletions in diffs: NaN for float
//! series, `None` for text series.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::{CResult, Error};

/// The value type of a series, fixed at first insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Text,
}

impl ValueKind {
    /// The registered `value_type` metadata tag.
    pub fn value_type(&self) -> &'static str {
        match self {
            ValueKind::Float => "float64",
            ValueKind::Text => "object",
        }
    }

    /// The registered `value_dtype` metadata tag.
    pub fn value_dtype(&self) -> &'static str {
        match self {
            ValueKind::Float => "<f8",
            ValueKind::Text => "|O",
        }
    }
}

/// The values of a series, tagged by type. Float nulls are NaN, text nulls
/// are None.
#[derive(Clone, Debug)]
pub enum Values {
    Float(Vec<f64>),
    Text(Vec<Option<String>>),
}

impl Values {
    pub fn kind(&self) -> ValueKind {
        match self {
            Values::Float(_) => ValueKind::Float,
            Values::Text(_) => ValueKind::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Float(v) => v.len(),
            Values::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_null(&self, i: usize) -> bool {
        match self {
            Values::Float(v) => v[i].is_nan(),
            Values::Text(v) => v[i].is_none(),
        }
    }

    fn slice(&self, lo: usize, hi: usize) -> Values {
        match self {
            Values::Float(v) => Values::Float(v[lo..hi].to_vec()),
            Values::Text(v) => Values::Text(v[lo..hi].to_vec()),
        }
    }

    fn select(&self, keep: &[usize]) -> Values {
        match self {
            Values::Float(v) => Values::Float(keep.iter().map(|&i| v[i]).collect()),
            Values::Text(v) => Values::Text(keep.iter().map(|&i| v[i].clone()).collect()),
        }
    }
}

impl PartialEq for Values {
    /// Equality with NaN == NaN, so identical float series compare equal.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Values::Float(a), Values::Float(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
            }
            (Values::Text(a), Values::Text(b)) => a == b,
            _ => false,
        }
    }
}

/// An ordered, typed, time-indexed sequence of values.
#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    index: Vec<i64>,
    values: Values,
    tzaware: bool,
}

impl Series {
    /// Builds a series from an index and values of equal length. The entries
    /// are sorted by value date; duplicate value dates are rejected.
    pub fn new(index: Vec<i64>, values: Values) -> CResult<Self> {
        if index.len() != values.len() {
            return Err(Error::BadInput(format!(
                "index and values length mismatch: {} vs {}",
                index.len(),
                values.len()
            )));
        }
        let sorted = index.windows(2).all(|w| w[0] < w[1]);
        if sorted {
            return Ok(Self { index, values, tzaware: false });
        }

        let mut order: Vec<usize> = (0..index.len()).collect();
        order.sort_by_key(|&i| index[i]);
        let sorted_index: Vec<i64> = order.iter().map(|&i| index[i]).collect();
        if sorted_index.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::BadInput("duplicate entries in the index".into()));
        }
        let values = values.select(&order);
        Ok(Self { index: sorted_index, values, tzaware: false })
    }

    /// Builds an already-sorted series without validation. Callers must
    /// guarantee a strictly increasing index.
    pub(crate) fn trusted(index: Vec<i64>, values: Values, tzaware: bool) -> Self {
        debug_assert!(index.windows(2).all(|w| w[0] < w[1]));
        debug_assert_eq!(index.len(), values.len());
        Self { index, values, tzaware }
    }

    pub fn from_floats(pairs: Vec<(i64, f64)>) -> CResult<Self> {
        let (index, values) = pairs.into_iter().unzip();
        Self::new(index, Values::Float(values))
    }

    pub fn from_texts(pairs: Vec<(i64, Option<String>)>) -> CResult<Self> {
        let (index, values) = pairs.into_iter().unzip();
        Self::new(index, Values::Text(values))
    }

    pub fn empty(kind: ValueKind) -> Self {
        let values = match kind {
            ValueKind::Float => Values::Float(vec![]),
            ValueKind::Text => Values::Text(vec![]),
        };
        Self { index: vec![], values, tzaware: false }
    }

    /// Flags the series value dates as timezone-aware (stored UTC-naive,
    /// localized to UTC by readers).
    pub fn with_tzaware(mut self, tzaware: bool) -> Self {
        self.tzaware = tzaware;
        self
    }

    pub fn tzaware(&self) -> bool {
        self.tzaware
    }

    pub fn kind(&self) -> ValueKind {
        self.values.kind()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[i64] {
        &self.index
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn min_index(&self) -> Option<i64> {
        self.index.first().copied()
    }

    pub fn max_index(&self) -> Option<i64> {
        self.index.last().copied()
    }

    /// The inclusive `[from, to]` slice of the series.
    pub fn slice(&self, from: Option<i64>, to: Option<i64>) -> Series {
        let lo = match from {
            Some(from) => self.index.partition_point(|&t| t < from),
            None => 0,
        };
        let hi = match to {
            Some(to) => self.index.partition_point(|&t| t <= to),
            None => self.index.len(),
        };
        let (lo, hi) = (lo.min(hi), hi);
        Series {
            index: self.index[lo..hi].to_vec(),
            values: self.values.slice(lo, hi),
            tzaware: self.tzaware,
        }
    }

    /// The series without its null entries.
    pub fn drop_nulls(&self) -> Series {
        let keep: Vec<usize> = (0..self.len()).filter(|&i| !self.values.is_null(i)).collect();
        Series {
            index: keep.iter().map(|&i| self.index[i]).collect(),
            values: self.values.select(&keep),
            tzaware: self.tzaware,
        }
    }

    /// The non-null value date span, or None if every entry is null.
    pub fn start_end(&self) -> Option<(i64, i64)> {
        let first = (0..self.len()).find(|&i| !self.values.is_null(i))?;
        let last = (0..self.len()).rfind(|&i| !self.values.is_null(i))?;
        Some((self.index[first], self.index[last]))
    }

    pub(crate) fn first_is_null(&self) -> bool {
        !self.is_empty() && self.values.is_null(0)
    }

    pub(crate) fn last_is_null(&self) -> bool {
        !self.is_empty() && self.values.is_null(self.len() - 1)
    }

    /// Splits the series into contiguous buckets of at most `max` points.
    pub(crate) fn buckets(&self, max: usize) -> Vec<Series> {
        if self.len() <= max {
            return vec![self.clone()];
        }
        let mut buckets = Vec::with_capacity(self.len() / max + 1);
        let mut start = 0;
        while start < self.len() {
            let end = (start + max).min(self.len());
            buckets.push(Series {
                index: self.index[start..end].to_vec(),
                values: self.values.slice(start, end),
                tzaware: self.tzaware,
            });
            start = end;
        }
        buckets
    }

    /// Iterates float entries; panics on text series.
    pub fn iter_float(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        let values = match &self.values {
            Values::Float(v) => v,
            Values::Text(_) => panic!("not a float series"),
        };
        self.index.iter().copied().zip(values.iter().copied())
    }

    /// Iterates text entries; panics on float series.
    pub fn iter_text(&self) -> impl Iterator<Item = (i64, Option<&str>)> + '_ {
        let values = match &self.values {
            Values::Text(v) => v,
            Values::Float(_) => panic!("not a text series"),
        };
        self.index.iter().copied().zip(values.iter().map(|v| v.as_deref()))
    }
}

// timestamp helpers: value dates are UTC-naive nanoseconds internally,
// chrono types at the API edge.

pub fn ns_to_utc(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

pub fn ns_to_naive(ns: i64) -> NaiveDateTime {
    Utc.timestamp_nanos(ns).naive_utc()
}

pub fn utc_to_ns(t: &DateTime<Utc>) -> CResult<i64> {
    t.timestamp_nanos_opt()
        .ok_or_else(|| Error::BadInput(format!("timestamp out of nanosecond range: {}", t)))
}

pub fn naive_to_ns(t: &NaiveDateTime) -> CResult<i64> {
    utc_to_ns(&Utc.from_utc_datetime(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn day(d: i64) -> i64 {
        // 2010-01-<d> in epoch nanoseconds
        let base = 1_262_304_000i64 * 1_000_000_000; // 2010-01-01T00:00:00Z
        base + (d - 1) * 86_400 * 1_000_000_000
    }

    #[test]
    fn unsorted_input_is_sorted() -> CResult<()> {
        let ts = Series::from_floats(vec![(day(3), 3.0), (day(1), 1.0), (day(2), 2.0)])?;
        assert_eq!(ts.index(), &[day(1), day(2), day(3)]);
        assert_eq!(ts.iter_float().map(|(_, v)| v).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let err = Series::from_floats(vec![(day(1), 1.0), (day(1), 2.0)]).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn slice_is_inclusive() -> CResult<()> {
        let ts = Series::from_floats((1..=5).map(|d| (day(d), d as f64)).collect())?;
        let sliced = ts.slice(Some(day(2)), Some(day(4)));
        assert_eq!(sliced.index(), &[day(2), day(3), day(4)]);
        assert_eq!(ts.slice(None, Some(day(1))).len(), 1);
        assert_eq!(ts.slice(Some(day(6)), None).len(), 0);
        Ok(())
    }

    #[test]
    fn nulls_and_span() -> CResult<()> {
        let ts = Series::from_floats(vec![
            (day(1), f64::NAN),
            (day(2), 2.0),
            (day(3), f64::NAN),
            (day(4), 4.0),
            (day(5), f64::NAN),
        ])?;
        assert_eq!(ts.start_end(), Some((day(2), day(4))));
        assert!(ts.first_is_null());
        assert!(ts.last_is_null());

        let stripped = ts.drop_nulls();
        assert_eq!(stripped.index(), &[day(2), day(4)]);

        let allnull = Series::from_floats(vec![(day(1), f64::NAN)])?;
        assert_eq!(allnull.start_end(), None);
        Ok(())
    }

    #[test]
    fn buckets_split_evenly() -> CResult<()> {
        let ts = Series::from_floats((1..=5).map(|d| (day(d), d as f64)).collect())?;
        let buckets = ts.buckets(2);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].index(), &[day(1), day(2)]);
        assert_eq!(buckets[1].index(), &[day(3), day(4)]);
        assert_eq!(buckets[2].index(), &[day(5)]);
        assert_eq!(ts.buckets(10).len(), 1);
        Ok(())
    }

    #[test]
    fn nan_equality() -> CResult<()> {
        let a = Series::from_floats(vec![(day(1), f64::NAN), (day(2), 2.0)])?;
        let b = Series::from_floats(vec![(day(1), f64::NAN), (day(2), 2.0)])?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn text_series() -> CResult<()> {
        let ts = Series::from_texts(vec![
            (day(2), Some("b".to_string())),
            (day(1), Some("a".to_string())),
            (day(3), None),
        ])?;
        assert_eq!(ts.kind(), ValueKind::Text);
        assert_eq!(ts.start_end(), Some((day(1), day(2))));
        assert_eq!(ts.drop_nulls().len(), 2);
        Ok(())
    }

    #[test]
    fn timestamp_round_trip() -> CResult<()> {
        let ns = day(15);
        assert_eq!(naive_to_ns(&ns_to_naive(ns))?, ns);
        assert_eq!(utc_to_ns(&ns_to_utc(ns))?, ns);
        Ok(())
    }
}
