//! Half-open integer intervals and interval sets
//!
//! Exclusive tile regions are computed one axis at a time by subtracting
//! neighbour extents from a tile's own extent. [`IntervalSet`] keeps the
//! residual exact, so a split into several pieces is visible to the caller
//! instead of being silently merged.

use std::fmt;

/// Half-open interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

impl Interval {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True when both intervals share at least one point
    pub fn intersects(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, point: usize) -> bool {
        self.start <= point && point < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Ordered set of disjoint, non-empty, non-adjacent intervals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_interval(interval: Interval) -> Self {
        let mut set = Self::new();
        set.insert(interval);
        set
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total number of points covered
    pub fn measure(&self) -> usize {
        self.intervals.iter().map(Interval::len).sum()
    }

    /// Add an interval, merging with anything it touches or overlaps
    pub fn insert(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }

        let mut merged = interval;
        let mut result = Vec::with_capacity(self.intervals.len() + 1);
        let mut placed = false;
        for &existing in &self.intervals {
            if existing.end < merged.start {
                result.push(existing);
            } else if merged.end < existing.start {
                if !placed {
                    result.push(merged);
                    placed = true;
                }
                result.push(existing);
            } else {
                merged = Interval::new(
                    merged.start.min(existing.start),
                    merged.end.max(existing.end),
                );
            }
        }
        if !placed {
            result.push(merged);
        }
        self.intervals = result;
    }

    /// Remove every point of `interval` from the set
    pub fn subtract(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }

        let mut result = Vec::with_capacity(self.intervals.len() + 1);
        for &existing in &self.intervals {
            if !existing.intersects(&interval) {
                result.push(existing);
                continue;
            }
            if existing.start < interval.start {
                result.push(Interval::new(existing.start, interval.start));
            }
            if interval.end < existing.end {
                result.push(Interval::new(interval.end, existing.end));
            }
        }
        self.intervals = result;
    }

    /// Collapse to one interval
    ///
    /// Returns `Ok(None)` for an empty set and `Err(pieces)` when the set is
    /// fragmented into more than one interval.
    pub fn single(&self) -> std::result::Result<Option<Interval>, usize> {
        match self.intervals.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(*only)),
            pieces => Err(pieces.len()),
        }
    }
}
