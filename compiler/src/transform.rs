// transform.rs — Index transforms and the interval algebra over them
//
// A read edge `g(e)` inside stage `f` stores, per producer dimension, the
// access expression `e` as a closed algebra of transform kinds applied to
// one consumer variable: integer offset, integer scale, floor division, and
// their composition. Anything else (data-dependent indices, several
// variables mixed together) is `Opaque` and has no inverse.
//
// Every kind with a factor requires the factor to be >= 1, so each transform
// is monotone non-decreasing and the image of an interval is the interval
// between the images of its end points. Both directions round outward:
// lower bounds down, upper bounds up.

use std::fmt;

use serde::Serialize;

use crate::sym::{floor_div, SymExpr};

// ── Interval ────────────────────────────────────────────────────────────────

/// A closed integer interval `[lo, hi]` whose bounds may be symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Interval {
    pub lo: SymExpr,
    pub hi: SymExpr,
}

impl Interval {
    pub fn new(lo: SymExpr, hi: SymExpr) -> Self {
        Interval { lo, hi }
    }

    pub fn constant(lo: i64, hi: i64) -> Self {
        Interval::new(SymExpr::Const(lo), SymExpr::Const(hi))
    }

    pub fn point(at: SymExpr) -> Self {
        Interval::new(at.clone(), at)
    }

    /// Smallest interval containing both.
    pub fn union(&self, other: &Interval) -> Interval {
        Interval::new(self.lo.sym_min(&other.lo), self.hi.sym_max(&other.hi))
    }

    /// Number of points, `hi - lo + 1`.
    pub fn extent(&self) -> SymExpr {
        self.hi.sub(&self.lo).add_const(1)
    }

    /// Bounds as constants, if both are known at compile time.
    pub fn as_const(&self) -> Option<(i64, i64)> {
        Some((self.lo.as_const()?, self.hi.as_const()?))
    }

    pub fn mentions_block(&self) -> bool {
        self.lo.mentions_block() || self.hi.mentions_block()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

// ── Transform kinds ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexTransform {
    Identity,
    /// `x + k`
    Offset(i64),
    /// `k * x`, `k >= 1`
    Scale(i64),
    /// `floor(x / k)`, `k >= 1`
    Div(i64),
    /// Applied left to right.
    Compose(Vec<IndexTransform>),
    /// Data-dependent index; no inverse.
    Opaque,
}

impl IndexTransform {
    /// `self` followed by `next`, normalized: identities dropped, adjacent
    /// offsets summed, adjacent scales and divisions multiplied. Opaque if a
    /// merged constant overflows.
    pub fn then(&self, next: &IndexTransform) -> IndexTransform {
        self.try_then(next).unwrap_or(IndexTransform::Opaque)
    }

    /// `then`, or `None` when merging constants overflows `i64`.
    pub fn try_then(&self, next: &IndexTransform) -> Option<IndexTransform> {
        let mut steps = Vec::new();
        flatten_into(self, &mut steps);
        flatten_into(next, &mut steps);

        let mut merged: Vec<IndexTransform> = Vec::with_capacity(steps.len());
        for step in steps {
            let combined = match (merged.last(), &step) {
                (Some(IndexTransform::Offset(a)), IndexTransform::Offset(b)) => {
                    Some(IndexTransform::Offset(a.checked_add(*b)?))
                }
                (Some(IndexTransform::Scale(a)), IndexTransform::Scale(b)) => {
                    Some(IndexTransform::Scale(a.checked_mul(*b)?))
                }
                (Some(IndexTransform::Div(a)), IndexTransform::Div(b)) => {
                    Some(IndexTransform::Div(a.checked_mul(*b)?))
                }
                _ => None,
            };
            match combined {
                Some(c) => {
                    merged.pop();
                    if !c.is_trivial() {
                        merged.push(c);
                    }
                }
                None => merged.push(step),
            }
        }

        Some(match merged.len() {
            0 => IndexTransform::Identity,
            1 => merged.remove(0),
            _ => IndexTransform::Compose(merged),
        })
    }

    /// Largest magnitude among the offsets and factors.
    pub fn max_constant(&self) -> i64 {
        match self {
            IndexTransform::Identity | IndexTransform::Opaque => 0,
            IndexTransform::Offset(k) | IndexTransform::Scale(k) | IndexTransform::Div(k) => {
                k.checked_abs().unwrap_or(i64::MAX)
            }
            IndexTransform::Compose(steps) => {
                steps.iter().map(IndexTransform::max_constant).max().unwrap_or(0)
            }
        }
    }

    fn is_trivial(&self) -> bool {
        matches!(
            self,
            IndexTransform::Identity
                | IndexTransform::Offset(0)
                | IndexTransform::Scale(1)
                | IndexTransform::Div(1)
        )
    }

    pub fn has_inverse(&self) -> bool {
        match self {
            IndexTransform::Opaque => false,
            IndexTransform::Compose(steps) => steps.iter().all(IndexTransform::has_inverse),
            _ => true,
        }
    }

    pub fn apply_point(&self, x: i64) -> Option<i64> {
        match self {
            IndexTransform::Identity => Some(x),
            IndexTransform::Offset(k) => Some(x + k),
            IndexTransform::Scale(k) => Some(x * k),
            IndexTransform::Div(k) => Some(floor_div(x, *k)),
            IndexTransform::Compose(steps) => steps.iter().try_fold(x, |v, t| t.apply_point(v)),
            IndexTransform::Opaque => None,
        }
    }

    /// Hull of the producer coordinates reached from consumer `interval`.
    pub fn image(&self, interval: &Interval) -> Option<Interval> {
        match self {
            IndexTransform::Identity => Some(interval.clone()),
            IndexTransform::Offset(k) => Some(Interval::new(
                interval.lo.add_const(*k),
                interval.hi.add_const(*k),
            )),
            IndexTransform::Scale(k) => Some(Interval::new(
                interval.lo.scale(*k),
                interval.hi.scale(*k),
            )),
            IndexTransform::Div(k) => Some(Interval::new(
                interval.lo.floor_div(*k),
                interval.hi.floor_div(*k),
            )),
            IndexTransform::Compose(steps) => steps
                .iter()
                .try_fold(interval.clone(), |acc, t| t.image(&acc)),
            IndexTransform::Opaque => None,
        }
    }

    /// Consumer coordinates whose access may land in producer `interval`
    /// (the per-kind inverse, rounded outward).
    pub fn preimage(&self, interval: &Interval) -> Option<Interval> {
        match self {
            IndexTransform::Identity => Some(interval.clone()),
            IndexTransform::Offset(k) => Some(Interval::new(
                interval.lo.add_const(-k),
                interval.hi.add_const(-k),
            )),
            IndexTransform::Scale(k) => Some(Interval::new(
                interval.lo.floor_div(*k),
                interval.hi.ceil_div(*k),
            )),
            IndexTransform::Div(k) => Some(Interval::new(
                interval.lo.scale(*k),
                interval.hi.scale(*k).add_const(k - 1),
            )),
            IndexTransform::Compose(steps) => steps
                .iter()
                .rev()
                .try_fold(interval.clone(), |acc, t| t.preimage(&acc)),
            IndexTransform::Opaque => None,
        }
    }

    /// Render as an index expression over `var`.
    pub fn render(&self, var: &str) -> String {
        match self {
            IndexTransform::Identity => var.to_string(),
            IndexTransform::Offset(k) if *k < 0 => format!("{var} - {}", -k),
            IndexTransform::Offset(k) => format!("{var} + {k}"),
            IndexTransform::Scale(k) => format!("{k}*{}", wrap(var)),
            IndexTransform::Div(k) => format!("{} / {k}", wrap(var)),
            IndexTransform::Compose(steps) => steps
                .iter()
                .fold(var.to_string(), |acc, t| t.render(&acc)),
            IndexTransform::Opaque => format!("?({var})"),
        }
    }
}

fn flatten_into(t: &IndexTransform, out: &mut Vec<IndexTransform>) {
    match t {
        IndexTransform::Compose(steps) => {
            for s in steps {
                flatten_into(s, out);
            }
        }
        other if other.is_trivial() => {}
        other => out.push(other.clone()),
    }
}

fn wrap(expr: &str) -> String {
    if expr.contains(' ') {
        format!("({expr})")
    } else {
        expr.to_string()
    }
}

impl fmt::Display for IndexTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render("x"))
    }
}

impl Serialize for IndexTransform {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ── Evaluator seam ──────────────────────────────────────────────────────────

/// The interval-arithmetic service region propagation is written against.
/// `None` means the transform has no inverse and cannot bound a region.
pub trait IntervalEvaluator {
    fn image(&self, transform: &IndexTransform, interval: &Interval) -> Option<Interval>;
    fn preimage(&self, transform: &IndexTransform, interval: &Interval) -> Option<Interval>;
}

/// Evaluator backed by the closed transform algebra above.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformAlgebra;

impl IntervalEvaluator for TransformAlgebra {
    fn image(&self, transform: &IndexTransform, interval: &Interval) -> Option<Interval> {
        transform.image(interval)
    }

    fn preimage(&self, transform: &IndexTransform, interval: &Interval) -> Option<Interval> {
        transform.preimage(interval)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merging_overflow_is_reported() {
        let big = IndexTransform::Scale(1 << 40);
        assert_eq!(big.try_then(&big), None);
        assert_eq!(big.then(&big), IndexTransform::Opaque);
        let near = IndexTransform::Offset(i64::MAX);
        assert_eq!(near.try_then(&IndexTransform::Offset(1)), None);
        assert_eq!(
            IndexTransform::Scale(2).try_then(&IndexTransform::Offset(-7)).map(|t| t.max_constant()),
            Some(7)
        );
    }

    #[test]
    fn offset_read_expands_upper_boundary() {
        let consumer = Interval::constant(10, 25);
        let plain = IndexTransform::Identity.image(&consumer).unwrap();
        let shifted = IndexTransform::Offset(3).image(&consumer).unwrap();
        assert_eq!(plain.union(&shifted), Interval::constant(10, 28));
    }

    #[test]
    fn negative_offset_expands_lower_boundary() {
        let consumer = Interval::constant(0, 7);
        let r = IndexTransform::Offset(-2)
            .image(&consumer)
            .unwrap()
            .union(&consumer);
        assert_eq!(r, Interval::constant(-2, 7));
    }

    #[test]
    fn div_inverse_covers_both_sources() {
        // inverse of `/2` over [a, b] is [2a, 2b + 1]
        let r = IndexTransform::Div(2)
            .preimage(&Interval::constant(3, 5))
            .unwrap();
        assert_eq!(r, Interval::constant(6, 11));
    }

    #[test]
    fn div_round_trip_contains_consumer() {
        let consumer = Interval::constant(-7, 13);
        let producer = IndexTransform::Div(4).image(&consumer).unwrap();
        assert_eq!(producer, Interval::constant(-2, 3));
        let back = IndexTransform::Div(4).preimage(&producer).unwrap();
        assert_eq!(back, Interval::constant(-8, 15));
    }

    #[test]
    fn scale_preimage_rounds_outward() {
        let r = IndexTransform::Scale(3)
            .preimage(&Interval::constant(4, 10))
            .unwrap();
        assert_eq!(r, Interval::constant(1, 4));
    }

    #[test]
    fn symbolic_tile_through_div() {
        let bx = SymExpr::block(0);
        let tile = Interval::new(bx.scale(64), bx.scale(64).add_const(63));
        let r = IndexTransform::Div(2).image(&tile).unwrap();
        assert_eq!(r.extent(), SymExpr::Const(32));
    }

    #[test]
    fn then_merges_adjacent_kinds() {
        let t = IndexTransform::Offset(1)
            .then(&IndexTransform::Offset(-1))
            .then(&IndexTransform::Scale(2))
            .then(&IndexTransform::Scale(3));
        assert_eq!(t, IndexTransform::Scale(6));
        let t = IndexTransform::Scale(2).then(&IndexTransform::Offset(1));
        assert_eq!(
            t,
            IndexTransform::Compose(vec![IndexTransform::Scale(2), IndexTransform::Offset(1)])
        );
        assert_eq!(t.to_string(), "2*x + 1");
        assert_eq!(t.apply_point(5), Some(11));
    }

    #[test]
    fn compose_preimage_inverts_in_reverse() {
        let t = IndexTransform::Offset(1).then(&IndexTransform::Div(2));
        assert_eq!(t.to_string(), "(x + 1) / 2");
        let consumer = Interval::constant(0, 9);
        let producer = t.image(&consumer).unwrap();
        assert_eq!(producer, Interval::constant(0, 5));
        let back = t.preimage(&producer).unwrap();
        assert_eq!(back, Interval::constant(-1, 10));
    }

    #[test]
    fn opaque_has_no_inverse() {
        let t = IndexTransform::Offset(1).then(&IndexTransform::Opaque);
        assert!(!t.has_inverse());
        assert!(TransformAlgebra
            .image(&t, &Interval::constant(0, 1))
            .is_none());
    }
}
