// sym.rs — Symbolic integer expressions for region bounds and buffer sizes
//
// A bound is either a compile-time constant or an expression over runtime
// symbols (block indices, runtime extent parameters) evaluated at block
// entry. Both cases share one type so interval union, extent arithmetic and
// max-over-grid work uniformly across constants, symbols, and their mix.
//
// Invariants:
//   - every `Symbol` ranges over non-negative integers;
//   - `Sum` is canonical: atoms sorted, no zero coefficients, no `Const` or
//     `Sum` atoms, and it never degenerates to a single bare atom or constant;
//   - `FloorDiv` divisors are positive; division is floor division.
//
// Simplification is sound but incomplete: `sym_min`/`sym_max` collapse only when the
// ordering is provable from non-negativity, otherwise a node is kept.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::{FuseError, Result};

// ── Symbols ─────────────────────────────────────────────────────────────────

/// A runtime quantity a bound may depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    /// Index of the current block along grid dimension `d`.
    Block(usize),
    /// Named runtime parameter (`param n`), typically an output extent.
    Param(String),
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Block(0) => write!(f, "bx"),
            Symbol::Block(1) => write!(f, "by"),
            Symbol::Block(2) => write!(f, "bz"),
            Symbol::Block(d) => write!(f, "b{d}"),
            Symbol::Param(name) => write!(f, "{name}"),
        }
    }
}

/// Runtime values for symbols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(BTreeMap<Symbol, i64>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sym: Symbol, value: i64) -> Self {
        self.0.insert(sym, value);
        self
    }

    pub fn set(&mut self, sym: Symbol, value: i64) {
        self.0.insert(sym, value);
    }

    pub fn get(&self, sym: &Symbol) -> Option<i64> {
        self.0.get(sym).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &i64)> {
        self.0.iter()
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymExpr {
    Const(i64),
    Sym(Symbol),
    /// `Σ coeff·atom + constant`.
    Sum(Vec<(SymExpr, i64)>, i64),
    Mul(Box<SymExpr>, Box<SymExpr>),
    FloorDiv(Box<SymExpr>, i64),
    Min(Box<SymExpr>, Box<SymExpr>),
    Max(Box<SymExpr>, Box<SymExpr>),
}

/// Floor division on integers (rounds toward negative infinity).
pub fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

struct Linear {
    terms: Vec<(SymExpr, i64)>,
    constant: i64,
}

impl Linear {
    fn of(e: &SymExpr) -> Linear {
        match e {
            SymExpr::Const(c) => Linear {
                terms: Vec::new(),
                constant: *c,
            },
            SymExpr::Sum(terms, c) => Linear {
                terms: terms.clone(),
                constant: *c,
            },
            other => Linear {
                terms: vec![(other.clone(), 1)],
                constant: 0,
            },
        }
    }

    fn scaled(mut self, k: i64) -> Linear {
        for term in &mut self.terms {
            term.1 *= k;
        }
        self.constant *= k;
        self
    }

    fn plus(mut self, other: Linear) -> Linear {
        self.terms.extend(other.terms);
        self.constant += other.constant;
        self
    }

    fn into_expr(self) -> SymExpr {
        let mut merged: BTreeMap<SymExpr, i64> = BTreeMap::new();
        for (atom, k) in self.terms {
            *merged.entry(atom).or_insert(0) += k;
        }
        let mut terms: Vec<(SymExpr, i64)> = merged.into_iter().filter(|(_, k)| *k != 0).collect();
        match (terms.len(), self.constant) {
            (0, c) => SymExpr::Const(c),
            (1, 0) if terms[0].1 == 1 => terms.remove(0).0,
            (_, c) => SymExpr::Sum(terms, c),
        }
    }
}

impl SymExpr {
    pub fn constant(c: i64) -> SymExpr {
        SymExpr::Const(c)
    }

    pub fn block(dim: usize) -> SymExpr {
        SymExpr::Sym(Symbol::Block(dim))
    }

    pub fn param(name: impl Into<String>) -> SymExpr {
        SymExpr::Sym(Symbol::Param(name.into()))
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            SymExpr::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    pub fn add(&self, other: &SymExpr) -> SymExpr {
        Linear::of(self).plus(Linear::of(other)).into_expr()
    }

    pub fn add_const(&self, c: i64) -> SymExpr {
        self.add(&SymExpr::Const(c))
    }

    pub fn sub(&self, other: &SymExpr) -> SymExpr {
        Linear::of(self)
            .plus(Linear::of(other).scaled(-1))
            .into_expr()
    }

    pub fn scale(&self, k: i64) -> SymExpr {
        if k == 0 {
            return SymExpr::Const(0);
        }
        Linear::of(self).scaled(k).into_expr()
    }

    pub fn mul(&self, other: &SymExpr) -> SymExpr {
        match (self.as_const(), other.as_const()) {
            (Some(a), _) => other.scale(a),
            (_, Some(b)) => self.scale(b),
            _ => {
                let (a, b) = if self <= other {
                    (self, other)
                } else {
                    (other, self)
                };
                SymExpr::Mul(Box::new(a.clone()), Box::new(b.clone()))
            }
        }
    }

    /// `floor(self / k)` for `k > 0`. Terms whose coefficient is a multiple
    /// of `k` are pulled out of the division.
    pub fn floor_div(&self, k: i64) -> SymExpr {
        debug_assert!(k > 0, "floor_div by non-positive {k}");
        if k == 1 {
            return self.clone();
        }
        let lin = Linear::of(self);
        let mut outside = Vec::new();
        let mut inside = Vec::new();
        for (atom, c) in lin.terms {
            if c % k == 0 {
                outside.push((atom, c / k));
            } else {
                inside.push((atom, c));
            }
        }
        let mut result = Linear {
            terms: outside,
            constant: lin.constant.div_euclid(k),
        };
        if !inside.is_empty() {
            let rest = Linear {
                terms: inside,
                constant: lin.constant.rem_euclid(k),
            }
            .into_expr();
            let divided = match rest {
                // floor(floor(a / j) / k) == floor(a / (j * k))
                SymExpr::FloorDiv(inner, j) => SymExpr::FloorDiv(inner, j * k),
                other => SymExpr::FloorDiv(Box::new(other), k),
            };
            result.terms.push((divided, 1));
        }
        result.into_expr()
    }

    /// `ceil(self / k)` for `k > 0`.
    pub fn ceil_div(&self, k: i64) -> SymExpr {
        self.add_const(k - 1).floor_div(k)
    }

    /// Smallest multiple of `a` not below `self`, for `a > 0`.
    pub fn align_up(&self, a: i64) -> SymExpr {
        if a <= 1 || self.is_multiple_of(a) {
            return self.clone();
        }
        self.ceil_div(a).scale(a)
    }

    /// Conservative proof that the value is a multiple of `a` (`a > 0`).
    pub fn is_multiple_of(&self, a: i64) -> bool {
        match self {
            SymExpr::Const(c) => c % a == 0,
            SymExpr::Sum(terms, c) => {
                c % a == 0 && terms.iter().all(|(atom, k)| k % a == 0 || atom.is_multiple_of(a))
            }
            SymExpr::Mul(x, y) => x.is_multiple_of(a) || y.is_multiple_of(a),
            SymExpr::Min(x, y) | SymExpr::Max(x, y) => x.is_multiple_of(a) && y.is_multiple_of(a),
            SymExpr::Sym(_) | SymExpr::FloorDiv(..) => false,
        }
    }

    pub fn sym_min(&self, other: &SymExpr) -> SymExpr {
        if self == other || other.sub(self).is_nonneg() {
            return self.clone();
        }
        if self.sub(other).is_nonneg() {
            return other.clone();
        }
        let (a, b) = if self <= other {
            (self, other)
        } else {
            (other, self)
        };
        SymExpr::Min(Box::new(a.clone()), Box::new(b.clone()))
    }

    pub fn sym_max(&self, other: &SymExpr) -> SymExpr {
        if self == other || self.sub(other).is_nonneg() {
            return self.clone();
        }
        if other.sub(self).is_nonneg() {
            return other.clone();
        }
        let (a, b) = if self <= other {
            (self, other)
        } else {
            (other, self)
        };
        SymExpr::Max(Box::new(a.clone()), Box::new(b.clone()))
    }

    /// Conservative proof that the value is `>= 0` for every assignment of
    /// non-negative integers to symbols.
    pub fn is_nonneg(&self) -> bool {
        match self {
            SymExpr::Const(c) => *c >= 0,
            SymExpr::Sym(_) => true,
            SymExpr::Sum(terms, c) => {
                *c >= 0 && terms.iter().all(|(atom, k)| *k > 0 && atom.is_nonneg())
            }
            SymExpr::Mul(a, b) => a.is_nonneg() && b.is_nonneg(),
            SymExpr::FloorDiv(a, _) => a.is_nonneg(),
            SymExpr::Min(a, b) => a.is_nonneg() && b.is_nonneg(),
            SymExpr::Max(a, b) => a.is_nonneg() || b.is_nonneg(),
        }
    }

    /// Symbolic `(lower, upper)` bounds of `self` while `sym` ranges over
    /// `[lo, hi]`. Exact for expressions linear in `sym`; sound otherwise.
    pub fn range_over(&self, sym: &Symbol, lo: &SymExpr, hi: &SymExpr) -> (SymExpr, SymExpr) {
        match self {
            SymExpr::Const(_) => (self.clone(), self.clone()),
            SymExpr::Sym(s) if s == sym => (lo.clone(), hi.clone()),
            SymExpr::Sym(_) => (self.clone(), self.clone()),
            SymExpr::Sum(terms, c) => {
                let mut low = SymExpr::Const(*c);
                let mut high = SymExpr::Const(*c);
                for (atom, k) in terms {
                    let (al, ah) = atom.range_over(sym, lo, hi);
                    if *k > 0 {
                        low = low.add(&al.scale(*k));
                        high = high.add(&ah.scale(*k));
                    } else {
                        low = low.add(&ah.scale(*k));
                        high = high.add(&al.scale(*k));
                    }
                }
                (low, high)
            }
            SymExpr::Mul(a, b) => {
                let (al, ah) = a.range_over(sym, lo, hi);
                let (bl, bh) = b.range_over(sym, lo, hi);
                if al.is_nonneg() && bl.is_nonneg() {
                    (al.mul(&bl), ah.mul(&bh))
                } else {
                    let corners = [al.mul(&bl), al.mul(&bh), ah.mul(&bl), ah.mul(&bh)];
                    let low = corners[1..].iter().fold(corners[0].clone(), |m, e| m.sym_min(e));
                    let high = corners[1..].iter().fold(corners[0].clone(), |m, e| m.sym_max(e));
                    (low, high)
                }
            }
            SymExpr::FloorDiv(a, k) => {
                let (al, ah) = a.range_over(sym, lo, hi);
                (al.floor_div(*k), ah.floor_div(*k))
            }
            SymExpr::Min(a, b) => {
                let (al, ah) = a.range_over(sym, lo, hi);
                let (bl, bh) = b.range_over(sym, lo, hi);
                (al.sym_min(&bl), ah.sym_min(&bh))
            }
            SymExpr::Max(a, b) => {
                let (al, ah) = a.range_over(sym, lo, hi);
                let (bl, bh) = b.range_over(sym, lo, hi);
                (al.sym_max(&bl), ah.sym_max(&bh))
            }
        }
    }

    /// Every symbol the expression mentions.
    pub fn symbols(&self) -> BTreeSet<Symbol> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<Symbol>) {
        match self {
            SymExpr::Const(_) => {}
            SymExpr::Sym(s) => {
                out.insert(s.clone());
            }
            SymExpr::Sum(terms, _) => {
                for (atom, _) in terms {
                    atom.collect_symbols(out);
                }
            }
            SymExpr::FloorDiv(a, _) => a.collect_symbols(out),
            SymExpr::Mul(a, b) | SymExpr::Min(a, b) | SymExpr::Max(a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
        }
    }

    pub fn mentions_block(&self) -> bool {
        self.symbols()
            .iter()
            .any(|s| matches!(s, Symbol::Block(_)))
    }

    pub fn eval(&self, bindings: &Bindings) -> Result<i64> {
        match self {
            SymExpr::Const(c) => Ok(*c),
            SymExpr::Sym(s) => bindings.get(s).ok_or_else(|| FuseError::UnboundSymbol {
                name: s.to_string(),
            }),
            SymExpr::Sum(terms, c) => terms
                .iter()
                .try_fold(*c, |acc, (atom, k)| Ok(acc + k * atom.eval(bindings)?)),
            SymExpr::Mul(a, b) => Ok(a.eval(bindings)? * b.eval(bindings)?),
            SymExpr::FloorDiv(a, k) => Ok(floor_div(a.eval(bindings)?, *k)),
            SymExpr::Min(a, b) => Ok(a.eval(bindings)?.min(b.eval(bindings)?)),
            SymExpr::Max(a, b) => Ok(a.eval(bindings)?.max(b.eval(bindings)?)),
        }
    }
}

impl From<i64> for SymExpr {
    fn from(c: i64) -> Self {
        SymExpr::Const(c)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

fn write_atom(f: &mut fmt::Formatter<'_>, atom: &SymExpr) -> fmt::Result {
    match atom {
        SymExpr::Mul(..) | SymExpr::FloorDiv(..) | SymExpr::Sum(..) => write!(f, "({atom})"),
        _ => write!(f, "{atom}"),
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymExpr::Const(c) => write!(f, "{c}"),
            SymExpr::Sym(s) => write!(f, "{s}"),
            SymExpr::Sum(terms, c) => {
                for (i, (atom, k)) in terms.iter().enumerate() {
                    if i == 0 {
                        if *k < 0 {
                            write!(f, "-")?;
                        }
                    } else if *k < 0 {
                        write!(f, " - ")?;
                    } else {
                        write!(f, " + ")?;
                    }
                    if k.abs() != 1 {
                        write!(f, "{}*", k.abs())?;
                        write_atom(f, atom)?;
                    } else {
                        write!(f, "{atom}")?;
                    }
                }
                if *c > 0 {
                    write!(f, " + {c}")?;
                } else if *c < 0 {
                    write!(f, " - {}", -c)?;
                }
                Ok(())
            }
            SymExpr::Mul(a, b) => {
                write_atom(f, a)?;
                write!(f, "*")?;
                write_atom(f, b)
            }
            SymExpr::FloorDiv(a, k) => {
                write_atom(f, a)?;
                write!(f, " / {k}")
            }
            SymExpr::Min(a, b) => write!(f, "min({a}, {b})"),
            SymExpr::Max(a, b) => write!(f, "max({a}, {b})"),
        }
    }
}

impl Serialize for SymExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            SymExpr::Const(c) => serializer.serialize_i64(*c),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
