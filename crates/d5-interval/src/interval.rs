//! Closed real intervals with conservative outward rounding.
//!
//! The empty interval is represented as `[+∞, -∞]`. Division by an
//! interval that straddles zero returns the hull of the extended-division
//! result. Elementary functions narrow their argument to the function
//! domain first, so `sqrt([-4, -1])` is empty rather than an error.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::round::{next_down, next_up, tx_down, tx_up};

/// A closed interval of doubles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    /// Lower bound.
    pub lb: f64,
    /// Upper bound.
    pub ub: f64,
}

// Outward-rounded constructor for results of basic arithmetic.
#[inline]
fn widened(lb: f64, ub: f64) -> Interval {
    Interval {
        lb: next_down(lb),
        ub: next_up(ub),
    }
}

// Outward-rounded constructor for results of library transcendentals.
#[inline]
fn widened_tx(lb: f64, ub: f64) -> Interval {
    Interval {
        lb: tx_down(lb),
        ub: tx_up(ub),
    }
}

// x*y with the 0·∞ = 0 convention of interval arithmetic.
#[inline]
fn mul_bound(x: f64, y: f64) -> f64 {
    let p = x * y;
    if p.is_nan() {
        0.0
    } else {
        p
    }
}

impl Interval {
    /// The interval `[lb, ub]`.
    #[inline]
    pub fn new(lb: f64, ub: f64) -> Interval {
        debug_assert!(!lb.is_nan() && !ub.is_nan());
        Interval { lb, ub }
    }

    /// The degenerate interval `[v, v]`.
    #[inline]
    pub fn point(v: f64) -> Interval {
        Interval { lb: v, ub: v }
    }

    /// The empty interval.
    #[inline]
    pub fn empty() -> Interval {
        Interval {
            lb: f64::INFINITY,
            ub: f64::NEG_INFINITY,
        }
    }

    /// The whole real line.
    #[inline]
    pub fn entire() -> Interval {
        Interval {
            lb: f64::NEG_INFINITY,
            ub: f64::INFINITY,
        }
    }

    /// True iff the interval contains no point.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lb > self.ub
    }

    /// True iff the interval is a single point.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        !self.is_empty() && self.lb == self.ub
    }

    /// True iff `v` lies inside the interval.
    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        self.lb <= v && v <= self.ub
    }

    /// Width of the interval; zero when empty.
    #[inline]
    pub fn diam(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.ub - self.lb
        }
    }

    /// Largest absolute value in the interval; zero when empty.
    #[inline]
    pub fn mag(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.lb.abs().max(self.ub.abs())
        }
    }

    /// Smallest absolute value in the interval; zero when empty or when
    /// the interval contains zero.
    #[inline]
    pub fn mig(&self) -> f64 {
        if self.is_empty() || self.contains(0.0) {
            0.0
        } else {
            self.lb.abs().min(self.ub.abs())
        }
    }

    /// A midpoint of the interval. For half-bounded intervals a finite
    /// interior point is returned; for the entire line it is zero.
    pub fn mid(&self) -> f64 {
        debug_assert!(!self.is_empty());
        match (self.lb == f64::NEG_INFINITY, self.ub == f64::INFINITY) {
            (true, true) => 0.0,
            (true, false) => self.ub - 1.0 - self.ub.abs(),
            (false, true) => self.lb + 1.0 + self.lb.abs(),
            (false, false) => {
                let m = 0.5 * self.lb + 0.5 * self.ub;
                if m.is_finite() {
                    m
                } else {
                    // Both bounds huge with the same sign.
                    self.lb
                }
            }
        }
    }

    /// True iff bisecting at the midpoint yields two strictly smaller
    /// non-degenerate halves.
    pub fn is_bisectable(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        let m = self.mid();
        self.lb < m && m < self.ub
    }

    /// Split at the midpoint. Only legal when [`is_bisectable`] holds.
    ///
    /// [`is_bisectable`]: Interval::is_bisectable
    pub fn bisect(&self) -> (Interval, Interval) {
        debug_assert!(self.is_bisectable());
        let m = self.mid();
        (Interval::new(self.lb, m), Interval::new(m, self.ub))
    }

    /// Intersection.
    #[inline]
    pub fn intersect(&self, other: &Interval) -> Interval {
        let lb = self.lb.max(other.lb);
        let ub = self.ub.min(other.ub);
        if lb > ub {
            Interval::empty()
        } else {
            Interval { lb, ub }
        }
    }

    /// Convex hull. The empty interval is the identity.
    #[inline]
    pub fn hull(&self, other: &Interval) -> Interval {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Interval {
            lb: self.lb.min(other.lb),
            ub: self.ub.max(other.ub),
        }
    }

    /// True iff `self ⊆ other`.
    #[inline]
    pub fn is_subset(&self, other: &Interval) -> bool {
        self.is_empty() || (other.lb <= self.lb && self.ub <= other.ub)
    }

    /// Absolute value.
    pub fn abs(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        if self.lb >= 0.0 {
            self
        } else if self.ub <= 0.0 {
            -self
        } else {
            Interval::new(0.0, self.ub.max(-self.lb))
        }
    }

    /// Square, tighter than `self * self` when the interval straddles zero.
    pub fn sqr(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        let a = self.abs();
        widened((a.lb * a.lb).max(0.0), a.ub * a.ub)
    }

    /// Integer power.
    pub fn powi(self, n: i32) -> Interval {
        if self.is_empty() {
            return self;
        }
        match n {
            0 => Interval::point(1.0),
            1 => self,
            2 => self.sqr(),
            n if n < 0 => Interval::point(1.0) / self.powi(-n),
            n if n % 2 == 0 => {
                let a = self.abs();
                widened_tx((a.lb.powi(n)).max(0.0), a.ub.powi(n))
            }
            n => widened_tx(self.lb.powi(n), self.ub.powi(n)),
        }
    }

    /// Power with a real exponent. The base is narrowed to `[0, ∞)` first.
    pub fn powf(self, p: f64) -> Interval {
        if p.fract() == 0.0 && p.abs() <= i32::MAX as f64 {
            return self.powi(p as i32);
        }
        let x = self.intersect(&Interval::new(0.0, f64::INFINITY));
        if x.is_empty() {
            return Interval::empty();
        }
        if p >= 0.0 {
            widened_tx(x.lb.powf(p), x.ub.powf(p))
        } else {
            widened_tx(x.ub.powf(p), x.lb.powf(p))
        }
    }

    /// Power with an interval exponent.
    pub fn pow(self, e: Interval) -> Interval {
        if self.is_empty() || e.is_empty() {
            return Interval::empty();
        }
        if e.is_degenerate() {
            return self.powf(e.lb);
        }
        // General case through exp(e · log(x)) on the non-negative part.
        let x = self.intersect(&Interval::new(0.0, f64::INFINITY));
        if x.is_empty() {
            return Interval::empty();
        }
        let mut r = (e * x.ln()).exp();
        if x.contains(0.0) {
            // 0^e with a positive exponent contributes 0.
            r = r.hull(&Interval::point(0.0));
        }
        r
    }

    /// n-th root. Odd roots are defined on the whole line, even roots on
    /// `[0, ∞)`.
    pub fn nth_root(self, n: i32) -> Interval {
        debug_assert!(n >= 1);
        if self.is_empty() {
            return self;
        }
        if n == 1 {
            return self;
        }
        let root = |v: f64| -> f64 {
            if v < 0.0 {
                -(-v).powf(1.0 / n as f64)
            } else {
                v.powf(1.0 / n as f64)
            }
        };
        if n % 2 == 1 {
            widened_tx(root(self.lb), root(self.ub))
        } else {
            let x = self.intersect(&Interval::new(0.0, f64::INFINITY));
            if x.is_empty() {
                return Interval::empty();
            }
            widened_tx((root(x.lb)).max(0.0), root(x.ub))
        }
    }

    /// Square root, empty when the argument is entirely negative.
    pub fn sqrt(self) -> Interval {
        let x = self.intersect(&Interval::new(0.0, f64::INFINITY));
        if x.is_empty() {
            return Interval::empty();
        }
        widened_tx((x.lb.sqrt()).max(0.0), x.ub.sqrt())
    }

    /// Exponential.
    pub fn exp(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        widened_tx((self.lb.exp()).max(0.0), self.ub.exp())
    }

    /// Natural logarithm, narrowed to the non-negative part of the
    /// argument.
    pub fn ln(self) -> Interval {
        let x = self.intersect(&Interval::new(0.0, f64::INFINITY));
        if x.is_empty() {
            return Interval::empty();
        }
        let lb = if x.lb == 0.0 {
            f64::NEG_INFINITY
        } else {
            tx_down(x.lb.ln())
        };
        Interval {
            lb,
            ub: tx_up(x.ub.ln()),
        }
    }

    /// Cosine.
    pub fn cos(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        const TWO_PI: f64 = 2.0 * std::f64::consts::PI;
        const PI: f64 = std::f64::consts::PI;
        if self.diam() >= TWO_PI || self.lb.abs() > 1e12 {
            // Arguments too wide, or too large for an accurate reduction.
            return Interval::new(-1.0, 1.0);
        }
        // Shift so the lower bound lands in [0, 2π); the reduction error is
        // absorbed by a small outward margin on the crossing tests.
        let k = (self.lb / TWO_PI).floor();
        let a = self.lb - k * TWO_PI;
        let b = a + self.diam();
        let margin = 1e-9;
        let crosses_min = (a - margin <= PI && PI <= b + margin)
            || (a - margin <= 3.0 * PI && 3.0 * PI <= b + margin);
        let crosses_max = b + margin >= TWO_PI || a - margin <= 0.0;
        let ca = a.cos();
        let cb = b.cos();
        let lb = if crosses_min { -1.0 } else { tx_down(ca.min(cb)) };
        let ub = if crosses_max { 1.0 } else { tx_up(ca.max(cb)) };
        Interval {
            lb: lb.max(-1.0),
            ub: ub.min(1.0),
        }
    }

    /// Sine, via `sin(x) = cos(x - π/2)`.
    pub fn sin(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        let half_pi = widened_tx(
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
        );
        (self - half_pi).cos()
    }

    /// Tangent. The whole line when the argument spans a singularity.
    pub fn tan(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        if self.diam() >= std::f64::consts::PI {
            return Interval::entire();
        }
        let ta = self.lb.tan();
        let tb = self.ub.tan();
        if ta > tb {
            // Crossed a pole of tan.
            return Interval::entire();
        }
        widened_tx(ta, tb)
    }

    /// Arcsine, narrowed to `[-1, 1]`.
    pub fn asin(self) -> Interval {
        let x = self.intersect(&Interval::new(-1.0, 1.0));
        if x.is_empty() {
            return Interval::empty();
        }
        widened_tx(x.lb.asin(), x.ub.asin())
    }

    /// Arccosine, narrowed to `[-1, 1]`.
    pub fn acos(self) -> Interval {
        let x = self.intersect(&Interval::new(-1.0, 1.0));
        if x.is_empty() {
            return Interval::empty();
        }
        widened_tx(x.ub.acos(), x.lb.acos())
    }

    /// Arctangent.
    pub fn atan(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        widened_tx(self.lb.atan(), self.ub.atan())
    }

    /// Two-argument arctangent `atan2(self, x)`. Conservative: exact only
    /// on the right half-plane.
    pub fn atan2(self, x: Interval) -> Interval {
        if self.is_empty() || x.is_empty() {
            return Interval::empty();
        }
        if x.lb > 0.0 {
            // Monotone region: the hull of the four corners encloses it.
            let corners = [
                self.lb.atan2(x.lb),
                self.lb.atan2(x.ub),
                self.ub.atan2(x.lb),
                self.ub.atan2(x.ub),
            ];
            let lo = corners.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = corners.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            widened_tx(lo, hi)
        } else {
            Interval::new(-std::f64::consts::PI, std::f64::consts::PI)
        }
    }

    /// Hyperbolic sine.
    pub fn sinh(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        widened_tx(self.lb.sinh(), self.ub.sinh())
    }

    /// Hyperbolic cosine.
    pub fn cosh(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        let a = self.abs();
        widened_tx((a.lb.cosh()).max(1.0), a.ub.cosh())
    }

    /// Hyperbolic tangent.
    pub fn tanh(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        let r = widened_tx(self.lb.tanh(), self.ub.tanh());
        Interval {
            lb: r.lb.max(-1.0),
            ub: r.ub.min(1.0),
        }
    }

    /// Inverse hyperbolic sine.
    pub fn asinh(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        widened_tx(self.lb.asinh(), self.ub.asinh())
    }

    /// Inverse hyperbolic cosine, narrowed to `[1, ∞)`.
    pub fn acosh(self) -> Interval {
        let x = self.intersect(&Interval::new(1.0, f64::INFINITY));
        if x.is_empty() {
            return Interval::empty();
        }
        widened_tx((x.lb.acosh()).max(0.0), x.ub.acosh())
    }

    /// Inverse hyperbolic tangent, narrowed to `[-1, 1]`.
    pub fn atanh(self) -> Interval {
        let x = self.intersect(&Interval::new(-1.0, 1.0));
        if x.is_empty() {
            return Interval::empty();
        }
        let lb = if x.lb <= -1.0 {
            f64::NEG_INFINITY
        } else {
            tx_down(x.lb.atanh())
        };
        let ub = if x.ub >= 1.0 {
            f64::INFINITY
        } else {
            tx_up(x.ub.atanh())
        };
        Interval { lb, ub }
    }

    /// Componentwise minimum.
    pub fn min_i(self, other: Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        Interval::new(self.lb.min(other.lb), self.ub.min(other.ub))
    }

    /// Componentwise maximum.
    pub fn max_i(self, other: Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::empty();
        }
        Interval::new(self.lb.max(other.lb), self.ub.max(other.ub))
    }
}

impl Add for Interval {
    type Output = Interval;
    fn add(self, rhs: Interval) -> Interval {
        if self.is_empty() || rhs.is_empty() {
            return Interval::empty();
        }
        widened(self.lb + rhs.lb, self.ub + rhs.ub)
    }
}

impl Sub for Interval {
    type Output = Interval;
    fn sub(self, rhs: Interval) -> Interval {
        if self.is_empty() || rhs.is_empty() {
            return Interval::empty();
        }
        widened(self.lb - rhs.ub, self.ub - rhs.lb)
    }
}

impl Neg for Interval {
    type Output = Interval;
    fn neg(self) -> Interval {
        if self.is_empty() {
            return self;
        }
        Interval::new(-self.ub, -self.lb)
    }
}

impl Mul for Interval {
    type Output = Interval;
    fn mul(self, rhs: Interval) -> Interval {
        if self.is_empty() || rhs.is_empty() {
            return Interval::empty();
        }
        let products = [
            mul_bound(self.lb, rhs.lb),
            mul_bound(self.lb, rhs.ub),
            mul_bound(self.ub, rhs.lb),
            mul_bound(self.ub, rhs.ub),
        ];
        let lo = products.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = products.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        widened(lo, hi)
    }
}

impl Mul<f64> for Interval {
    type Output = Interval;
    fn mul(self, rhs: f64) -> Interval {
        if rhs == 1.0 {
            return self;
        }
        self * Interval::point(rhs)
    }
}

impl Mul<Interval> for f64 {
    type Output = Interval;
    fn mul(self, rhs: Interval) -> Interval {
        Interval::point(self) * rhs
    }
}

impl Add<f64> for Interval {
    type Output = Interval;
    fn add(self, rhs: f64) -> Interval {
        self + Interval::point(rhs)
    }
}

impl Sub<f64> for Interval {
    type Output = Interval;
    fn sub(self, rhs: f64) -> Interval {
        self - Interval::point(rhs)
    }
}

impl Div for Interval {
    type Output = Interval;
    fn div(self, rhs: Interval) -> Interval {
        if self.is_empty() || rhs.is_empty() {
            return Interval::empty();
        }
        let (a, b) = (self.lb, self.ub);
        let (c, d) = (rhs.lb, rhs.ub);
        if c == 0.0 && d == 0.0 {
            return if self.contains(0.0) {
                Interval::entire()
            } else {
                Interval::empty()
            };
        }
        if c < 0.0 && d > 0.0 {
            // The extended-division result is two half-lines; its hull is
            // the whole line.
            return Interval::entire();
        }
        if c == 0.0 {
            return if a >= 0.0 {
                Interval {
                    lb: next_down(a / d),
                    ub: f64::INFINITY,
                }
            } else if b <= 0.0 {
                Interval {
                    lb: f64::NEG_INFINITY,
                    ub: next_up(b / d),
                }
            } else {
                Interval::entire()
            };
        }
        if d == 0.0 {
            return if a >= 0.0 {
                Interval {
                    lb: f64::NEG_INFINITY,
                    ub: next_up(a / c),
                }
            } else if b <= 0.0 {
                Interval {
                    lb: next_down(b / c),
                    ub: f64::INFINITY,
                }
            } else {
                Interval::entire()
            };
        }
        let quotients = [a / c, a / d, b / c, b / d];
        let lo = quotients.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = quotients.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        widened(lo, hi)
    }
}

impl Div<f64> for Interval {
    type Output = Interval;
    fn div(self, rhs: f64) -> Interval {
        self / Interval::point(rhs)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[ empty ]")
        } else {
            write!(f, "[{}, {}]", self.lb, self.ub)
        }
    }
}
