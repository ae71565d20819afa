//! The three line-level multiplication kernels.
//!
//! A kernel never sees whole big numbers. It sees one line at a time: for
//! every coefficient of a polynomial, the same width-8 slice of doubles,
//! interpreted as 4 complex lanes. All lane arithmetic is element-wise, so
//! a convolution of [`Elem`] sequences is simultaneously a convolution of
//! 4 independent complex sequences — one per lane.
//!
//! - [`brute`]: schoolbook convolution, window-restricted.
//! - [`karatsuba`]: recursive three-way split with brute-force base case.
//! - [`fft`]: mixed-radix (4, 2, 3, 5) transform, pointwise multiply,
//!   inverse transform.

use crate::engine::{LINE_DOUBLES, LINE_LANES};

pub(crate) mod brute;
pub(crate) mod fft;
pub(crate) mod karatsuba;

// ======================================================================
// Elem - CRATE

/// One polynomial coefficient's slice of a line: 8 doubles, 4 complex lanes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct Elem(pub [f64; LINE_DOUBLES]);

impl Elem {
    pub(crate) const ZERO: Elem = Elem([0.0; LINE_DOUBLES]);

    #[inline(always)]
    pub(crate) fn from_slice(slice: &[f64]) -> Elem {
        let mut e = Elem::ZERO;
        e.0.copy_from_slice(&slice[..LINE_DOUBLES]);
        e
    }

    #[inline(always)]
    pub(crate) fn add(self, other: Elem) -> Elem {
        let mut out = Elem::ZERO;
        for i in 0..LINE_DOUBLES {
            out.0[i] = self.0[i] + other.0[i];
        }
        out
    }

    #[inline(always)]
    pub(crate) fn sub(self, other: Elem) -> Elem {
        let mut out = Elem::ZERO;
        for i in 0..LINE_DOUBLES {
            out.0[i] = self.0[i] - other.0[i];
        }
        out
    }

    #[inline(always)]
    pub(crate) fn neg(self) -> Elem {
        let mut out = Elem::ZERO;
        for i in 0..LINE_DOUBLES {
            out.0[i] = -self.0[i];
        }
        out
    }

    #[inline(always)]
    pub(crate) fn scale(self, s: f64) -> Elem {
        let mut out = Elem::ZERO;
        for i in 0..LINE_DOUBLES {
            out.0[i] = self.0[i] * s;
        }
        out
    }

    /// Lane-wise complex product.
    #[inline(always)]
    pub(crate) fn cmul(self, other: Elem) -> Elem {
        let mut out = Elem::ZERO;
        for lane in 0..LINE_LANES {
            let (ar, ai) = (self.0[2 * lane], self.0[2 * lane + 1]);
            let (br, bi) = (other.0[2 * lane], other.0[2 * lane + 1]);
            out.0[2 * lane] = ar * br - ai * bi;
            out.0[2 * lane + 1] = ar * bi + ai * br;
        }
        out
    }

    /// Lane-wise multiply by the imaginary unit.
    #[inline(always)]
    pub(crate) fn mul_i(self) -> Elem {
        let mut out = Elem::ZERO;
        for lane in 0..LINE_LANES {
            out.0[2 * lane] = -self.0[2 * lane + 1];
            out.0[2 * lane + 1] = self.0[2 * lane];
        }
        out
    }

    /// Multiplies every lane by the scalar `cos + i * sin`.
    #[inline(always)]
    pub(crate) fn rot(self, cos: f64, sin: f64) -> Elem {
        let mut out = Elem::ZERO;
        for lane in 0..LINE_LANES {
            let (re, im) = (self.0[2 * lane], self.0[2 * lane + 1]);
            out.0[2 * lane] = re * cos - im * sin;
            out.0[2 * lane + 1] = re * sin + im * cos;
        }
        out
    }
}

// ======================================================================
// TEST HELPERS - CRATE

/// An element whose lanes all hold the real value `v`: the shape the
/// [`Reference`](crate::engine::Reference) engine produces.
#[cfg(test)]
pub(crate) fn real_elem(v: f64) -> Elem {
    let mut e = Elem::ZERO;
    for lane in 0..LINE_LANES {
        e.0[2 * lane] = v;
    }
    e
}

// ======================================================================
// TESTS
