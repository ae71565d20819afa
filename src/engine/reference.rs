use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::engine::{Coefficient, Engine, LINE_DOUBLES, LINE_LANES};

// ======================================================================
// Reference - PUBLIC

/// Simple reference implementation of [`Engine`].
///
/// - [`Reference`] is meant for tests and for those who want to study the
///   source code to understand the [`Engine`] contract.
/// - It also includes some debug assertions a production engine would not
///   carry.
///
/// The transform of an integer `x` is `x` replicated into the real part of
/// every complex lane of every line, with all imaginary parts zero. That
/// makes every lane a ring homomorphism, so lane-wise products and sums in
/// the transform domain mirror integer products and sums exactly (for
/// values small enough that `f64` arithmetic is exact after rounding).
#[derive(Clone, Debug)]
pub struct Reference {
    element_doubles: usize,
    forward_count: Arc<AtomicU64>,
    inverse_count: Arc<AtomicU64>,
}

impl Reference {
    /// Creates a new [`Reference`] engine whose coefficients span `lines`
    /// lines.
    ///
    /// # Panics
    ///
    /// If `lines` is zero.
    pub fn new(lines: usize) -> Self {
        assert!(lines > 0);
        Self {
            element_doubles: lines * LINE_DOUBLES,
            forward_count: Arc::new(AtomicU64::new(0)),
            inverse_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocates a coefficient holding the integer `value`, still in
    /// integer form (call [`Engine::forward`] before multiplying).
    pub fn from_value(&self, value: i64) -> Coefficient {
        let mut c = self.alloc();
        self.set_value(&mut c, value);
        c
    }

    /// Stores `value` into a coefficient in integer form.
    pub fn set_value(&self, coefficient: &mut Coefficient, value: i64) {
        let data = coefficient.data_mut();
        data.fill(0.0);
        data[0] = value as f64;
    }

    /// Reads the integer value of a coefficient in integer form.
    pub fn value(&self, coefficient: &Coefficient) -> i64 {
        coefficient.data()[0].round() as i64
    }

    /// Number of forward transforms run so far, summed over all worker
    /// clones. Clones share the counters, so per-helper statistics merge
    /// back to the parent automatically.
    pub fn forward_count(&self) -> u64 {
        self.forward_count.load(Ordering::Relaxed)
    }

    /// Number of inverse transforms run so far, summed over all worker
    /// clones.
    pub fn inverse_count(&self) -> u64 {
        self.inverse_count.load(Ordering::Relaxed)
    }
}

impl Engine for Reference {
    fn element_doubles(&self) -> usize {
        self.element_doubles
    }

    fn forward(&self, coefficient: &mut Coefficient) {
        self.forward_count.fetch_add(1, Ordering::Relaxed);

        let data = coefficient.data_mut();
        debug_assert_eq!(data.len(), self.element_doubles);

        let value = data[0];
        for line in data.chunks_exact_mut(LINE_DOUBLES) {
            for lane in 0..LINE_LANES {
                line[2 * lane] = value;
                line[2 * lane + 1] = 0.0;
            }
        }
    }

    fn inverse(&self, coefficient: &mut Coefficient) {
        self.inverse_count.fetch_add(1, Ordering::Relaxed);

        let data = coefficient.data_mut();
        debug_assert_eq!(data.len(), self.element_doubles);

        let value = data[0].round();

        // Every lane of every line carries the same number; anything else
        // means a kernel mixed up its line bookkeeping.
        #[cfg(debug_assertions)]
        for line in data.chunks_exact(LINE_DOUBLES) {
            for lane in 0..LINE_LANES {
                debug_assert!((line[2 * lane] - data[0]).abs() < 0.25);
                debug_assert!(line[2 * lane + 1].abs() < 0.25);
            }
        }

        data.fill(0.0);
        data[0] = value;
    }

    fn unit_line(&self, _line: usize, out: &mut [f64; LINE_DOUBLES]) {
        for lane in 0..LINE_LANES {
            out[2 * lane] = 1.0;
            out[2 * lane + 1] = 0.0;
        }
    }
}

// ======================================================================
// TESTS
