//! Twiddle-factor tables shared by all helpers during a call.
//!
//! A table set covers one poly-FFT size: two arrays of paired sin/cos
//! values, one consumed by the radix-3 stages and one by the combined
//! radix-4/5 (and odd radix-2) stages. Table sets are cached per handle by
//! exact size; the cache never replaces a live table set, holds at most
//! [`MAX_CACHED_TABLES`] entries, and is only mutated by the main thread
//! before helpers are signalled.

use std::{
    collections::HashMap,
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use once_cell::sync::Lazy;

use crate::Error;

// ======================================================================
// CONST - CRATE

/// Upper bound on cached table sets per handle.
pub(crate) const MAX_CACHED_TABLES: usize = 40;

// ======================================================================
// STATIC - CRATE

/// Sorted list of supported poly-FFT sizes: `2^a * 3^b * 5^c` with small
/// `b` and `c`.
pub(crate) static FFT_SIZES: Lazy<Vec<usize>> = Lazy::new(|| {
    const CAP: usize = 1 << 26;

    let mut sizes = Vec::new();
    let mut pow3 = 1usize;
    for _ in 0..=2 {
        let mut pow35 = pow3;
        for _ in 0..=2 {
            let mut n = pow35;
            while n <= CAP {
                sizes.push(n);
                n *= 2;
            }
            pow35 *= 5;
        }
        pow3 *= 3;
    }
    sizes.sort_unstable();
    sizes
});

// ======================================================================
// FUNCTIONS - CRATE

/// Decomposes a supported size into the stage radices, in transform order:
/// radix-4 stages first (with one radix-2 stage for an odd power of two),
/// then radix-3, then radix-5.
pub(crate) fn radix_factors(size: usize) -> Option<Vec<usize>> {
    let mut n = size;
    let mut factors = Vec::new();

    while n % 4 == 0 {
        factors.push(4);
        n /= 4;
    }
    if n % 2 == 0 {
        factors.push(2);
        n /= 2;
    }
    while n % 3 == 0 {
        factors.push(3);
        n /= 3;
    }
    while n % 5 == 0 {
        factors.push(5);
        n /= 5;
    }

    (n == 1).then(|| factors)
}

// ======================================================================
// TwiddleTables - CRATE

#[derive(Clone, Copy, Debug)]
pub(crate) enum TwiddleBank {
    Radix3,
    Radix45,
}

/// One transform stage: blocks of `m` entries split by `radix`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Stage {
    pub radix: usize,
    pub m: usize,
    bank: TwiddleBank,
    offset: usize,
}

/// Sin/cos tables for one poly-FFT size.
pub(crate) struct TwiddleTables {
    pub size: usize,
    pub stages: Vec<Stage>,

    // `[cos, sin]` of `2*pi*u*j/m`, laid out per stage, then per `j`, then
    // per butterfly leg `u` in `1..radix`.
    radix3: Box<[[f64; 2]]>,
    radix45: Box<[[f64; 2]]>,
}

impl TwiddleTables {
    pub(crate) fn build(size: usize) -> Result<TwiddleTables, Error> {
        let factors = radix_factors(size)
            .unwrap_or_else(|| panic!("unsupported poly-FFT size {}", size));

        // Size both banks up front so a failed allocation surfaces as an
        // error instead of an abort.
        let mut len3 = 0usize;
        let mut len45 = 0usize;
        let mut m = size;
        for &radix in &factors {
            let stage_len = (radix - 1) * (m / radix);
            if radix == 3 {
                len3 += stage_len;
            } else {
                len45 += stage_len;
            }
            m /= radix;
        }

        let mut radix3: Vec<[f64; 2]> = Vec::new();
        let mut radix45: Vec<[f64; 2]> = Vec::new();
        radix3
            .try_reserve_exact(len3)
            .map_err(|_| Error::OutOfMemory { bytes: len3 * 16 })?;
        radix45
            .try_reserve_exact(len45)
            .map_err(|_| Error::OutOfMemory { bytes: len45 * 16 })?;

        let mut stages = Vec::with_capacity(factors.len());
        let mut m = size;
        for &radix in &factors {
            let q = m / radix;
            let (bank, table) = if radix == 3 {
                (TwiddleBank::Radix3, &mut radix3)
            } else {
                (TwiddleBank::Radix45, &mut radix45)
            };

            stages.push(Stage {
                radix,
                m,
                bank,
                offset: table.len(),
            });

            for j in 0..q {
                for u in 1..radix {
                    let (sin, cos) = (TAU * (u * j) as f64 / m as f64).sin_cos();
                    table.push([cos, sin]);
                }
            }

            m = q;
        }

        Ok(TwiddleTables {
            size,
            stages,
            radix3: radix3.into_boxed_slice(),
            radix45: radix45.into_boxed_slice(),
        })
    }

    /// The `(radix - 1) * (m / radix)` twiddle pairs of one stage.
    #[inline(always)]
    pub(crate) fn stage_twiddles(&self, stage: &Stage) -> &[[f64; 2]] {
        let len = (stage.radix - 1) * (stage.m / stage.radix);
        match stage.bank {
            TwiddleBank::Radix3 => &self.radix3[stage.offset..stage.offset + len],
            TwiddleBank::Radix45 => &self.radix45[stage.offset..stage.offset + len],
        }
    }
}

// ======================================================================
// TwiddleCache - CRATE

/// Per-handle twiddle table cache, keyed by exact FFT size.
pub(crate) struct TwiddleCache {
    tables: Mutex<HashMap<usize, Arc<TwiddleTables>>>,
    additions_enabled: AtomicBool,
}

impl TwiddleCache {
    pub(crate) fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            additions_enabled: AtomicBool::new(true),
        }
    }

    /// Returns tables for `size`, building them on a miss. The fresh
    /// tables are cached only while additions are enabled and fewer than
    /// [`MAX_CACHED_TABLES`] sizes are held; otherwise they are returned
    /// uncached.
    pub(crate) fn ensure(&self, size: usize) -> Result<Arc<TwiddleTables>, Error> {
        let mut tables = self.tables.lock().unwrap();

        if let Some(hit) = tables.get(&size) {
            return Ok(Arc::clone(hit));
        }

        let built = Arc::new(TwiddleTables::build(size)?);
        if self.additions_enabled.load(Ordering::Relaxed) && tables.len() < MAX_CACHED_TABLES {
            tables.insert(size, Arc::clone(&built));
        }
        Ok(built)
    }

    /// Gates cache insertions; lookups and fresh builds keep working.
    pub(crate) fn set_additions_enabled(&self, enabled: bool) {
        self.additions_enabled.store(enabled, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tables.lock().unwrap().len()
    }
}

// ======================================================================
// TESTS
