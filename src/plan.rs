//! Request options and the planner.
//!
//! The planner turns one multiplication request into a [`Plan`]: algorithm
//! choice, FFT size, monic strip decisions, unit add-in locations, skipped
//! coefficient counts and the window shift. A plan is immutable for the
//! duration of the call; every illegal combination is rejected here, so
//! the kernels never fail.

use crate::{
    lines::LoadLayout,
    twiddles::{radix_factors, FFT_SIZES},
    Error,
};

// ======================================================================
// VecOptions - PUBLIC

/// Per-input-vector options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VecOptions {
    /// The implied leading coefficient `1` is omitted from the stored
    /// vector.
    pub monic: bool,
    /// Reciprocal Laurent polynomial: coefficients of degrees `±k` are
    /// equal and the vector stores only degrees `0..len`.
    pub rlp: bool,
    /// Coefficients are negated as they are loaded. An implied monic `1`
    /// is never negated.
    pub negate: bool,
}

// ======================================================================
// Window - PUBLIC

/// Which slice of the full product is returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Window {
    /// The full product, starting at degree zero.
    #[default]
    Full,
    /// Only the `outvec_size` highest coefficients.
    High,
    /// Only the `outvec_size` lowest coefficients.
    Low,
    /// `outvec_size` coefficients starting at `start` (several-entry only).
    Mid {
        /// Number of low coefficients skipped before the window begins.
        start: usize,
    },
}

// ======================================================================
// Circular - PUBLIC

/// Reduction modulo `X^S - 1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Circular {
    /// Plain (linear) multiplication.
    #[default]
    Off,
    /// `S` is the output vector size.
    OutputSize,
    /// Explicit `S` (several-entry only).
    Size(usize),
}

// ======================================================================
// FmaMode - PUBLIC

/// How the optional third polynomial folds into the product.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FmaMode {
    /// No fused operand.
    #[default]
    None,
    /// `result = a * b + f`
    Add,
    /// `result = a * b - f`
    Sub,
    /// `result = f - a * b`
    SubFromFma,
}

// ======================================================================
// PostAction - PUBLIC

/// What happens to each output coefficient after its lines are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PostAction {
    /// Apply the engine's inverse transform.
    #[default]
    Inverse,
    /// Leave outputs in the per-coefficient transform domain.
    Keep,
    /// Inverse transform, then begin the next forward transform.
    InverseStartNext,
    /// Inverse transform, then a full forward transform.
    InverseForward,
}

// ======================================================================
// Options - PUBLIC

/// All options of one multiplication request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Options of the first input vector.
    pub invec1: VecOptions,
    /// Options of the second input vector.
    pub invec2: VecOptions,
    /// Output window.
    pub window: Window,
    /// Circular reduction.
    pub circular: Circular,
    /// Fused multiply-add mode; requires the matching `fma` vector.
    pub fma: FmaMode,
    /// Per-coefficient post-processing of the outputs.
    pub post: PostAction,
}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Required extra bits of numeric headroom in each coefficient for a
/// product of polynomials of `n1` and `n2` coefficients.
///
/// Summing `min(n1, n2)` per-line products grows sample magnitudes by that
/// factor; half of it must be absorbed by the engine's rounding margin.
pub fn safety_margin(n1: usize, n2: usize) -> f64 {
    0.5 * (n1.min(n2).max(1) as f64).log2()
}

/// Smallest supported poly-FFT size that is at least `n`.
///
/// Supported sizes are products `2^a * 3^b * 5^c` with `b, c <= 2`.
pub fn fft_size(n: usize) -> usize {
    match FFT_SIZES.binary_search(&n) {
        Ok(i) => FFT_SIZES[i],
        Err(i) => match FFT_SIZES.get(i) {
            Some(&size) => size,
            // Beyond the precomputed list; powers of two are always valid.
            None => n.next_power_of_two(),
        },
    }
}

/// The supported poly-FFT sizes up to `limit`, ascending.
pub fn supported_fft_sizes(limit: usize) -> Vec<usize> {
    FFT_SIZES
        .iter()
        .copied()
        .take_while(|&size| size <= limit)
        .collect()
}

/// Estimated bytes of working memory one call will allocate: per-thread
/// line scratch plus twiddle tables.
pub fn mem_required(n1: usize, n2: usize, options: &Options, num_threads: usize) -> u64 {
    let tuning = Tuning::default();
    let spec1 = PolySpec {
        stored_len: n1.max(1),
        options: options.invec1,
        pre_fft: None,
    };
    let spec2 = PolySpec {
        stored_len: n2.max(1),
        options: options.invec2,
        pre_fft: None,
    };
    let outvec_size = n1.max(1) + n2.max(1);

    let plan = match Plan::build(
        &spec1,
        &spec2,
        outvec_size,
        options,
        Entry::Several,
        options.fma != FmaMode::None,
        &tuning,
        None,
    ) {
        Ok(plan) => plan,
        Err(_) => return 0,
    };

    let per_thread = plan.scratch_elems() * 64;
    let twiddles = match plan.algorithm {
        Algorithm::Fft { fft_size } => 2 * fft_size * 16,
        _ => 0,
    };
    (num_threads.max(1) * per_thread + twiddles) as u64
}

// ======================================================================
// Tuning - CRATE

/// Cached breakpoints and the cache-size target.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Tuning {
    pub karat_break: usize,
    pub fft_break: usize,
    pub cache_bytes: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            karat_break: 32,
            fft_break: 128,
            cache_bytes: 256 * 1024,
        }
    }
}

// ======================================================================
// PolySpec / Entry - CRATE

/// Planner-facing description of one input operand.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PolySpec {
    pub stored_len: usize,
    pub options: VecOptions,
    /// `Some(fft_size)` when the operand is a pre-FFTed preprocessed poly;
    /// its raw element lines are then unavailable and its implied monic
    /// units were folded in at preprocessing time.
    pub pre_fft: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Entry {
    Plain,
    Several,
}

// ======================================================================
// Plan - CRATE

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Algorithm {
    Brute,
    Karatsuba,
    Fft { fft_size: usize },
}

/// Resolved, immutable description of how one multiplication executes.
#[derive(Clone, Debug)]
pub(crate) struct Plan {
    pub algorithm: Algorithm,
    pub load1: LoadLayout,
    pub load2: LoadLayout,

    /// Fully expanded product length, implied units included.
    pub true_len: usize,
    /// Convolution length of the loaded sequences.
    pub conv_len: usize,
    /// Full coordinate of convolution index 0.
    pub conv_offset: usize,
    /// Working buffer length: circular size when reducing, else `true_len`.
    pub buffer_len: usize,

    pub outvec_size: usize,
    /// Window origin in buffer coordinates; may be negative when more
    /// coefficients are requested than exist.
    pub out_start: isize,
    pub skip_lsw: usize,
    pub skip_msw: usize,
    /// FFT zero padding beyond the convolution.
    pub adjusted_pad: usize,

    pub circular_size: Option<usize>,
    /// The kernel over-computes the full product and wraps it afterwards.
    pub emulate_circular: bool,

    /// Buffer coordinates of the at-most-four `1·1` products of stripped
    /// monic units.
    pub unit_addins: [Option<usize>; 4],
    /// Buffer coordinate of a suppressed top unit (monic high-window).
    pub subout: Option<usize>,

    pub fma: FmaMode,
    pub post: PostAction,
}

impl Plan {
    /// Builds and validates a plan.
    ///
    /// `forced_fft` pins the FFT size (shared forward transforms in the
    /// several entry, pre-FFTed operands).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        spec1: &PolySpec,
        spec2: &PolySpec,
        outvec_size: usize,
        options: &Options,
        entry: Entry,
        fma_present: bool,
        tuning: &Tuning,
        forced_fft: Option<usize>,
    ) -> Result<Plan, Error> {
        if spec1.stored_len == 0 {
            return Err(Error::InvalidSize {
                what: "first input size",
                got: 0,
            });
        }
        if spec2.stored_len == 0 {
            return Err(Error::InvalidSize {
                what: "second input size",
                got: 0,
            });
        }
        if outvec_size == 0 {
            return Err(Error::InvalidSize {
                what: "output size",
                got: 0,
            });
        }

        if fma_present != (options.fma != FmaMode::None) {
            return Err(Error::UnsupportedOptions {
                detail: "fma mode and fma vector must be given together",
            });
        }

        let circular_size = match options.circular {
            Circular::Off => None,
            Circular::OutputSize => Some(outvec_size),
            Circular::Size(size) => {
                if entry == Entry::Plain {
                    return Err(Error::UnsupportedOptions {
                        detail: "explicit circular size requires the several entry",
                    });
                }
                if size == 0 {
                    return Err(Error::InvalidSize {
                        what: "circular size",
                        got: 0,
                    });
                }
                Some(size)
            }
        };

        if entry == Entry::Plain {
            if matches!(options.window, Window::Mid { .. }) {
                return Err(Error::UnsupportedOptions {
                    detail: "mid window requires the several entry",
                });
            }
            if circular_size.is_some() && options.window != Window::Full {
                return Err(Error::UnsupportedOptions {
                    detail: "circular with a high or low window requires the several entry",
                });
            }
        }

        // Monic strip-or-keep: stripping always shortens the adjusted
        // convolution, so units stay in only when they were folded into a
        // pre-FFT image, or when the cross add-in would need raw lines of
        // a pre-FFTed other operand.
        let load1 = load_layout(spec1, spec2);
        let load2 = load_layout(spec2, spec1);

        let true_len = load1.full_len() + load2.full_len() - 1;
        let conv_len = load1.loaded_len() + load2.loaded_len() - 1;
        let conv_offset = load1.lead() + load2.lead();
        let buffer_len = circular_size.unwrap_or(true_len);

        // Algorithm by the adjusted output size against the breakpoints.
        let adjusted_outvec = outvec_size.min(buffer_len);
        let algorithm = if let Some(forced) = forced_fft {
            let native = circular_size == Some(forced)
                && native_circular_ok(forced, &load1, &load2, conv_offset);
            if !native && forced < conv_len {
                return Err(Error::PreprocessedMismatch {
                    what: "fft size",
                    expected: select_fft_size(conv_len, tuning.cache_bytes),
                    got: forced,
                });
            }
            Algorithm::Fft { fft_size: forced }
        } else if spec1.pre_fft.is_some() || spec2.pre_fft.is_some() {
            // Resolved by the caller against the stored header; reaching
            // here without a forced size is a caller bug.
            unreachable!("pre-FFT operands pin the fft size");
        } else if adjusted_outvec < tuning.karat_break {
            Algorithm::Brute
        } else if adjusted_outvec < tuning.fft_break {
            Algorithm::Karatsuba
        } else {
            let size = match circular_size {
                Some(s) if native_circular_ok(s, &load1, &load2, conv_offset) => s,
                _ => select_fft_size(conv_len, tuning.cache_bytes),
            };
            Algorithm::Fft { fft_size: size }
        };

        let (emulate_circular, adjusted_pad) = match (circular_size, algorithm) {
            (None, Algorithm::Fft { fft_size }) => (false, fft_size - conv_len.min(fft_size)),
            (None, _) => (false, 0),
            (Some(s), Algorithm::Fft { fft_size }) => {
                let native = fft_size == s && native_circular_ok(s, &load1, &load2, conv_offset);
                (!native, fft_size - conv_len.min(fft_size))
            }
            (Some(_), _) => (true, 0),
        };

        // Window resolution. A monic-by-monic product tops out in the
        // implied unit; the high window returns the coefficients below it
        // and records the suppressed position.
        let both_monic = spec1.options.monic && spec2.options.monic;
        let (out_start, subout) = match options.window {
            Window::Full | Window::Low => (0, None),
            Window::High => {
                if both_monic && circular_size.is_none() {
                    (
                        buffer_len as isize - 1 - outvec_size as isize,
                        Some(buffer_len - 1),
                    )
                } else {
                    (buffer_len as isize - outvec_size as isize, None)
                }
            }
            Window::Mid { start } => (start as isize, None),
        };

        let skip_lsw = out_start.max(0) as usize;
        let skip_msw = (buffer_len as isize - out_start - outvec_size as isize).max(0) as usize;

        // The at-most-four unit products of stripped monic units.
        let mut unit_addins = [None; 4];
        let mut next = 0;
        for u1 in load1.stripped_units().into_iter().flatten() {
            for u2 in load2.stripped_units().into_iter().flatten() {
                unit_addins[next] = Some(u1 + u2);
                next += 1;
            }
        }

        Ok(Plan {
            algorithm,
            load1,
            load2,
            true_len,
            conv_len,
            conv_offset,
            buffer_len,
            outvec_size,
            out_start,
            skip_lsw,
            skip_msw,
            adjusted_pad,
            circular_size,
            emulate_circular,
            unit_addins,
            subout,
            fma: options.fma,
            post: options.post,
        })
    }

    /// Convolution-coordinate range the brute-force kernel must compute:
    /// the skipped-LSW/MSW counts intersected with the convolution span.
    pub(crate) fn conv_window(&self) -> (usize, usize) {
        if self.circular_size.is_some() {
            return (0, self.conv_len);
        }

        let lo = self.skip_lsw.max(self.conv_offset);
        let hi = (self.buffer_len - self.skip_msw).min(self.conv_offset + self.conv_len);
        if lo >= hi {
            (0, 0)
        } else {
            (lo - self.conv_offset, hi - self.conv_offset)
        }
    }

    /// Worst-case per-worker scratch, in elements.
    pub(crate) fn scratch_elems(&self) -> usize {
        let loads = self.load1.loaded_len() + self.load2.loaded_len();
        let (work, tmp) = match self.algorithm {
            Algorithm::Brute => (0, 0),
            Algorithm::Karatsuba => (
                self.conv_len,
                crate::kernels::karatsuba::scratch_len(
                    self.load1.loaded_len(),
                    self.load2.loaded_len(),
                    // Worst case: scratch for the deepest possible split.
                    3,
                ),
            ),
            Algorithm::Fft { fft_size } => (2 * fft_size, 0),
        };
        loads + self.buffer_len + work + tmp + self.outvec_size
    }
}

// ======================================================================
// FUNCTIONS - CRATE

/// Smallest supported FFT size at least `needed`, preferring candidates
/// whose per-line working set fits half the cache target, then fewer
/// floating-point operations, then less memory.
pub(crate) fn select_fft_size(needed: usize, cache_bytes: usize) -> usize {
    let first = fft_size(needed);
    let budget = cache_bytes / 2;

    let mut best = first;
    let mut best_cost = weighted_cost(first, budget);

    let from = match FFT_SIZES.binary_search(&first) {
        Ok(i) => i + 1,
        Err(i) => i,
    };
    for &size in FFT_SIZES[from..].iter().take_while(|&&s| s <= 2 * first) {
        let cost = weighted_cost(size, budget);
        if cost < best_cost {
            best = size;
            best_cost = cost;
        }
    }
    best
}

// ======================================================================
// FUNCTIONS - PRIVATE

fn load_layout(spec: &PolySpec, other: &PolySpec) -> LoadLayout {
    let keep_units = spec.options.monic && (spec.pre_fft.is_some() || other.pre_fft.is_some());
    LoadLayout {
        stored_len: spec.stored_len,
        rlp: spec.options.rlp,
        monic: spec.options.monic,
        negate: spec.options.negate,
        keep_units,
    }
}

// Native cyclic reduction needs both inputs to fit in the transform and
// the convolution to start at full coordinate zero.
fn native_circular_ok(size: usize, load1: &LoadLayout, load2: &LoadLayout, conv_offset: usize) -> bool {
    conv_offset == 0
        && load1.loaded_len() <= size
        && load2.loaded_len() <= size
        && radix_factors(size).is_some()
}

fn weighted_cost(size: usize, budget: usize) -> f64 {
    let factors = match radix_factors(size) {
        Some(factors) => factors,
        None => return f64::INFINITY,
    };

    let per_point: f64 = factors
        .iter()
        .map(|radix| match radix {
            2 => 1.0,
            3 => 1.75,
            4 => 2.0,
            5 => 3.25,
            _ => unreachable!(),
        })
        .sum();

    let mut cost = size as f64 * per_point;
    if size * 64 > budget {
        cost *= 1.25;
    }
    cost
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(len: usize, options: VecOptions) -> PolySpec {
        PolySpec {
            stored_len: len,
            options,
            pre_fft: None,
        }
    }

    fn plain(len: usize) -> PolySpec {
        spec(len, VecOptions::default())
    }

    fn build(
        spec1: PolySpec,
        spec2: PolySpec,
        outvec_size: usize,
        options: Options,
        entry: Entry,
    ) -> Result<Plan, Error> {
        Plan::build(
            &spec1,
            &spec2,
            outvec_size,
            &options,
            entry,
            options.fma != FmaMode::None,
            &Tuning::default(),
            None,
        )
    }

    #[test]
    fn fft_size_rounds_up_to_supported() {
        assert_eq!(fft_size(1), 1);
        assert_eq!(fft_size(7), 8);
        assert_eq!(fft_size(17), 18);
        assert_eq!(fft_size(26), 30);
        assert_eq!(fft_size(100), 100);
        assert_eq!(fft_size(101), 120);
    }

    #[test]
    fn supported_sizes_prefix() {
        assert_eq!(
            supported_fft_sizes(20),
            vec![1, 2, 3, 4, 5, 6, 8, 9, 10, 12, 15, 16, 18, 20]
        );
    }

    #[test]
    fn plain_plan_shapes() {
        let plan = build(plain(3), plain(3), 5, Options::default(), Entry::Plain).unwrap();
        assert_eq!(plan.algorithm, Algorithm::Brute);
        assert_eq!(plan.true_len, 5);
        assert_eq!(plan.conv_len, 5);
        assert_eq!(plan.buffer_len, 5);
        assert_eq!(plan.out_start, 0);
        assert_eq!((plan.skip_lsw, plan.skip_msw), (0, 0));
        assert_eq!(plan.unit_addins, [None; 4]);
    }

    #[test]
    fn breakpoints_select_algorithms() {
        let plan = build(plain(30), plain(30), 59, Options::default(), Entry::Plain).unwrap();
        assert_eq!(plan.algorithm, Algorithm::Karatsuba);

        let plan = build(plain(80), plain(80), 159, Options::default(), Entry::Plain).unwrap();
        assert_eq!(plan.algorithm, Algorithm::Fft { fft_size: 160 });
    }

    #[test]
    fn monic_units_are_stripped_and_recorded() {
        let options = Options {
            invec1: VecOptions {
                monic: true,
                ..VecOptions::default()
            },
            invec2: VecOptions {
                monic: true,
                ..VecOptions::default()
            },
            ..Options::default()
        };
        let plan = build(
            spec(2, options.invec1),
            spec(2, options.invec2),
            4,
            options,
            Entry::Plain,
        )
        .unwrap();

        // Stored 2 + implied 1 on each side: full product of length 5,
        // loaded convolution of length 3.
        assert_eq!(plan.true_len, 5);
        assert_eq!(plan.conv_len, 3);
        assert_eq!(plan.conv_offset, 0);
        assert!(!plan.load1.keep_units && !plan.load2.keep_units);
        assert_eq!(plan.unit_addins, [Some(4), None, None, None]);
    }

    #[test]
    fn rlp_monic_units_make_four_addins() {
        let vec = VecOptions {
            monic: true,
            rlp: true,
            negate: false,
        };
        let options = Options {
            invec1: vec,
            invec2: vec,
            ..Options::default()
        };
        let plan = build(spec(2, vec), spec(2, vec), 9, options, Entry::Plain).unwrap();

        // Each side expands to degree span 5 (units at both ends).
        assert_eq!(plan.true_len, 9);
        assert_eq!(plan.conv_offset, 2);
        let addins: Vec<usize> = plan.unit_addins.iter().flatten().copied().collect();
        assert_eq!(addins, vec![0, 4, 4, 8]);
    }

    #[test]
    fn high_window_of_monic_product_skips_the_unit() {
        let vec = VecOptions {
            monic: true,
            ..VecOptions::default()
        };
        let options = Options {
            invec1: vec,
            invec2: vec,
            window: Window::High,
            ..Options::default()
        };
        let plan = build(spec(3, vec), spec(3, vec), 2, options, Entry::Plain).unwrap();

        // true_len = 7, unit at 6; window covers 4..6.
        assert_eq!(plan.subout, Some(6));
        assert_eq!(plan.out_start, 4);
        assert_eq!((plan.skip_lsw, plan.skip_msw), (4, 1));
    }

    #[test]
    fn circular_prefers_native_fft() {
        let options = Options {
            circular: Circular::OutputSize,
            ..Options::default()
        };
        let plan = build(plain(100), plain(100), 144, options, Entry::Plain).unwrap();
        assert_eq!(plan.algorithm, Algorithm::Fft { fft_size: 144 });
        assert!(!plan.emulate_circular);
        assert_eq!(plan.buffer_len, 144);

        // 143 is not a supported transform size; fall back to emulation.
        let plan = build(plain(100), plain(100), 143, options, Entry::Plain).unwrap();
        assert!(plan.emulate_circular);
        assert_eq!(plan.buffer_len, 143);
    }

    #[test]
    fn plain_entry_rejects_several_only_options() {
        let mid = Options {
            window: Window::Mid { start: 1 },
            ..Options::default()
        };
        assert!(matches!(
            build(plain(4), plain(4), 3, mid, Entry::Plain),
            Err(Error::UnsupportedOptions { .. })
        ));
        assert!(build(plain(4), plain(4), 3, mid, Entry::Several).is_ok());

        let circ_high = Options {
            circular: Circular::OutputSize,
            window: Window::High,
            ..Options::default()
        };
        assert!(matches!(
            build(plain(4), plain(4), 3, circ_high, Entry::Plain),
            Err(Error::UnsupportedOptions { .. })
        ));
        assert!(build(plain(4), plain(4), 3, circ_high, Entry::Several).is_ok());

        let explicit = Options {
            circular: Circular::Size(5),
            ..Options::default()
        };
        assert!(matches!(
            build(plain(4), plain(4), 3, explicit, Entry::Plain),
            Err(Error::UnsupportedOptions { .. })
        ));
    }

    #[test]
    fn oversized_output_keeps_extra_zeros() {
        let plan = build(plain(2), plain(2), 7, Options::default(), Entry::Plain).unwrap();
        assert_eq!(plan.true_len, 3);
        assert_eq!(plan.out_start, 0);
        assert_eq!((plan.skip_lsw, plan.skip_msw), (0, 0));

        let high = Options {
            window: Window::High,
            ..Options::default()
        };
        let plan = build(plain(2), plain(2), 7, high, Entry::Plain).unwrap();
        assert_eq!(plan.out_start, -4);
    }

    #[test]
    fn select_prefers_cheaper_near_miss() {
        // Any candidate within 2x of the minimum competes on weighted
        // flops; the minimum itself wins ties.
        let chosen = select_fft_size(31, 256 * 1024);
        assert_eq!(chosen, 32);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(matches!(
            build(plain(0), plain(1), 1, Options::default(), Entry::Plain),
            Err(Error::InvalidSize { .. })
        ));
        assert!(matches!(
            build(plain(1), plain(1), 0, Options::default(), Entry::Plain),
            Err(Error::InvalidSize { .. })
        ));
    }
}
