//! Line readers and writers.
//!
//! A line is the width-8 slice of doubles at the same offset inside every
//! coefficient of a polynomial. Readers expand monic/RLP/negated storage
//! into the plain element sequence a kernel convolves; the writer scatters
//! one result line back across the output coefficients.

use fixedbitset::FixedBitSet;

use crate::{
    engine::{Coefficient, LINE_DOUBLES},
    kernels::Elem,
    preprocess::PreprocessedPoly,
    Error,
};

// ======================================================================
// LoadLayout - CRATE

/// How one stored input vector expands into the element sequence the
/// kernels actually convolve.
///
/// Coordinates come in two flavors:
/// - *full* coordinates index the fully expanded polynomial, implied monic
///   units included;
/// - the *loaded* sequence is what [`LineReader::read_line`] produces,
///   which omits stripped units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LoadLayout {
    pub stored_len: usize,
    pub rlp: bool,
    pub monic: bool,
    pub negate: bool,
    /// Implied monic units are materialized on load instead of being
    /// stripped and re-added after the multiply.
    pub keep_units: bool,
}

impl LoadLayout {
    /// Expanded length without any units.
    fn base_len(&self) -> usize {
        if self.rlp {
            2 * self.stored_len - 1
        } else {
            self.stored_len
        }
    }

    /// Length of the loaded element sequence.
    pub(crate) fn loaded_len(&self) -> usize {
        self.base_len() + self.unit_count() * (self.monic && self.keep_units) as usize
    }

    /// Fully expanded length, units included whether kept or stripped.
    pub(crate) fn full_len(&self) -> usize {
        self.base_len() + self.unit_count() * self.monic as usize
    }

    /// Full coordinate of loaded element 0.
    pub(crate) fn lead(&self) -> usize {
        (self.monic && !self.keep_units && self.rlp) as usize
    }

    /// Full coordinates of the stripped implied units.
    pub(crate) fn stripped_units(&self) -> [Option<usize>; 2] {
        if !self.monic || self.keep_units {
            [None, None]
        } else if self.rlp {
            [Some(0), Some(self.full_len() - 1)]
        } else {
            [None, Some(self.full_len() - 1)]
        }
    }

    fn unit_count(&self) -> usize {
        if self.rlp {
            2
        } else {
            1
        }
    }
}

// ======================================================================
// LineSource / LineReader - CRATE

pub(crate) enum LineSource<'a> {
    Coefficients(&'a [Coefficient]),
    Pre(&'a PreprocessedPoly),
}

pub(crate) struct LineReader<'a> {
    source: LineSource<'a>,
    layout: LoadLayout,
}

impl<'a> LineReader<'a> {
    pub(crate) fn new(source: LineSource<'a>, layout: LoadLayout) -> Self {
        Self { source, layout }
    }

    /// `true` if the source stores forward poly-FFT images instead of raw
    /// element sequences.
    pub(crate) fn is_pre_fft(&self) -> bool {
        match &self.source {
            LineSource::Coefficients(_) => false,
            LineSource::Pre(pre) => pre.fft_size().is_some(),
        }
    }

    /// Reads the loaded element sequence of one line into `out`.
    ///
    /// `unit` is this line of the engine's transform of `1`; it is used for
    /// kept monic units and is never negated.
    pub(crate) fn read_line(&self, line: usize, unit: &Elem, out: &mut Vec<Elem>) {
        out.clear();

        match &self.source {
            LineSource::Coefficients(coefficients) => {
                debug_assert_eq!(coefficients.len(), self.layout.stored_len);

                let l = &self.layout;
                let keep = l.monic && l.keep_units;

                if l.rlp {
                    let center = if keep { l.stored_len } else { l.stored_len - 1 };
                    if keep {
                        out.push(*unit);
                    }
                    for i in 0..2 * l.stored_len - 1 {
                        let stored = center.abs_diff(i + keep as usize);
                        out.push(self.stored_elem(coefficients, stored, line));
                    }
                    if keep {
                        out.push(*unit);
                    }
                } else {
                    for stored in 0..l.stored_len {
                        out.push(self.stored_elem(coefficients, stored, line));
                    }
                    if keep {
                        out.push(*unit);
                    }
                }
            }

            LineSource::Pre(pre) => {
                debug_assert!(pre.fft_size().is_none());
                pre.read_line(line, out);

                // Records store the expansion without units; fold kept
                // units back in at the ends.
                if self.layout.monic && self.layout.keep_units {
                    if self.layout.rlp {
                        out.insert(0, *unit);
                    }
                    out.push(*unit);
                }
            }
        }

        debug_assert_eq!(out.len(), self.layout.loaded_len());
    }

    /// Reads one pre-transformed line (only for pre-FFT sources).
    pub(crate) fn read_fft_line(&self, line: usize, out: &mut Vec<Elem>) {
        match &self.source {
            LineSource::Pre(pre) => {
                debug_assert!(pre.fft_size().is_some());
                pre.read_line(line, out);
            }
            LineSource::Coefficients(_) => unreachable!("raw source has no pre-FFT lines"),
        }
    }

    fn stored_elem(&self, coefficients: &[Coefficient], index: usize, line: usize) -> Elem {
        let e = coefficient_line(&coefficients[index], line);
        if self.layout.negate {
            e.neg()
        } else {
            e
        }
    }
}

// ======================================================================
// FUNCTIONS - CRATE

/// Line `line` of one coefficient.
#[inline(always)]
pub(crate) fn coefficient_line(coefficient: &Coefficient, line: usize) -> Elem {
    Elem::from_slice(&coefficient.data()[line * LINE_DOUBLES..])
}

// ======================================================================
// OutputSink - CRATE

/// Scatters result lines back across the output coefficients.
///
/// Helpers write concurrently through raw pointers: every write lands in
/// the 64-byte slice of line `line`, and each line index is claimed by
/// exactly one worker via the pool's atomic counter, so no two threads
/// ever touch the same bytes.
pub(crate) struct OutputSink {
    ptrs: Vec<*mut f64>,
    live: FixedBitSet,
}

unsafe impl Send for OutputSink {}
unsafe impl Sync for OutputSink {}

impl OutputSink {
    /// Builds a sink over the output vector. `None` slots are discarded;
    /// every present coefficient must span `element_doubles` samples.
    pub(crate) fn new(
        outputs: &mut [Option<Coefficient>],
        element_doubles: usize,
    ) -> Result<Self, Error> {
        let mut ptrs = Vec::with_capacity(outputs.len());
        let mut live = FixedBitSet::with_capacity(outputs.len());

        for (index, output) in outputs.iter_mut().enumerate() {
            match output {
                Some(coefficient) => {
                    let data = coefficient.data_mut();
                    if data.len() != element_doubles {
                        return Err(Error::DifferentElementSize {
                            element_doubles,
                            got: data.len(),
                        });
                    }
                    live.set(index, true);
                    ptrs.push(data.as_mut_ptr());
                }
                None => ptrs.push(std::ptr::null_mut()),
            }
        }

        Ok(Self { ptrs, live })
    }

    /// Writes one line of every live output coefficient.
    ///
    /// # Safety
    ///
    /// Each `line` index must be written at most once per call, and the
    /// output coefficients must not be accessed elsewhere until the pool
    /// barrier has been passed.
    pub(crate) unsafe fn write_line(&self, line: usize, values: &[Elem]) {
        debug_assert_eq!(values.len(), self.ptrs.len());

        for (index, value) in values.iter().enumerate() {
            if !self.live.contains(index) {
                continue;
            }
            let dst = self.ptrs[index].add(line * LINE_DOUBLES);
            std::ptr::copy_nonoverlapping(value.0.as_ptr(), dst, LINE_DOUBLES);
        }
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, Reference};
    use crate::kernels::real_elem;

    fn layout(stored_len: usize) -> LoadLayout {
        LoadLayout {
            stored_len,
            rlp: false,
            monic: false,
            negate: false,
            keep_units: false,
        }
    }

    fn transformed(engine: &Reference, values: &[i64]) -> Vec<Coefficient> {
        values
            .iter()
            .map(|&v| {
                let mut c = engine.from_value(v);
                engine.forward(&mut c);
                c
            })
            .collect()
    }

    fn unit(engine: &Reference, line: usize) -> Elem {
        let mut raw = [0.0; LINE_DOUBLES];
        engine.unit_line(line, &mut raw);
        Elem(raw)
    }

    #[test]
    fn plain_read() {
        let engine = Reference::new(2);
        let coefficients = transformed(&engine, &[3, -4, 5]);
        let reader = LineReader::new(LineSource::Coefficients(&coefficients), layout(3));

        let mut out = Vec::new();
        reader.read_line(1, &unit(&engine, 1), &mut out);

        assert_eq!(out, vec![real_elem(3.0), real_elem(-4.0), real_elem(5.0)]);
    }

    #[test]
    fn negate_skips_nothing_without_units() {
        let engine = Reference::new(1);
        let coefficients = transformed(&engine, &[2, 7]);
        let reader = LineReader::new(
            LineSource::Coefficients(&coefficients),
            LoadLayout {
                negate: true,
                ..layout(2)
            },
        );

        let mut out = Vec::new();
        reader.read_line(0, &unit(&engine, 0), &mut out);
        assert_eq!(out, vec![real_elem(-2.0), real_elem(-7.0)]);
    }

    #[test]
    fn monic_kept_appends_unnegated_unit() {
        let engine = Reference::new(1);
        let coefficients = transformed(&engine, &[2, 7]);
        let reader = LineReader::new(
            LineSource::Coefficients(&coefficients),
            LoadLayout {
                monic: true,
                negate: true,
                keep_units: true,
                ..layout(2)
            },
        );

        let mut out = Vec::new();
        reader.read_line(0, &unit(&engine, 0), &mut out);
        assert_eq!(
            out,
            vec![real_elem(-2.0), real_elem(-7.0), real_elem(1.0)]
        );
    }

    #[test]
    fn rlp_mirrors_about_degree_zero() {
        let engine = Reference::new(1);
        let coefficients = transformed(&engine, &[9, 8, 7]);

        let reader = LineReader::new(
            LineSource::Coefficients(&coefficients),
            LoadLayout {
                rlp: true,
                ..layout(3)
            },
        );

        let mut out = Vec::new();
        reader.read_line(0, &unit(&engine, 0), &mut out);
        assert_eq!(
            out,
            [7.0, 8.0, 9.0, 8.0, 7.0].map(real_elem).to_vec()
        );
    }

    #[test]
    fn rlp_monic_kept_has_units_at_both_ends() {
        let engine = Reference::new(1);
        let coefficients = transformed(&engine, &[9, 8]);

        let reader = LineReader::new(
            LineSource::Coefficients(&coefficients),
            LoadLayout {
                rlp: true,
                monic: true,
                keep_units: true,
                ..layout(2)
            },
        );

        let mut out = Vec::new();
        reader.read_line(0, &unit(&engine, 0), &mut out);
        assert_eq!(
            out,
            [1.0, 8.0, 9.0, 8.0, 1.0].map(real_elem).to_vec()
        );
    }

    #[test]
    fn layout_coordinates() {
        let l = LoadLayout {
            stored_len: 3,
            rlp: true,
            monic: true,
            negate: false,
            keep_units: false,
        };
        assert_eq!(l.loaded_len(), 5);
        assert_eq!(l.full_len(), 7);
        assert_eq!(l.lead(), 1);
        assert_eq!(l.stripped_units(), [Some(0), Some(6)]);

        let l = LoadLayout {
            stored_len: 4,
            rlp: false,
            monic: true,
            negate: false,
            keep_units: false,
        };
        assert_eq!(l.loaded_len(), 4);
        assert_eq!(l.full_len(), 5);
        assert_eq!(l.lead(), 0);
        assert_eq!(l.stripped_units(), [None, Some(4)]);
    }

    #[test]
    fn sink_skips_discarded_outputs() {
        let engine = Reference::new(1);
        let mut outputs = vec![Some(engine.alloc()), None, Some(engine.alloc())];
        let sink = OutputSink::new(&mut outputs, LINE_DOUBLES).unwrap();

        let values = vec![real_elem(1.0), real_elem(2.0), real_elem(3.0)];
        unsafe { sink.write_line(0, &values) };

        assert_eq!(outputs[0].as_ref().unwrap().data()[0], 1.0);
        assert!(outputs[1].is_none());
        assert_eq!(outputs[2].as_ref().unwrap().data()[0], 3.0);
    }

    #[test]
    fn sink_rejects_wrong_element_size() {
        let mut outputs = vec![Some(Coefficient::zeroed(16))];
        assert_eq!(
            OutputSink::new(&mut outputs, 32).err(),
            Some(Error::DifferentElementSize {
                element_doubles: 32,
                got: 16
            })
        );
    }
}
