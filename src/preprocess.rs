//! Preprocessed polynomial representations.
//!
//! A preprocessed poly stores an input polynomial line-by-line instead of
//! coefficient-by-coefficient, so repeated multiplications skip the gather
//! work — and, with [`PreOptions::fft`], the forward poly-FFT as well. The
//! header travels inside the value (no before-the-pointer sentinel): a
//! preprocessed poly is recognized by its type and validated against the
//! sizes and options recorded at preprocessing time.
//!
//! With [`PreOptions::compress`] each double is stored in 56 bits: sign,
//! a 3-bit exponent delta below a per-record base exponent, and the full
//! 52-bit mantissa — about 12.5 % smaller. The engine contract bounds the
//! numeric range of a line, so deltas beyond the 3-bit field occur only
//! for zeros (and rounding dust), which decode as signed zero.

use crate::{
    engine::{Coefficient, Engine},
    kernels::{fft, Elem},
    lines::{LineReader, LineSource, LoadLayout},
    plan::VecOptions,
    twiddles::TwiddleTables,
    Error,
};

// ======================================================================
// CONST - PRIVATE

const MANTISSA_MASK: u64 = (1 << 52) - 1;
const DELTA_ZERO: u64 = 7;

// ======================================================================
// PreOptions - PUBLIC

/// Preprocessing options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreOptions {
    /// Store each line's forward poly-FFT image instead of its elements.
    pub fft: bool,
    /// Pack each double into 56 bits.
    pub compress: bool,
}

// ======================================================================
// PreprocessedPoly - PUBLIC

/// A reusable, opaque, optionally pre-transformed polynomial.
///
/// Built by [`Polymult::polymult_preprocess`]; only valid for later calls
/// whose sizes and options match the ones given at preprocessing time.
/// A preprocessed poly cannot be used in big-number engine operations.
///
/// [`Polymult::polymult_preprocess`]: crate::Polymult::polymult_preprocess
pub struct PreprocessedPoly {
    num_lines: usize,
    elems_per_line: usize,
    raw_element_bytes: usize,
    padded_element_bytes: usize,

    self_len: usize,
    other_len: usize,
    outvec_size: usize,
    options: VecOptions,
    fft_size: Option<usize>,
    monic_ones_included: bool,
    compressed: bool,

    data: Vec<u8>,
}

impl PreprocessedPoly {
    /// Number of stored lines.
    pub fn num_lines(&self) -> usize {
        self.num_lines
    }

    /// FFT size of the stored images, if preprocessing ran the forward
    /// transform.
    pub fn fft_size(&self) -> Option<usize> {
        self.fft_size
    }

    /// `true` if implied monic leading ones were folded into the stored
    /// lines.
    pub fn monic_ones_included(&self) -> bool {
        self.monic_ones_included
    }

    /// `true` if doubles are stored in packed 56-bit form.
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    /// Unpadded bytes of one line record.
    pub fn raw_element_bytes(&self) -> usize {
        self.raw_element_bytes
    }

    /// Stored bytes of one line record, padded for alignment.
    pub fn padded_element_bytes(&self) -> usize {
        self.padded_element_bytes
    }

    /// The input vector length given at preprocessing time.
    pub fn stored_len(&self) -> usize {
        self.self_len
    }
}

impl PreprocessedPoly {
    // ============================================================
    // CRATE

    /// Rejects a call whose sizes or options differ from the ones recorded
    /// at preprocessing time.
    pub(crate) fn check_compatible(
        &self,
        other_len: usize,
        outvec_size: usize,
        options: VecOptions,
    ) -> Result<(), Error> {
        if options != self.options {
            return Err(Error::PreprocessedMismatch {
                what: "input options",
                expected: fingerprint(self.options),
                got: fingerprint(options),
            });
        }
        if other_len != self.other_len {
            return Err(Error::PreprocessedMismatch {
                what: "other input size",
                expected: self.other_len,
                got: other_len,
            });
        }
        if outvec_size != self.outvec_size {
            return Err(Error::PreprocessedMismatch {
                what: "output size",
                expected: self.outvec_size,
                got: outvec_size,
            });
        }
        Ok(())
    }

    /// Decodes one line record into `out`.
    pub(crate) fn read_line(&self, line: usize, out: &mut Vec<Elem>) {
        debug_assert!(line < self.num_lines);
        out.clear();

        let record = &self.data
            [line * self.padded_element_bytes..line * self.padded_element_bytes + self.raw_element_bytes];

        if !self.compressed {
            for chunk in record.chunks_exact(8 * std::mem::size_of::<f64>()) {
                let mut elem = Elem::ZERO;
                for (i, bytes) in chunk.chunks_exact(std::mem::size_of::<f64>()).enumerate() {
                    elem.0[i] = bytemuck::pod_read_unaligned::<f64>(bytes);
                }
                out.push(elem);
            }
        } else {
            let base_exp = u16::from_le_bytes([record[0], record[1]]);
            let payload = &record[2..];
            for chunk in payload.chunks_exact(7 * 8) {
                let mut elem = Elem::ZERO;
                for (i, bytes) in chunk.chunks_exact(7).enumerate() {
                    let mut packed = 0u64;
                    for (shift, &byte) in bytes.iter().enumerate() {
                        packed |= (byte as u64) << (8 * shift);
                    }
                    elem.0[i] = unpack_double(packed, base_exp);
                }
                out.push(elem);
            }
        }

        debug_assert_eq!(out.len(), self.elems_per_line);
    }
}

// ======================================================================
// FUNCTIONS - CRATE

/// Builds a preprocessed poly from a coefficient vector.
///
/// `fft` carries the twiddle tables when the forward transform is folded
/// in; the expansion layout must then keep implied monic units.
pub(crate) fn build<E: Engine>(
    engine: &E,
    input: &[Coefficient],
    layout: LoadLayout,
    other_len: usize,
    outvec_size: usize,
    options: VecOptions,
    fft: Option<&TwiddleTables>,
    compress: bool,
) -> Result<PreprocessedPoly, Error> {
    let num_lines = engine.lines();
    let elems_per_line = match fft {
        Some(tables) => tables.size,
        None => layout.loaded_len(),
    };

    let raw_element_bytes = if compress {
        2 + elems_per_line * 8 * 7
    } else {
        elems_per_line * 8 * std::mem::size_of::<f64>()
    };
    let padded_element_bytes = raw_element_bytes.div_ceil(64) * 64;

    let total = num_lines * padded_element_bytes;
    let mut data: Vec<u8> = Vec::new();
    data.try_reserve_exact(total)
        .map_err(|_| Error::OutOfMemory { bytes: total })?;

    let reader = LineReader::new(LineSource::Coefficients(input), layout);
    let mut elems: Vec<Elem> = Vec::new();
    let mut doubles: Vec<f64> = Vec::with_capacity(elems_per_line * 8);

    for line in 0..num_lines {
        let mut unit_raw = [0.0; crate::engine::LINE_DOUBLES];
        engine.unit_line(line, &mut unit_raw);
        reader.read_line(line, &Elem(unit_raw), &mut elems);

        if let Some(tables) = fft {
            elems.resize(tables.size, Elem::ZERO);
            fft::forward(&mut elems, tables);
        }

        doubles.clear();
        for elem in &elems {
            doubles.extend_from_slice(&elem.0);
        }

        if compress {
            let base_exp = base_exponent(&doubles);
            data.extend_from_slice(&base_exp.to_le_bytes());
            for &value in &doubles {
                let packed = pack_double(value, base_exp);
                data.extend_from_slice(&packed.to_le_bytes()[..7]);
            }
        } else {
            data.extend_from_slice(bytemuck::cast_slice::<f64, u8>(&doubles));
        }

        data.resize((line + 1) * padded_element_bytes, 0);
    }

    Ok(PreprocessedPoly {
        num_lines,
        elems_per_line,
        raw_element_bytes,
        padded_element_bytes,
        self_len: layout.stored_len,
        other_len,
        outvec_size,
        options,
        fft_size: fft.map(|tables| tables.size),
        monic_ones_included: layout.monic && layout.keep_units,
        compressed: compress,
        data,
    })
}

// ======================================================================
// FUNCTIONS - PRIVATE

fn fingerprint(options: VecOptions) -> usize {
    options.monic as usize | (options.rlp as usize) << 1 | (options.negate as usize) << 2
}

// Largest biased exponent in the record.
fn base_exponent(doubles: &[f64]) -> u16 {
    doubles
        .iter()
        .map(|value| ((value.to_bits() >> 52) & 0x7FF) as u16)
        .max()
        .unwrap_or(0)
}

fn pack_double(value: f64, base_exp: u16) -> u64 {
    let bits = value.to_bits();
    let sign = bits >> 63;
    let exp = ((bits >> 52) & 0x7FF) as u16;
    debug_assert!(exp <= base_exp);

    let delta = (base_exp - exp) as u64;
    if delta >= DELTA_ZERO {
        // Below the representable range: signed zero.
        (sign << 55) | (DELTA_ZERO << 52)
    } else {
        (sign << 55) | (delta << 52) | (bits & MANTISSA_MASK)
    }
}

fn unpack_double(packed: u64, base_exp: u16) -> f64 {
    let sign = (packed >> 55) & 1;
    let delta = (packed >> 52) & 7;
    if delta == DELTA_ZERO {
        return f64::from_bits(sign << 63);
    }
    let exp = (base_exp as u64 - delta) & 0x7FF;
    f64::from_bits((sign << 63) | (exp << 52) | (packed & MANTISSA_MASK))
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Reference;
    use crate::kernels::real_elem;

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

    fn plain_layout(stored_len: usize) -> LoadLayout {
        LoadLayout {
            stored_len,
            rlp: false,
            monic: false,
            negate: false,
            keep_units: false,
        }
    }

    #[test]
    fn codec_roundtrips_in_range_values() {
        let values = [0.0, -0.0, 1.0, -1.0, 3.5, -123.456, 64.0, 127.999, 2.0];
        let base = base_exponent(&values);
        for &value in &values {
            let unpacked = unpack_double(pack_double(value, base), base);
            assert_eq!(unpacked.to_bits(), value.to_bits(), "value {}", value);
        }
    }

    #[test]
    fn codec_flushes_far_below_base_to_zero() {
        let base = base_exponent(&[1.0e20]);
        assert_eq!(unpack_double(pack_double(1.0e-20, base), base), 0.0);
        let flushed = unpack_double(pack_double(-1.0e-20, base), base);
        assert_eq!(flushed, 0.0);
        assert!(flushed.is_sign_negative());
    }

    #[test]
    fn raw_records_roundtrip() {
        let engine = Reference::new(3);
        let input = transformed(&engine, &[5, -6, 7, 8]);

        let pre = build(
            &engine,
            &input,
            plain_layout(4),
            4,
            7,
            VecOptions::default(),
            None,
            false,
        )
        .unwrap();

        assert_eq!(pre.num_lines(), 3);
        assert_eq!(pre.fft_size(), None);
        assert_eq!(pre.raw_element_bytes(), 4 * 64);

        let mut out = Vec::new();
        pre.read_line(2, &mut out);
        assert_eq!(
            out,
            [5.0, -6.0, 7.0, 8.0].map(real_elem).to_vec()
        );
    }

    #[test]
    fn compressed_records_match_raw() {
        let engine = Reference::new(2);
        let input = transformed(&engine, &[100, 73, -128, 90, 65]);

        let raw = build(
            &engine,
            &input,
            plain_layout(5),
            5,
            9,
            VecOptions::default(),
            None,
            false,
        )
        .unwrap();
        let packed = build(
            &engine,
            &input,
            plain_layout(5),
            5,
            9,
            VecOptions::default(),
            None,
            true,
        )
        .unwrap();

        assert!(packed.raw_element_bytes() < raw.raw_element_bytes());

        let mut from_raw = Vec::new();
        let mut from_packed = Vec::new();
        for line in 0..2 {
            raw.read_line(line, &mut from_raw);
            packed.read_line(line, &mut from_packed);
            assert_eq!(from_raw, from_packed);
        }
    }

    #[test]
    fn pre_fft_records_hold_forward_images() {
        let engine = Reference::new(2);
        let input = transformed(&engine, &[1, 2, 3]);
        let tables = TwiddleTables::build(8).unwrap();

        let pre = build(
            &engine,
            &input,
            plain_layout(3),
            3,
            5,
            VecOptions::default(),
            Some(&tables),
            false,
        )
        .unwrap();

        assert_eq!(pre.fft_size(), Some(8));

        let mut expected: Vec<Elem> = [1.0, 2.0, 3.0].map(real_elem).to_vec();
        expected.resize(8, Elem::ZERO);
        crate::kernels::fft::forward(&mut expected, &tables);

        let mut stored = Vec::new();
        pre.read_line(0, &mut stored);
        assert_eq!(stored, expected);
    }

    #[test]
    fn compatibility_check_is_deterministic() {
        let engine = Reference::new(1);
        let input = transformed(&engine, &[1, 2]);
        let pre = build(
            &engine,
            &input,
            plain_layout(2),
            3,
            4,
            VecOptions::default(),
            None,
            false,
        )
        .unwrap();

        assert!(pre.check_compatible(3, 4, VecOptions::default()).is_ok());
        assert!(matches!(
            pre.check_compatible(2, 4, VecOptions::default()),
            Err(Error::PreprocessedMismatch {
                what: "other input size",
                ..
            })
        ));
        assert!(matches!(
            pre.check_compatible(
                3,
                4,
                VecOptions {
                    monic: true,
                    ..VecOptions::default()
                }
            ),
            Err(Error::PreprocessedMismatch {
                what: "input options",
                ..
            })
        ));
    }
}
