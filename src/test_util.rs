use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use crate::{
    engine::{Coefficient, Engine, Reference},
    Circular, FmaMode, Options, PolyIn, Polymult, VecOptions, Window,
};

// ======================================================================
// FUNCTIONS - CRATE - reference model

// Expands one stored vector the way the line readers do: RLP mirror,
// negation of stored values, implied monic units (never negated).
// Widened to i128 so the model keeps full headroom at any exercised size.
pub(crate) fn expand(values: &[i64], options: VecOptions) -> Vec<i128> {
    let n = values.len();
    let mut expanded: Vec<i128> = if options.rlp {
        (0..2 * n - 1)
            .map(|i| i128::from(values[(n - 1).abs_diff(i)]))
            .collect()
    } else {
        values.iter().copied().map(i128::from).collect()
    };

    if options.negate {
        for v in expanded.iter_mut() {
            *v = -*v;
        }
    }

    if options.monic {
        expanded.push(1);
        if options.rlp {
            expanded.insert(0, 1);
        }
    }
    expanded
}

// Schoolbook i128 model of one polymult call: expansion, full product,
// circular wrap, window, fused operand.
pub(crate) fn model(
    a: &[i64],
    b: &[i64],
    options: &Options,
    outvec_size: usize,
    fma: Option<&[i64]>,
) -> Vec<i128> {
    let ea = expand(a, options.invec1);
    let eb = expand(b, options.invec2);

    let mut full = vec![0i128; ea.len() + eb.len() - 1];
    for (i, &x) in ea.iter().enumerate() {
        for (j, &y) in eb.iter().enumerate() {
            full[i + j] += x * y;
        }
    }

    let circular = match options.circular {
        Circular::Off => None,
        Circular::OutputSize => Some(outvec_size),
        Circular::Size(size) => Some(size),
    };
    let buffer = match circular {
        Some(size) => {
            let mut wrapped = vec![0i128; size];
            for (t, &v) in full.iter().enumerate() {
                wrapped[t % size] += v;
            }
            wrapped
        }
        None => full,
    };

    let both_monic = options.invec1.monic && options.invec2.monic;
    let out_start: isize = match options.window {
        Window::Full | Window::Low => 0,
        Window::High => {
            buffer.len() as isize
                - outvec_size as isize
                - (both_monic && circular.is_none()) as isize
        }
        Window::Mid { start } => start as isize,
    };

    (0..outvec_size)
        .map(|j| {
            let index = out_start + j as isize;
            let mut v = if index >= 0 && (index as usize) < buffer.len() {
                buffer[index as usize]
            } else {
                0
            };
            if let Some(f) = fma {
                v = match options.fma {
                    FmaMode::None => v,
                    FmaMode::Add => v + i128::from(f[j]),
                    FmaMode::Sub => v - i128::from(f[j]),
                    FmaMode::SubFromFma => i128::from(f[j]) - v,
                };
            }
            v
        })
        .collect()
}

// ======================================================================
// FUNCTIONS - CRATE - engine plumbing

pub(crate) fn handle(lines: usize) -> Polymult<Reference> {
    Polymult::new(Reference::new(lines))
}

pub(crate) fn transformed(engine: &Reference, values: &[i64]) -> Vec<Coefficient> {
    values
        .iter()
        .map(|&v| {
            let mut c = engine.from_value(v);
            engine.forward(&mut c);
            c
        })
        .collect()
}

pub(crate) fn fresh_outputs(engine: &Reference, outvec_size: usize) -> Vec<Option<Coefficient>> {
    (0..outvec_size).map(|_| Some(engine.alloc())).collect()
}

pub(crate) fn values_of(engine: &Reference, outputs: &[Option<Coefficient>]) -> Vec<i128> {
    outputs
        .iter()
        .map(|c| i128::from(engine.value(c.as_ref().expect("discarded output"))))
        .collect()
}

pub(crate) fn random_values(len: usize, rng: &mut ChaCha8Rng) -> Vec<i64> {
    (0..len).map(|_| rng.gen_range(-50..=50)).collect()
}

// SHA-256 over the raw transform-domain bytes of every output, for
// bitwise comparisons between runs.
pub(crate) fn digest(outputs: &[Option<Coefficient>]) -> String {
    let mut sha = Sha256::new();
    for output in outputs.iter().flatten() {
        sha.update(bytemuck::cast_slice::<f64, u8>(output.data()));
    }
    hex::encode(sha.finalize())
}

// ======================================================================
// FUNCTIONS - CRATE - one-call checks

// Runs one plain-entry multiplication and compares it with the model.
pub(crate) fn check(
    pm: &mut Polymult<Reference>,
    a: &[i64],
    b: &[i64],
    options: &Options,
    outvec_size: usize,
    fma: Option<&[i64]>,
) {
    let engine = pm.engine().clone();
    let ca = transformed(&engine, a);
    let cb = transformed(&engine, b);
    let cf = fma.map(|f| transformed(&engine, f));
    let mut out = fresh_outputs(&engine, outvec_size);

    let result = match &cf {
        Some(f) => pm.polymult_fma(PolyIn::Slice(&ca), PolyIn::Slice(&cb), &mut out, f, options),
        None => pm.polymult(PolyIn::Slice(&ca), PolyIn::Slice(&cb), &mut out, options),
    };
    result.unwrap_or_else(|e| {
        panic!(
            "polymult failed: {} (a={:?} b={:?} options={:?})",
            e, a, b, options
        )
    });

    let got = values_of(&engine, &out);
    let want = model(a, b, options, outvec_size, fma);
    assert_eq!(
        got, want,
        "a={:?} b={:?} outvec={} options={:?}",
        a, b, outvec_size, options
    );
}

// Runs one several-entry argument list and compares every output with
// the model.
pub(crate) fn check_several(
    pm: &mut Polymult<Reference>,
    a: &[i64],
    invec1: VecOptions,
    cases: &[(&[i64], Options, usize, Option<&[i64]>)],
) {
    let engine = pm.engine().clone();
    let ca = transformed(&engine, a);

    let cbs: Vec<_> = cases
        .iter()
        .map(|(b, _, _, _)| transformed(&engine, b))
        .collect();
    let cfs: Vec<_> = cases
        .iter()
        .map(|(_, _, _, fma)| fma.map(|f| transformed(&engine, f)))
        .collect();
    let mut outs: Vec<_> = cases
        .iter()
        .map(|(_, _, outvec_size, _)| fresh_outputs(&engine, *outvec_size))
        .collect();

    {
        let mut args: Vec<crate::SeveralArg<'_>> = Vec::new();
        for (((case, cb), cf), out) in cases.iter().zip(&cbs).zip(&cfs).zip(&mut outs) {
            args.push(crate::SeveralArg {
                in2: PolyIn::Slice(cb),
                out,
                fma: cf.as_deref(),
                options: case.1,
            });
        }
        pm.polymult_several(PolyIn::Slice(&ca), invec1, &mut args)
            .unwrap_or_else(|e| panic!("polymult_several failed: {} (a={:?})", e, a));
    }

    for (case, out) in cases.iter().zip(&outs) {
        let (b, mut options, outvec_size, fma) = (case.0, case.1, case.2, case.3);
        options.invec1 = invec1;
        let want = model(a, b, &options, outvec_size, fma);
        let got = values_of(&engine, out);
        assert_eq!(
            got, want,
            "several: a={:?} b={:?} outvec={} options={:?}",
            a, b, outvec_size, options
        );
    }
}
