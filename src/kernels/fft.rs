use crate::{
    kernels::Elem,
    twiddles::TwiddleTables,
};

// ======================================================================
// CONST - PRIVATE

const SIN3: f64 = 0.8660254037844386467637231707529362;
const C51: f64 = 0.3090169943749474241022934171828191;
const S51: f64 = 0.9510565162951535721164393333793821;
const C52: f64 = -0.8090169943749474241022934171828191;
const S52: f64 = 0.5877852522924731291687059546390728;

// ======================================================================
// FUNCTIONS - CRATE

/// Forward mixed-radix transform, decimation in frequency.
///
/// Leaves the spectrum in digit-scrambled order; [`inverse`] undoes the
/// same order, so pointwise products never need a reordering pass.
pub(crate) fn forward(buf: &mut [Elem], tables: &TwiddleTables) {
    debug_assert_eq!(buf.len(), tables.size);

    for stage in &tables.stages {
        let m = stage.m;
        let q = m / stage.radix;
        let tws = tables.stage_twiddles(stage);

        let mut base = 0;
        while base < buf.len() {
            match stage.radix {
                2 => {
                    for j in 0..q {
                        dif2(buf, base + j, q, &tws[j]);
                    }
                }
                3 => {
                    for j in 0..q {
                        dif3(buf, base + j, q, &tws[2 * j..2 * j + 2]);
                    }
                }
                4 => {
                    for j in 0..q {
                        dif4(buf, base + j, q, &tws[3 * j..3 * j + 3]);
                    }
                }
                5 => {
                    for j in 0..q {
                        dif5(buf, base + j, q, &tws[4 * j..4 * j + 4]);
                    }
                }
                _ => unreachable!(),
            }
            base += m;
        }
    }
}

/// Inverse mixed-radix transform, decimation in time.
///
/// Consumes the digit-scrambled order produced by [`forward`], restores
/// natural order and applies the `1/N` scaling.
pub(crate) fn inverse(buf: &mut [Elem], tables: &TwiddleTables) {
    debug_assert_eq!(buf.len(), tables.size);

    for stage in tables.stages.iter().rev() {
        let m = stage.m;
        let q = m / stage.radix;
        let tws = tables.stage_twiddles(stage);

        let mut base = 0;
        while base < buf.len() {
            match stage.radix {
                2 => {
                    for j in 0..q {
                        dit2(buf, base + j, q, &tws[j]);
                    }
                }
                3 => {
                    for j in 0..q {
                        dit3(buf, base + j, q, &tws[2 * j..2 * j + 2]);
                    }
                }
                4 => {
                    for j in 0..q {
                        dit4(buf, base + j, q, &tws[3 * j..3 * j + 3]);
                    }
                }
                5 => {
                    for j in 0..q {
                        dit5(buf, base + j, q, &tws[4 * j..4 * j + 4]);
                    }
                }
                _ => unreachable!(),
            }
            base += m;
        }
    }

    let scale = 1.0 / tables.size as f64;
    for e in buf.iter_mut() {
        *e = e.scale(scale);
    }
}

/// `dst[i] = dst[i] * src[i]`, lane-wise complex.
pub(crate) fn pointwise_mul(dst: &mut [Elem], src: &[Elem]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = s.cmul(*d);
    }
}

// ======================================================================
// FUNCTIONS - PRIVATE - forward butterflies

#[inline(always)]
fn dif2(buf: &mut [Elem], idx: usize, q: usize, w: &[f64; 2]) {
    let x0 = buf[idx];
    let x1 = buf[idx + q];

    buf[idx] = x0.add(x1);
    buf[idx + q] = x0.sub(x1).rot(w[0], -w[1]);
}

#[inline(always)]
fn dif3(buf: &mut [Elem], idx: usize, q: usize, w: &[[f64; 2]]) {
    let x0 = buf[idx];
    let x1 = buf[idx + q];
    let x2 = buf[idx + 2 * q];

    let t = x1.add(x2);
    let u = x1.sub(x2).scale(SIN3).mul_i();
    let m1 = x0.sub(t.scale(0.5));

    buf[idx] = x0.add(t);
    buf[idx + q] = m1.sub(u).rot(w[0][0], -w[0][1]);
    buf[idx + 2 * q] = m1.add(u).rot(w[1][0], -w[1][1]);
}

#[inline(always)]
fn dif4(buf: &mut [Elem], idx: usize, q: usize, w: &[[f64; 2]]) {
    let x0 = buf[idx];
    let x1 = buf[idx + q];
    let x2 = buf[idx + 2 * q];
    let x3 = buf[idx + 3 * q];

    let t0 = x0.add(x2);
    let t1 = x1.add(x3);
    let t2 = x0.sub(x2);
    let t3 = x1.sub(x3).mul_i();

    buf[idx] = t0.add(t1);
    buf[idx + q] = t2.sub(t3).rot(w[0][0], -w[0][1]);
    buf[idx + 2 * q] = t0.sub(t1).rot(w[1][0], -w[1][1]);
    buf[idx + 3 * q] = t2.add(t3).rot(w[2][0], -w[2][1]);
}

#[inline(always)]
fn dif5(buf: &mut [Elem], idx: usize, q: usize, w: &[[f64; 2]]) {
    let x0 = buf[idx];
    let x1 = buf[idx + q];
    let x2 = buf[idx + 2 * q];
    let x3 = buf[idx + 3 * q];
    let x4 = buf[idx + 4 * q];

    let t1 = x1.add(x4);
    let t2 = x2.add(x3);
    let u1 = x1.sub(x4);
    let u2 = x2.sub(x3);

    let a1 = x0.add(t1.scale(C51)).add(t2.scale(C52));
    let a2 = x0.add(t1.scale(C52)).add(t2.scale(C51));
    let b1 = u1.scale(S51).add(u2.scale(S52)).mul_i();
    let b2 = u1.scale(S52).sub(u2.scale(S51)).mul_i();

    buf[idx] = x0.add(t1).add(t2);
    buf[idx + q] = a1.sub(b1).rot(w[0][0], -w[0][1]);
    buf[idx + 2 * q] = a2.sub(b2).rot(w[1][0], -w[1][1]);
    buf[idx + 3 * q] = a2.add(b2).rot(w[2][0], -w[2][1]);
    buf[idx + 4 * q] = a1.add(b1).rot(w[3][0], -w[3][1]);
}

// ======================================================================
// FUNCTIONS - PRIVATE - inverse butterflies

#[inline(always)]
fn dit2(buf: &mut [Elem], idx: usize, q: usize, w: &[f64; 2]) {
    let z0 = buf[idx];
    let z1 = buf[idx + q].rot(w[0], w[1]);

    buf[idx] = z0.add(z1);
    buf[idx + q] = z0.sub(z1);
}

#[inline(always)]
fn dit3(buf: &mut [Elem], idx: usize, q: usize, w: &[[f64; 2]]) {
    let z0 = buf[idx];
    let z1 = buf[idx + q].rot(w[0][0], w[0][1]);
    let z2 = buf[idx + 2 * q].rot(w[1][0], w[1][1]);

    let t = z1.add(z2);
    let u = z1.sub(z2).scale(SIN3).mul_i();
    let m1 = z0.sub(t.scale(0.5));

    buf[idx] = z0.add(t);
    buf[idx + q] = m1.add(u);
    buf[idx + 2 * q] = m1.sub(u);
}

#[inline(always)]
fn dit4(buf: &mut [Elem], idx: usize, q: usize, w: &[[f64; 2]]) {
    let z0 = buf[idx];
    let z1 = buf[idx + q].rot(w[0][0], w[0][1]);
    let z2 = buf[idx + 2 * q].rot(w[1][0], w[1][1]);
    let z3 = buf[idx + 3 * q].rot(w[2][0], w[2][1]);

    let s0 = z0.add(z2);
    let s1 = z1.add(z3);
    let d0 = z0.sub(z2);
    let d1 = z1.sub(z3).mul_i();

    buf[idx] = s0.add(s1);
    buf[idx + q] = d0.add(d1);
    buf[idx + 2 * q] = s0.sub(s1);
    buf[idx + 3 * q] = d0.sub(d1);
}

#[inline(always)]
fn dit5(buf: &mut [Elem], idx: usize, q: usize, w: &[[f64; 2]]) {
    let z0 = buf[idx];
    let z1 = buf[idx + q].rot(w[0][0], w[0][1]);
    let z2 = buf[idx + 2 * q].rot(w[1][0], w[1][1]);
    let z3 = buf[idx + 3 * q].rot(w[2][0], w[2][1]);
    let z4 = buf[idx + 4 * q].rot(w[3][0], w[3][1]);

    let t1 = z1.add(z4);
    let t2 = z2.add(z3);
    let u1 = z1.sub(z4);
    let u2 = z2.sub(z3);

    let a1 = z0.add(t1.scale(C51)).add(t2.scale(C52));
    let a2 = z0.add(t1.scale(C52)).add(t2.scale(C51));
    let b1 = u1.scale(S51).add(u2.scale(S52)).mul_i();
    let b2 = u1.scale(S52).sub(u2.scale(S51)).mul_i();

    buf[idx] = z0.add(t1).add(t2);
    buf[idx + q] = a1.add(b1);
    buf[idx + 2 * q] = a2.add(b2);
    buf[idx + 3 * q] = a2.sub(b2);
    buf[idx + 4 * q] = a1.sub(b1);
}

// ======================================================================
// TESTS
