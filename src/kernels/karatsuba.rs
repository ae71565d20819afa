use crate::kernels::{brute, Elem};

// ======================================================================
// FUNCTIONS - CRATE

/// Scratch length needed by [`multiply`] for inputs of `n1` and `n2`
/// elements with the given brute-force breakpoint.
pub(crate) fn scratch_len(n1: usize, n2: usize, karat_break: usize) -> usize {
    let n = n1.max(n2);
    let mut len = rec_len(n, karat_break);
    if n1 != n2 {
        // Padded copy of the shorter input plus the padded product.
        len += n + (2 * n - 1);
    }
    len
}

/// Karatsuba convolution over one line.
///
/// Overwrites all of `out`, which must span `n1 + n2 - 1` entries. `scratch`
/// must hold at least [`scratch_len`] entries; its contents are arbitrary
/// on entry and on exit.
pub(crate) fn multiply(
    a: &[Elem],
    b: &[Elem],
    out: &mut [Elem],
    scratch: &mut [Elem],
    karat_break: usize,
) {
    debug_assert!(!a.is_empty() && !b.is_empty());
    debug_assert_eq!(out.len(), a.len() + b.len() - 1);

    if a.len() == b.len() {
        multiply_equal(a, b, out, scratch, karat_break);
        return;
    }

    // Pad the shorter input with zeros; the padded product's prefix is the
    // true product because the extra top entries only produce zeros.
    let (long, short) = if a.len() > b.len() { (a, b) } else { (b, a) };
    let n = long.len();

    let (padded, rest) = scratch.split_at_mut(n);
    let (product, rest) = rest.split_at_mut(2 * n - 1);

    padded[..short.len()].copy_from_slice(short);
    padded[short.len()..].fill(Elem::ZERO);

    multiply_equal(long, padded, product, rest, karat_break);
    out.copy_from_slice(&product[..out.len()]);
}

// ======================================================================
// FUNCTIONS - PRIVATE

fn rec_len(n: usize, karat_break: usize) -> usize {
    if n <= 2 || n < karat_break {
        0
    } else {
        let hi = n - n / 2;
        // Two padded half sums, their product, and the deepest recursion.
        2 * hi + (2 * hi - 1) + rec_len(hi, karat_break)
    }
}

// Equal-length Karatsuba: split at h = n / 2, three recursive products,
// combine with two subtractions and two additions.
fn multiply_equal(
    a: &[Elem],
    b: &[Elem],
    out: &mut [Elem],
    scratch: &mut [Elem],
    karat_break: usize,
) {
    let n = a.len();
    debug_assert_eq!(b.len(), n);
    debug_assert_eq!(out.len(), 2 * n - 1);

    if n <= 2 || n < karat_break {
        brute::multiply(a, b, out, 0, 2 * n - 1);
        return;
    }

    let h = n / 2;
    let hi = n - h;

    // z0 = lo(a)·lo(b) and z2 = hi(a)·hi(b) straight into `out`. The slot
    // between them is not written by either recursion.
    multiply_equal(&a[..h], &b[..h], &mut out[..2 * h - 1], scratch, karat_break);
    out[2 * h - 1] = Elem::ZERO;
    multiply_equal(&a[h..], &b[h..], &mut out[2 * h..], scratch, karat_break);

    let (s1, rest) = scratch.split_at_mut(hi);
    let (s2, rest) = rest.split_at_mut(hi);
    let (z1, rest) = rest.split_at_mut(2 * hi - 1);

    // s = lo + hi, with lo zero-padded up to hi's length.
    for i in 0..hi {
        s1[i] = if i < h { a[i].add(a[h + i]) } else { a[h + i] };
        s2[i] = if i < h { b[i].add(b[h + i]) } else { b[h + i] };
    }

    multiply_equal(s1, s2, z1, rest, karat_break);

    // z1 -= z0 + z2 while `out` still holds the untouched halves, then fold
    // the middle term in.
    for t in 0..2 * hi - 1 {
        if t < 2 * h - 1 {
            z1[t] = z1[t].sub(out[t]);
        }
        z1[t] = z1[t].sub(out[2 * h + t]);
    }
    for t in 0..2 * hi - 1 {
        out[h + t] = out[h + t].add(z1[t]);
    }
}

// ======================================================================
// TESTS
