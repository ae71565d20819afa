//! The polymult handle and entry points.

use std::sync::Arc;

use crate::{
    engine::{Coefficient, Engine, LINE_DOUBLES},
    kernels::{brute, fft, karatsuba, Elem},
    lines::{coefficient_line, LineReader, LineSource, OutputSink},
    plan::{select_fft_size, Algorithm, Entry, Options, Plan, PolySpec, PostAction, Tuning, VecOptions},
    pool::{HelperPool, Job, SharedSliceMut, WorkerSlot},
    preprocess::{self, PreOptions, PreprocessedPoly},
    twiddles::{TwiddleCache, TwiddleTables},
    Error, FmaMode,
};

// ======================================================================
// PolyIn - PUBLIC

/// One input polynomial: an ordered coefficient vector, lowest degree
/// first, or a reusable preprocessed representation.
#[derive(Clone, Copy)]
pub enum PolyIn<'a> {
    /// Plain coefficient handles, already forward-transformed by the
    /// engine.
    Slice(&'a [Coefficient]),
    /// A preprocessed poly built by
    /// [`Polymult::polymult_preprocess`].
    Pre(&'a PreprocessedPoly),
}

impl<'a> PolyIn<'a> {
    /// Stored vector length.
    pub fn len(&self) -> usize {
        match self {
            PolyIn::Slice(coefficients) => coefficients.len(),
            PolyIn::Pre(pre) => pre.stored_len(),
        }
    }

    /// `true` if no coefficients are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pre(&self) -> Option<&'a PreprocessedPoly> {
        match *self {
            PolyIn::Slice(_) => None,
            PolyIn::Pre(pre) => Some(pre),
        }
    }

    fn source(&self) -> LineSource<'a> {
        match *self {
            PolyIn::Slice(coefficients) => LineSource::Coefficients(coefficients),
            PolyIn::Pre(pre) => LineSource::Pre(pre),
        }
    }
}

// ======================================================================
// SeveralArg - PUBLIC

/// One multiplication of the several-entry: `in1` times `in2`, with its
/// own output vector, optional fused operand and options.
///
/// The first input's vector options are given once to
/// [`Polymult::polymult_several`]; `options.invec1` here is ignored.
pub struct SeveralArg<'a> {
    /// The second input.
    pub in2: PolyIn<'a>,
    /// Output coefficients; `None` slots are computed but discarded.
    pub out: &'a mut [Option<Coefficient>],
    /// Fused operand, aligned with the output window.
    pub fma: Option<&'a [Coefficient]>,
    /// Options of this multiplication.
    pub options: Options,
}

// ======================================================================
// Polymult - PUBLIC

/// Process-scoped polymult state: engine reference, helper pool, twiddle
/// cache and tuning.
///
/// Dropping the handle tears down the helpers and frees the cached
/// twiddle tables.
pub struct Polymult<E: Engine> {
    engine: E,
    pool: HelperPool<E>,
    main_slot: WorkerSlot<E>,
    max_num_threads: usize,
    num_threads: usize,
    tuning: Tuning,
    twiddles: TwiddleCache,
}

impl<E: Engine> Polymult<E> {
    /// Creates a handle bound to one big-number engine.
    pub fn new(engine: E) -> Self {
        Self {
            pool: HelperPool::new(engine.clone()),
            main_slot: WorkerSlot::new(engine.clone()),
            engine,
            max_num_threads: 1,
            num_threads: 1,
            tuning: Tuning::default(),
            twiddles: TwiddleCache::new(),
        }
    }

    /// The engine this handle multiplies with.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Sets the thread budget: the calling thread plus `threads - 1`
    /// helpers. Helpers spawn lazily on the next call.
    pub fn set_max_num_threads(&mut self, threads: usize) {
        let threads = threads.max(1);
        self.max_num_threads = threads;
        self.num_threads = threads;
        self.pool.set_helper_target(threads - 1);
    }

    /// Uses `threads` of the configured budget for subsequent calls.
    pub fn set_num_threads(&mut self, threads: usize) {
        self.num_threads = threads.clamp(1, self.max_num_threads);
    }

    /// Target L2 cache size in bytes, consulted by FFT size selection.
    pub fn set_cache_size(&mut self, bytes: usize) {
        self.tuning.cache_bytes = bytes.max(1024);
    }

    /// Overrides the algorithm breakpoints (output sizes below
    /// `karat_break` run brute force, below `fft_break` Karatsuba).
    pub fn set_tuning(&mut self, karat_break: usize, fft_break: usize) {
        self.tuning.karat_break = karat_break;
        self.tuning.fft_break = fft_break.max(karat_break);
    }

    // ============================================================
    // PUBLIC - multiplication entries

    /// Multiplies two polynomials: `out = in1 * in2`.
    ///
    /// `out.len()` coefficients of the product are written according to
    /// `options`; see [`Options`] for windows, circular reduction and
    /// input shapes. `options.fma` must be [`FmaMode::None`].
    pub fn polymult(
        &mut self,
        in1: PolyIn<'_>,
        in2: PolyIn<'_>,
        out: &mut [Option<Coefficient>],
        options: &Options,
    ) -> Result<(), Error> {
        self.polymult2(in1, in2, out, None, options)
    }

    /// Multiplies and fuses: `out = in1 * in2 ± fma` (or `fma - in1 * in2`),
    /// per `options.fma`.
    pub fn polymult_fma(
        &mut self,
        in1: PolyIn<'_>,
        in2: PolyIn<'_>,
        out: &mut [Option<Coefficient>],
        fma: &[Coefficient],
        options: &Options,
    ) -> Result<(), Error> {
        self.polymult2(in1, in2, out, Some(fma), options)
    }

    /// Full-options entry: everything [`polymult`] and [`polymult_fma`]
    /// can do, with the fused operand optional.
    ///
    /// [`polymult`]: Polymult::polymult
    /// [`polymult_fma`]: Polymult::polymult_fma
    pub fn polymult2(
        &mut self,
        in1: PolyIn<'_>,
        in2: PolyIn<'_>,
        out: &mut [Option<Coefficient>],
        fma: Option<&[Coefficient]>,
        options: &Options,
    ) -> Result<(), Error> {
        let invec1 = options.invec1;
        let prepared = vec![PreparedArg {
            in2,
            out,
            fma,
            options: *options,
        }];
        self.execute(in1, invec1, prepared, Entry::Plain)
    }

    /// Multiplies one polynomial against many, sharing one forward
    /// poly-FFT of `in1` across all products.
    ///
    /// `invec1` describes `in1`; each argument carries its own second
    /// input, output, fused operand and options (whose `invec1` field is
    /// ignored). Mid windows and explicit circular sizes are permitted
    /// here only.
    pub fn polymult_several(
        &mut self,
        in1: PolyIn<'_>,
        invec1: VecOptions,
        args: &mut [SeveralArg<'_>],
    ) -> Result<(), Error> {
        let prepared: Vec<PreparedArg<'_>> = args
            .iter_mut()
            .map(|arg| PreparedArg {
                in2: arg.in2,
                out: &mut *arg.out,
                fma: arg.fma,
                options: arg.options,
            })
            .collect();
        self.execute(in1, invec1, prepared, Entry::Several)
    }

    /// Builds a reusable representation of `input` for later calls with
    /// the other input of `other_len` coefficients, `outvec_size` outputs
    /// and the same `options`.
    pub fn polymult_preprocess(
        &mut self,
        input: &[Coefficient],
        other_len: usize,
        outvec_size: usize,
        options: &Options,
        pre: PreOptions,
    ) -> Result<PreprocessedPoly, Error> {
        let element_doubles = self.engine.element_doubles();
        for coefficient in input {
            if coefficient.data().len() != element_doubles {
                return Err(Error::DifferentElementSize {
                    element_doubles,
                    got: coefficient.data().len(),
                });
            }
        }

        // Plan as the later multiply will, to learn whether the FFT path
        // runs at all and to validate the request.
        let spec1 = PolySpec {
            stored_len: input.len(),
            options: options.invec1,
            pre_fft: None,
        };
        let spec2 = PolySpec {
            stored_len: other_len,
            options: options.invec2,
            pre_fft: None,
        };
        let plan = Plan::build(
            &spec1,
            &spec2,
            outvec_size,
            options,
            Entry::Several,
            options.fma != FmaMode::None,
            &self.tuning,
            None,
        )?;

        if !pre.fft || !matches!(plan.algorithm, Algorithm::Fft { .. }) {
            // Linearized records only; the expansion keeps units out so a
            // later call may still strip them.
            let layout = crate::lines::LoadLayout {
                keep_units: false,
                ..plan.load1
            };
            return preprocess::build(
                &self.engine,
                input,
                layout,
                other_len,
                outvec_size,
                options.invec1,
                None,
                pre.compress,
            );
        }

        // Pre-FFT folds the implied monic units in, and the later call
        // keeps the other side's units in too; size the transform for
        // those kept-unit lengths.
        let load1 = crate::lines::LoadLayout {
            keep_units: options.invec1.monic,
            ..plan.load1
        };
        let load2 = crate::lines::LoadLayout {
            keep_units: options.invec2.monic,
            ..plan.load2
        };
        let needed = load1.loaded_len() + load2.loaded_len() - 1;
        let fft_size = match plan.circular_size {
            Some(size)
                if crate::twiddles::radix_factors(size).is_some()
                    && load1.loaded_len() <= size
                    && load2.loaded_len() <= size =>
            {
                size
            }
            _ => select_fft_size(needed, self.tuning.cache_bytes),
        };

        let tables = self.twiddles.ensure(fft_size)?;
        preprocess::build(
            &self.engine,
            input,
            load1,
            other_len,
            outvec_size,
            options.invec1,
            Some(&tables),
            pre.compress,
        )
    }

    // ============================================================
    // PUBLIC - user-driven helpers

    /// Wakes the helper pool to run `callback` once per helper, each with
    /// its private engine clone; the calling thread may run its own share
    /// (worker index 0) before waiting on the returned guard.
    ///
    /// Work splitting inside the callback is the caller's business; this
    /// drives the same pool, events and barrier the multiplication
    /// entries use.
    pub fn launch_helpers<'a>(
        &'a mut self,
        callback: &'a (dyn Fn(usize, &E) + Sync),
    ) -> HelpersGuard<'a, E> {
        let participants = self.num_threads.saturating_sub(1);
        let job: Box<Job<'a, E>> = Box::new(move |index, slot: &mut WorkerSlot<E>| {
            callback(index + 1, &slot.engine)
        });
        self.pool.launch(participants, participants, &*job);
        HelpersGuard {
            pool: &self.pool,
            _job: job,
            done: false,
        }
    }

    /// [`launch_helpers`], the calling thread's share, and the wait, in
    /// one call.
    ///
    /// [`launch_helpers`]: Polymult::launch_helpers
    pub fn run_helpers(&mut self, callback: &(dyn Fn(usize, &E) + Sync)) {
        let engine = self.engine.clone();
        let guard = self.launch_helpers(callback);
        callback(0, &engine);
        guard.wait();
    }

    // ============================================================
    // PRIVATE - execution

    fn execute<'b>(
        &mut self,
        in1: PolyIn<'b>,
        invec1: VecOptions,
        mut prepared: Vec<PreparedArg<'b>>,
        entry: Entry,
    ) -> Result<(), Error> {
        if prepared.is_empty() {
            return Ok(());
        }

        let element_doubles = self.engine.element_doubles();
        let num_lines = self.engine.lines();

        check_input(&in1, element_doubles, num_lines)?;
        for arg in &prepared {
            check_input(&arg.in2, element_doubles, num_lines)?;
            if let Some(fma) = arg.fma {
                if fma.len() != arg.out.len() {
                    return Err(Error::InvalidSize {
                        what: "fma vector size",
                        got: fma.len(),
                    });
                }
                for coefficient in fma {
                    if coefficient.data().len() != element_doubles {
                        return Err(Error::DifferentElementSize {
                            element_doubles,
                            got: coefficient.data().len(),
                        });
                    }
                }
            }
        }

        // Preprocessed operands: compatibility is checked against the
        // header, and pre-FFT images pin the shared transform size.
        let pre1_fft = match in1.pre() {
            Some(pre) => {
                for arg in &prepared {
                    pre.check_compatible(arg.in2.len(), arg.out.len(), invec1)?;
                }
                pre.fft_size()
            }
            None => None,
        };
        let mut forced = pre1_fft;
        for arg in &prepared {
            if let Some(pre) = arg.in2.pre() {
                pre.check_compatible(in1.len(), arg.out.len(), arg.options.invec2)?;
                if let Some(size) = pre.fft_size() {
                    match forced {
                        Some(existing) if existing != size => {
                            return Err(Error::PreprocessedMismatch {
                                what: "shared fft size",
                                expected: existing,
                                got: size,
                            });
                        }
                        _ => forced = Some(size),
                    }
                }
            }
        }

        // Plans, then unify the FFT size so in1 is transformed once.
        let spec1 = PolySpec {
            stored_len: in1.len(),
            options: invec1,
            pre_fft: pre1_fft,
        };
        let mut plans = Vec::with_capacity(prepared.len());
        for arg in &prepared {
            let spec2 = PolySpec {
                stored_len: arg.in2.len(),
                options: arg.options.invec2,
                pre_fft: arg.in2.pre().and_then(|pre| pre.fft_size()),
            };
            let mut options = arg.options;
            options.invec1 = invec1;
            plans.push(Plan::build(
                &spec1,
                &spec2,
                arg.out.len(),
                &options,
                entry,
                arg.fma.is_some(),
                &self.tuning,
                forced,
            )?);
        }

        let shared_fft = self.unify_fft_size(&spec1, &prepared, invec1, entry, forced, &mut plans)?;

        let tables = match shared_fft {
            Some(size) => Some(self.twiddles.ensure(size)?),
            None => None,
        };

        // Assemble the per-line job. Sinks hold raw output pointers;
        // helpers write disjoint line slices claimed off the pool counter.
        let mut runs = Vec::with_capacity(prepared.len());
        let mut outs = Vec::with_capacity(prepared.len());
        for (arg, plan) in prepared.drain(..).zip(plans.drain(..)) {
            let sink = OutputSink::new(arg.out, element_doubles)?;
            runs.push(RunArg {
                reader2: LineReader::new(arg.in2.source(), plan.load2),
                plan,
                sink,
                fma: arg.fma,
            });
            outs.push(arg.out);
        }

        let job = LineJob {
            reader1: LineReader::new(in1.source(), runs[0].plan.load1),
            runs,
            tables,
            karat_break: self.tuning.karat_break,
        };

        // Twiddle additions stay off while helpers are live.
        self.twiddles.set_additions_enabled(false);

        let participants = self.num_threads.saturating_sub(1);
        let line_job =
            |line: usize, slot: &mut WorkerSlot<E>| job.run_line(line, slot);
        self.pool.launch(num_lines, participants, &line_job);
        self.pool.run_items(num_lines, &line_job, &mut self.main_slot);
        self.pool.wait();

        // Per-coefficient post pass: inverse / next-forward transforms,
        // dispatched over output indices.
        for (run, out) in job.runs.iter().zip(outs.iter_mut()) {
            let post = run.plan.post;
            if post == PostAction::Keep {
                continue;
            }
            let shared = SharedSliceMut::new(out);
            let post_job = |index: usize, slot: &mut WorkerSlot<E>| {
                let slot_out = unsafe { shared.get_mut(index) };
                if let Some(coefficient) = slot_out.as_mut() {
                    match post {
                        PostAction::Inverse => slot.engine.inverse(coefficient),
                        PostAction::InverseStartNext => {
                            slot.engine.inverse(coefficient);
                            slot.engine.start_next_forward(coefficient);
                        }
                        PostAction::InverseForward => slot.engine.inverse_then_forward(coefficient),
                        PostAction::Keep => unreachable!(),
                    }
                }
            };
            self.pool.launch(shared.len(), participants, &post_job);
            self.pool.run_items(shared.len(), &post_job, &mut self.main_slot);
            self.pool.wait();
        }

        self.twiddles.set_additions_enabled(true);
        Ok(())
    }

    // All FFT plans must agree on one size so in1's forward transform is
    // shared. Preprocessed images force the size outright; otherwise the
    // largest selected size wins, falling back to a size that covers every
    // convolution when a native-circular plan cannot keep its own.
    fn unify_fft_size(
        &self,
        spec1: &PolySpec,
        prepared: &[PreparedArg<'_>],
        invec1: VecOptions,
        entry: Entry,
        forced: Option<usize>,
        plans: &mut [Plan],
    ) -> Result<Option<usize>, Error> {
        let sizes: Vec<usize> = plans
            .iter()
            .filter_map(|plan| match plan.algorithm {
                Algorithm::Fft { fft_size } => Some(fft_size),
                _ => None,
            })
            .collect();

        let Some(&first) = sizes.first() else {
            return Ok(None);
        };
        if forced.is_some() || sizes.iter().all(|&size| size == first) {
            return Ok(Some(forced.unwrap_or(first)));
        }

        let max_selected = sizes.iter().copied().max().unwrap();
        let covers = |size: usize| {
            plans.iter().all(|plan| match plan.algorithm {
                // A plan already at the shared size keeps its (possibly
                // native-circular) shape; anything rebuilt must cover its
                // whole convolution.
                Algorithm::Fft { fft_size } => fft_size == size || size >= plan.conv_len,
                _ => true,
            })
        };
        let shared = if covers(max_selected) {
            max_selected
        } else {
            let max_conv = plans
                .iter()
                .filter(|plan| matches!(plan.algorithm, Algorithm::Fft { .. }))
                .map(|plan| plan.conv_len)
                .max()
                .unwrap();
            select_fft_size(max_conv, self.tuning.cache_bytes)
        };

        for (plan, arg) in plans.iter_mut().zip(prepared.iter()) {
            if !matches!(plan.algorithm, Algorithm::Fft { fft_size } if fft_size != shared) {
                continue;
            }
            let spec2 = PolySpec {
                stored_len: arg.in2.len(),
                options: arg.options.invec2,
                pre_fft: None,
            };
            let mut options = arg.options;
            options.invec1 = invec1;
            *plan = Plan::build(
                spec1,
                &spec2,
                arg.out.len(),
                &options,
                entry,
                arg.fma.is_some(),
                &self.tuning,
                Some(shared),
            )?;
        }
        Ok(Some(shared))
    }
}

// ======================================================================
// HelpersGuard - PUBLIC

/// Outstanding helper work started by [`Polymult::launch_helpers`].
///
/// Waits at the pool barrier on [`wait`](HelpersGuard::wait) or on drop.
pub struct HelpersGuard<'a, E: Engine> {
    pool: &'a HelperPool<E>,
    _job: Box<Job<'a, E>>,
    done: bool,
}

impl<'a, E: Engine> HelpersGuard<'a, E> {
    /// Blocks until every helper has finished its callback.
    pub fn wait(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.pool.wait();
        }
    }
}

impl<'a, E: Engine> Drop for HelpersGuard<'a, E> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ======================================================================
// PreparedArg / RunArg / LineJob - PRIVATE

struct PreparedArg<'b> {
    in2: PolyIn<'b>,
    out: &'b mut [Option<Coefficient>],
    fma: Option<&'b [Coefficient]>,
    options: Options,
}

struct RunArg<'j> {
    plan: Plan,
    reader2: LineReader<'j>,
    sink: OutputSink,
    fma: Option<&'j [Coefficient]>,
}

struct LineJob<'j> {
    reader1: LineReader<'j>,
    runs: Vec<RunArg<'j>>,
    tables: Option<Arc<TwiddleTables>>,
    karat_break: usize,
}

impl<'j> LineJob<'j> {
    fn run_line<E: Engine>(&self, line: usize, slot: &mut WorkerSlot<E>) {
        let mut unit_raw = [0.0; LINE_DOUBLES];
        slot.engine.unit_line(line, &mut unit_raw);
        let unit = Elem(unit_raw);

        let scratch = &mut slot.scratch;

        // Load in1 once per line; its forward image (if any FFT plan runs)
        // is shared across every argument.
        let mut have_image = false;
        if self.reader1.is_pre_fft() {
            self.reader1.read_fft_line(line, &mut scratch.work);
            have_image = true;
        } else {
            self.reader1.read_line(line, &unit, &mut scratch.a);
        }

        if !have_image {
            if let Some(tables) = self.tables.as_deref() {
                scratch.work.clear();
                scratch.work.extend_from_slice(&scratch.a);
                scratch.work.resize(tables.size, Elem::ZERO);
                fft::forward(&mut scratch.work, tables);
            }
        }

        for run in &self.runs {
            run_arg_line(
                run,
                line,
                &unit,
                scratch,
                self.tables.as_deref(),
                self.karat_break,
            );
        }
    }
}

// ======================================================================
// FUNCTIONS - PRIVATE

fn check_input(poly: &PolyIn<'_>, element_doubles: usize, num_lines: usize) -> Result<(), Error> {
    match poly {
        PolyIn::Slice(coefficients) => {
            for coefficient in *coefficients {
                if coefficient.data().len() != element_doubles {
                    return Err(Error::DifferentElementSize {
                        element_doubles,
                        got: coefficient.data().len(),
                    });
                }
            }
            Ok(())
        }
        PolyIn::Pre(pre) => {
            if pre.num_lines() != num_lines {
                return Err(Error::PreprocessedMismatch {
                    what: "line count",
                    expected: num_lines,
                    got: pre.num_lines(),
                });
            }
            Ok(())
        }
    }
}

fn run_arg_line(
    run: &RunArg<'_>,
    line: usize,
    unit: &Elem,
    scratch: &mut crate::pool::Scratch,
    tables: Option<&TwiddleTables>,
    karat_break: usize,
) {
    let plan = &run.plan;

    // The kernel works in a buffer covering the full expanded product;
    // emulated circular reduction wraps it down afterwards.
    let compute_len = if plan.emulate_circular {
        plan.true_len
    } else {
        plan.buffer_len
    };
    scratch.full.clear();
    scratch.full.resize(compute_len, Elem::ZERO);

    let mut b_loaded = false;
    match plan.algorithm {
        Algorithm::Brute => {
            run.reader2.read_line(line, unit, &mut scratch.b);
            b_loaded = true;

            let (k_lo, k_hi) = plan.conv_window();
            if k_lo < k_hi {
                let out = &mut scratch.full[plan.conv_offset..plan.conv_offset + plan.conv_len];
                brute::multiply(&scratch.a, &scratch.b, out, k_lo, k_hi);
            }
        }

        Algorithm::Karatsuba => {
            run.reader2.read_line(line, unit, &mut scratch.b);
            b_loaded = true;

            scratch.tmp.resize(
                karatsuba::scratch_len(scratch.a.len(), scratch.b.len(), karat_break.max(3)),
                Elem::ZERO,
            );
            let out = &mut scratch.full[plan.conv_offset..plan.conv_offset + plan.conv_len];
            karatsuba::multiply(&scratch.a, &scratch.b, out, &mut scratch.tmp, karat_break);
        }

        Algorithm::Fft { fft_size } => {
            let tables = tables.expect("fft plan without twiddle tables");
            debug_assert_eq!(tables.size, fft_size);
            debug_assert_eq!(plan.adjusted_pad, fft_size - plan.conv_len.min(fft_size));

            if run.reader2.is_pre_fft() {
                run.reader2.read_fft_line(line, &mut scratch.work2);
            } else {
                run.reader2.read_line(line, unit, &mut scratch.b);
                b_loaded = true;
                scratch.work2.clear();
                scratch.work2.extend_from_slice(&scratch.b);
                scratch.work2.resize(fft_size, Elem::ZERO);
                fft::forward(&mut scratch.work2, tables);
            }

            fft::pointwise_mul(&mut scratch.work2, &scratch.work);
            fft::inverse(&mut scratch.work2, tables);

            if plan.circular_size == Some(fft_size) && !plan.emulate_circular {
                // Native reduction: the transform already wrapped.
                scratch.full.copy_from_slice(&scratch.work2[..plan.buffer_len]);
            } else {
                let len = plan.conv_len.min(fft_size);
                scratch.full[plan.conv_offset..plan.conv_offset + len]
                    .copy_from_slice(&scratch.work2[..len]);
            }
        }
    }

    // Stripped-monic fixups: each stripped unit contributes a shifted copy
    // of the other loaded input, and unit pairs contribute `1·1` products.
    let native_mod = if plan.emulate_circular {
        None
    } else {
        plan.circular_size
    };
    let add_at = |full: &mut [Elem], index: usize, value: Elem| {
        let index = match native_mod {
            Some(size) => index % size,
            None => index,
        };
        full[index] = full[index].add(value);
    };

    let units1 = plan.load1.stripped_units();
    let units2 = plan.load2.stripped_units();
    if units1.iter().any(Option::is_some) {
        debug_assert!(b_loaded, "stripping needs the other side's raw lines");
        for u1 in units1.into_iter().flatten() {
            for (j, value) in scratch.b.iter().enumerate() {
                add_at(&mut scratch.full, u1 + plan.load2.lead() + j, *value);
            }
        }
    }
    if units2.iter().any(Option::is_some) {
        for u2 in units2.into_iter().flatten() {
            for (i, value) in scratch.a.iter().enumerate() {
                add_at(&mut scratch.full, u2 + plan.load1.lead() + i, *value);
            }
        }
    }
    for addin in plan.unit_addins.into_iter().flatten() {
        add_at(&mut scratch.full, addin, *unit);
    }

    if plan.emulate_circular {
        let size = plan.circular_size.expect("emulation without circular size");
        for t in size..compute_len {
            scratch.full[t % size] = scratch.full[t % size].add(scratch.full[t]);
        }
    }

    // Window, fuse, write. A recorded subout position (the suppressed top
    // unit of a monic-by-monic high window) always falls outside the
    // window itself.
    debug_assert!(plan
        .subout
        .map_or(true, |idx| (idx as isize) >= plan.out_start + plan.outvec_size as isize));

    let limit = plan.buffer_len;
    scratch.values.clear();
    for j in 0..plan.outvec_size {
        let index = plan.out_start + j as isize;
        let mut value = if index >= 0 && (index as usize) < limit {
            scratch.full[index as usize]
        } else {
            Elem::ZERO
        };

        if let Some(fma) = run.fma {
            let fused = coefficient_line(&fma[j], line);
            value = match plan.fma {
                FmaMode::None => value,
                FmaMode::Add => value.add(fused),
                FmaMode::Sub => value.sub(fused),
                FmaMode::SubFromFma => fused.sub(value),
            };
        }
        scratch.values.push(value);
    }

    // Line indices are claimed uniquely off the pool counter, so this
    // write owns its 64-byte slice of every output coefficient.
    unsafe { run.sink.write_line(line, &scratch.values) };
}

// ======================================================================
// TESTS
