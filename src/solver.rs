//! Multi-pass solve orchestration.
//!
//! One call to [`Solver::calc_next`] advances the field by `1 +
//! extra_pass_count` steps. The orchestrator decides which sheet each pass
//! writes into, keeps the two-generation history the wave technique needs,
//! owns the scratch buffers for the implicit schemes, and clamps the field
//! when a deliberately unstable parameter choice makes it blow up.

use std::sync::{
    Arc,
    atomic::{
        AtomicBool,
        Ordering,
    },
};

use crate::{
    Scalar,
    cast,
    dispatch::{
        self,
        LineForEach,
        MultiThreaded,
        SingleThreaded,
        Strips,
    },
    sheet::Sheet,
    stencil::{
        self,
        AssignMode,
    },
    strider::{
        Grid,
        GridMut,
    },
};

/// How a 2-D step is assembled from 1-D or 2-D kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Technique {
    /// Two 1-D solves, first along x then along y. The only technique that
    /// may solve in place.
    OrthoInterleave,
    /// One 2-D stencil per pass; the wave solve with full damping.
    Simultaneous2d,
    /// Second order in time: the previous *two* generations feed each pass.
    WaveWithDamping,
}

/// Which difference scheme the kernels use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Method {
    Forward,
    Backward,
    Central,
}

/// Where the second-to-last generation ended up after a solve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LastSolveSaved {
    #[default]
    NotSaved,
    InSrc,
    InExtra,
}

fn maybe_assign<V>(slot: &mut V, value: V) -> bool
where
    V: PartialEq,
{
    if *slot == value {
        false
    }
    else {
        *slot = value;
        true
    }
}

/// Immutable-per-solve parameter block. Setters report whether the value
/// actually changed, so a UI can decide when to repaint.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InputParams<T> {
    technique: Technique,
    method: Method,
    parallel: bool,
    damping: T,
    rate_x: T,
    rate_y: T,
    extra_pass_count: usize,
    extra_passes_disabled: bool,
    reset_extra_if_unused: bool,
    copy_for_history: bool,
    size_for_history: bool,
    wave_damping_floor: T,
}

impl<T> Default for InputParams<T>
where
    T: Scalar,
{
    fn default() -> Self {
        Self {
            technique: Technique::Simultaneous2d,
            method: Method::Forward,
            parallel: true,
            damping: T::zero(),
            rate_x: cast(0.2),
            rate_y: cast(0.2),
            extra_pass_count: 0,
            extra_passes_disabled: false,
            reset_extra_if_unused: false,
            copy_for_history: false,
            size_for_history: false,
            wave_damping_floor: cast(0.3),
        }
    }
}

impl<T> InputParams<T>
where
    T: Scalar,
{
    pub fn technique(&self) -> Technique {
        self.technique
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn damping(&self) -> T {
        self.damping
    }

    pub fn rate_x(&self) -> T {
        self.rate_x
    }

    pub fn rate_y(&self) -> T {
        self.rate_y
    }

    pub fn extra_pass_count(&self) -> usize {
        self.extra_pass_count
    }

    pub fn pass_count(&self) -> usize {
        self.extra_pass_count + 1
    }

    pub fn has_extra_passes(&self) -> bool {
        self.extra_pass_count > 0
    }

    pub fn extra_passes_disabled(&self) -> bool {
        self.extra_passes_disabled
    }

    pub fn reset_extra_if_unused(&self) -> bool {
        self.reset_extra_if_unused
    }

    pub fn copy_for_history(&self) -> bool {
        self.copy_for_history
    }

    pub fn size_for_history(&self) -> bool {
        self.size_for_history
    }

    /// Damping values below this make the wave solve blow up in practice,
    /// so the stability clamp kicks in underneath it.
    pub fn wave_damping_floor(&self) -> T {
        self.wave_damping_floor
    }

    /// Switching technique also picks the extra-sheet policy that makes
    /// sense for it: the interleave never needs the extra sheet, the 2-D
    /// techniques want history kept, and the wave cannot run without it.
    pub fn set_technique(&mut self, technique: Technique) -> bool {
        if self.technique == technique {
            return false;
        }
        self.technique = technique;
        match technique {
            Technique::OrthoInterleave => {
                self.copy_for_history = true;
                self.size_for_history = false;
                self.reset_extra_if_unused = true;
            }
            Technique::Simultaneous2d => {
                self.copy_for_history = true;
                self.size_for_history = false;
                self.reset_extra_if_unused = false;
            }
            Technique::WaveWithDamping => {
                self.copy_for_history = true;
                self.size_for_history = true;
                self.reset_extra_if_unused = false;
            }
        }
        true
    }

    pub fn set_method(&mut self, method: Method) -> bool {
        maybe_assign(&mut self.method, method)
    }

    pub fn set_parallel(&mut self, parallel: bool) -> bool {
        maybe_assign(&mut self.parallel, parallel)
    }

    pub fn set_damping(&mut self, damping: T) -> bool {
        maybe_assign(&mut self.damping, damping)
    }

    pub fn set_rate_x(&mut self, rate_x: T) -> bool {
        maybe_assign(&mut self.rate_x, rate_x)
    }

    pub fn set_rate_y(&mut self, rate_y: T) -> bool {
        maybe_assign(&mut self.rate_y, rate_y)
    }

    pub fn set_rates(&mut self, rate_x: T, rate_y: T) -> bool {
        let changed_x = self.set_rate_x(rate_x);
        self.set_rate_y(rate_y) || changed_x
    }

    pub fn set_extra_pass_count(&mut self, extra_pass_count: usize) -> bool {
        maybe_assign(&mut self.extra_pass_count, extra_pass_count)
    }

    pub fn set_extra_passes_disabled(&mut self, disabled: bool) -> bool {
        maybe_assign(&mut self.extra_passes_disabled, disabled)
    }

    pub fn set_wave_damping_floor(&mut self, floor: T) -> bool {
        maybe_assign(&mut self.wave_damping_floor, floor)
    }
}

/// Per-solve output, reset at the start of every solve. The early-exit flag
/// is the only field another thread touches while a solve runs.
#[derive(Debug)]
pub struct SolveStatus {
    early_exit: Arc<AtomicBool>,
    was_extra_used: bool,
    was_extra_sized: bool,
    solve_count: usize,
    last_solve_saved: LastSolveSaved,
}

impl SolveStatus {
    fn new() -> Self {
        Self {
            early_exit: Arc::new(AtomicBool::new(false)),
            was_extra_used: false,
            was_extra_sized: false,
            solve_count: 0,
            last_solve_saved: LastSolveSaved::NotSaved,
        }
    }

    fn reset(&mut self) {
        self.early_exit.store(false, Ordering::Relaxed);
        self.was_extra_used = false;
        self.was_extra_sized = false;
        self.solve_count = 0;
        self.last_solve_saved = LastSolveSaved::NotSaved;
    }

    pub fn is_early_exit(&self) -> bool {
        self.early_exit.load(Ordering::Relaxed)
    }

    /// Cooperative cancellation; observed between passes and at the start
    /// of every dispatched line. Target contents are undefined afterwards.
    pub fn request_early_exit(&self) {
        self.early_exit.store(true, Ordering::Relaxed);
    }

    /// Shared handle so a controller can cancel from another thread.
    pub fn early_exit_handle(&self) -> Arc<AtomicBool> {
        self.early_exit.clone()
    }

    pub fn was_extra_used(&self) -> bool {
        self.was_extra_used
    }

    pub fn was_extra_sized(&self) -> bool {
        self.was_extra_sized
    }

    pub fn solve_count(&self) -> usize {
        self.solve_count
    }

    pub fn last_solve_saved(&self) -> LastSolveSaved {
        self.last_solve_saved
    }
}

/// The sheets one solve reads and writes.
///
/// `InPlace` is the src-is-trg request; it is only legal with
/// [`Technique::OrthoInterleave`], whose kernels read ahead of their
/// writes.
#[derive(Debug)]
pub enum SolveTarget<'a, T> {
    InPlace(&'a mut Sheet<T>),
    OutOfPlace {
        src: &'a Sheet<T>,
        trg: &'a mut Sheet<T>,
    },
}

/// Which sheet currently holds the newest generation during the pass loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Loc {
    Src,
    Trg,
    Extra,
}

/// The solve orchestrator. Owns the implicit-scheme scratch buffers and
/// one serial plus one pooled dispatcher; the `parallel` input picks
/// between them per pass.
#[derive(Debug)]
pub struct Solver<T = f32> {
    status: SolveStatus,
    buf_a: Vec<T>,
    buf_b: Vec<T>,
    serial: SingleThreaded,
    pooled: MultiThreaded,
}

impl<T> Default for Solver<T>
where
    T: Scalar,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Solver<T>
where
    T: Scalar,
{
    pub fn new() -> Self {
        Self {
            status: SolveStatus::new(),
            buf_a: Vec::new(),
            buf_b: Vec::new(),
            serial: SingleThreaded,
            pooled: MultiThreaded::from_default_thread_pool(),
        }
    }

    /// Runs the pooled dispatch on a caller-supplied thread pool.
    pub fn with_multi_threaded(pooled: MultiThreaded) -> Self {
        Self {
            pooled,
            ..Self::new()
        }
    }

    pub fn status(&self) -> &SolveStatus {
        &self.status
    }

    pub fn request_early_exit(&self) {
        self.status.request_early_exit();
    }

    // -------------------------------------------------------------------
    // The solve state machine

    /// Advances the field by `1 + extra_pass_count` steps.
    ///
    /// `extra` is the caller-owned auxiliary sheet; whether it is used,
    /// resized or left alone follows the input's history policy and is
    /// reported in the status. For [`Technique::WaveWithDamping`], `trg`
    /// enters holding the generation before `src` and the solve keeps that
    /// two-generation chain intact across passes.
    pub fn calc_next(
        &mut self,
        params: &InputParams<T>,
        target: SolveTarget<'_, T>,
        extra: &mut Sheet<T>,
    ) {
        self.status.reset();
        match target {
            SolveTarget::InPlace(trg) => self.calc_next_inner(params, None, trg, extra),
            SolveTarget::OutOfPlace { src, trg } => {
                debug_assert_eq!(src.x_count(), trg.x_count());
                debug_assert_eq!(src.y_count(), trg.y_count());
                self.calc_next_inner(params, Some(src), trg, extra)
            }
        }
    }

    fn calc_next_inner(
        &mut self,
        params: &InputParams<T>,
        src: Option<&Sheet<T>>,
        trg: &mut Sheet<T>,
        extra: &mut Sheet<T>,
    ) {
        let x_count = trg.x_count();
        let y_count = trg.y_count();
        debug_assert!(x_count > 0 && y_count > 0);
        if x_count == 0 || y_count == 0 {
            return;
        }

        let in_place_requested = src.is_none();
        let is_multi_pass = params.has_extra_passes() && !params.extra_passes_disabled();
        let is_one_pass = !is_multi_pass;
        let is_in_place_possible = params.technique() == Technique::OrthoInterleave;
        let is_extra_pre_sized = extra.x_count() == x_count && extra.y_count() == y_count;
        let is_history_vital = params.size_for_history();
        let is_history_nice = is_history_vital || params.copy_for_history();
        let is_extra_vital_for_solve = is_multi_pass && !is_in_place_possible;
        let is_extra_vital_for_history = is_multi_pass || in_place_requested;
        let is_extra_vital =
            is_extra_vital_for_solve || (is_history_vital && is_extra_vital_for_history);
        let is_extra_nice =
            is_extra_vital || (is_history_nice && is_extra_vital_for_history);
        let is_extra_used = is_extra_vital || (is_extra_nice && is_extra_pre_sized);

        // src-is-trg outside the interleave is a caller bug
        debug_assert!(!in_place_requested || is_in_place_possible);

        if is_extra_vital && !is_extra_pre_sized {
            let sized = extra.set_xy_counts(x_count, y_count, T::zero());
            debug_assert!(sized);
            self.status.was_extra_sized = true;
        }
        if is_extra_used {
            self.status.was_extra_used = true;
        }
        else if params.reset_extra_if_unused() {
            extra.reset();
        }

        // The wave solve keeps the one-generation-back state in whatever
        // sheet the next pass reads, so seed extra (and trg) to line the
        // chain up with the pass parity.
        if is_multi_pass && params.technique() == Technique::WaveWithDamping {
            debug_assert!(is_extra_used);
            if self.status.is_early_exit() {
                return;
            }
            let src = src.expect("the wave technique never solves in place");
            if params.extra_pass_count() % 2 == 1 {
                // src -> extra first: extra must hold trg's generation
                extra.clone_from(trg);
                trg.clone_from(src);
            }
            else {
                // src -> trg first, trg -> extra second
                extra.clone_from(src);
            }
        }

        let mut loc = if in_place_requested { Loc::Trg } else { Loc::Src };
        let mut countdown = if is_multi_pass {
            params.extra_pass_count()
        }
        else {
            0
        };
        while countdown > 0 {
            if self.status.is_early_exit() {
                return;
            }
            self.status.solve_count += 1;

            let to_extra = is_extra_used && countdown % 2 == 1;
            loc = match (loc, to_extra) {
                (Loc::Src, true) => {
                    self.calc_next_pass(params, src.expect("loc Src implies src"), extra);
                    Loc::Extra
                }
                (Loc::Src, false) => {
                    self.calc_next_pass(params, src.expect("loc Src implies src"), trg);
                    Loc::Trg
                }
                (Loc::Trg, true) => {
                    self.calc_next_pass(params, trg, extra);
                    Loc::Extra
                }
                (Loc::Trg, false) => {
                    self.calc_next_pass_in_place(params, trg);
                    Loc::Trg
                }
                (Loc::Extra, false) => {
                    self.calc_next_pass(params, extra, trg);
                    Loc::Trg
                }
                (Loc::Extra, true) => {
                    // parity alternates, so this cannot come up
                    debug_assert!(false);
                    Loc::Extra
                }
            };
            countdown -= 1;
        }

        // Bookkeeping for where the second-to-last generation survives.
        if is_one_pass {
            if in_place_requested {
                if is_history_nice && is_extra_used {
                    if self.status.is_early_exit() {
                        return;
                    }
                    extra.clone_from(trg);
                    self.status.last_solve_saved = LastSolveSaved::InExtra;
                }
            }
            else {
                self.status.last_solve_saved = LastSolveSaved::InSrc;
            }
        }
        else if is_extra_used {
            debug_assert_eq!(loc, Loc::Extra);
            self.status.last_solve_saved = LastSolveSaved::InExtra;
        }
        else {
            // multi-pass without the extra sheet only happens in place
            debug_assert_eq!(loc, Loc::Trg);
            debug_assert!(is_in_place_possible);
        }

        // The last pass always lands in trg.
        if self.status.is_early_exit() {
            return;
        }
        self.status.solve_count += 1;
        match loc {
            Loc::Src => self.calc_next_pass(params, src.expect("loc Src implies src"), trg),
            Loc::Trg => self.calc_next_pass_in_place(params, trg),
            Loc::Extra => self.calc_next_pass(params, extra, trg),
        }
    }

    // -------------------------------------------------------------------
    // One pass

    fn calc_next_pass(&mut self, params: &InputParams<T>, src: &Sheet<T>, trg: &mut Sheet<T>) {
        debug_assert_eq!(src.x_count(), trg.x_count());
        debug_assert_eq!(src.y_count(), trg.y_count());

        if !self.status.is_early_exit() {
            match params.technique() {
                Technique::OrthoInterleave => self.ortho_interleave(params, src, trg),
                Technique::Simultaneous2d => {
                    // the wave with full damping is plain 2-D diffusion
                    self.wave_with_damping(params, T::one(), src, trg)
                }
                Technique::WaveWithDamping => {
                    self.wave_with_damping(params, params.damping(), src, trg)
                }
            }
        }
        if !self.status.is_early_exit() {
            self.fix_out_of_bounds_if_necessary(params, trg);
        }
    }

    fn calc_next_pass_in_place(&mut self, params: &InputParams<T>, trg: &mut Sheet<T>) {
        debug_assert_eq!(params.technique(), Technique::OrthoInterleave);

        if !self.status.is_early_exit() {
            self.ortho_interleave_in_place(params, trg);
        }
        if !self.status.is_early_exit() {
            self.fix_out_of_bounds_if_necessary(params, trg);
        }
    }

    /// Two 1-D solves: x along every row, then y along every column of the
    /// intermediate result. A zero rate skips its axis entirely.
    fn ortho_interleave(&mut self, params: &InputParams<T>, src: &Sheet<T>, trg: &mut Sheet<T>) {
        self.ensure_buffer_size(params, src.x_count(), src.y_count());

        let rate_x = params.rate_x();
        let rate_y = params.rate_y();

        if rate_x != T::zero() {
            self.solve_lines_1d(params, AssignMode::Set, rate_x, src.range_yx(), trg.range_yx_mut());
            if !self.status.is_early_exit() && rate_y != T::zero() {
                // the y solve reads what the x solve just wrote
                let (mid, out) = trg.range_xy_in_place();
                self.solve_lines_1d(params, AssignMode::Set, rate_y, mid, out);
            }
        }
        else if rate_y != T::zero() {
            self.solve_lines_1d(params, AssignMode::Set, rate_y, src.range_xy(), trg.range_xy_mut());
        }
        else {
            trg.clone_from(src);
        }
    }

    fn ortho_interleave_in_place(&mut self, params: &InputParams<T>, trg: &mut Sheet<T>) {
        self.ensure_buffer_size(params, trg.x_count(), trg.y_count());

        let rate_x = params.rate_x();
        let rate_y = params.rate_y();

        if rate_x != T::zero() {
            {
                let (src, out) = trg.range_yx_in_place();
                self.solve_lines_1d(params, AssignMode::Set, rate_x, src, out);
            }
            if !self.status.is_early_exit() && rate_y != T::zero() {
                let (src, out) = trg.range_xy_in_place();
                self.solve_lines_1d(params, AssignMode::Set, rate_y, src, out);
            }
        }
        else if rate_y != T::zero() {
            let (src, out) = trg.range_xy_in_place();
            self.solve_lines_1d(params, AssignMode::Set, rate_y, src, out);
        }
        // both rates zero in place: nothing to do
    }

    /// One wave step. Forward diff does it in a single 2-D kernel pass;
    /// the implicit schemes split it into an x pass that applies the wave
    /// blend and a y pass that accumulates on top.
    fn wave_with_damping(
        &mut self,
        params: &InputParams<T>,
        damping: T,
        src: &Sheet<T>,
        trg: &mut Sheet<T>,
    ) {
        match params.method() {
            Method::Forward => {
                // forward diff needs no scratch; drop any held allocation
                self.clear_buffers();
                self.solve_lines_2d_forward(
                    params,
                    damping,
                    src.range_yx(),
                    trg.range_yx_mut(),
                );
            }
            Method::Backward | Method::Central => {
                self.ensure_buffer_size(params, src.x_count(), src.y_count());
                self.solve_lines_1d(
                    params,
                    AssignMode::Wave(damping),
                    params.rate_x(),
                    src.range_yx(),
                    trg.range_yx_mut(),
                );
                if !self.status.is_early_exit() {
                    self.solve_lines_1d(
                        params,
                        AssignMode::Add,
                        params.rate_y(),
                        src.range_xy(),
                        trg.range_xy_mut(),
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Kernel fan-out

    fn solve_lines_1d(
        &mut self,
        params: &InputParams<T>,
        mode: AssignMode<T>,
        rate: T,
        src: Grid<'_, T>,
        trg: GridMut<'_, T>,
    ) {
        let Self {
            status,
            buf_a,
            buf_b,
            serial,
            pooled,
        } = self;
        let threading: &dyn LineForEach = if params.is_parallel() { pooled } else { serial };
        let early_exit: &AtomicBool = &status.early_exit;
        let line_len = src.inner_count();

        match params.method() {
            Method::Forward => {
                dispatch::map_lines(threading, early_exit, src, trg, move |_, line, mut out| {
                    stencil::forward_line(mode, T::one(), rate, line, &mut out);
                });
            }
            Method::Backward => {
                let (strips_a, strips_b) = if params.is_parallel() {
                    (Strips::per_line(buf_a, line_len), Strips::per_line(buf_b, line_len))
                }
                else {
                    (Strips::shared(buf_a, line_len), Strips::shared(buf_b, line_len))
                };
                dispatch::map_lines_buffered(
                    threading,
                    early_exit,
                    src,
                    trg,
                    strips_a,
                    strips_b,
                    move |_, line, mut out, rhs, diag| {
                        stencil::backward_line(mode, rate, line, &mut out, rhs, diag);
                    },
                );
            }
            Method::Central => {
                let (strips_a, strips_b) = if params.is_parallel() {
                    (Strips::per_line(buf_a, line_len), Strips::per_line(buf_b, line_len))
                }
                else {
                    (Strips::shared(buf_a, line_len), Strips::shared(buf_b, line_len))
                };
                dispatch::map_lines_buffered(
                    threading,
                    early_exit,
                    src,
                    trg,
                    strips_a,
                    strips_b,
                    move |_, line, mut out, rhs, diag| {
                        stencil::central_line(mode, rate, line, &mut out, rhs, diag);
                    },
                );
            }
        }
    }

    fn solve_lines_2d_forward(
        &mut self,
        params: &InputParams<T>,
        damping: T,
        src: Grid<'_, T>,
        trg: GridMut<'_, T>,
    ) {
        let Self {
            status,
            serial,
            pooled,
            ..
        } = self;
        let threading: &dyn LineForEach = if params.is_parallel() { pooled } else { serial };
        let early_exit: &AtomicBool = &status.early_exit;

        let mode = AssignMode::Wave(damping);
        let rate = params.rate_x();
        let rate_side = params.rate_y();
        debug_assert!(src.count() > 0);
        let last = src.count() - 1;

        dispatch::map_lines(threading, early_exit, src, trg, move |index, line, mut out| {
            if last == 0 {
                // a one-row sheet has no side neighbours at all
                stencil::forward_line(mode, T::one(), rate, line, &mut out);
            }
            else if index == 0 {
                stencil::forward_2d_edge(mode, rate, rate_side, line, src.line(1), &mut out);
            }
            else if index == last {
                stencil::forward_2d_edge(mode, rate, rate_side, line, src.line(last - 1), &mut out);
            }
            else {
                stencil::forward_2d_middle(
                    mode,
                    rate,
                    rate_side,
                    line,
                    src.line(index - 1),
                    src.line(index + 1),
                    &mut out,
                );
            }
        });
    }

    // -------------------------------------------------------------------
    // Scratch buffers

    fn min_buf_size(params: &InputParams<T>, x_count: usize, y_count: usize) -> usize {
        match params.method() {
            Method::Forward => 0,
            Method::Backward | Method::Central => {
                if params.is_parallel() {
                    // one exclusive strip per line
                    x_count * y_count
                }
                else {
                    x_count.max(y_count)
                }
            }
        }
    }

    fn ensure_buffer_size(&mut self, params: &InputParams<T>, x_count: usize, y_count: usize) {
        if self.status.is_early_exit() {
            return;
        }
        let now = self.buf_a.len();
        let min = Self::min_buf_size(params, x_count, y_count);
        if min > now || min < now / 2 {
            if min == 0 {
                self.clear_buffers();
            }
            else {
                tracing::debug!(from = now, to = min, "resizing solver scratch buffers");
                self.buf_a.resize(min, T::zero());
                self.buf_a.shrink_to_fit();
                self.buf_b.resize(min, T::zero());
                self.buf_b.shrink_to_fit();
            }
        }
        debug_assert!(self.buf_a.len() >= min && self.buf_b.len() >= min);
    }

    fn clear_buffers(&mut self) {
        if !self.status.is_early_exit() && !self.buf_a.is_empty() {
            self.buf_a = Vec::new();
            self.buf_b = Vec::new();
        }
    }

    // -------------------------------------------------------------------
    // Stability clamp

    /// Flags the parameter combinations that are known to let the field
    /// run away. Imperfect on purpose: it exists so experiments with
    /// illegal rates stay renderable, not to certify stability.
    fn fix_out_of_bounds_if_necessary(&mut self, params: &InputParams<T>, trg: &mut Sheet<T>) {
        let rate_x = params.rate_x();
        let rate_y = params.rate_y();
        let damping = params.damping();
        let half = cast::<T>(0.5);

        let needs_correction = if rate_x < T::zero() || rate_y < T::zero() {
            true
        }
        else if params.technique() == Technique::WaveWithDamping
            && (damping < T::zero()
                || damping > T::one()
                || damping < params.wave_damping_floor())
        {
            true
        }
        else if params.method() != Method::Backward
            && (rate_x >= half
                || rate_y >= half
                || (params.technique() != Technique::OrthoInterleave
                    && rate_x + rate_y >= half))
        {
            true
        }
        else {
            false
        };

        if needs_correction {
            self.fix_severely_out_of_bounds_sheet(trg);
        }
    }

    /// Pulls a runaway field back into a renderable range. A flat field
    /// outside [-1, 1] flattens to zero; anything past +/-100 is squeezed
    /// back inside +/-50.
    fn fix_severely_out_of_bounds_sheet(&mut self, trg: &mut Sheet<T>) {
        let normal_min = -T::one();
        let normal_max = T::one();
        let normal_mid = T::zero();
        let out_of_bounds_min = cast::<T>(-100.0);
        let out_of_bounds_max = cast::<T>(100.0);
        let back_in_bounds_min = cast::<T>(-50.0);
        let back_in_bounds_max = cast::<T>(50.0);

        let Some((min_value, max_value)) = trg.get_min_max_values() else {
            return;
        };
        debug_assert!(min_value <= max_value);

        if min_value == max_value {
            if min_value < normal_min || max_value > normal_max {
                tracing::warn!(value = ?min_value, "flat sheet out of range, flattening to zero");
                trg.fill_sheet(normal_mid);
            }
        }
        else if min_value < out_of_bounds_min {
            tracing::warn!(min = ?min_value, max = ?max_value, "sheet ran away low, renormalizing");
            trg.normalize(
                back_in_bounds_min,
                normal_mid.max(back_in_bounds_max.min(max_value)),
            );
        }
        else if max_value > out_of_bounds_max {
            tracing::warn!(min = ?min_value, max = ?max_value, "sheet ran away high, renormalizing");
            trg.normalize(
                normal_mid.min(back_in_bounds_min.max(min_value)),
                back_in_bounds_max,
            );
        }
    }
}

// _______________________________________________________________________

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet_from(x_count: usize, y_count: usize, cells: &[f32]) -> Sheet<f32> {
        assert_eq!(cells.len(), x_count * y_count);
        let mut sheet = Sheet::new();
        assert!(sheet.set_xy_counts(x_count, y_count, 0.0));
        for (index, value) in cells.iter().enumerate() {
            assert!(sheet.set_value_at(*value, index % x_count, index / x_count));
        }
        sheet
    }

    fn params(technique: Technique, method: Method) -> InputParams<f32> {
        let mut params = InputParams::default();
        params.set_technique(technique);
        params.set_method(method);
        params.set_parallel(false);
        params
    }

    fn assert_cells_eq(sheet: &Sheet<f32>, expected: &[f32]) {
        assert_eq!(sheet.cells().len(), expected.len());
        for (index, (have, want)) in sheet.cells().iter().zip(expected).enumerate() {
            assert!(
                (have - want).abs() < 1e-5,
                "cell {index}: have {have}, want {want}"
            );
        }
    }

    #[test]
    fn it_solves_a_three_cell_row() {
        let src = sheet_from(3, 1, &[0.0, 1.0, 0.0]);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(3, 1, 0.0));
        let mut extra = Sheet::new();

        let mut input = params(Technique::OrthoInterleave, Method::Forward);
        input.set_rates(0.25, 0.0);

        let mut solver = Solver::new();
        solver.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert_cells_eq(&trg, &[0.25, 0.5, 0.25]);
        assert_eq!(solver.status().solve_count(), 1);
        assert_eq!(solver.status().last_solve_saved(), LastSolveSaved::InSrc);
    }

    #[test]
    fn it_solves_a_three_cell_column() {
        let src = sheet_from(1, 3, &[0.0, 1.0, 0.0]);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(1, 3, 0.0));
        let mut extra = Sheet::new();

        let mut input = params(Technique::OrthoInterleave, Method::Forward);
        input.set_rates(0.0, 0.25);

        Solver::new().calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert_cells_eq(&trg, &[0.25, 0.5, 0.25]);
    }

    #[test]
    fn it_diffuses_a_symmetric_spike_in_2d() {
        let src = sheet_from(
            3,
            3,
            &[
                0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 0.0, 0.0,
            ],
        );
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(3, 3, 0.0));
        let mut extra = Sheet::new();

        let mut input = params(Technique::Simultaneous2d, Method::Forward);
        input.set_rates(0.2, 0.2);

        Solver::new().calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert_cells_eq(
            &trg,
            &[
                0.0, 0.2, 0.0, //
                0.2, 0.2, 0.2, //
                0.0, 0.2, 0.0,
            ],
        );
        // exact symmetry across both axes
        assert_eq!(trg.get_at(0, 1), trg.get_at(2, 1));
        assert_eq!(trg.get_at(1, 0), trg.get_at(1, 2));
    }

    #[test]
    fn it_holds_a_flat_sheet_fixed_under_the_implicit_scheme() {
        let src = sheet_from(5, 5, &[0.7; 25]);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(5, 5, 0.0));
        let mut extra = Sheet::new();

        let mut input = params(Technique::Simultaneous2d, Method::Backward);
        input.set_rates(0.3, 0.3);

        Solver::new().calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert_cells_eq(&trg, &[0.7; 25]);
    }

    #[test]
    fn it_keeps_a_flat_sheet_flat_through_every_scheme() {
        for technique in [Technique::OrthoInterleave, Technique::Simultaneous2d] {
            for method in [Method::Forward, Method::Backward, Method::Central] {
                let src = sheet_from(4, 6, &[0.42; 24]);
                let mut trg = Sheet::new();
                assert!(trg.set_xy_counts(4, 6, 0.0));
                let mut extra = Sheet::new();

                let mut input = params(technique, method);
                input.set_rates(0.2, 0.15);

                Solver::new().calc_next(
                    &input,
                    SolveTarget::OutOfPlace {
                        src: &src,
                        trg: &mut trg,
                    },
                    &mut extra,
                );

                for value in trg.cells() {
                    assert!(
                        (value - 0.42).abs() < 1e-5,
                        "{technique:?}/{method:?} disturbed a flat sheet"
                    );
                }
            }
        }
    }

    #[test]
    fn it_solves_in_place_for_the_interleave() {
        let mut trg = sheet_from(3, 1, &[0.0, 1.0, 0.0]);
        let mut extra = Sheet::new();

        let mut input = params(Technique::OrthoInterleave, Method::Forward);
        input.set_rates(0.25, 0.0);

        let mut solver = Solver::new();
        solver.calc_next(&input, SolveTarget::InPlace(&mut trg), &mut extra);

        assert_cells_eq(&trg, &[0.25, 0.5, 0.25]);
        // ortho resets an unused extra sheet
        assert!(extra.is_reset());
        assert_eq!(
            solver.status().last_solve_saved(),
            LastSolveSaved::NotSaved
        );
    }

    #[test]
    fn it_saves_history_for_an_in_place_solve_when_extra_is_ready() {
        let mut trg = sheet_from(3, 1, &[0.0, 1.0, 0.0]);
        let mut extra = Sheet::new();
        assert!(extra.set_xy_counts(3, 1, 0.0));

        let mut input = params(Technique::OrthoInterleave, Method::Forward);
        input.set_rates(0.25, 0.0);

        let mut solver = Solver::new();
        solver.calc_next(&input, SolveTarget::InPlace(&mut trg), &mut extra);

        assert_cells_eq(&trg, &[0.25, 0.5, 0.25]);
        // the pre-solve field survived in extra
        assert_cells_eq(&extra, &[0.0, 1.0, 0.0]);
        assert!(solver.status().was_extra_used());
        assert_eq!(
            solver.status().last_solve_saved(),
            LastSolveSaved::InExtra
        );
    }

    #[test]
    fn it_matches_two_single_passes_with_one_multi_pass_solve() {
        let src = sheet_from(4, 4, &[0.1, 0.9, 0.3, 0.4, 0.0, 0.2, 0.8, 0.1, 0.5, 0.5, 0.5, 0.6, 0.7, 0.0, 0.2, 0.3]);

        let mut input = params(Technique::Simultaneous2d, Method::Forward);
        input.set_rates(0.2, 0.1);

        // two explicit single passes
        let mut step_1 = Sheet::new();
        assert!(step_1.set_xy_counts(4, 4, 0.0));
        let mut step_2 = Sheet::new();
        assert!(step_2.set_xy_counts(4, 4, 0.0));
        let mut scratch = Sheet::new();
        let mut solver = Solver::new();
        solver.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut step_1,
            },
            &mut scratch,
        );
        solver.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &step_1,
                trg: &mut step_2,
            },
            &mut scratch,
        );

        // one solve with an extra pass
        input.set_extra_pass_count(1);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(4, 4, 0.0));
        let mut extra = Sheet::new();
        let mut multi = Solver::new();
        multi.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert_cells_eq(&trg, step_2.cells());
        // the intermediate generation is returned in extra
        assert_cells_eq(&extra, step_1.cells());
        assert!(multi.status().was_extra_used());
        assert!(multi.status().was_extra_sized());
        assert_eq!(multi.status().solve_count(), 2);
        assert_eq!(multi.status().last_solve_saved(), LastSolveSaved::InExtra);
    }

    #[test]
    fn it_masks_extra_passes_when_disabled() {
        let src = sheet_from(3, 3, &[0.5; 9]);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(3, 3, 0.0));
        let mut extra = Sheet::new();

        let mut input = params(Technique::Simultaneous2d, Method::Forward);
        input.set_extra_pass_count(5);
        input.set_extra_passes_disabled(true);

        let mut solver = Solver::new();
        solver.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert_eq!(solver.status().solve_count(), 1);
        assert!(!solver.status().was_extra_sized());
    }

    #[test]
    fn it_chains_wave_generations_across_passes() {
        // u0 in trg, u1 in src; two passes must equal two chained solves
        let u1 = sheet_from(7, 1, &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let u0 = u1.clone();

        let mut input = params(Technique::WaveWithDamping, Method::Forward);
        input.set_rates(0.25, 0.0);
        input.set_damping(0.0);

        // manual: u2 = step(u1 over u0), u3 = step(u2 over u1)
        let mut manual = Solver::new();
        let mut u2 = u0.clone();
        let mut unused = Sheet::new();
        manual.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &u1,
                trg: &mut u2,
            },
            &mut unused,
        );
        let mut u3 = u1.clone();
        manual.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &u2,
                trg: &mut u3,
            },
            &mut unused,
        );

        // multi-pass: one call, extra_pass_count = 1
        input.set_extra_pass_count(1);
        let mut trg = u0.clone();
        let mut extra = Sheet::new();
        let mut solver = Solver::new();
        solver.calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &u1,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert_cells_eq(&trg, u3.cells());
        assert_cells_eq(&extra, u2.cells());

        // the undamped wave conserves the total exactly when it starts
        // from rest
        let total: f32 = trg.cells().iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn it_agrees_between_simultaneous_and_fully_damped_wave() {
        let src = sheet_from(5, 4, &[0.3, 0.1, 0.7, 0.2, 0.9, 0.4, 0.6, 0.0, 0.5, 0.8, 0.2, 0.2, 0.1, 0.9, 0.3, 0.4, 0.6, 0.7, 0.0, 0.5]);

        let mut sim_trg = Sheet::new();
        assert!(sim_trg.set_xy_counts(5, 4, 0.0));
        let mut wave_trg = Sheet::new();
        assert!(wave_trg.set_xy_counts(5, 4, 0.0));
        let mut extra = Sheet::new();

        let mut sim = params(Technique::Simultaneous2d, Method::Central);
        sim.set_rates(0.15, 0.1);
        Solver::new().calc_next(
            &sim,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut sim_trg,
            },
            &mut extra,
        );

        let mut wave = params(Technique::WaveWithDamping, Method::Central);
        wave.set_rates(0.15, 0.1);
        wave.set_damping(1.0);
        Solver::new().calc_next(
            &wave,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut wave_trg,
            },
            &mut extra,
        );

        assert_cells_eq(&sim_trg, wave_trg.cells());
    }

    #[test]
    fn it_matches_serial_and_parallel_dispatch() {
        let mut src = Sheet::new();
        assert!(src.set_xy_counts(24, 17, 0.0));
        assert!(src.fill_bell_curve(11.0, 8.0, 4.0, 3.0, -0.5, 1.0));

        for method in [Method::Forward, Method::Backward, Method::Central] {
            let mut serial_trg = Sheet::new();
            assert!(serial_trg.set_xy_counts(24, 17, 0.0));
            let mut parallel_trg = Sheet::new();
            assert!(parallel_trg.set_xy_counts(24, 17, 0.0));
            let mut extra = Sheet::new();

            let mut input = params(Technique::Simultaneous2d, method);
            input.set_rates(0.2, 0.2);

            Solver::new().calc_next(
                &input,
                SolveTarget::OutOfPlace {
                    src: &src,
                    trg: &mut serial_trg,
                },
                &mut extra,
            );

            input.set_parallel(true);
            Solver::new().calc_next(
                &input,
                SolveTarget::OutOfPlace {
                    src: &src,
                    trg: &mut parallel_trg,
                },
                &mut extra,
            );

            for (a, b) in serial_trg.cells().iter().zip(parallel_trg.cells()) {
                assert!((a - b).abs() < 1e-6, "{method:?} diverged across dispatch");
            }
        }
    }

    #[test]
    fn it_clamps_a_runaway_sheet() {
        let src = sheet_from(3, 3, &[500.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -80.0]);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(3, 3, 0.0));
        let mut extra = Sheet::new();

        // a rate far past stable triggers the inspection
        let mut input = params(Technique::Simultaneous2d, Method::Forward);
        input.set_rates(0.9, 0.9);

        Solver::new().calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        let (min_value, max_value) = trg.get_min_max_values().unwrap();
        assert!(min_value >= -50.0 - 1e-3);
        assert!(max_value <= 50.0 + 1e-3);
    }

    #[test]
    fn it_flattens_a_flat_out_of_range_sheet() {
        let src = sheet_from(2, 2, &[400.0; 4]);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(2, 2, 0.0));
        let mut extra = Sheet::new();

        // zero rates keep the field flat; the negative rate flags it
        let mut input = params(Technique::Simultaneous2d, Method::Forward);
        input.set_rates(0.0, -0.1);

        Solver::new().calc_next(
            &input,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );

        assert!(trg.cells().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn it_couples_policy_bits_to_the_technique() {
        let mut input = InputParams::<f32>::default();
        assert!(input.set_technique(Technique::WaveWithDamping));
        assert!(input.copy_for_history() && input.size_for_history());
        assert!(!input.reset_extra_if_unused());

        assert!(input.set_technique(Technique::OrthoInterleave));
        assert!(input.copy_for_history());
        assert!(!input.size_for_history());
        assert!(input.reset_extra_if_unused());

        // unchanged assignment reports false
        assert!(!input.set_technique(Technique::OrthoInterleave));
        assert!(!input.set_rates(0.2, 0.2));
        assert!(input.set_rates(0.2, 0.3));
    }

    #[test]
    fn it_releases_buffers_for_explicit_solves() {
        let src = sheet_from(4, 4, &[0.5; 16]);
        let mut trg = Sheet::new();
        assert!(trg.set_xy_counts(4, 4, 0.0));
        let mut extra = Sheet::new();

        let mut solver = Solver::new();

        let mut implicit = params(Technique::Simultaneous2d, Method::Backward);
        implicit.set_rates(0.2, 0.2);
        solver.calc_next(
            &implicit,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );
        assert!(!solver.buf_a.is_empty());

        let mut explicit = params(Technique::Simultaneous2d, Method::Forward);
        explicit.set_rates(0.2, 0.2);
        solver.calc_next(
            &explicit,
            SolveTarget::OutOfPlace {
                src: &src,
                trg: &mut trg,
            },
            &mut extra,
        );
        assert!(solver.buf_a.is_empty());
        assert!(solver.buf_a.capacity() == 0);
    }
}
