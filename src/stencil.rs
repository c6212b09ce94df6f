//! One-step finite-difference kernels over single lines of a sheet.
//!
//! Every kernel walks one line of the source and writes the matching line
//! of the target. How a stencil value lands in the target is decided by
//! [`AssignMode`]: plain set, accumulate, or the wave blend that folds the
//! previous two generations together. The solve techniques compose whole
//! 2-D steps out of these pieces; see the solver module.
//!
//! Edges never leak: a missing neighbour is simply omitted from the stencil
//! and its share stays in the cell. Rates are taken as-is — the caller is
//! allowed to experiment with unstable values, and negative rates are
//! routed to the division-safe tridiagonal solver.

use crate::{
    Scalar,
    strider::{
        Line,
        LineMut,
    },
    tridiag::{
        self,
        Store,
    },
};

/// How a kernel's stencil value combines into the target cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AssignMode<T> {
    /// `trg = stencil`
    Set,
    /// `trg += stencil`
    Add,
    /// `trg = stencil + (1 - damping) * (src - trg)`, where `trg` still
    /// holds the generation before `src`. Damping 1 reduces to `Set`
    /// (pure diffusion), damping 0 keeps all the momentum.
    Wave(T),
}

impl<T> AssignMode<T>
where
    T: Scalar,
{
    #[inline]
    fn blend(self, trg: &mut LineMut<'_, T>, index: usize, src: T, stencil: T) {
        match self {
            AssignMode::Set => trg.set(index, stencil),
            AssignMode::Add => {
                let old = trg.get(index);
                trg.set(index, old + stencil);
            }
            AssignMode::Wave(damping) => {
                if damping == T::one() {
                    trg.set(index, stencil);
                }
                else if damping == T::zero() {
                    let old = trg.get(index);
                    trg.set(index, stencil + src - old);
                }
                else {
                    let old = trg.get(index);
                    trg.set(index, stencil + (T::one() - damping) * (src - old));
                }
            }
        }
    }
}

// _______________________________________________________________________
// Explicit forward difference

/// One forward-difference step along a single line.
///
/// `base` is 1 for a forward-diff step; base 2 turns the same walk into the
/// Crank–Nicolson right-hand side. A one-cell line copies (nothing leaks
/// off the ends). Works in place: the three-cell window is carried by
/// value, so reads stay ahead of writes.
pub fn forward_line<T>(
    mode: AssignMode<T>,
    base: T,
    rate: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) where
    T: Scalar,
{
    let n = src.count();
    debug_assert_eq!(n, trg.count());
    if n == 0 {
        return;
    }

    let carry_edge = base - rate;
    let carry_middle = carry_edge - rate;

    let mut src_0 = src.get(0);
    if n == 1 {
        mode.blend(trg, 0, src_0, src_0);
        return;
    }

    let mut src_1 = src.get(1);
    mode.blend(trg, 0, src_0, carry_edge * src_0 + rate * src_1);

    for i in 1..n - 1 {
        let src_2 = src.get(i + 1);
        mode.blend(trg, i, src_1, carry_middle * src_1 + rate * (src_0 + src_2));
        src_0 = src_1;
        src_1 = src_2;
    }

    mode.blend(trg, n - 1, src_1, carry_edge * src_1 + rate * src_0);
}

/// Forward difference for an interior row of a 2-D solve: the line stencil
/// plus `rate_side` times the two adjacent rows, advanced in lock step.
pub fn forward_2d_middle<T>(
    mode: AssignMode<T>,
    rate: T,
    rate_side: T,
    src: Line<'_, T>,
    side_a: Line<'_, T>,
    side_b: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) where
    T: Scalar,
{
    let n = src.count();
    debug_assert_eq!(n, trg.count());
    debug_assert_eq!(n, side_a.count());
    debug_assert_eq!(n, side_b.count());
    if n == 0 {
        return;
    }

    let carry_edge = T::one() - (rate + rate_side + rate_side);
    let carry_middle = carry_edge - rate;
    let side = |i: usize| (side_a.get(i) + side_b.get(i)) * rate_side;

    let mut src_0 = src.get(0);
    if n == 1 {
        mode.blend(trg, 0, src_0, src_0 + side(0));
        return;
    }

    let mut src_1 = src.get(1);
    mode.blend(trg, 0, src_0, carry_edge * src_0 + rate * src_1 + side(0));

    for i in 1..n - 1 {
        let src_2 = src.get(i + 1);
        mode.blend(
            trg,
            i,
            src_1,
            carry_middle * src_1 + rate * (src_0 + src_2) + side(i),
        );
        src_0 = src_1;
        src_1 = src_2;
    }

    mode.blend(trg, n - 1, src_1, carry_edge * src_1 + rate * src_0 + side(n - 1));
}

/// Forward difference for the top or bottom row, which has one side
/// neighbour only.
pub fn forward_2d_edge<T>(
    mode: AssignMode<T>,
    rate: T,
    rate_side: T,
    src: Line<'_, T>,
    side_line: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
) where
    T: Scalar,
{
    let n = src.count();
    debug_assert_eq!(n, trg.count());
    debug_assert_eq!(n, side_line.count());
    if n == 0 {
        return;
    }

    let carry_edge = T::one() - (rate + rate_side);
    let carry_middle = carry_edge - rate;
    let side = |i: usize| side_line.get(i) * rate_side;

    let mut src_0 = src.get(0);
    if n == 1 {
        mode.blend(trg, 0, src_0, src_0 + side(0));
        return;
    }

    let mut src_1 = src.get(1);
    mode.blend(trg, 0, src_0, carry_edge * src_0 + rate * src_1 + side(0));

    for i in 1..n - 1 {
        let src_2 = src.get(i + 1);
        mode.blend(
            trg,
            i,
            src_1,
            carry_middle * src_1 + rate * (src_0 + src_2) + side(i),
        );
        src_0 = src_1;
        src_1 = src_2;
    }

    mode.blend(trg, n - 1, src_1, carry_edge * src_1 + rate * src_0 + side(n - 1));
}

// _______________________________________________________________________
// Implicit schemes

/// Pre-scales the target so the tridiagonal solve can accumulate on top:
/// `trg = damping * (trg - src) - trg`, with the exact branches for the
/// all-momentum and no-momentum endpoints.
pub fn init_wave_damping<T>(damping: T, src: Line<'_, T>, trg: &mut LineMut<'_, T>)
where
    T: Scalar,
{
    let n = src.count();
    debug_assert_eq!(n, trg.count());

    if damping == T::zero() {
        for i in 0..n {
            let old = trg.get(i);
            trg.set(i, -old);
        }
    }
    else if damping == T::one() {
        for i in 0..n {
            trg.set(i, -src.get(i));
        }
    }
    else {
        for i in 0..n {
            let old = trg.get(i);
            trg.set(i, damping * (old - src.get(i)) - old);
        }
    }
}

/// Fills the main diagonal for an implicit solve: `base + 2*rate` in the
/// interior, `base + rate` at the two insulated ends.
pub fn fill_matrix_diagonal<T>(base: T, rate: T, diag: &mut [T])
where
    T: Scalar,
{
    let n = diag.len();
    if n == 0 {
        return;
    }
    let carry_edge = base + rate;
    let carry_middle = carry_edge + rate;

    diag[0] = carry_edge;
    if n > 1 {
        for pivot in &mut diag[1..n - 1] {
            *pivot = carry_middle;
        }
        diag[n - 1] = carry_edge;
    }
}

/// Runs the tridiagonal solve with `-rate` off-diagonals. Negative rates
/// make the system lose dominance, so they go through the division-safe
/// variant; the orchestrator clamps the sheet afterwards.
fn solve_matrix_destructive<T>(
    store: Store,
    rate: T,
    diag: &mut [T],
    rhs: &mut [T],
    trg: &mut LineMut<'_, T>,
) where
    T: Scalar,
{
    if rate >= T::zero() {
        tridiag::solve_destructive(store, -rate, diag, -rate, rhs, trg);
    }
    else {
        tridiag::solve_destructive_extra_careful(store, -rate, diag, -rate, rhs, trg);
    }
}

fn init_damping_and_solve<T>(
    mode: AssignMode<T>,
    rate: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
    diag: &mut [T],
    rhs: &mut [T],
) where
    T: Scalar,
{
    match mode {
        AssignMode::Set => solve_matrix_destructive(Store::Set, rate, diag, rhs, trg),
        AssignMode::Add => solve_matrix_destructive(Store::Add, rate, diag, rhs, trg),
        AssignMode::Wave(damping) => {
            init_wave_damping(damping, src, trg);
            solve_matrix_destructive(Store::Add, rate, diag, rhs, trg);
        }
    }
}

/// One backward-difference (implicit) step along a single line.
///
/// Copies the source into `buf_rhs`, fills `buf_diag` with the base-1
/// diagonal and solves. `trg` must not overlap the buffers; it may overlap
/// `src` only in `Set` mode, since the wave blends read the old target.
pub fn backward_line<T>(
    mode: AssignMode<T>,
    rate: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
    buf_rhs: &mut [T],
    buf_diag: &mut [T],
) where
    T: Scalar,
{
    let n = src.count();
    debug_assert_eq!(n, trg.count());
    debug_assert!(buf_rhs.len() >= n && buf_diag.len() >= n);
    if n == 0 {
        return;
    }

    let rhs = &mut buf_rhs[..n];
    let diag = &mut buf_diag[..n];
    for (cell, value) in rhs.iter_mut().zip(src.iter()) {
        *cell = value;
    }
    fill_matrix_diagonal(T::one(), rate, diag);

    init_damping_and_solve(mode, rate, src, trg, diag, rhs);
}

/// One central-difference (Crank–Nicolson) step along a single line.
///
/// Identical to [`backward_line`] except the right-hand side is the base-2
/// explicit stencil of the source and the diagonal is base 2.
pub fn central_line<T>(
    mode: AssignMode<T>,
    rate: T,
    src: Line<'_, T>,
    trg: &mut LineMut<'_, T>,
    buf_rhs: &mut [T],
    buf_diag: &mut [T],
) where
    T: Scalar,
{
    let n = src.count();
    debug_assert_eq!(n, trg.count());
    debug_assert!(buf_rhs.len() >= n && buf_diag.len() >= n);
    if n == 0 {
        return;
    }

    let two = T::one() + T::one();
    let rhs = &mut buf_rhs[..n];
    let diag = &mut buf_diag[..n];

    forward_line(
        AssignMode::Set,
        two,
        rate,
        src,
        &mut LineMut::from_slice(rhs),
    );
    fill_matrix_diagonal(two, rate, diag);

    init_damping_and_solve(mode, rate, src, trg, diag, rhs);
}

// _______________________________________________________________________
