//! Destructive Thomas solver for tridiagonal systems with constant sub-
//! and super-diagonals.
//!
//! The solver is a forward elimination followed by a backward substitution.
//! It reuses `diag` and `rhs` as scratch space, which is why the caller
//! hands them over as exclusive slices. The ordinary variant requires
//! diagonal dominance (`|b[i]| > |a| + |c|`); the extra-careful variant
//! substitutes a tiny value for exactly-zero pivots so that deliberately
//! out-of-range solve rates do not divide by zero. It is inaccurate by
//! construction and exists only so such experiments terminate; the solve
//! orchestrator clamps the resulting field afterwards.

use crate::{
    Scalar,
    cast,
    strider::LineMut,
};

/// How the solver stores results into the output line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Store {
    /// `out[i] = x[i]`
    Set,
    /// `out[i] += x[i]`
    Add,
}

impl Store {
    #[inline]
    pub(crate) fn apply<T>(self, out: &mut LineMut<'_, T>, index: usize, value: T)
    where
        T: Scalar,
    {
        match self {
            Store::Set => out.set(index, value),
            Store::Add => {
                let old = out.get(index);
                out.set(index, old + value);
            }
        }
    }
}

#[cfg(debug_assertions)]
fn assert_diagonally_dominant<T>(sub: T, diag: &[T], sup: T)
where
    T: Scalar,
{
    let n = diag.len();
    debug_assert!(diag[0].abs() > sup.abs());
    debug_assert!(diag[n - 1].abs() > sub.abs());
    let corner_sum = sub.abs() + sup.abs();
    for pivot in diag.iter().skip(1).take(n.saturating_sub(2)) {
        debug_assert!(pivot.abs() > corner_sum);
    }
}

/// Solves `M * x = rhs` where `M` has `sub` on the sub-diagonal, `diag` on
/// the main diagonal and `sup` on the super-diagonal, storing `x` into
/// `out` through `store`.
///
/// `diag` and `rhs` are used as scratch space and destroyed. The system
/// must be diagonally dominant (checked in debug builds).
pub fn solve_destructive<T>(
    store: Store,
    sub: T,
    diag: &mut [T],
    sup: T,
    rhs: &mut [T],
    out: &mut LineMut<'_, T>,
) where
    T: Scalar,
{
    let n = diag.len();
    debug_assert!(n >= 1);
    debug_assert_eq!(rhs.len(), n);
    debug_assert_eq!(out.count(), n);
    #[cfg(debug_assertions)]
    assert_diagonally_dominant(sub, diag, sup);

    for i in 1..n {
        let scale = sub / diag[i - 1];
        diag[i] = diag[i] - scale * sup;
        rhs[i] = rhs[i] - scale * rhs[i - 1];
    }

    let mut value = rhs[n - 1] / diag[n - 1];
    for i in (0..n - 1).rev() {
        store.apply(out, i + 1, value);
        value = (rhs[i] - sup * value) / diag[i];
    }
    store.apply(out, 0, value);
}

/// Like [`solve_destructive`] but never divides by zero: an exactly-zero
/// pivot is replaced by `1e-5`, and no dominance is checked.
pub fn solve_destructive_extra_careful<T>(
    store: Store,
    sub: T,
    diag: &mut [T],
    sup: T,
    rhs: &mut [T],
    out: &mut LineMut<'_, T>,
) where
    T: Scalar,
{
    let n = diag.len();
    debug_assert!(n >= 1);
    debug_assert_eq!(rhs.len(), n);
    debug_assert_eq!(out.count(), n);

    let small_pivot = cast::<T>(1.0e-5);
    let pivot = |value: T| if value == T::zero() { small_pivot } else { value };

    for i in 1..n {
        let scale = sub / pivot(diag[i - 1]);
        diag[i] = diag[i] - scale * sup;
        rhs[i] = rhs[i] - scale * rhs[i - 1];
    }

    let mut value = rhs[n - 1] / pivot(diag[n - 1]);
    for i in (0..n - 1).rev() {
        store.apply(out, i + 1, value);
        value = (rhs[i] - sup * value) / pivot(diag[i]);
    }
    store.apply(out, 0, value);
}

// _______________________________________________________________________

#[cfg(test)]
mod tests {
    use super::*;

    /// `M * x` for a tridiagonal matrix with constant off-diagonals.
    fn multiply(sub: f64, diag: &[f64], sup: f64, x: &[f64]) -> Vec<f64> {
        let n = diag.len();
        (0..n)
            .map(|i| {
                let mut sum = diag[i] * x[i];
                if i > 0 {
                    sum += sub * x[i - 1];
                }
                if i + 1 < n {
                    sum += sup * x[i + 1];
                }
                sum
            })
            .collect()
    }

    fn solve(sub: f64, diag: &[f64], sup: f64, rhs: &[f64]) -> Vec<f64> {
        let mut diag_scratch = diag.to_vec();
        let mut rhs_scratch = rhs.to_vec();
        let mut out = vec![0.0; diag.len()];
        solve_destructive(
            Store::Set,
            sub,
            &mut diag_scratch,
            sup,
            &mut rhs_scratch,
            &mut LineMut::from_slice(&mut out),
        );
        out
    }

    #[test]
    fn it_solves_a_single_cell() {
        assert_eq!(solve(0.0, &[2.0], 0.0, &[3.0]), vec![1.5]);
    }

    #[test]
    fn it_solves_diagonally_dominant_systems() {
        let sub = -0.3;
        let sup = -0.3;
        let diag = [1.3, 1.6, 1.6, 1.6, 1.3];
        let rhs = [0.7, 0.1, -0.5, 1.9, 0.25];

        let x = solve(sub, &diag, sup, &rhs);
        let back = multiply(sub, &diag, sup, &x);
        for (computed, expected) in back.iter().zip(rhs.iter()) {
            assert!((computed - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn it_matches_a_known_solution() {
        // [2 1 0; 1 3 1; 0 1 2] * [1, 2, 3] = [4, 10, 8]
        let x = solve(1.0, &[2.0, 3.0, 2.0], 1.0, &[4.0, 10.0, 8.0]);
        for (computed, expected) in x.iter().zip([1.0, 2.0, 3.0]) {
            assert!((computed - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn it_accumulates_through_the_add_store() {
        let mut diag = vec![2.0_f64, 2.0];
        let mut rhs = vec![2.0_f64, 4.0];
        let mut out = vec![10.0_f64, 10.0];
        solve_destructive(
            Store::Add,
            0.0,
            &mut diag,
            0.0,
            &mut rhs,
            &mut LineMut::from_slice(&mut out),
        );
        assert_eq!(out, vec![11.0, 12.0]);
    }

    #[test]
    fn it_survives_zero_pivots_in_the_careful_variant() {
        let mut diag = vec![0.0_f64, 0.0, 0.0];
        let mut rhs = vec![1.0_f64, 1.0, 1.0];
        let mut out = vec![0.0_f64; 3];
        solve_destructive_extra_careful(
            Store::Set,
            -1.0,
            &mut diag,
            -1.0,
            &mut rhs,
            &mut LineMut::from_slice(&mut out),
        );
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn it_agrees_with_the_plain_variant_on_legal_systems() {
        let sub = -0.2;
        let sup = -0.2;
        let diag = [1.4, 1.4, 1.4, 1.4];
        let rhs = [1.0, 0.0, 0.0, 1.0];

        let plain = solve(sub, &diag, sup, &rhs);

        let mut diag_scratch = diag.to_vec();
        let mut rhs_scratch = rhs.to_vec();
        let mut careful = vec![0.0; 4];
        solve_destructive_extra_careful(
            Store::Set,
            sub,
            &mut diag_scratch,
            sup,
            &mut rhs_scratch,
            &mut LineMut::from_slice(&mut careful),
        );

        for (a, b) in plain.iter().zip(careful.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
