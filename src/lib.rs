//! 2-D finite-difference solver for heat and wave equations on a
//! rectangular scalar field (a "sheet").
//!
//! The crate is layered bottom-up:
//!
//! - [`strider`]: nestable strided views over the sheet's flat storage,
//!   giving row-major, column-major and sub-rectangle traversal without
//!   copying.
//! - [`walker`]: resolution-changing line copies that preserve either the
//!   sum or the area of the copied field.
//! - [`sheet`]: the owned scalar grid and its bulk operations.
//! - [`tridiag`]: the destructive Thomas solver used by the implicit
//!   schemes.
//! - [`stencil`]: one-step forward/backward/central difference kernels.
//! - [`dispatch`]: serial or thread-pool fan-out of a kernel over the lines
//!   of a sheet.
//! - [`solver`]: the multi-pass orchestrator tying schemes, techniques and
//!   scratch buffers together.
//! - [`executor`]: a worker-thread controller so the solve never blocks the
//!   caller's thread and can be cancelled cooperatively.

use std::fmt::Debug;

use num::Float;

pub mod dispatch;
pub mod executor;
pub mod sheet;
pub mod solver;
pub mod stencil;
pub mod strider;
pub mod tridiag;
pub mod walker;

pub use crate::{
    dispatch::{
        LineForEach,
        MultiThreaded,
        SingleThreaded,
    },
    executor::{
        Executor,
        Sheets,
        SubmitError,
    },
    sheet::Sheet,
    solver::{
        InputParams,
        LastSolveSaved,
        Method,
        SolveStatus,
        SolveTarget,
        Solver,
        Technique,
    },
    stencil::AssignMode,
    walker::LineWalker,
};

/// Element type of a sheet.
///
/// `f32` is the reference instantiation; `f64` is available when the extra
/// precision is worth the bandwidth.
pub trait Scalar: Float + Debug + Default + Send + Sync + 'static {}

impl Scalar for f32 {}
impl Scalar for f64 {}

/// Converts an `f64` constant into the element type.
///
/// Only used for literal constants (clamp thresholds, the small-pivot
/// substitute), which are representable in every `Scalar` impl.
pub(crate) fn cast<T>(value: f64) -> T
where
    T: Scalar,
{
    T::from(value).expect("constant is representable in the element type")
}
