//! Fans a per-line kernel out over every line of a 2-D range.
//!
//! The threading choice is a trait so the solver can hold one serial and
//! one pooled dispatcher and pick per pass. Lines are independent: each
//! task owns exactly one target line (and, for the implicit schemes, an
//! exclusive strip of the scratch buffers), so no synchronisation happens
//! inside a pass. The dispatch blocks until every line is done.
//!
//! Cancellation is coarse: each task reads the shared early-exit flag once
//! at start and returns without writing if it is set.

use std::{
    fmt::Debug,
    marker::PhantomData,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
};

use crate::{
    Scalar,
    strider::{
        Grid,
        GridMut,
        Line,
        LineMut,
    },
};

/// Runs a closure once per line index, serially or on a worker pool.
pub trait LineForEach: Debug + Send + Sync {
    fn for_each_line(&self, line_count: usize, f: &(dyn Fn(usize) + Send + Sync));
}

/// In-thread dispatch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleThreaded;

impl LineForEach for SingleThreaded {
    fn for_each_line(&self, line_count: usize, f: &(dyn Fn(usize) + Send + Sync)) {
        for index in 0..line_count {
            f(index);
        }
    }
}

/// Worker-pool dispatch.
#[cfg(feature = "rayon")]
#[derive(Clone, Debug, Default)]
pub struct MultiThreaded {
    thread_pool: Option<std::sync::Arc<rayon::ThreadPool>>,
}

#[cfg(feature = "rayon")]
impl MultiThreaded {
    /// Use the default number of threads (see [`rayon::current_num_threads`]).
    pub fn from_default_thread_pool() -> Self {
        Self { thread_pool: None }
    }

    pub fn from_num_threads(num_threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        Ok(Self::from_thread_pool(
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()?,
        ))
    }

    pub fn from_thread_pool(thread_pool: rayon::ThreadPool) -> Self {
        Self {
            thread_pool: Some(std::sync::Arc::new(thread_pool)),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.thread_pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |thread_pool| {
                thread_pool.current_num_threads()
            })
    }
}

#[cfg(feature = "rayon")]
impl LineForEach for MultiThreaded {
    fn for_each_line(&self, line_count: usize, f: &(dyn Fn(usize) + Send + Sync)) {
        use rayon::iter::{
            IntoParallelIterator as _,
            ParallelIterator as _,
        };

        let run = || (0..line_count).into_par_iter().for_each(|index| f(index));

        if let Some(thread_pool) = &self.thread_pool {
            thread_pool.install(run);
        }
        else {
            run();
        }
    }
}

/// Fallback when compiled without rayon: same dispatch, one thread.
#[cfg(not(feature = "rayon"))]
#[derive(Clone, Copy, Debug, Default)]
pub struct MultiThreaded;

#[cfg(not(feature = "rayon"))]
impl MultiThreaded {
    pub fn from_default_thread_pool() -> Self {
        Self
    }
}

#[cfg(not(feature = "rayon"))]
impl LineForEach for MultiThreaded {
    fn for_each_line(&self, line_count: usize, f: &(dyn Fn(usize) + Send + Sync)) {
        SingleThreaded.for_each_line(line_count, f);
    }
}

// _______________________________________________________________________
// Scratch strips

/// Hands each task a fixed-length strip of a scratch buffer.
///
/// A per-line layout (stride == strip length) gives every task exclusive
/// scratch; a shared layout (stride 0) reuses one strip and is only valid
/// with serial dispatch, where tasks run one after another.
pub(crate) struct Strips<'a, T> {
    ptr: *mut T,
    buf_len: usize,
    stride: usize,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<'a, T> Send for Strips<'a, T> where T: Send {}
unsafe impl<'a, T> Sync for Strips<'a, T> where T: Send + Sync {}

impl<'a, T> Strips<'a, T> {
    pub fn shared(buf: &'a mut [T], len: usize) -> Self {
        debug_assert!(buf.len() >= len);
        Self {
            ptr: buf.as_mut_ptr(),
            buf_len: buf.len(),
            stride: 0,
            len,
            _marker: PhantomData,
        }
    }

    pub fn per_line(buf: &'a mut [T], len: usize) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            buf_len: buf.len(),
            stride: len,
            len,
            _marker: PhantomData,
        }
    }

    /// Safety: each index goes to at most one live task, and a stride-0
    /// layout is only used under serial dispatch.
    unsafe fn strip(&self, index: usize) -> &'a mut [T] {
        let offset = index * self.stride;
        debug_assert!(offset + self.len <= self.buf_len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), self.len) }
    }
}

// _______________________________________________________________________
// Drivers

/// Applies `kernel` to every (src line, trg line) pair.
///
/// The kernel also receives the line index so 2-D stencils can read the
/// neighbouring source lines.
pub(crate) fn map_lines<T, K>(
    threading: &dyn LineForEach,
    early_exit: &AtomicBool,
    src: Grid<'_, T>,
    trg: GridMut<'_, T>,
    kernel: K,
) where
    T: Scalar,
    K: Fn(usize, Line<'_, T>, LineMut<'_, T>) + Send + Sync,
{
    debug_assert_eq!(src.count(), trg.count());
    debug_assert_eq!(src.inner_count(), trg.inner_count());

    threading.for_each_line(src.count(), &|index| {
        if early_exit.load(Ordering::Relaxed) {
            return;
        }
        let src_line = src.line(index);
        let trg_line = unsafe { trg.line_unchecked(index) };
        kernel(index, src_line, trg_line);
    });
}

/// Like [`map_lines`], with two exclusive scratch strips per task.
pub(crate) fn map_lines_buffered<T, K>(
    threading: &dyn LineForEach,
    early_exit: &AtomicBool,
    src: Grid<'_, T>,
    trg: GridMut<'_, T>,
    strips_a: Strips<'_, T>,
    strips_b: Strips<'_, T>,
    kernel: K,
) where
    T: Scalar,
    K: Fn(usize, Line<'_, T>, LineMut<'_, T>, &mut [T], &mut [T]) + Send + Sync,
{
    debug_assert_eq!(src.count(), trg.count());
    debug_assert_eq!(src.inner_count(), trg.inner_count());

    threading.for_each_line(src.count(), &|index| {
        if early_exit.load(Ordering::Relaxed) {
            return;
        }
        let src_line = src.line(index);
        let trg_line = unsafe { trg.line_unchecked(index) };
        let strip_a = unsafe { strips_a.strip(index) };
        let strip_b = unsafe { strips_b.strip(index) };
        kernel(index, src_line, trg_line, strip_a, strip_b);
    });
}

// _______________________________________________________________________
