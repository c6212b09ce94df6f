//! Worker-thread control for the solver.
//!
//! The [`Executor`] owns the three sheets and the solver behind a lock and
//! runs every solve on a single long-lived worker thread, so the caller's
//! thread never blocks on a solve. Submitting is a non-blocking channel
//! send; completion comes back through an optional callback carrying the
//! wall-clock duration, after the busy flag has cleared. At most one job is
//! ever in flight.
//!
//! Shutdown is cooperative: dropping the executor raises the early-exit
//! flag (which any in-flight solve observes between lines), posts a quit
//! command and joins the worker.

use std::{
    ops::{
        Deref,
        DerefMut,
    },
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
        mpsc,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::Instant,
};

use parking_lot::{
    Mutex,
    RwLock,
    RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::{
    Scalar,
    sheet::Sheet,
    solver::{
        InputParams,
        Method,
        SolveStatus,
        SolveTarget,
        Solver,
        Technique,
    },
};

/// The three sheets one solve works on. `src` is read-only during a solve;
/// `trg` and `extra` are written.
#[derive(Clone, Debug, Default)]
pub struct Sheets<T = f32> {
    pub src: Sheet<T>,
    pub trg: Sheet<T>,
    pub extra: Sheet<T>,
}

/// Why a job submission was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("a solve is already in flight")]
    Busy,
    #[error("the executor is shutting down")]
    ShuttingDown,
}

#[derive(Debug)]
struct State<T> {
    sheets: Sheets<T>,
    solver: Solver<T>,
}

#[derive(derive_more::Debug)]
struct Shared {
    busy: AtomicBool,
    exiting: AtomicBool,
    early_exit: Arc<AtomicBool>,
    /// -1 until a duration has been recorded.
    last_duration: Mutex<f64>,
    #[debug(ignore)]
    on_finished: Mutex<Option<Box<dyn FnMut(f64) + Send>>>,
}

enum Command<T> {
    Solve {
        params: InputParams<T>,
        in_place: bool,
    },
    Quit,
}

#[derive(Debug)]
struct Worker<T> {
    command_tx: mpsc::Sender<Command<T>>,
    join_handle: JoinHandle<()>,
}

/// Controls the solve worker thread. Created with the sheets it will own;
/// the worker itself is spawned lazily by the first submitted job.
#[derive(Debug)]
pub struct Executor<T = f32>
where
    T: Scalar,
{
    state: Arc<RwLock<State<T>>>,
    shared: Arc<Shared>,
    params: Mutex<InputParams<T>>,
    worker: Mutex<Option<Worker<T>>>,
}

impl<T> Executor<T>
where
    T: Scalar,
{
    pub fn new(sheets: Sheets<T>) -> Self {
        let solver = Solver::new();
        let early_exit = solver.status().early_exit_handle();

        Self {
            state: Arc::new(RwLock::new(State { sheets, solver })),
            shared: Arc::new(Shared {
                busy: AtomicBool::new(false),
                exiting: AtomicBool::new(false),
                early_exit,
                last_duration: Mutex::new(-1.0),
                on_finished: Mutex::new(None),
            }),
            params: Mutex::new(InputParams::default()),
            worker: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------
    // Sheet and status access

    /// Read access to the sheets and the last solve's status. Do not hold
    /// guards across a submit; the worker needs the write side.
    pub fn read(&self) -> ReadGuard<'_, T> {
        ReadGuard {
            guard: self.state.read(),
        }
    }

    /// Write access to the sheets, for seeding and resizing between
    /// solves.
    pub fn write(&self) -> WriteGuard<'_, T> {
        WriteGuard {
            guard: self.state.write(),
        }
    }

    // -------------------------------------------------------------------
    // Job control

    /// Submits one solve of `src -> trg`. Non-blocking; the worker picks
    /// the job up with a snapshot of the current parameters.
    pub fn calc_next(&self, extra_passes_disabled: bool) -> Result<(), SubmitError> {
        self.submit(false, extra_passes_disabled)
    }

    /// Submits one in-place solve of `trg`. Only meaningful with
    /// [`Technique::OrthoInterleave`].
    pub fn calc_next_in_place(&self, extra_passes_disabled: bool) -> Result<(), SubmitError> {
        self.submit(true, extra_passes_disabled)
    }

    fn submit(&self, in_place: bool, extra_passes_disabled: bool) -> Result<(), SubmitError> {
        if self.is_going_down() {
            return Err(SubmitError::ShuttingDown);
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SubmitError::Busy);
        }

        let params = {
            let mut params = self.params.lock();
            params.set_extra_passes_disabled(extra_passes_disabled);
            params.clone()
        };

        let mut worker = self.worker.lock();
        let worker = worker.get_or_insert_with(|| {
            spawn_worker(self.state.clone(), self.shared.clone())
        });

        if worker
            .command_tx
            .send(Command::Solve { params, in_place })
            .is_err()
        {
            self.shared.busy.store(false, Ordering::Release);
            return Err(SubmitError::ShuttingDown);
        }
        Ok(())
    }

    /// Callback invoked on the worker thread after each solve, once the
    /// executor is idle again. Receives the wall-clock duration in
    /// seconds.
    pub fn set_on_finished<F>(&self, on_finished: F)
    where
        F: FnMut(f64) + Send + 'static,
    {
        *self.shared.on_finished.lock() = Some(Box::new(on_finished));
    }

    /// Asks an in-flight solve to abandon its work. The target sheet
    /// contents are undefined afterwards.
    pub fn request_early_exit(&self) {
        self.shared.early_exit.store(true, Ordering::Relaxed);
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn is_going_down(&self) -> bool {
        self.shared.exiting.load(Ordering::Relaxed)
            || self.shared.early_exit.load(Ordering::Relaxed)
    }

    /// Duration of the last completed solve in seconds, -1 before any
    /// solve has completed.
    pub fn last_duration_seconds(&self) -> f64 {
        *self.shared.last_duration.lock()
    }

    // -------------------------------------------------------------------
    // Parameter setters; each reports whether the value changed

    pub fn set_technique(&self, technique: Technique) -> bool {
        self.params.lock().set_technique(technique)
    }

    pub fn set_method(&self, method: Method) -> bool {
        self.params.lock().set_method(method)
    }

    pub fn set_parallel(&self, parallel: bool) -> bool {
        self.params.lock().set_parallel(parallel)
    }

    pub fn set_damping(&self, damping: T) -> bool {
        self.params.lock().set_damping(damping)
    }

    pub fn set_rates(&self, rate_x: T, rate_y: T) -> bool {
        self.params.lock().set_rates(rate_x, rate_y)
    }

    pub fn set_extra_pass_count(&self, extra_pass_count: usize) -> bool {
        self.params.lock().set_extra_pass_count(extra_pass_count)
    }

    pub fn params(&self) -> InputParams<T> {
        self.params.lock().clone()
    }
}

impl<T> Drop for Executor<T>
where
    T: Scalar,
{
    fn drop(&mut self) {
        self.shared.exiting.store(true, Ordering::Relaxed);
        self.shared.early_exit.store(true, Ordering::Relaxed);

        if let Some(worker) = self.worker.lock().take() {
            // the worker drains the in-flight job (cut short by the
            // early-exit flag), then sees the quit and returns
            let _ = worker.command_tx.send(Command::Quit);
            if worker.join_handle.join().is_err() {
                tracing::warn!("solver worker thread panicked during shutdown");
            }
        }
    }
}

fn spawn_worker<T>(state: Arc<RwLock<State<T>>>, shared: Arc<Shared>) -> Worker<T>
where
    T: Scalar,
{
    let (command_tx, command_rx) = mpsc::channel();

    let join_handle = thread::spawn(move || {
        run_worker(command_rx, state, shared);
    });
    tracing::debug!("solver worker thread started");

    Worker {
        command_tx,
        join_handle,
    }
}

fn run_worker<T>(
    command_rx: mpsc::Receiver<Command<T>>,
    state: Arc<RwLock<State<T>>>,
    shared: Arc<Shared>,
) where
    T: Scalar,
{
    loop {
        match command_rx.recv() {
            Ok(Command::Solve { params, in_place }) => {
                // a job that was queued before shutdown began is drained,
                // not solved; starting it would re-arm the early-exit flag
                if shared.exiting.load(Ordering::Relaxed) {
                    shared.busy.store(false, Ordering::Release);
                    continue;
                }

                let start = Instant::now();

                {
                    let mut state = state.write();
                    let State { sheets, solver } = &mut *state;
                    let target = if in_place {
                        SolveTarget::InPlace(&mut sheets.trg)
                    }
                    else {
                        SolveTarget::OutOfPlace {
                            src: &sheets.src,
                            trg: &mut sheets.trg,
                        }
                    };
                    solver.calc_next(&params, target, &mut sheets.extra);
                }

                let duration_seconds = start.elapsed().as_secs_f64();
                *shared.last_duration.lock() = duration_seconds;
                tracing::debug!(duration_seconds, "solve finished");

                // clear busy before signalling, so the callback observes an
                // idle executor
                shared.busy.store(false, Ordering::Release);
                if let Some(on_finished) = shared.on_finished.lock().as_mut() {
                    on_finished(duration_seconds);
                }
            }
            Ok(Command::Quit) | Err(mpsc::RecvError) => break,
        }
    }
    tracing::debug!("solver worker thread exiting");
}

// _______________________________________________________________________
// Guards

#[derive(Debug)]
pub struct ReadGuard<'a, T>
where
    T: Scalar,
{
    guard: RwLockReadGuard<'a, State<T>>,
}

impl<'a, T> ReadGuard<'a, T>
where
    T: Scalar,
{
    pub fn sheets(&self) -> &Sheets<T> {
        &self.guard.sheets
    }

    pub fn status(&self) -> &SolveStatus {
        self.guard.solver.status()
    }
}

impl<'a, T> Deref for ReadGuard<'a, T>
where
    T: Scalar,
{
    type Target = Sheets<T>;

    fn deref(&self) -> &Self::Target {
        &self.guard.sheets
    }
}

#[derive(Debug)]
pub struct WriteGuard<'a, T>
where
    T: Scalar,
{
    guard: RwLockWriteGuard<'a, State<T>>,
}

impl<'a, T> WriteGuard<'a, T>
where
    T: Scalar,
{
    pub fn sheets_mut(&mut self) -> &mut Sheets<T> {
        &mut self.guard.sheets
    }
}

impl<'a, T> Deref for WriteGuard<'a, T>
where
    T: Scalar,
{
    type Target = Sheets<T>;

    fn deref(&self) -> &Self::Target {
        &self.guard.sheets
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T>
where
    T: Scalar,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.sheets
    }
}

// _______________________________________________________________________

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn line_sheets() -> Sheets<f32> {
        let mut sheets = Sheets::default();
        assert!(sheets.src.set_xy_counts(3, 1, 0.0));
        assert!(sheets.src.set_value_at(1.0, 1, 0));
        assert!(sheets.trg.set_xy_counts(3, 1, 0.0));
        sheets
    }

    #[test]
    fn it_runs_a_solve_on_the_worker_thread() {
        let executor = Executor::new(line_sheets());
        executor.set_technique(Technique::OrthoInterleave);
        executor.set_method(Method::Forward);
        executor.set_parallel(false);
        executor.set_rates(0.25, 0.0);

        assert_eq!(executor.last_duration_seconds(), -1.0);
        executor.calc_next(false).unwrap();
        wait_until("solve completion", || !executor.is_busy());

        let guard = executor.read();
        assert!((guard.trg.get_at(0, 0) - 0.25).abs() < 1e-6);
        assert!((guard.trg.get_at(1, 0) - 0.5).abs() < 1e-6);
        assert!((guard.trg.get_at(2, 0) - 0.25).abs() < 1e-6);
        assert_eq!(guard.status().solve_count(), 1);
        drop(guard);

        assert!(executor.last_duration_seconds() >= 0.0);
        assert!(!executor.is_going_down());
    }

    #[test]
    fn it_signals_completion_through_the_callback() {
        let executor = Executor::new(line_sheets());
        executor.set_technique(Technique::OrthoInterleave);
        executor.set_parallel(false);
        executor.set_rates(0.25, 0.0);

        let (done_tx, done_rx) = mpsc::channel();
        executor.set_on_finished(move |duration_seconds| {
            done_tx.send(duration_seconds).unwrap();
        });

        executor.calc_next(false).unwrap();
        let duration_seconds = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(duration_seconds >= 0.0);
        // busy cleared before the signal
        assert!(!executor.is_busy());
    }

    #[test]
    fn it_rejects_a_second_job_while_busy() {
        let mut sheets = Sheets::default();
        assert!(sheets.src.set_xy_counts(512, 512, 0.0));
        assert!(sheets.src.set_value_at(1.0, 256, 256));
        assert!(sheets.trg.set_xy_counts(512, 512, 0.0));

        let executor = Executor::new(sheets);
        executor.set_technique(Technique::Simultaneous2d);
        executor.set_method(Method::Backward);
        executor.set_parallel(false);
        executor.set_rates(0.3, 0.3);
        executor.set_extra_pass_count(200);

        executor.calc_next(false).unwrap();
        assert_eq!(executor.calc_next(false), Err(SubmitError::Busy));

        // don't sit through all 201 passes
        executor.request_early_exit();
        wait_until("cancelled solve to finish", || !executor.is_busy());
    }

    #[test]
    fn it_refuses_jobs_once_going_down() {
        let executor = Executor::new(line_sheets());
        executor.request_early_exit();
        assert!(executor.is_going_down());
        assert_eq!(executor.calc_next(false), Err(SubmitError::ShuttingDown));
    }

    #[test]
    fn it_cancels_cooperatively() {
        let mut sheets = Sheets::default();
        assert!(sheets.src.set_xy_counts(256, 256, 0.5));
        assert!(sheets.trg.set_xy_counts(256, 256, 0.0));

        let executor = Executor::new(sheets);
        executor.set_technique(Technique::Simultaneous2d);
        executor.set_method(Method::Backward);
        executor.set_parallel(false);
        executor.set_rates(0.3, 0.3);
        executor.set_extra_pass_count(500);

        let (done_tx, done_rx) = mpsc::channel();
        executor.set_on_finished(move |_| {
            let _ = done_tx.send(());
        });

        executor.calc_next(false).unwrap();
        executor.request_early_exit();

        // the worker must come back promptly instead of grinding through
        // all the passes
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!executor.is_busy());

        let guard = executor.read();
        assert!(guard.status().solve_count() <= 501);
    }

    #[test]
    fn it_seeds_sheets_through_the_write_guard() {
        let executor = Executor::new(Sheets::default());
        {
            let mut guard = executor.write();
            assert!(guard.src.set_xy_counts(4, 4, 0.0));
            assert!(guard.src.fill_bell_curve(1.5, 1.5, 1.0, 1.0, 0.0, 1.0));
            assert!(guard.trg.set_xy_counts(4, 4, 0.0));
        }

        executor.set_technique(Technique::OrthoInterleave);
        executor.set_parallel(false);
        executor.set_rates(0.2, 0.2);
        executor.calc_next(false).unwrap();
        wait_until("solve completion", || !executor.is_busy());

        let guard = executor.read();
        let total_before: f32 = guard.src.cells().iter().sum();
        let total_after: f32 = guard.trg.cells().iter().sum();
        // the interleave's no-leak edges conserve the total
        assert!((total_before - total_after).abs() < 1e-4);
    }

    #[test]
    fn it_tracks_parameter_changes() {
        let executor = Executor::<f32>::new(Sheets::default());
        assert!(executor.set_method(Method::Central));
        assert!(!executor.set_method(Method::Central));
        assert!(executor.set_damping(0.5));
        assert!(executor.set_extra_pass_count(3));
        assert!(executor.set_parallel(false));

        let params = executor.params();
        assert_eq!(params.method(), Method::Central);
        assert_eq!(params.extra_pass_count(), 3);
        assert!(!params.is_parallel());
    }

    #[test]
    fn it_shuts_down_cleanly_mid_solve() {
        let mut sheets = Sheets::default();
        assert!(sheets.src.set_xy_counts(256, 256, 0.25));
        assert!(sheets.trg.set_xy_counts(256, 256, 0.0));

        let executor = Executor::new(sheets);
        executor.set_technique(Technique::Simultaneous2d);
        executor.set_method(Method::Central);
        executor.set_parallel(false);
        executor.set_extra_pass_count(500);

        executor.calc_next(false).unwrap();
        // dropping raises early-exit, drains and joins
        drop(executor);
    }
}
