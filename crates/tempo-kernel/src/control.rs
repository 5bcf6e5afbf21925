//! Kernel handle and cooperative concurrency protocol.
//!
//! [`Kernel`] is the explicit engine handle threaded through every control
//! call; there is no process-wide singleton. The engine either runs on its own
//! thread ([`Kernel::start`], asynchronous mode) or is driven inside the
//! caller's thread ([`Kernel::run_sync_until`] and friends, synchronous mode).
//!
//! At most one thread mutates simulation state at any instant. External
//! threads gain access through [`Kernel::lock`]: the engine polls the lock
//! request count at timestamp boundaries only, parks there, and the caller
//! receives an RAII guard with mutable access to the whole engine. Dropping
//! the guard resumes the engine. Event callbacks must never call the blocking
//! control API (`lock`, `stop`, `step`, `join`, ...) — the engine would
//! deadlock against itself. This is a caller contract, not checked at
//! runtime.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, KernelConfig};
use crate::engine::{RunState, SliceExit, TimeEngine};

/// Errors surfaced by the control API.
///
/// Scheduling-order violations are not errors: they abort the process,
/// because the engine has no safe continuation once monotonic time is broken.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("engine thread already started")]
    AlreadyStarted,
    #[error("engine thread not started")]
    NotStarted,
    #[error("simulation already finished")]
    Finished,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Callbacks invoked by the kernel at control-flow milestones.
///
/// Implementations must not call back into the blocking control API.
pub trait EngineObserver: Send {
    /// The simulation reached `quit` and will not run again until reopened.
    fn simulation_ended(&mut self, _status: i32) {}

    /// The engine paused at a timestamp boundary.
    fn simulation_stopped(&mut self, _time_ps: u64) {}

    /// An external operation changed the earliest pending deadline; drivers
    /// polling the engine should re-poll.
    fn next_wakeup_changed(&mut self, _time_ps: u64) {}
}

struct Shared {
    core: Mutex<TimeEngine>,
    cond: Condvar,
    /// External lock holders; the engine parks while nonzero.
    lock_req: AtomicU32,
    /// Cross-thread stop request, honored at the next boundary.
    stop_req: AtomicBool,
    /// True while the engine is allowed to dispatch.
    run_req: AtomicBool,
    /// Parties jointly gating time progress.
    retain: AtomicI32,
    closed: AtomicBool,
    observer: Mutex<Option<Box<dyn EngineObserver>>>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, TimeEngine> {
        self.core.lock().expect("engine state poisoned by earlier panic")
    }

    fn interrupted(&self) -> bool {
        self.lock_req.load(Ordering::SeqCst) > 0
            || self.stop_req.load(Ordering::SeqCst)
            || self.retain.load(Ordering::SeqCst) > 0
            || self.closed.load(Ordering::SeqCst)
    }

    fn notify_stopped(&self, time_ps: u64) {
        if let Some(obs) = self
            .observer
            .lock()
            .expect("observer poisoned")
            .as_mut()
        {
            obs.simulation_stopped(time_ps);
        }
    }

    fn notify_ended(&self, status: i32) {
        if let Some(obs) = self
            .observer
            .lock()
            .expect("observer poisoned")
            .as_mut()
        {
            obs.simulation_ended(status);
        }
    }

    fn notify_wakeup(&self, time_ps: u64) {
        if let Some(obs) = self
            .observer
            .lock()
            .expect("observer poisoned")
            .as_mut()
        {
            obs.next_wakeup_changed(time_ps);
        }
    }

    /// Applies retain counts restored by step boundary events.
    fn apply_retain_restore(&self, core: &mut TimeEngine) {
        let restored = core.flags.take_retain_restore();
        if restored != 0 {
            self.retain.fetch_add(restored, Ordering::SeqCst);
        }
    }
}

/// The explicit engine handle. Cheap to share behind an `Arc`; all methods
/// take `&self`.
pub struct Kernel {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Kernel {
    /// Builds an engine from already-parsed configuration values.
    pub fn open(config: KernelConfig) -> Result<Kernel, ControlError> {
        config.validate()?;
        let mut core = TimeEngine::new();
        for domain in &config.domains {
            core.new_domain(domain.name.clone(), domain.freq_hz);
        }
        debug!(domains = config.domains.len(), "kernel opened");
        Ok(Kernel {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                cond: Condvar::new(),
                lock_req: AtomicU32::new(0),
                stop_req: AtomicBool::new(false),
                run_req: AtomicBool::new(false),
                retain: AtomicI32::new(0),
                closed: AtomicBool::new(false),
                observer: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        })
    }

    /// Tears the engine down: requests a stop, wakes every waiter and joins
    /// the engine thread. A panic on the engine thread (e.g. an ordering
    /// violation) is propagated here.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stop_req.store(true, Ordering::SeqCst);
        // Serialize with the engine's check-then-wait window; a poisoned mutex
        // means the engine already died and join() below will surface it.
        drop(self.shared.core.lock());
        self.shared.cond.notify_all();
        let handle = self
            .thread
            .lock()
            .expect("thread slot poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
        debug!("kernel closed");
    }

    /// Registers the observer invoked at end/stop/wakeup-change milestones.
    pub fn set_observer(&self, observer: Box<dyn EngineObserver>) {
        *self.shared.observer.lock().expect("observer poisoned") = Some(observer);
    }

    /// Spawns the engine thread (asynchronous mode). The engine starts paused;
    /// call [`run`](Self::run) or [`step`](Self::step) to let time progress.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut slot = self.thread.lock().expect("thread slot poisoned");
        if slot.is_some() {
            return Err(ControlError::AlreadyStarted);
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("tempo-engine".to_string())
            .spawn(move || engine_main(&shared))
            .expect("failed to spawn engine thread");
        *slot = Some(handle);
        debug!("engine thread started");
        Ok(())
    }

    fn started(&self) -> bool {
        self.thread.lock().expect("thread slot poisoned").is_some()
    }

    /// Lets the engine free-run; returns promptly.
    pub fn run(&self) {
        if self.shared.run_req.swap(true, Ordering::SeqCst) {
            return;
        }
        // Serialize against the engine's check-then-wait window so the wakeup
        // cannot fall between its predicate check and the condvar wait.
        drop(self.shared.core());
        self.shared.cond.notify_all();
    }

    /// Requests a pause at the next timestamp boundary and blocks until the
    /// engine is no longer running.
    pub fn stop(&self) {
        self.shared.stop_req.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        let mut core = self.shared.core();
        while core.state() == RunState::Running {
            core = self
                .shared
                .cond
                .wait(core)
                .expect("engine state poisoned by earlier panic");
        }
        // If the engine was already parked the request was never consumed;
        // clear it so a later `run` is not clobbered.
        self.shared.stop_req.store(false, Ordering::SeqCst);
    }

    /// Schedules the end of the simulation at the current boundary and records
    /// `status` for [`join`](Self::join).
    pub fn quit(&self, status: i32) {
        {
            let mut guard = self.lock();
            guard.quit(status);
        }
        self.shared.cond.notify_all();
    }

    /// Runs until `end_ps` (absolute) by scheduling a transient stop client
    /// through the normal dispatch path; returns immediately.
    pub fn run_until(&self, end_ps: u64) {
        {
            let mut guard = self.lock();
            let at = end_ps.max(guard.time_ps());
            guard.schedule_stop_at(at, false);
        }
        self.run();
    }

    /// Advances simulated time by exactly `delta_ps` and blocks until the
    /// boundary is reached (asynchronous mode).
    ///
    /// The stepper lets go of one retain count on entry and the boundary event
    /// restores it, so several concurrent steppers gate each other: time never
    /// passes a boundary some party still holds.
    pub fn step(&self, delta_ps: u64) -> Result<u64, ControlError> {
        if !self.started() {
            return Err(ControlError::NotStarted);
        }
        let end_ps = {
            let mut guard = self.lock();
            if guard.state() == RunState::Finished {
                return Err(ControlError::Finished);
            }
            let end_ps = guard
                .time_ps()
                .checked_add(delta_ps)
                .expect("simulated time overflowed u64::MAX");
            guard.schedule_stop_at(end_ps, true);
            end_ps
        };
        self.shared.retain.fetch_sub(1, Ordering::SeqCst);
        self.run();
        self.wait_time_at_least(end_ps)
    }

    /// Like [`step`](Self::step) with an absolute boundary.
    pub fn step_until(&self, end_ps: u64) -> Result<u64, ControlError> {
        if !self.started() {
            return Err(ControlError::NotStarted);
        }
        {
            let mut guard = self.lock();
            if guard.state() == RunState::Finished {
                return Err(ControlError::Finished);
            }
            if end_ps <= guard.time_ps() {
                return Ok(guard.time_ps());
            }
            guard.schedule_stop_at(end_ps, true);
        }
        self.shared.retain.fetch_sub(1, Ordering::SeqCst);
        self.run();
        self.wait_time_at_least(end_ps)
    }

    /// Blocks until the simulation has finished and returns its status.
    pub fn join(&self) -> i32 {
        let mut core = self.shared.core();
        while core.state() != RunState::Finished {
            core = self
                .shared
                .cond
                .wait(core)
                .expect("engine state poisoned by earlier panic");
        }
        core.stop_status()
    }

    /// Blocks until the engine has drained the current instant and parked at a
    /// timestamp boundary.
    pub fn flush(&self) {
        drop(self.lock());
    }

    /// Moves idle simulated time forward to `end_ps` (co-simulation bridges).
    pub fn update(&self, end_ps: u64) {
        let mut guard = self.lock();
        guard.update(end_ps);
    }

    /// Adds one party gating time progress.
    pub fn retain(&self) {
        self.shared.retain.fetch_add(1, Ordering::SeqCst);
        drop(self.shared.core());
        self.shared.cond.notify_all();
    }

    /// Removes one gating party; the engine resumes once the count reaches
    /// zero.
    pub fn release(&self) {
        let old = self.shared.retain.fetch_sub(1, Ordering::SeqCst);
        if old <= 0 {
            // The engine cannot have been parked on the count; don't contend
            // for the core mutex of a possibly free-running engine.
            return;
        }
        drop(self.shared.core());
        self.shared.cond.notify_all();
    }

    pub fn retain_count(&self) -> i32 {
        self.shared.retain.load(Ordering::SeqCst)
    }

    /// Acquires exclusive access to the engine at a timestamp boundary.
    ///
    /// Blocks until the engine thread has left its dispatch section; the
    /// returned guard dereferences to the full [`TimeEngine`] API. The engine
    /// resumes when the guard is dropped.
    pub fn lock(&self) -> KernelGuard<'_> {
        self.shared.lock_req.fetch_add(1, Ordering::SeqCst);
        self.shared.cond.notify_all();
        let core = self.shared.core();
        KernelGuard {
            core: Some(core),
            shared: &self.shared,
        }
    }

    /// Current simulated time; forces a boundary.
    pub fn time_ps(&self) -> u64 {
        self.lock().time_ps()
    }

    pub fn state(&self) -> RunState {
        self.lock().state()
    }

    /// Drives the engine inside the caller's thread until `end_ps`
    /// (synchronous mode). Fails if the engine thread was started.
    pub fn run_sync_until(&self, end_ps: u64) -> Result<u64, ControlError> {
        if self.started() {
            return Err(ControlError::AlreadyStarted);
        }
        let mut core = self.shared.core();
        if core.state() == RunState::Finished {
            return Err(ControlError::Finished);
        }
        if end_ps <= core.time_ps() {
            return Ok(core.time_ps());
        }
        core.schedule_stop_at(end_ps, false);
        loop {
            core.state = RunState::Running;
            let exit = core.run_slice(&mut || self.shared.interrupted());
            self.shared.apply_retain_restore(&mut core);
            match exit {
                SliceExit::Stopped => {
                    core.flags.stop_req = false;
                    core.flags.pause_req = false;
                    core.state = if core.flags.finished {
                        RunState::Finished
                    } else {
                        RunState::Paused
                    };
                    break;
                }
                SliceExit::Finished => {
                    core.state = RunState::Finished;
                    break;
                }
                SliceExit::Idle => {
                    core.state = RunState::Paused;
                    break;
                }
                SliceExit::Yield => {
                    if self.shared.closed.load(Ordering::SeqCst) {
                        core.state = RunState::Paused;
                        break;
                    }
                    // Let an external locker in, then keep going.
                    while self.shared.lock_req.load(Ordering::SeqCst) > 0 {
                        self.shared.cond.notify_all();
                        core = self
                            .shared
                            .cond
                            .wait(core)
                            .expect("engine state poisoned by earlier panic");
                    }
                    if self.shared.stop_req.swap(false, Ordering::SeqCst) {
                        core.state = RunState::Paused;
                        break;
                    }
                    while self.shared.retain.load(Ordering::SeqCst) > 0 {
                        self.shared.cond.notify_all();
                        core = self
                            .shared
                            .cond
                            .wait(core)
                            .expect("engine state poisoned by earlier panic");
                    }
                }
            }
        }
        let time = core.time_ps();
        if core.state() == RunState::Finished {
            let status = core.stop_status();
            drop(core);
            self.shared.notify_ended(status);
        } else {
            drop(core);
            self.shared.notify_stopped(time);
        }
        self.shared.cond.notify_all();
        Ok(time)
    }

    /// Synchronous-mode counterpart of [`step`](Self::step).
    pub fn step_sync(&self, delta_ps: u64) -> Result<u64, ControlError> {
        let end_ps = self
            .shared
            .core()
            .time_ps()
            .checked_add(delta_ps)
            .expect("simulated time overflowed u64::MAX");
        self.run_sync_until(end_ps)
    }

    fn wait_time_at_least(&self, end_ps: u64) -> Result<u64, ControlError> {
        let mut core = self.shared.core();
        while core.time_ps() < end_ps
            && !core.flags.finished
            && !self.shared.closed.load(Ordering::SeqCst)
        {
            core = self
                .shared
                .cond
                .wait(core)
                .expect("engine state poisoned by earlier panic");
        }
        Ok(core.time_ps())
    }
}

/// RAII guard returned by [`Kernel::lock`].
///
/// Dereferences to [`TimeEngine`]; dropping it releases the hold and wakes the
/// engine. If the earliest pending deadline changed while the guard was held,
/// the observer's `next_wakeup_changed` fires after release.
pub struct KernelGuard<'a> {
    core: Option<MutexGuard<'a, TimeEngine>>,
    shared: &'a Shared,
}

impl<'a> std::ops::Deref for KernelGuard<'a> {
    type Target = TimeEngine;

    fn deref(&self) -> &TimeEngine {
        self.core.as_ref().expect("guard already released")
    }
}

impl<'a> std::ops::DerefMut for KernelGuard<'a> {
    fn deref_mut(&mut self) -> &mut TimeEngine {
        self.core.as_mut().expect("guard already released")
    }
}

impl<'a> Drop for KernelGuard<'a> {
    fn drop(&mut self) {
        let mut wakeup = None;
        if let Some(core) = self.core.as_mut() {
            if core.take_wakeup_dirty() {
                wakeup = Some(core.next_wakeup_ps().unwrap_or(core.time_ps()));
            }
        }
        self.core = None;
        self.shared.lock_req.fetch_sub(1, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(t) = wakeup {
            self.shared.notify_wakeup(t);
        }
    }
}

/// Engine thread main loop (asynchronous mode).
///
/// The core mutex is held for the whole run; it is released only while parked
/// on the condition variable, which is exactly when external threads may take
/// the lock. Every park point is a timestamp boundary, so an instant is never
/// split by an external request.
fn engine_main(shared: &Shared) {
    let mut core = shared.core();
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            shared.cond.notify_all();
            return;
        }
        if shared.lock_req.load(Ordering::SeqCst) > 0 {
            shared.cond.notify_all();
            core = shared
                .cond
                .wait(core)
                .expect("engine state poisoned by earlier panic");
            continue;
        }
        if core.flags.finished {
            if core.state() != RunState::Finished {
                core.state = RunState::Finished;
                shared.run_req.store(false, Ordering::SeqCst);
                let status = core.stop_status();
                debug!(status, "simulation finished");
                shared.notify_ended(status);
            }
            shared.cond.notify_all();
            core = shared
                .cond
                .wait(core)
                .expect("engine state poisoned by earlier panic");
            continue;
        }
        if !shared.run_req.load(Ordering::SeqCst) {
            if core.state() == RunState::Running {
                core.state = RunState::Paused;
                let time = core.time_ps();
                debug!(time_ps = time, "simulation paused");
                shared.notify_stopped(time);
            }
            shared.cond.notify_all();
            core = shared
                .cond
                .wait(core)
                .expect("engine state poisoned by earlier panic");
            continue;
        }
        if shared.stop_req.swap(false, Ordering::SeqCst) {
            shared.run_req.store(false, Ordering::SeqCst);
            if core.state() == RunState::Running {
                core.state = RunState::Paused;
                let time = core.time_ps();
                shared.notify_stopped(time);
            }
            shared.cond.notify_all();
            continue;
        }
        if shared.retain.load(Ordering::SeqCst) > 0 {
            // Parked at a boundary until every retaining party lets go.
            shared.cond.notify_all();
            core = shared
                .cond
                .wait(core)
                .expect("engine state poisoned by earlier panic");
            continue;
        }

        core.state = RunState::Running;
        let exit = core.run_slice(&mut || shared.interrupted());
        shared.apply_retain_restore(&mut core);
        match exit {
            SliceExit::Stopped => {
                core.flags.stop_req = false;
                core.flags.pause_req = false;
                shared.run_req.store(false, Ordering::SeqCst);
                if !core.flags.finished {
                    core.state = RunState::Paused;
                    let time = core.time_ps();
                    debug!(time_ps = time, "simulation stopped at boundary");
                    shared.notify_stopped(time);
                }
                shared.cond.notify_all();
            }
            SliceExit::Finished => {
                // Handled at the top of the loop.
            }
            SliceExit::Idle => {
                // Nothing to run; park until an external enqueue wakes us.
                core.state = RunState::Paused;
                shared.cond.notify_all();
                core = shared
                    .cond
                    .wait(core)
                    .expect("engine state poisoned by earlier panic");
            }
            SliceExit::Yield => {
                // The top of the loop sorts out who wanted the thread.
            }
        }
    }
}
