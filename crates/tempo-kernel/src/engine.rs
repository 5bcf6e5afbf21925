//! Global time engine.
//!
//! A single strictly time-ordered scheduler of *time clients*: clock domains
//! and domain-less time events, kept in an ascending intrusive list by
//! absolute picosecond deadline. The engine owns the notion of current
//! simulated time. Within one instant every due client is drained before time
//! advances, and among clients due at the identical timestamp the most
//! recently inserted executes first; some model configurations depend on that
//! ordering, so it is part of the contract.

use std::collections::HashMap;
use std::mem;

use tempo_time::Clock;
use tracing::{debug, trace};

use crate::clock::ClockEngine;
use crate::event::{EventFn, EventId};

/// Non-owning handle to a time client (a clock domain or a time event).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId {
    index: u32,
    generation: u32,
}

/// Callback type for domain-less time events.
pub type TimeFn = Box<dyn FnMut(&mut TimeContext<'_>) + Send>;

/// Engine run state, per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Finished,
}

/// Stop/pause/quit requests raised from inside the dispatch loop.
///
/// These are the engine-internal halves of the control protocol; the
/// cross-thread halves live in atomics owned by the kernel handle.
#[derive(Debug, Default)]
pub(crate) struct EngineFlags {
    pub(crate) stop_req: bool,
    pub(crate) pause_req: bool,
    pub(crate) finished: bool,
    pub(crate) stop_status: i32,
    /// Retain counts restored by step boundary events, applied by the kernel
    /// once the dispatch slice returns.
    pub(crate) retain_restore: i32,
}

impl EngineFlags {
    pub(crate) fn request_stop(&mut self) {
        self.stop_req = true;
    }

    pub(crate) fn quit(&mut self, status: i32) {
        self.pause_req = true;
        self.finished = true;
        self.stop_status = status;
    }

    pub(crate) fn take_retain_restore(&mut self) -> i32 {
        mem::take(&mut self.retain_restore)
    }
}

pub(crate) struct TimeEvent {
    name: String,
    callback: Option<TimeFn>,
    /// Transient stop helpers free their slot after firing.
    transient: bool,
}

pub(crate) enum ClientKind {
    Clock(ClockEngine),
    Timer(TimeEvent),
    /// Placeholder while the client's state is taken out for execution.
    Vacant,
}

struct Client {
    next_event_time: u64,
    enqueued: bool,
    running: bool,
    next: Option<ClientId>,
    kind: ClientKind,
}

struct ClientSlot {
    generation: u32,
    client: Option<Client>,
}

/// Why a dispatch slice returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SliceExit {
    /// No client is enqueued.
    Idle,
    /// An internal stop/pause request was honored at a timestamp boundary.
    Stopped,
    /// `quit` was called.
    Finished,
    /// The yield callback asked for the thread at a timestamp boundary.
    Yield,
}

pub struct TimeEngine {
    slots: Vec<ClientSlot>,
    free: Vec<u32>,
    /// Head of the ascending list by `next_event_time`.
    first_client: Option<ClientId>,
    time: Clock,
    pub(crate) flags: EngineFlags,
    pub(crate) state: RunState,
    domains: HashMap<String, ClientId>,
    wakeup_dirty: bool,
}

impl TimeEngine {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            first_client: None,
            time: Clock::new(),
            flags: EngineFlags::default(),
            state: RunState::Idle,
            domains: HashMap::new(),
            wakeup_dirty: false,
        }
    }

    /// Current simulated time in picoseconds.
    pub fn time_ps(&self) -> u64 {
        self.time.now_ps()
    }

    /// Deadline of the earliest enqueued client, if any.
    pub fn next_wakeup_ps(&self) -> Option<u64> {
        self.first_client.map(|id| self.client(id).next_event_time)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stop_status(&self) -> i32 {
        self.flags.stop_status
    }

    /// Registers a new clock domain and returns its client handle.
    pub fn new_domain(&mut self, name: impl Into<String>, freq_hz: u64) -> ClientId {
        let name = name.into();
        debug!(domain = %name, freq_hz, "registering clock domain");
        let id = self.alloc_client(ClientKind::Clock(ClockEngine::new(name.clone(), freq_hz)));
        self.domains.insert(name, id);
        id
    }

    /// Looks up a clock domain registered by `new_domain`.
    pub fn domain_id(&self, name: &str) -> Option<ClientId> {
        self.domains.get(name).copied()
    }

    /// Read access to a clock domain's state (cycle count, period, frequency).
    pub fn clock(&self, id: ClientId) -> &ClockEngine {
        match &self.client(id).kind {
            ClientKind::Clock(ck) => ck,
            _ => panic!("time client is not a clock domain"),
        }
    }

    pub fn domain_cycles(&self, id: ClientId) -> u64 {
        self.clock(id).get_cycles()
    }

    pub fn domain_period_ps(&self, id: ClientId) -> u64 {
        self.clock(id).get_period()
    }

    pub fn domain_frequency_hz(&self, id: ClientId) -> u64 {
        self.clock(id).get_frequency()
    }

    /// Changes a domain's frequency on the current cycle boundary and
    /// reschedules its pending wakeup under the new period.
    pub fn set_frequency(&mut self, id: ClientId, freq_hz: u64) {
        let now = self.time.now_ps();
        let (has_events, next) = {
            let ck = self.clock_mut(id);
            ck.apply_frequency(now, freq_hz);
            (ck.has_events(), ck.next_event_time_ps())
        };
        self.dequeue_client(id);
        if has_events {
            if let Some(t) = next {
                // A sharply shorter period can pull the pending boundary into
                // the current instant; it is never allowed into the past.
                self.enqueue_client(id, t.max(now));
            }
        }
    }

    /// Creates a clock event owned by `domain`.
    pub fn new_event(
        &mut self,
        domain: ClientId,
        name: impl Into<String>,
        callback: EventFn,
    ) -> EventId {
        self.clock_mut(domain).new_event(name, callback)
    }

    /// Destroys a clock event, cancelling it first.
    pub fn del_event(&mut self, domain: ClientId, event: EventId) {
        self.clock_mut(domain).del_event(event);
        self.refresh_domain(domain);
    }

    /// Schedules `event` `delta_cycles` ahead on `domain`, resynchronizing the
    /// domain first since the caller is external to it.
    pub fn event_enqueue(&mut self, domain: ClientId, event: EventId, delta_cycles: u64) {
        let now = self.time.now_ps();
        self.clock_mut(domain).enqueue_ext(now, event, delta_cycles);
        self.refresh_domain(domain);
    }

    /// Cancel-then-enqueue for external callers.
    pub fn event_reenqueue(&mut self, domain: ClientId, event: EventId, delta_cycles: u64) {
        let now = self.time.now_ps();
        self.clock_mut(domain).reenqueue_ext(now, event, delta_cycles);
        self.refresh_domain(domain);
    }

    pub fn event_cancel(&mut self, domain: ClientId, event: EventId) {
        self.clock_mut(domain).cancel(event);
        self.refresh_domain(domain);
    }

    /// Enables `event` to fire once per cycle until disabled.
    pub fn event_enable(&mut self, domain: ClientId, event: EventId) {
        let now = self.time.now_ps();
        self.clock_mut(domain).enable_ext(now, event);
        self.refresh_domain(domain);
    }

    pub fn event_disable(&mut self, domain: ClientId, event: EventId) {
        self.clock_mut(domain).disable(event);
        self.refresh_domain(domain);
    }

    pub fn event_stall_set(&mut self, domain: ClientId, event: EventId, cycles: u64) {
        self.clock_mut(domain).stall_cycles_set(event, cycles);
    }

    pub fn event_stall_inc(&mut self, domain: ClientId, event: EventId, cycles: u64) {
        self.clock_mut(domain).stall_cycles_inc(event, cycles);
    }

    pub fn event_is_enqueued(&self, domain: ClientId, event: EventId) -> bool {
        self.clock(domain).is_enqueued(event)
    }

    /// Registers a domain-less time client scheduled in absolute picoseconds.
    pub fn new_time_event(&mut self, name: impl Into<String>, callback: TimeFn) -> ClientId {
        self.alloc_client(ClientKind::Timer(TimeEvent {
            name: name.into(),
            callback: Some(callback),
            transient: false,
        }))
    }

    /// Schedules a time event `delta_ps` from now.
    pub fn time_event_enqueue(&mut self, id: ClientId, delta_ps: u64) {
        let at = self
            .time
            .now_ps()
            .checked_add(delta_ps)
            .expect("simulated time overflowed u64::MAX");
        self.enqueue_client(id, at);
    }

    pub fn time_event_cancel(&mut self, id: ClientId) {
        self.dequeue_client(id);
    }

    /// Ends the simulation with `status` at the next timestamp boundary.
    pub fn quit(&mut self, status: i32) {
        self.flags.quit(status);
    }

    /// Inserts `id` into the ordered list for absolute time `time_ps`.
    ///
    /// No-op if the client is already enqueued at an equal-or-earlier time
    /// (avoiding redundant list churn); otherwise it is dequeued and
    /// reinserted at its sorted position.
    ///
    /// # Panics
    ///
    /// Panics if `time_ps` is strictly in the past: the engine cannot continue
    /// once monotonic ordering is broken.
    pub fn enqueue_client(&mut self, id: ClientId, time_ps: u64) {
        let now = self.time.now_ps();
        assert!(
            time_ps >= now,
            "time client scheduled in the past ({time_ps} ps < {now} ps)"
        );
        {
            let c = self.client(id);
            if c.enqueued && c.next_event_time <= time_ps {
                return;
            }
        }
        let old_head = self.first_client;
        if self.client(id).enqueued {
            self.unlink(id);
        }
        self.insert_sorted(id, time_ps);
        if self.first_client != old_head {
            self.wakeup_dirty = true;
        }
    }

    /// Removes `id` from the ordered list; idempotent.
    pub fn dequeue_client(&mut self, id: ClientId) {
        let Some(c) = self.client_opt(id) else {
            return;
        };
        if !c.enqueued {
            return;
        }
        let old_head = self.first_client;
        self.unlink(id);
        self.client_mut(id).enqueued = false;
        if self.first_client != old_head {
            self.wakeup_dirty = true;
        }
    }

    /// Moves the engine's idle clock forward to `end_ps` for co-simulation
    /// bridges. No-op while any client is due at or before `end_ps`, and time
    /// never rewinds.
    pub fn update(&mut self, end_ps: u64) {
        let now = self.time.now_ps();
        if end_ps <= now {
            return;
        }
        match self.next_wakeup_ps() {
            Some(head) if head <= end_ps => {}
            _ => {
                self.time.advance(end_ps - now);
                self.wakeup_dirty = true;
            }
        }
    }

    /// Schedules a transient stop client at `end_ps` through the normal client
    /// path, so the dispatch loop halts there by itself.
    pub(crate) fn schedule_stop_at(&mut self, end_ps: u64, restore_retain: bool) {
        let callback: TimeFn = Box::new(move |ctx| {
            if restore_retain {
                ctx.restore_retain();
            }
            ctx.request_stop();
        });
        let id = self.alloc_client(ClientKind::Timer(TimeEvent {
            name: "stop".to_string(),
            callback: Some(callback),
            transient: true,
        }));
        self.enqueue_client(id, end_ps);
    }

    pub(crate) fn take_wakeup_dirty(&mut self) -> bool {
        mem::take(&mut self.wakeup_dirty)
    }

    /// Runs the dispatch loop until a stop condition is honored.
    ///
    /// `should_yield` is consulted only at timestamp boundaries (never
    /// mid-instant); returning true parks the slice with the current client
    /// requeued, which is how external lock/retain requests interrupt the
    /// engine without ever splitting an instant.
    pub(crate) fn run_slice(&mut self, should_yield: &mut dyn FnMut() -> bool) -> SliceExit {
        loop {
            let Some(head) = self.first_client else {
                if self.flags.finished {
                    return SliceExit::Finished;
                }
                if self.flags.stop_req || self.flags.pause_req {
                    return SliceExit::Stopped;
                }
                return SliceExit::Idle;
            };
            let head_time = self.client(head).next_event_time;
            let now = self.time.now_ps();
            assert!(
                head_time >= now,
                "time client list fell behind current time ({head_time} ps < {now} ps)"
            );
            if head_time > now {
                // Timestamp boundary: the only place requests are honored, so
                // an instant is always drained whole.
                if self.flags.finished {
                    return SliceExit::Finished;
                }
                if self.flags.stop_req || self.flags.pause_req {
                    return SliceExit::Stopped;
                }
                if should_yield() {
                    return SliceExit::Yield;
                }
            }

            // Pop the earliest client and run it.
            self.first_client = self.client(head).next;
            {
                let c = self.client_mut(head);
                debug_assert!(!c.running, "time client dispatched reentrantly");
                c.enqueued = false;
                c.next = None;
                c.running = true;
            }
            let mut kind = mem::replace(&mut self.client_mut(head).kind, ClientKind::Vacant);
            self.time.advance(head_time - now);
            let mut t = head_time;

            let requeue_at = loop {
                let delta = match &mut kind {
                    ClientKind::Clock(ck) => ck.exec(&mut self.flags),
                    ClientKind::Timer(tev) => Self::exec_timer(&mut self.flags, t, tev),
                    ClientKind::Vacant => unreachable!("vacant client dispatched"),
                };
                let Some(d) = delta else {
                    break None;
                };
                if d == 0 {
                    break None;
                }
                let next = t.checked_add(d).expect("simulated time overflowed u64::MAX");
                if self.flags.finished || self.flags.stop_req || self.flags.pause_req {
                    break Some(next);
                }
                if should_yield() {
                    break Some(next);
                }
                // Fast path: keep running the same client while it stays no
                // later than the earliest enqueued client. Clock domains
                // usually remain the earliest client for many consecutive
                // cycles, so this avoids touching the list at all.
                match self.first_client {
                    Some(h) if self.client(h).next_event_time < next => break Some(next),
                    _ => {
                        self.time.advance(next - t);
                        t = next;
                    }
                }
            };

            let transient_done = requeue_at.is_none()
                && matches!(&kind, ClientKind::Timer(tev) if tev.transient);
            if transient_done {
                drop(kind);
                self.free_client(head);
                continue;
            }
            {
                let c = self.client_mut(head);
                c.kind = kind;
                c.running = false;
            }
            if let Some(at) = requeue_at {
                self.insert_sorted(head, at);
            }
        }
    }

    fn exec_timer(flags: &mut EngineFlags, now_ps: u64, tev: &mut TimeEvent) -> Option<u64> {
        let Some(mut callback) = tev.callback.take() else {
            return None;
        };
        trace!(timer = %tev.name, at_ps = now_ps, "time event fired");
        let mut ctx = TimeContext {
            now_ps,
            flags,
            reschedule: None,
        };
        callback(&mut ctx);
        let reschedule = ctx.reschedule;
        tev.callback = Some(callback);
        reschedule
    }

    fn alloc_client(&mut self, kind: ClientKind) -> ClientId {
        let client = Client {
            next_event_time: 0,
            enqueued: false,
            running: false,
            next: None,
            kind,
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.client.is_none());
                slot.client = Some(client);
                ClientId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("client arena exhausted");
                self.slots.push(ClientSlot {
                    generation: 0,
                    client: Some(client),
                });
                ClientId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn free_client(&mut self, id: ClientId) {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation);
        slot.client = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    fn client(&self, id: ClientId) -> &Client {
        self.client_opt(id).expect("stale time client handle")
    }

    fn client_opt(&self, id: ClientId) -> Option<&Client> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.client.as_ref()
    }

    fn client_mut(&mut self, id: ClientId) -> &mut Client {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .expect("stale time client handle");
        assert_eq!(slot.generation, id.generation, "stale time client handle");
        slot.client.as_mut().expect("stale time client handle")
    }

    fn clock_mut(&mut self, id: ClientId) -> &mut ClockEngine {
        match &mut self.client_mut(id).kind {
            ClientKind::Clock(ck) => ck,
            _ => panic!("time client is not a clock domain"),
        }
    }

    /// Keeps a domain's registration exactly tracking its `has_events()`
    /// predicate.
    fn refresh_domain(&mut self, id: ClientId) {
        let (has_events, next) = {
            let ck = self.clock(id);
            (ck.has_events(), ck.next_event_time_ps())
        };
        match next {
            Some(t) if has_events => self.enqueue_client(id, t),
            _ => self.dequeue_client(id),
        }
    }

    /// Ascending insert; among equal timestamps the new client lands first
    /// (before the first existing client whose time is not earlier), so
    /// equal-timestamp clients execute most-recently-inserted first.
    fn insert_sorted(&mut self, id: ClientId, time_ps: u64) {
        let mut prev: Option<ClientId> = None;
        let mut cur = self.first_client;
        let mut last_time = 0u64;
        while let Some(c) = cur {
            let ct = self.client(c).next_event_time;
            assert!(
                ct >= last_time,
                "time client list is not ascending ({ct} ps after {last_time} ps)"
            );
            last_time = ct;
            if ct >= time_ps {
                break;
            }
            prev = Some(c);
            cur = self.client(c).next;
        }
        {
            let cl = self.client_mut(id);
            cl.next_event_time = time_ps;
            cl.enqueued = true;
            cl.next = cur;
        }
        match prev {
            Some(p) => self.client_mut(p).next = Some(id),
            None => self.first_client = Some(id),
        }
    }

    fn unlink(&mut self, id: ClientId) {
        let mut prev: Option<ClientId> = None;
        let mut cur = self.first_client;
        while let Some(c) = cur {
            if c == id {
                let next = self.client(c).next;
                match prev {
                    Some(p) => self.client_mut(p).next = next,
                    None => self.first_client = next,
                }
                let cl = self.client_mut(id);
                cl.next = None;
                cl.enqueued = false;
                return;
            }
            prev = Some(c);
            cur = self.client(c).next;
        }
    }
}

/// Context handed to time event callbacks.
pub struct TimeContext<'a> {
    now_ps: u64,
    flags: &'a mut EngineFlags,
    reschedule: Option<u64>,
}

impl<'a> TimeContext<'a> {
    /// Current simulated time.
    pub fn now_ps(&self) -> u64 {
        self.now_ps
    }

    /// Re-arms the event `delta_ps` from now. A zero delta is ignored: a time
    /// event never re-executes within its own instant.
    pub fn reschedule_in(&mut self, delta_ps: u64) {
        self.reschedule = Some(delta_ps);
    }

    /// Asks the engine to pause at the next timestamp boundary.
    pub fn request_stop(&mut self) {
        self.flags.request_stop();
    }

    /// Ends the simulation with `status`.
    pub fn quit(&mut self, status: i32) {
        self.flags.quit(status);
    }

    /// Gives back a retain count released by a bounded step on entry.
    pub(crate) fn restore_retain(&mut self) {
        self.flags.retain_restore += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;

    fn run_to_idle(engine: &mut TimeEngine) -> SliceExit {
        engine.run_slice(&mut || false)
    }

    #[test]
    fn equal_timestamp_clients_run_most_recent_first() {
        let mut engine = TimeEngine::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..5u32 {
            let order = Arc::clone(&order);
            let id = engine.new_time_event(
                format!("e{tag}"),
                Box::new(move |_| order.lock().unwrap().push(tag)),
            );
            engine.time_event_enqueue(id, 100);
        }
        assert_eq!(run_to_idle(&mut engine), SliceExit::Idle);
        assert_eq!(*order.lock().unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(engine.time_ps(), 100);
    }

    #[test]
    fn redundant_reschedule_keeps_position_and_time() {
        let mut engine = TimeEngine::new();
        let a = engine.new_time_event("a", Box::new(|_| {}));
        let b = engine.new_time_event("b", Box::new(|_| {}));
        engine.time_event_enqueue(a, 100);
        engine.time_event_enqueue(b, 150);

        // Already enqueued at an equal-or-earlier time: both are no-ops.
        engine.time_event_enqueue(a, 200);
        engine.time_event_enqueue(a, 100);
        assert_eq!(engine.next_wakeup_ps(), Some(100));
    }

    #[test]
    fn rescheduling_earlier_moves_the_client() {
        let mut engine = TimeEngine::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut mk = |tag: u32| {
            let order = Arc::clone(&order);
            engine.new_time_event(
                format!("e{tag}"),
                Box::new(move |_| order.lock().unwrap().push(tag)),
            )
        };
        let a = mk(0);
        let b = mk(1);
        engine.time_event_enqueue(a, 100);
        engine.time_event_enqueue(b, 150);
        engine.time_event_cancel(b);
        engine.time_event_enqueue(b, 50);

        run_to_idle(&mut engine);
        assert_eq!(*order.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn dequeue_is_idempotent() {
        let mut engine = TimeEngine::new();
        let a = engine.new_time_event("a", Box::new(|_| {}));
        engine.time_event_enqueue(a, 100);
        engine.time_event_cancel(a);
        engine.time_event_cancel(a);
        assert_eq!(engine.next_wakeup_ps(), None);
        assert_eq!(run_to_idle(&mut engine), SliceExit::Idle);
        assert_eq!(engine.time_ps(), 0);
    }

    #[test]
    #[should_panic(expected = "scheduled in the past")]
    fn scheduling_in_the_past_is_fatal() {
        let mut engine = TimeEngine::new();
        let a = engine.new_time_event("a", Box::new(|_| {}));
        engine.time_event_enqueue(a, 100);
        run_to_idle(&mut engine);
        assert_eq!(engine.time_ps(), 100);
        engine.enqueue_client(a, 50);
    }

    #[test]
    fn periodic_time_event_observes_monotonic_time() {
        let mut engine = TimeEngine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let seen = Arc::clone(&seen);
            engine.new_time_event(
                "periodic",
                Box::new(move |ctx| {
                    seen.lock().unwrap().push(ctx.now_ps());
                    if ctx.now_ps() < 300 {
                        ctx.reschedule_in(30);
                    }
                }),
            )
        };
        engine.time_event_enqueue(id, 30);
        run_to_idle(&mut engine);

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 300);
    }

    #[test]
    fn stop_request_drains_the_whole_instant_first() {
        let mut engine = TimeEngine::new();
        let count = Arc::new(AtomicU64::new(0));
        // The stop helper fires first at t=100 (inserted last), yet both
        // remaining clients due at t=100 still run before the slice stops.
        for _ in 0..2 {
            let count = Arc::clone(&count);
            let id = engine.new_time_event(
                "work",
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
            engine.time_event_enqueue(id, 100);
        }
        engine.schedule_stop_at(100, false);

        assert_eq!(engine.run_slice(&mut || false), SliceExit::Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(engine.time_ps(), 100);
    }

    #[test]
    fn quit_from_a_callback_finishes_with_status() {
        let mut engine = TimeEngine::new();
        let id = engine.new_time_event("quitter", Box::new(|ctx| ctx.quit(7)));
        engine.time_event_enqueue(id, 40);

        assert_eq!(run_to_idle(&mut engine), SliceExit::Finished);
        assert_eq!(engine.stop_status(), 7);
        assert_eq!(engine.time_ps(), 40);
    }

    #[test]
    fn update_moves_idle_time_only() {
        let mut engine = TimeEngine::new();
        engine.update(500);
        assert_eq!(engine.time_ps(), 500);

        // Never rewinds.
        engine.update(400);
        assert_eq!(engine.time_ps(), 500);

        // No-op while a client is due inside the window.
        let a = engine.new_time_event("a", Box::new(|_| {}));
        engine.time_event_enqueue(a, 100);
        engine.update(1_000);
        assert_eq!(engine.time_ps(), 500);
    }

    #[test]
    fn domain_registration_tracks_has_events() {
        let mut engine = TimeEngine::new();
        let soc = engine.new_domain("soc", 100_000_000);
        assert_eq!(engine.next_wakeup_ps(), None);

        let ev = engine.new_event(soc, "once", Box::new(|_| {}));
        engine.event_enqueue(soc, ev, 4);
        assert_eq!(engine.next_wakeup_ps(), Some(40_000));

        engine.event_cancel(soc, ev);
        assert_eq!(engine.next_wakeup_ps(), None);
    }

    #[test]
    fn domain_executes_through_the_client_list() {
        let mut engine = TimeEngine::new();
        let soc = engine.new_domain("soc", 100_000_000);
        let fired_at = Arc::new(AtomicU64::new(u64::MAX));
        let ev = {
            let fired_at = Arc::clone(&fired_at);
            engine.new_event(
                soc,
                "once",
                Box::new(move |ctx| fired_at.store(ctx.cycles(), Ordering::SeqCst)),
            )
        };
        engine.event_enqueue(soc, ev, 10);
        run_to_idle(&mut engine);

        assert_eq!(fired_at.load(Ordering::SeqCst), 10);
        assert_eq!(engine.domain_cycles(soc), 10);
        assert_eq!(engine.time_ps(), 100_000);
        // Nothing left: the domain unregistered itself.
        assert_eq!(engine.next_wakeup_ps(), None);
    }

    #[test]
    fn two_domains_interleave_by_time() {
        let mut engine = TimeEngine::new();
        let fast = engine.new_domain("fast", 1_000_000_000);
        let slow = engine.new_domain("slow", 1_000_000);
        let log = Arc::new(Mutex::new(Vec::new()));

        for (domain, tag, delta) in [(fast, "fast", 500u64), (slow, "slow", 2u64)] {
            let log = Arc::clone(&log);
            let ev = engine.new_event(
                domain,
                tag,
                Box::new(move |ctx| log.lock().unwrap().push((tag, ctx.time_ps()))),
            );
            engine.event_enqueue(domain, ev, delta);
        }
        run_to_idle(&mut engine);

        // fast: 500 cycles @ 1 ns = 500_000 ps; slow: 2 cycles @ 1 us = 2_000_000 ps.
        assert_eq!(
            *log.lock().unwrap(),
            vec![("fast", 500_000), ("slow", 2_000_000)]
        );
    }

    #[test]
    fn set_frequency_reschedules_the_pending_wakeup() {
        let mut engine = TimeEngine::new();
        let soc = engine.new_domain("soc", 1_000_000);
        let ev = engine.new_event(soc, "once", Box::new(|_| {}));
        engine.event_enqueue(soc, ev, 10);
        assert_eq!(engine.next_wakeup_ps(), Some(10_000_000));

        engine.set_frequency(soc, 2_000_000);
        assert_eq!(engine.domain_period_ps(soc), 500_000);
        assert_eq!(engine.next_wakeup_ps(), Some(5_000_000));
    }
}
