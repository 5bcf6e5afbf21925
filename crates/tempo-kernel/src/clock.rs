//! Per-domain cycle scheduler.
//!
//! A [`ClockEngine`] advances one clock domain in discrete cycles of `period`
//! picoseconds and schedules three kinds of work:
//!
//! - one-shot events within the ring horizon, kept in a fixed ring of
//!   per-cycle slot lists;
//! - one-shot events beyond the horizon, kept in a far-horizon list sorted by
//!   ascending target cycle;
//! - permanently-enabled events, executed once per cycle until disabled,
//!   each optionally skipping cycles via a stall count.
//!
//! The domain participates in the global engine as one time client: its
//! [`exec`](ClockEngine::exec) runs everything due at the current cycle and
//! returns the picosecond distance to its next due event.

use tempo_time::period_ps;

use crate::engine::EngineFlags;
use crate::event::{ClockEvent, EventArena, EventFn, EventId, EventList, Queue};

/// Number of ring slots, i.e. the maximum relative cycle distance (exclusive)
/// a one-shot event can be scheduled at while staying in the ring.
///
/// Power of two. Within one slot, events execute in FIFO (enqueue) order.
pub const RING_SIZE: usize = 64;

pub(crate) type DispatchFn = fn(&mut ClockEngine, &mut EngineFlags, EventId);

pub(crate) fn dispatch_direct(clock: &mut ClockEngine, flags: &mut EngineFlags, id: EventId) {
    clock.exec_event(flags, id);
}

/// Stall stub substituted for the real dispatch while a stall count is
/// active, so the per-cycle hot path never branches on stall state for
/// events that never stall.
pub(crate) fn dispatch_stalled(clock: &mut ClockEngine, _flags: &mut EngineFlags, id: EventId) {
    let Some(ev) = clock.arena.get_mut(id) else {
        return;
    };
    ev.stall_cycles = ev.stall_cycles.saturating_sub(1);
    if ev.stall_cycles == 0 {
        ev.dispatch = dispatch_direct;
    }
}

pub struct ClockEngine {
    name: String,
    freq_hz: u64,
    period_ps: u64,
    /// Cycle currently being (or last) executed. For an idle domain this is a
    /// synthetic elapsed count, reconciled lazily by [`sync`](Self::sync).
    cycles: u64,
    /// Ring index of `cycles`.
    current_cycle: u64,
    ring: [EventList; RING_SIZE],
    ring_count: usize,
    /// Far-horizon one-shot events, ascending by absolute target cycle.
    delayed: EventList,
    /// Permanently-enabled events, most recently enabled first.
    permanent: EventList,
    /// Picosecond timestamp of cycle `cycles`; the anchor used to resynchronize
    /// the cycle count after an idle period.
    stop_time: u64,
    /// Absolute cycle of the next pending work, if any.
    next_due: Option<u64>,
    /// True while `exec` is on the stack.
    running: bool,
    /// True when cycle `cycles` has actually been executed (as opposed to a
    /// synthetic count reconciled while idle). Guards against re-running a
    /// boundary cycle when an event is enabled at that exact instant.
    last_cycle_executed: bool,
    arena: EventArena,
    /// Reused per-cycle snapshot of the permanent list.
    scratch: Vec<EventId>,
}

impl ClockEngine {
    pub(crate) fn new(name: impl Into<String>, freq_hz: u64) -> Self {
        Self {
            name: name.into(),
            freq_hz,
            period_ps: period_ps(freq_hz),
            cycles: 0,
            current_cycle: 0,
            ring: [EventList::EMPTY; RING_SIZE],
            ring_count: 0,
            delayed: EventList::EMPTY,
            permanent: EventList::EMPTY,
            stop_time: 0,
            next_due: None,
            running: false,
            last_cycle_executed: false,
            arena: EventArena::default(),
            scratch: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_frequency(&self) -> u64 {
        self.freq_hz
    }

    /// Picoseconds per cycle. Frequency may change on any cycle boundary, so
    /// callers must not cache this across cycles.
    pub fn get_period(&self) -> u64 {
        self.period_ps
    }

    /// Cycle count of the domain. For an idle domain this lags simulated time
    /// until the next `sync`.
    pub fn get_cycles(&self) -> u64 {
        self.cycles
    }

    /// Timestamp of the domain's current cycle boundary.
    pub fn time_ps(&self) -> u64 {
        self.stop_time
    }

    pub fn has_events(&self) -> bool {
        self.ring_count > 0 || !self.delayed.is_empty() || !self.permanent.is_empty()
    }

    pub fn is_enqueued(&self, id: EventId) -> bool {
        self.arena.get(id).is_some_and(|ev| ev.queue != Queue::None)
    }

    /// Creates a new event owned by this domain. The scheduler never owns the
    /// event: it stays allocated until [`del_event`](Self::del_event).
    pub fn new_event(&mut self, name: impl Into<String>, callback: EventFn) -> EventId {
        self.arena.alloc(ClockEvent {
            name: name.into(),
            callback: Some(callback),
            dispatch: dispatch_direct,
            queue: Queue::None,
            next: None,
            prev: None,
            cycle: 0,
            stall_cycles: 0,
        })
    }

    /// Cancels and destroys an event. No-op on a stale handle, so an owner may
    /// delete from inside the event's own callback.
    pub fn del_event(&mut self, id: EventId) {
        if self.arena.get(id).is_none() {
            return;
        }
        self.cancel(id);
        self.arena.free(id);
    }

    /// Schedules one future execution of `id`, `delta_cycles` from the current
    /// cycle. A delta of 0 means the next cycle, never "now": an event cannot
    /// execute within the call that enqueued it.
    ///
    /// Fails silently if the event is already scheduled in any container;
    /// callers must `cancel` first.
    ///
    /// # Panics
    ///
    /// Panics on a stale handle: scheduling a destroyed event is a model bug
    /// that would otherwise drop work silently.
    pub fn enqueue(&mut self, id: EventId, delta_cycles: u64) {
        let cycles = self.cycles;
        let ev = self
            .arena
            .get_mut(id)
            .expect("enqueue on dead clock event handle");
        if ev.queue != Queue::None {
            return;
        }
        let delta = delta_cycles.max(1);
        let target = cycles + delta;
        ev.cycle = target;
        if delta < RING_SIZE as u64 {
            let slot = (target % RING_SIZE as u64) as u16;
            ev.queue = Queue::Ring(slot);
            self.ring[slot as usize].push_back(&mut self.arena, id);
            self.ring_count += 1;
        } else {
            ev.queue = Queue::Delayed;
            self.insert_delayed(id, target);
        }
        self.schedule_due(target);
    }

    /// Removes the event from whichever container holds it; no-op if not
    /// scheduled (or on a stale handle).
    pub fn cancel(&mut self, id: EventId) {
        let Some(ev) = self.arena.get(id) else {
            return;
        };
        match ev.queue {
            Queue::None => return,
            Queue::Ring(slot) => {
                self.ring[slot as usize].remove(&mut self.arena, id);
                self.ring_count -= 1;
            }
            Queue::Delayed => self.delayed.remove(&mut self.arena, id),
            Queue::Permanent => self.permanent.remove(&mut self.arena, id),
        }
        self.arena.get_mut(id).expect("event vanished during cancel").queue = Queue::None;
        if !self.has_events() {
            self.next_due = None;
        }
    }

    /// Cancel-then-enqueue, for periodic models that reschedule themselves.
    pub fn reenqueue(&mut self, id: EventId, delta_cycles: u64) {
        self.cancel(id);
        self.enqueue(id, delta_cycles);
    }

    /// Moves the event into the permanently-enabled list: it executes once per
    /// cycle until disabled. No-op if already enabled.
    ///
    /// # Panics
    ///
    /// Panics on a stale handle.
    pub fn enable(&mut self, id: EventId) {
        {
            let ev = self
                .arena
                .get_mut(id)
                .expect("enable on dead clock event handle");
            if ev.queue == Queue::Permanent {
                return;
            }
        }
        self.cancel(id);
        {
            let ev = self.arena.get_mut(id).expect("event vanished during enable");
            ev.queue = Queue::Permanent;
            ev.dispatch = if ev.stall_cycles > 0 {
                dispatch_stalled
            } else {
                dispatch_direct
            };
        }
        self.permanent.push_front(&mut self.arena, id);
        if self.running {
            // The permanent pass for this cycle is already done; start next cycle.
            self.schedule_due(self.cycles + 1);
        }
    }

    /// Takes the event out of the permanently-enabled list; no-op otherwise.
    pub fn disable(&mut self, id: EventId) {
        let Some(ev) = self.arena.get(id) else {
            return;
        };
        if ev.queue != Queue::Permanent {
            return;
        }
        self.permanent.remove(&mut self.arena, id);
        self.arena.get_mut(id).expect("event vanished during disable").queue = Queue::None;
        if !self.has_events() {
            self.next_due = None;
        }
    }

    /// Sets the stall count: while enabled, the event is skipped for the next
    /// `n` cycles. Zero restores per-cycle firing immediately.
    pub fn stall_cycles_set(&mut self, id: EventId, n: u64) {
        let Some(ev) = self.arena.get_mut(id) else {
            return;
        };
        ev.stall_cycles = n;
        ev.dispatch = if n > 0 { dispatch_stalled } else { dispatch_direct };
    }

    /// Adds `n` to the stall count.
    pub fn stall_cycles_inc(&mut self, id: EventId, n: u64) {
        let Some(ev) = self.arena.get_mut(id) else {
            return;
        };
        ev.stall_cycles += n;
        ev.dispatch = if ev.stall_cycles > 0 {
            dispatch_stalled
        } else {
            dispatch_direct
        };
    }

    /// Reconciles the cycle count of an idle domain against elapsed simulated
    /// time. Domains with permanent events advance every cycle and never need
    /// reconciliation; a domain that is mid-`exec` must not be rewritten.
    ///
    /// This can never skip a pending one-shot: the global engine's time cannot
    /// pass the domain's registered wakeup without executing it, so
    /// `now_ps` is always at or before the earliest due event.
    pub(crate) fn sync(&mut self, now_ps: u64) {
        if self.running || !self.permanent.is_empty() {
            return;
        }
        if now_ps <= self.stop_time {
            return;
        }
        let elapsed = (now_ps - self.stop_time) / self.period_ps;
        if elapsed > 0 {
            self.cycles += elapsed;
            self.current_cycle = self.cycles % RING_SIZE as u64;
            self.stop_time += elapsed * self.period_ps;
            self.last_cycle_executed = false;
        }
        if let Some(due) = self.next_due {
            assert!(
                due >= self.cycles,
                "clock domain `{}` resynchronized past its next due event",
                self.name
            );
        }
    }

    /// External-caller variant of [`enqueue`](Self::enqueue): the caller may be
    /// outside the currently-running domain, so the cycle count is
    /// resynchronized first.
    pub(crate) fn enqueue_ext(&mut self, now_ps: u64, id: EventId, delta_cycles: u64) {
        self.sync(now_ps);
        self.enqueue(id, delta_cycles);
    }

    pub(crate) fn reenqueue_ext(&mut self, now_ps: u64, id: EventId, delta_cycles: u64) {
        self.sync(now_ps);
        self.reenqueue(id, delta_cycles);
    }

    /// External-caller variant of [`enable`](Self::enable).
    pub(crate) fn enable_ext(&mut self, now_ps: u64, id: EventId) {
        self.sync(now_ps);
        self.enable(id);
        if !self.running {
            // First tick lands on the current boundary if we sit exactly on
            // one that has not run yet, otherwise on the next.
            let due = if self.stop_time == now_ps && !self.last_cycle_executed {
                self.cycles
            } else {
                self.cycles + 1
            };
            self.schedule_due(due);
        }
    }

    /// Recomputes the period from a new frequency. The cycle count is
    /// resynchronized first so that cycles elapsed under the old period stay
    /// consistent.
    pub(crate) fn apply_frequency(&mut self, now_ps: u64, freq_hz: u64) {
        self.sync(now_ps);
        self.freq_hz = freq_hz;
        self.period_ps = period_ps(freq_hz);
    }

    /// Absolute timestamp of the next due event, if any.
    pub(crate) fn next_event_time_ps(&self) -> Option<u64> {
        let due = self.next_due?;
        debug_assert!(due >= self.cycles);
        Some(self.stop_time + (due - self.cycles) * self.period_ps)
    }

    /// Runs this domain's turn: executes every permanent event due this cycle
    /// (decrementing stalled ones), drains the current ring slot and any
    /// far-horizon events now due, and returns the relative picosecond
    /// distance to the next due event, or `None` when no further events are
    /// known.
    pub(crate) fn exec(&mut self, flags: &mut EngineFlags) -> Option<u64> {
        let due = self.next_due.take()?;
        assert!(
            due >= self.cycles,
            "clock domain `{}` asked to run cycle {} behind cycle {}",
            self.name,
            due,
            self.cycles
        );
        self.running = true;
        self.last_cycle_executed = true;
        self.stop_time += (due - self.cycles) * self.period_ps;
        self.cycles = due;
        self.current_cycle = due % RING_SIZE as u64;

        // Permanent events first, most recently enabled first. The snapshot
        // makes it safe for callbacks to enable/disable/destroy any event of
        // this domain mid-pass; entries are revalidated before dispatch.
        if !self.permanent.is_empty() {
            self.scratch.clear();
            let mut cur = self.permanent.head();
            while let Some(id) = cur {
                self.scratch.push(id);
                cur = self.arena.get(id).expect("permanent list entry is dead").next;
            }
            for i in 0..self.scratch.len() {
                let id = self.scratch[i];
                // Revalidate: an earlier callback this cycle may have disabled
                // or destroyed the entry.
                let dispatch = match self.arena.get(id) {
                    Some(ev) if ev.queue == Queue::Permanent => ev.dispatch,
                    _ => continue,
                };
                dispatch(self, flags, id);
            }
        }

        // One-shots in the current ring slot, FIFO. Re-enqueues from callbacks
        // always land in a different slot (relative deltas are below
        // RING_SIZE), so popping until empty terminates.
        let slot = self.current_cycle as usize;
        while let Some(id) = self.ring[slot].pop_front(&mut self.arena) {
            self.ring_count -= 1;
            let ev = self.arena.get_mut(id).expect("ring slot entry is dead");
            assert!(
                ev.cycle == self.cycles,
                "clock event `{}` drained off its target cycle",
                ev.name
            );
            ev.queue = Queue::None;
            self.exec_event(flags, id);
        }

        // Far-horizon events due now. The list is ascending, so due entries
        // are at the head.
        while let Some(head) = self.delayed.head() {
            let target = self.arena.get(head).expect("far-horizon entry is dead").cycle;
            if target > self.cycles {
                break;
            }
            assert!(
                target == self.cycles,
                "clock domain `{}` left a far-horizon event behind",
                self.name
            );
            self.delayed.pop_front(&mut self.arena);
            self.arena.get_mut(head).expect("far-horizon entry is dead").queue = Queue::None;
            self.exec_event(flags, head);
        }

        self.running = false;
        self.next_due = self.compute_next_due();
        self.next_due.map(|c| (c - self.cycles) * self.period_ps)
    }

    pub(crate) fn exec_event(&mut self, flags: &mut EngineFlags, id: EventId) {
        let Some(ev) = self.arena.get_mut(id) else {
            return;
        };
        // Taking the callback out doubles as a re-entrancy guard.
        let Some(mut callback) = ev.callback.take() else {
            return;
        };
        let mut ctx = ClockContext {
            clock: self,
            flags,
            event: id,
        };
        callback(&mut ctx);
        // The owner may have destroyed the event from inside the callback.
        if let Some(ev) = self.arena.get_mut(id) {
            ev.callback = Some(callback);
        }
    }

    fn insert_delayed(&mut self, id: EventId, target: u64) {
        let mut pos = self.delayed.head();
        while let Some(p) = pos {
            let ev = self.arena.get(p).expect("far-horizon entry is dead");
            // FIFO among equal targets: keep scanning past them.
            if ev.cycle > target {
                break;
            }
            pos = ev.next;
        }
        self.delayed.insert_before(&mut self.arena, pos, id);
    }

    fn schedule_due(&mut self, cycle: u64) {
        self.next_due = Some(match self.next_due {
            Some(due) => due.min(cycle),
            None => cycle,
        });
    }

    fn compute_next_due(&self) -> Option<u64> {
        if !self.permanent.is_empty() {
            // Nothing can be due earlier than the very next cycle.
            return Some(self.cycles + 1);
        }
        let mut best: Option<u64> = None;
        if self.ring_count > 0 {
            for d in 1..RING_SIZE as u64 {
                let slot = ((self.cycles + d) % RING_SIZE as u64) as usize;
                if !self.ring[slot].is_empty() {
                    best = Some(self.cycles + d);
                    break;
                }
            }
        }
        if let Some(head) = self.delayed.head() {
            let target = self.arena.get(head).expect("far-horizon entry is dead").cycle;
            best = Some(match best {
                Some(b) => b.min(target),
                None => target,
            });
        }
        best
    }
}

/// Context handed to clock event callbacks.
///
/// Scoped to the owning domain: callbacks schedule on their own domain
/// directly and reach the global engine only through stop/quit requests.
/// Cross-domain scheduling goes through the kernel lock.
pub struct ClockContext<'a> {
    pub(crate) clock: &'a mut ClockEngine,
    pub(crate) flags: &'a mut EngineFlags,
    pub(crate) event: EventId,
}

impl<'a> ClockContext<'a> {
    /// The event being executed.
    pub fn event(&self) -> EventId {
        self.event
    }

    /// Full scheduling access to the owning domain.
    pub fn clock(&mut self) -> &mut ClockEngine {
        self.clock
    }

    /// Cycle currently executing.
    pub fn cycles(&self) -> u64 {
        self.clock.get_cycles()
    }

    /// Timestamp of the current cycle boundary.
    pub fn time_ps(&self) -> u64 {
        self.clock.time_ps()
    }

    /// Reschedules the executing event `delta_cycles` ahead.
    pub fn reenqueue(&mut self, delta_cycles: u64) {
        let id = self.event;
        self.clock.reenqueue(id, delta_cycles);
    }

    /// Asks the global engine to pause at the next timestamp boundary.
    pub fn request_stop(&mut self) {
        self.flags.request_stop();
    }

    /// Ends the simulation with `status` at the next timestamp boundary.
    pub fn quit(&mut self, status: i32) {
        self.flags.quit(status);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    fn engine_1mhz() -> (ClockEngine, EngineFlags) {
        // 1 MHz: period of exactly 1_000_000 ps.
        (ClockEngine::new("test", 1_000_000), EngineFlags::default())
    }

    fn recording_event(clock: &mut ClockEngine, hits: &Arc<AtomicU64>) -> EventId {
        let hits = Arc::clone(hits);
        clock.new_event(
            "record",
            Box::new(move |ctx| {
                hits.store(ctx.cycles() + 1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn zero_delta_means_next_cycle() {
        let (mut clock, mut flags) = engine_1mhz();
        let hits = Arc::new(AtomicU64::new(0));
        let ev = recording_event(&mut clock, &hits);

        clock.enqueue(ev, 0);
        assert_eq!(clock.next_event_time_ps(), Some(1_000_000));

        assert_eq!(clock.exec(&mut flags), None);
        assert_eq!(clock.get_cycles(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2); // executed on cycle 1
    }

    #[test]
    fn enqueue_while_enqueued_is_ignored() {
        let (mut clock, mut flags) = engine_1mhz();
        let hits = Arc::new(AtomicU64::new(0));
        let ev = recording_event(&mut clock, &hits);

        clock.enqueue(ev, 5);
        clock.enqueue(ev, 2); // silently ignored; cancel first to move it
        assert_eq!(clock.next_event_time_ps(), Some(5_000_000));

        clock.exec(&mut flags);
        assert_eq!(clock.get_cycles(), 5);
    }

    #[test]
    fn reenqueue_moves_the_event() {
        let (mut clock, mut flags) = engine_1mhz();
        let hits = Arc::new(AtomicU64::new(0));
        let ev = recording_event(&mut clock, &hits);

        clock.enqueue(ev, 5);
        clock.reenqueue(ev, 2);
        assert_eq!(clock.next_event_time_ps(), Some(2_000_000));

        clock.exec(&mut flags);
        assert_eq!(clock.get_cycles(), 2);
    }

    #[test]
    fn cancel_is_a_noop_when_not_enqueued() {
        let (mut clock, _) = engine_1mhz();
        let hits = Arc::new(AtomicU64::new(0));
        let ev = recording_event(&mut clock, &hits);

        clock.cancel(ev);
        clock.enqueue(ev, 3);
        clock.cancel(ev);
        assert!(!clock.has_events());
        assert_eq!(clock.next_event_time_ps(), None);
    }

    #[test]
    fn fifo_within_one_ring_slot() {
        let (mut clock, mut flags) = engine_1mhz();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in 0..3u32 {
            let order = Arc::clone(&order);
            let ev = clock.new_event(
                format!("e{tag}"),
                Box::new(move |_| order.lock().unwrap().push(tag)),
            );
            clock.enqueue(ev, 4);
        }
        clock.exec(&mut flags);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn permanent_event_fires_every_cycle() {
        let (mut clock, mut flags) = engine_1mhz();
        let count = Arc::new(AtomicU64::new(0));
        let ev = {
            let count = Arc::clone(&count);
            clock.new_event(
                "tick",
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        clock.enable_ext(0, ev);

        for _ in 0..10 {
            let delta = clock.exec(&mut flags);
            assert_eq!(delta, Some(1_000_000));
        }
        assert_eq!(count.load(Ordering::SeqCst), 10);

        clock.disable(ev);
        assert!(!clock.has_events());
    }

    #[test]
    fn stall_skips_exactly_k_cycles() {
        let (mut clock, mut flags) = engine_1mhz();
        let count = Arc::new(AtomicU64::new(0));
        let ev = {
            let count = Arc::clone(&count);
            clock.new_event(
                "tick",
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        clock.enable_ext(0, ev);
        clock.stall_cycles_set(ev, 3);

        for _ in 0..3 {
            clock.exec(&mut flags);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        for _ in 0..4 {
            clock.exec(&mut flags);
        }
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn clearing_a_stall_restores_per_cycle_firing() {
        let (mut clock, mut flags) = engine_1mhz();
        let count = Arc::new(AtomicU64::new(0));
        let ev = {
            let count = Arc::clone(&count);
            clock.new_event(
                "tick",
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        clock.enable_ext(0, ev);
        clock.stall_cycles_set(ev, 1_000);
        clock.exec(&mut flags);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        clock.stall_cycles_set(ev, 0);
        clock.exec(&mut flags);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stall_inc_accumulates() {
        let (mut clock, mut flags) = engine_1mhz();
        let count = Arc::new(AtomicU64::new(0));
        let ev = {
            let count = Arc::clone(&count);
            clock.new_event(
                "tick",
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        clock.enable_ext(0, ev);
        clock.stall_cycles_inc(ev, 1);
        clock.stall_cycles_inc(ev, 1);

        for _ in 0..2 {
            clock.exec(&mut flags);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        clock.exec(&mut flags);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_event_reschedules_itself() {
        let (mut clock, mut flags) = engine_1mhz();
        let count = Arc::new(AtomicU64::new(0));
        let ev = {
            let count = Arc::clone(&count);
            clock.new_event(
                "periodic",
                Box::new(move |ctx| {
                    count.fetch_add(1, Ordering::SeqCst);
                    ctx.reenqueue(7);
                }),
            )
        };
        clock.enqueue(ev, 7);

        let mut fired_at = Vec::new();
        for _ in 0..5 {
            clock.exec(&mut flags);
            fired_at.push(clock.get_cycles());
        }
        assert_eq!(fired_at, vec![7, 14, 21, 28, 35]);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn sync_reconciles_idle_cycles() {
        let (mut clock, _) = engine_1mhz();
        // 10.5 periods of idle time elapse.
        clock.sync(10_500_000);
        assert_eq!(clock.get_cycles(), 10);
        assert_eq!(clock.time_ps(), 10_000_000);

        // The remainder carries: half a period later another cycle completes.
        clock.sync(11_000_000);
        assert_eq!(clock.get_cycles(), 11);
    }

    #[test]
    fn frequency_change_resynchronizes_first() {
        let (mut clock, _) = engine_1mhz();
        clock.apply_frequency(10_000_000, 2_000_000);
        assert_eq!(clock.get_cycles(), 10);
        assert_eq!(clock.get_frequency(), 2_000_000);
        assert_eq!(clock.get_period(), 500_000);

        // Cycles now accrue at the new period from the anchored boundary.
        clock.sync(11_000_000);
        assert_eq!(clock.get_cycles(), 12);
    }

    #[test]
    fn deleting_own_event_from_callback_is_safe() {
        let (mut clock, mut flags) = engine_1mhz();
        let ev = clock.new_event(
            "suicide",
            Box::new(move |ctx| {
                let id = ctx.event();
                ctx.clock().del_event(id);
            }),
        );
        clock.enqueue(ev, 1);
        clock.exec(&mut flags);
        assert!(!clock.is_enqueued(ev));
        assert!(!clock.has_events());
    }

    #[test]
    #[should_panic(expected = "dead clock event handle")]
    fn enqueue_on_deleted_event_panics() {
        let (mut clock, _) = engine_1mhz();
        let ev = clock.new_event("gone", Box::new(|_| {}));
        clock.del_event(ev);
        clock.enqueue(ev, 1);
    }
}
