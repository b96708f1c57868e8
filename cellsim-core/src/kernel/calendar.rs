//! Calendar queue with a two-phase sweep per tick.
//!
//! Events live in a slab and are threaded through index-linked doubly linked
//! lists, one list per `(phase, tick mod horizon)` bucket:
//!
//! ```text
//!   buckets[Early]:  slot 0 -> [e3] -> [e7]      slot 1 -> []    ...  slot H-1
//!   buckets[Late]:   slot 0 -> []                slot 1 -> [e1]  ...
//!   sweep[phase]:    bucket detached for the tick being processed
//! ```
//!
//! Advancing tick `t` detaches bucket `t mod H` of a phase into that phase's
//! sweep list. Members due at `t` fire; members whose tick merely collides
//! modulo the horizon go back into their bucket and wait for a later lap.
//! Every record knows which list it is on, so cancelling is O(1) and an event
//! that is on no list is known to be idle.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::clock::{Phase, Tick};
use crate::error::{ConfigError, SimError, SimResult};
use crate::kernel::object::ObjectId;

const NONE: u32 = u32::MAX;

/// Handle to an event allocated in a [`Calendar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u32);

impl EventHandle {
    /// Raw slab index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What caused an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A scheduled event reached its tick
    Event(EventHandle),
    /// Per-tick registration
    EveryTick,
}

/// One callback invocation handed to a simulated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// Object to activate
    pub owner: ObjectId,
    /// Discriminator chosen by the owner
    pub key: u32,
    /// Phase being executed
    pub phase: Phase,
    /// Tick being executed
    pub tick: Tick,
    /// Event or per-tick registration
    pub trigger: Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListRef {
    Bucket { phase: Phase, slot: u32 },
    Sweep { phase: Phase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Idle,
    Listed(ListRef),
}

#[derive(Debug, Clone, Copy)]
struct List {
    head: u32,
    tail: u32,
}

impl List {
    const EMPTY: List = List {
        head: NONE,
        tail: NONE,
    };
}

#[derive(Debug, Clone)]
struct EventRecord {
    owner: ObjectId,
    owner_name: Arc<str>,
    key: u32,
    time: Tick,
    phase: Phase,
    location: Location,
    prev: u32,
    next: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PerTick {
    owner: ObjectId,
    key: u32,
}

/// Event calendar and tick counter of one simulation.
#[derive(Debug, Clone)]
pub struct Calendar {
    now: Tick,
    horizon: usize,
    events: Vec<EventRecord>,
    buckets: [Vec<List>; 2],
    sweep: [List; 2],
    started: [bool; 2],
    current: Option<Phase>,
    per_tick: [Vec<Option<PerTick>>; 2],
    pending: usize,
}

impl Calendar {
    /// Creates a calendar with `horizon` buckets per phase.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If `horizon` is zero or does not fit a `u32`
    pub fn new(horizon: usize) -> Result<Self, ConfigError> {
        if horizon == 0 || u32::try_from(horizon).is_err() {
            return Err(ConfigError::BelowMinimum {
                object: "calendar".to_string(),
                parameter: "horizon",
                minimum: 1,
                value: horizon as u64,
            });
        }
        Ok(Self {
            now: 0,
            horizon,
            events: Vec::new(),
            buckets: [vec![List::EMPTY; horizon], vec![List::EMPTY; horizon]],
            sweep: [List::EMPTY; 2],
            started: [false; 2],
            current: None,
            per_tick: [Vec::new(), Vec::new()],
            pending: 0,
        })
    }

    /// Current tick.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of buckets per phase.
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Number of scheduled events not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Phase currently being swept, if a tick is in progress.
    pub fn current_phase(&self) -> Option<Phase> {
        self.current
    }

    /// Whether the sweep of `phase` has begun for the current tick.
    pub fn phase_started(&self, phase: Phase) -> bool {
        self.started[phase.index()]
    }

    /// Allocates an idle event owned by `owner`.
    pub fn allocate(&mut self, owner: ObjectId, owner_name: Arc<str>, key: u32) -> EventHandle {
        let handle = EventHandle(self.events.len() as u32);
        self.events.push(EventRecord {
            owner,
            owner_name,
            key,
            time: 0,
            phase: Phase::Early,
            location: Location::Idle,
            prev: NONE,
            next: NONE,
        });
        handle
    }

    /// Owner of an event.
    ///
    /// # Errors
    ///
    /// - `SimError::UnknownEvent` - If the handle was not allocated here
    pub fn owner(&self, event: EventHandle) -> SimResult<ObjectId> {
        Ok(self.record(event)?.owner)
    }

    /// Key chosen by the owner when the event was allocated.
    ///
    /// # Errors
    ///
    /// - `SimError::UnknownEvent` - If the handle was not allocated here
    pub fn key(&self, event: EventHandle) -> SimResult<u32> {
        Ok(self.record(event)?.key)
    }

    /// Whether the event is pending.
    pub fn is_scheduled(&self, event: EventHandle) -> bool {
        self.events
            .get(event.index())
            .is_some_and(|record| record.location != Location::Idle)
    }

    /// Target tick of a pending event.
    pub fn target(&self, event: EventHandle) -> Option<Tick> {
        self.events
            .get(event.index())
            .filter(|record| record.location != Location::Idle)
            .map(|record| record.time)
    }

    /// Schedules `event` to fire `delay` ticks from now in `phase`.
    ///
    /// Returns the absolute target tick.
    ///
    /// # Errors
    ///
    /// - `SimError::DoubleSchedule` - If the event is already pending
    /// - `SimError::ElapsedPhase` - If `delay` is 0 and `phase` has already been swept this tick
    /// - `SimError::TickOverflow` - If the target tick does not fit a `Tick`
    /// - `SimError::UnknownEvent` - If the handle was not allocated here
    pub fn schedule(&mut self, event: EventHandle, delay: Tick, phase: Phase) -> SimResult<Tick> {
        let record = self.record(event)?;
        let time = self.now.checked_add(delay).ok_or(SimError::TickOverflow {
            now: self.now,
            delay,
        })?;
        if record.location != Location::Idle {
            return Err(SimError::DoubleSchedule {
                owner: record.owner_name.to_string(),
                key: record.key,
                scheduled_for: record.time,
                requested: time,
            });
        }
        if delay == 0 && self.started[phase.index()] {
            return Err(SimError::ElapsedPhase {
                owner: record.owner_name.to_string(),
                key: record.key,
                phase,
                tick: self.now,
            });
        }

        let record = &mut self.events[event.index()];
        record.time = time;
        record.phase = phase;
        let slot = self.slot_of(time);
        self.push_back(ListRef::Bucket { phase, slot }, event.0);
        self.pending += 1;
        trace!(event = event.0, time, %phase, "scheduled");
        Ok(time)
    }

    /// Removes a pending event from its bucket or from the active sweep list.
    ///
    /// # Errors
    ///
    /// - `SimError::CancelNotScheduled` - If the event is not pending
    /// - `SimError::UnknownEvent` - If the handle was not allocated here
    pub fn cancel(&mut self, event: EventHandle) -> SimResult<()> {
        let record = self.record(event)?;
        if record.location == Location::Idle {
            return Err(SimError::CancelNotScheduled {
                owner: record.owner_name.to_string(),
                key: record.key,
                last_target: record.time,
                now: self.now,
            });
        }
        self.unlink(event.0);
        self.pending -= 1;
        trace!(event = event.0, "cancelled");
        Ok(())
    }

    /// Registers `owner` for an activation in `phase` of every tick.
    ///
    /// Per-tick activations fire after the scheduled events of the phase, in
    /// registration order.
    pub fn register_per_tick(&mut self, owner: ObjectId, key: u32, phase: Phase) {
        self.per_tick[phase.index()].push(Some(PerTick { owner, key }));
    }

    /// Removes a per-tick registration; returns whether one was found.
    pub fn unregister_per_tick(&mut self, owner: ObjectId, key: u32, phase: Phase) -> bool {
        let wanted = PerTick { owner, key };
        match self.per_tick[phase.index()]
            .iter_mut()
            .find(|entry| **entry == Some(wanted))
        {
            Some(entry) => {
                *entry = None;
                true
            }
            None => false,
        }
    }

    /// Executes the current tick and moves the clock forward by one.
    ///
    /// `fire` receives the calendar back so activations can schedule and
    /// cancel while the sweep is in progress.
    ///
    /// # Errors
    ///
    /// - Any error returned by `fire`, which stops the tick immediately
    /// - `SimError::StaleEvent` - If a bucket holds an event from the past
    /// - `SimError::TickOverflow` - If the clock cannot advance
    pub fn advance<F>(&mut self, mut fire: F) -> SimResult<()>
    where
        F: FnMut(&mut Calendar, Activation) -> SimResult<()>,
    {
        for phase in Phase::ALL {
            self.begin_phase(phase);

            while let Some(activation) = self.next_due(phase)? {
                fire(self, activation)?;
            }

            let mut index = 0;
            while index < self.per_tick[phase.index()].len() {
                if let Some(entry) = self.per_tick[phase.index()][index] {
                    let activation = Activation {
                        owner: entry.owner,
                        key: entry.key,
                        phase,
                        tick: self.now,
                        trigger: Trigger::EveryTick,
                    };
                    fire(self, activation)?;
                }
                index += 1;
            }
            self.per_tick[phase.index()].retain(Option::is_some);
            self.current = None;
        }
        self.finish_tick()
    }

    /// Rebases every pending event so that the current tick becomes zero.
    ///
    /// Returns the amount subtracted from every tick value.
    ///
    /// # Errors
    ///
    /// - `SimError::RenormalizeDuringTick` - If called while a tick is in progress
    /// - `SimError::StaleEvent` - If a pending event lies before the current tick
    pub fn renormalize(&mut self) -> SimResult<Tick> {
        if self.started.iter().any(|started| *started) {
            return Err(SimError::RenormalizeDuringTick { now: self.now });
        }
        let delta = self.now;

        let mut listed = Vec::with_capacity(self.pending);
        for (index, record) in self.events.iter().enumerate() {
            if record.location == Location::Idle {
                continue;
            }
            if record.time < delta {
                return Err(SimError::StaleEvent {
                    owner: record.owner_name.to_string(),
                    key: record.key,
                    time: record.time,
                    now: delta,
                });
            }
            listed.push(index as u32);
        }

        for &index in &listed {
            self.unlink(index);
        }
        for &index in &listed {
            let (phase, time) = {
                let record = &mut self.events[index as usize];
                record.time -= delta;
                (record.phase, record.time)
            };
            let slot = self.slot_of(time);
            self.push_back(ListRef::Bucket { phase, slot }, index);
        }
        self.now = 0;
        debug!(delta, pending = self.pending, "calendar renormalized");
        Ok(delta)
    }

    /// Forgets every event and registration and sets the clock to zero.
    pub fn reset(&mut self) {
        self.now = 0;
        self.events.clear();
        for buckets in &mut self.buckets {
            buckets.fill(List::EMPTY);
        }
        self.sweep = [List::EMPTY; 2];
        self.started = [false; 2];
        self.current = None;
        self.per_tick = [Vec::new(), Vec::new()];
        self.pending = 0;
    }

    fn begin_phase(&mut self, phase: Phase) {
        let slot = self.slot_of(self.now);
        let detached = std::mem::replace(
            &mut self.buckets[phase.index()][slot as usize],
            List::EMPTY,
        );
        self.sweep[phase.index()] = detached;

        let mut cursor = detached.head;
        while cursor != NONE {
            let record = &mut self.events[cursor as usize];
            record.location = Location::Listed(ListRef::Sweep { phase });
            cursor = record.next;
        }
        self.started[phase.index()] = true;
        self.current = Some(phase);
    }

    fn next_due(&mut self, phase: Phase) -> SimResult<Option<Activation>> {
        loop {
            let head = self.sweep[phase.index()].head;
            if head == NONE {
                return Ok(None);
            }
            self.unlink(head);

            let record = &self.events[head as usize];
            if record.time == self.now {
                self.pending -= 1;
                return Ok(Some(Activation {
                    owner: record.owner,
                    key: record.key,
                    phase,
                    tick: self.now,
                    trigger: Trigger::Event(EventHandle(head)),
                }));
            }
            if record.time < self.now {
                return Err(SimError::StaleEvent {
                    owner: record.owner_name.to_string(),
                    key: record.key,
                    time: record.time,
                    now: self.now,
                });
            }
            // Collided modulo the horizon; due on a later lap.
            let slot = self.slot_of(record.time);
            self.push_back(ListRef::Bucket { phase, slot }, head);
        }
    }

    fn finish_tick(&mut self) -> SimResult<()> {
        self.started = [false; 2];
        self.current = None;
        self.now = self
            .now
            .checked_add(1)
            .ok_or(SimError::TickOverflow {
                now: self.now,
                delay: 1,
            })?;
        Ok(())
    }

    fn record(&self, event: EventHandle) -> SimResult<&EventRecord> {
        self.events
            .get(event.index())
            .ok_or(SimError::UnknownEvent {
                index: event.index(),
            })
    }

    fn slot_of(&self, time: Tick) -> u32 {
        (time % self.horizon as u64) as u32
    }

    fn list(&self, list: ListRef) -> List {
        match list {
            ListRef::Bucket { phase, slot } => self.buckets[phase.index()][slot as usize],
            ListRef::Sweep { phase } => self.sweep[phase.index()],
        }
    }

    fn list_mut(&mut self, list: ListRef) -> &mut List {
        match list {
            ListRef::Bucket { phase, slot } => &mut self.buckets[phase.index()][slot as usize],
            ListRef::Sweep { phase } => &mut self.sweep[phase.index()],
        }
    }

    fn push_back(&mut self, list: ListRef, index: u32) {
        let tail = self.list(list).tail;
        {
            let record = &mut self.events[index as usize];
            record.location = Location::Listed(list);
            record.prev = tail;
            record.next = NONE;
        }
        if tail == NONE {
            self.list_mut(list).head = index;
        } else {
            self.events[tail as usize].next = index;
        }
        self.list_mut(list).tail = index;
    }

    fn unlink(&mut self, index: u32) {
        let (location, prev, next) = {
            let record = &self.events[index as usize];
            (record.location, record.prev, record.next)
        };
        let Location::Listed(list) = location else {
            return;
        };
        if prev == NONE {
            self.list_mut(list).head = next;
        } else {
            self.events[prev as usize].next = next;
        }
        if next == NONE {
            self.list_mut(list).tail = prev;
        } else {
            self.events[next as usize].prev = prev;
        }
        let record = &mut self.events[index as usize];
        record.location = Location::Idle;
        record.prev = NONE;
        record.next = NONE;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn owner() -> (ObjectId, Arc<str>) {
        (ObjectId::new(0), Arc::from("owner"))
    }

    fn run_tick(calendar: &mut Calendar, log: &mut Vec<(Tick, Phase, u32)>) {
        calendar
            .advance(|_, activation| {
                log.push((activation.tick, activation.phase, activation.key));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_zero_horizon_rejected() {
        assert!(matches!(
            Calendar::new(0),
            Err(ConfigError::BelowMinimum { parameter: "horizon", .. })
        ));
    }

    #[test]
    fn test_event_fires_at_exact_tick_and_phase() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 7);
        assert_eq!(calendar.schedule(event, 3, Phase::Late).unwrap(), 3);

        let mut log = Vec::new();
        for _ in 0..6 {
            run_tick(&mut calendar, &mut log);
        }
        assert_eq!(log, vec![(3, Phase::Late, 7)]);
        assert_eq!(calendar.pending(), 0);
        assert!(!calendar.is_scheduled(event));
    }

    #[test]
    fn test_early_phase_completes_before_late_phase() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let late = calendar.allocate(id, name.clone(), 1);
        let early_a = calendar.allocate(id, name.clone(), 2);
        let early_b = calendar.allocate(id, name, 3);
        calendar.schedule(late, 0, Phase::Late).unwrap();
        calendar.schedule(early_a, 0, Phase::Early).unwrap();
        calendar.schedule(early_b, 0, Phase::Early).unwrap();

        let mut log = Vec::new();
        run_tick(&mut calendar, &mut log);
        let phases: Vec<Phase> = log.iter().map(|(_, phase, _)| *phase).collect();
        assert_eq!(phases, vec![Phase::Early, Phase::Early, Phase::Late]);
    }

    #[test]
    fn test_delay_beyond_horizon_fires_on_correct_lap() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let far = calendar.allocate(id, name.clone(), 1);
        let near = calendar.allocate(id, name, 2);
        calendar.schedule(far, 9, Phase::Early).unwrap();
        calendar.schedule(near, 1, Phase::Early).unwrap();

        let mut log = Vec::new();
        for _ in 0..12 {
            run_tick(&mut calendar, &mut log);
        }
        assert_eq!(log, vec![(1, Phase::Early, 2), (9, Phase::Early, 1)]);
    }

    #[test]
    fn test_cancel_before_due_suppresses_firing() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 1);
        calendar.schedule(event, 5, Phase::Early).unwrap();

        let mut log = Vec::new();
        run_tick(&mut calendar, &mut log);
        calendar.cancel(event).unwrap();
        for _ in 0..10 {
            run_tick(&mut calendar, &mut log);
        }
        assert!(log.is_empty());
    }

    #[test]
    fn test_cancel_from_active_sweep_list() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let first = calendar.allocate(id, name.clone(), 1);
        let second = calendar.allocate(id, name, 2);
        calendar.schedule(first, 0, Phase::Early).unwrap();
        calendar.schedule(second, 0, Phase::Early).unwrap();

        let mut fired = Vec::new();
        calendar
            .advance(|calendar, activation| {
                fired.push(activation.key);
                if activation.key == 1 {
                    calendar.cancel(second)?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(fired, vec![1]);
        assert_eq!(calendar.pending(), 0);
    }

    #[test]
    fn test_double_schedule_is_fatal() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 4);
        calendar.schedule(event, 2, Phase::Early).unwrap();

        let err = calendar.schedule(event, 3, Phase::Early).unwrap_err();
        assert_eq!(
            err,
            SimError::DoubleSchedule {
                owner: "owner".to_string(),
                key: 4,
                scheduled_for: 2,
                requested: 3,
            }
        );
    }

    #[test]
    fn test_cancel_idle_event_is_fatal() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 4);
        assert!(matches!(
            calendar.cancel(event),
            Err(SimError::CancelNotScheduled { key: 4, .. })
        ));
    }

    #[test]
    fn test_zero_delay_into_elapsed_phase_is_fatal() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let trigger = calendar.allocate(id, name.clone(), 1);
        let follow_up = calendar.allocate(id, name, 2);
        calendar.schedule(trigger, 0, Phase::Late).unwrap();

        let err = calendar
            .advance(|calendar, _| calendar.schedule(follow_up, 0, Phase::Early).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, SimError::ElapsedPhase { phase: Phase::Early, .. }));
    }

    #[test]
    fn test_zero_delay_from_early_into_late_fires_same_tick() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let early = calendar.allocate(id, name.clone(), 1);
        let late = calendar.allocate(id, name, 2);
        calendar.schedule(early, 0, Phase::Early).unwrap();

        let mut fired = Vec::new();
        calendar
            .advance(|calendar, activation| {
                fired.push((activation.tick, activation.key));
                if activation.key == 1 {
                    calendar.schedule(late, 0, Phase::Late)?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(fired, vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn test_per_tick_registrations_fire_in_order_after_events() {
        let mut calendar = Calendar::new(8).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 9);
        calendar.register_per_tick(id, 100, Phase::Early);
        calendar.register_per_tick(id, 101, Phase::Early);
        calendar.schedule(event, 1, Phase::Early).unwrap();

        let mut log = Vec::new();
        run_tick(&mut calendar, &mut log);
        run_tick(&mut calendar, &mut log);
        let keys: Vec<u32> = log.iter().map(|(_, _, key)| *key).collect();
        assert_eq!(keys, vec![100, 101, 9, 100, 101]);

        assert!(calendar.unregister_per_tick(id, 100, Phase::Early));
        assert!(!calendar.unregister_per_tick(id, 100, Phase::Early));
        log.clear();
        run_tick(&mut calendar, &mut log);
        assert_eq!(log, vec![(2, Phase::Early, 101)]);
    }

    #[test]
    fn test_renormalize_preserves_relative_times() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 1);

        let mut log = Vec::new();
        for _ in 0..10 {
            run_tick(&mut calendar, &mut log);
        }
        calendar.schedule(event, 6, Phase::Late).unwrap();
        assert_eq!(calendar.target(event), Some(16));

        assert_eq!(calendar.renormalize().unwrap(), 10);
        assert_eq!(calendar.now(), 0);
        assert_eq!(calendar.target(event), Some(6));

        for _ in 0..7 {
            run_tick(&mut calendar, &mut log);
        }
        assert_eq!(log, vec![(6, Phase::Late, 1)]);
    }

    #[test]
    fn test_renormalize_rejected_mid_tick() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 1);
        calendar.schedule(event, 0, Phase::Early).unwrap();

        let err = calendar
            .advance(|calendar, _| calendar.renormalize().map(|_| ()))
            .unwrap_err();
        assert_eq!(err, SimError::RenormalizeDuringTick { now: 0 });
    }

    #[test]
    fn test_schedule_past_last_tick_is_fatal() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 1);
        calendar.now = Tick::MAX - 1;

        assert_eq!(
            calendar.schedule(event, 5, Phase::Early).unwrap_err(),
            SimError::TickOverflow {
                now: Tick::MAX - 1,
                delay: 5,
            }
        );
        assert!(!calendar.is_scheduled(event));
        assert_eq!(calendar.schedule(event, 1, Phase::Early).unwrap(), Tick::MAX);
    }

    #[test]
    fn test_clock_never_wraps() {
        let mut calendar = Calendar::new(4).unwrap();
        calendar.now = Tick::MAX - 1;

        calendar.advance(|_, _| Ok(())).unwrap();
        assert_eq!(calendar.now(), Tick::MAX);

        assert_eq!(
            calendar.advance(|_, _| Ok(())).unwrap_err(),
            SimError::TickOverflow {
                now: Tick::MAX,
                delay: 1,
            }
        );
        assert_eq!(calendar.now(), Tick::MAX);
    }

    #[test]
    fn test_stale_bucket_member_is_fatal() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 3);
        calendar.schedule(event, 2, Phase::Late).unwrap();
        calendar.now = 6;

        let err = calendar.advance(|_, _| Ok(())).unwrap_err();
        assert_eq!(
            err,
            SimError::StaleEvent {
                owner: "owner".to_string(),
                key: 3,
                time: 2,
                now: 6,
            }
        );
    }

    #[test]
    fn test_renormalize_with_stale_event_leaves_calendar_intact() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let stale = calendar.allocate(id, name.clone(), 1);
        let fresh = calendar.allocate(id, name, 2);
        calendar.schedule(stale, 2, Phase::Early).unwrap();
        calendar.schedule(fresh, 9, Phase::Late).unwrap();
        calendar.now = 5;

        assert!(matches!(
            calendar.renormalize(),
            Err(SimError::StaleEvent { key: 1, time: 2, now: 5, .. })
        ));
        assert_eq!(calendar.now(), 5);
        assert_eq!(calendar.pending(), 2);
        assert_eq!(calendar.target(stale), Some(2));
        assert_eq!(calendar.target(fresh), Some(9));

        calendar.cancel(stale).unwrap();
        assert_eq!(calendar.renormalize().unwrap(), 5);
        assert_eq!(calendar.target(fresh), Some(4));
        let mut log = Vec::new();
        for _ in 0..5 {
            run_tick(&mut calendar, &mut log);
        }
        assert_eq!(log, vec![(4, Phase::Late, 2)]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut calendar = Calendar::new(4).unwrap();
        let (id, name) = owner();
        let event = calendar.allocate(id, name, 1);
        calendar.schedule(event, 2, Phase::Early).unwrap();
        calendar.register_per_tick(id, 5, Phase::Late);
        run_tick(&mut calendar, &mut Vec::new());

        calendar.reset();
        assert_eq!(calendar.now(), 0);
        assert_eq!(calendar.pending(), 0);
        assert!(matches!(
            calendar.schedule(event, 1, Phase::Early),
            Err(SimError::UnknownEvent { index: 0 })
        ));
    }

    proptest! {
        #[test]
        fn prop_every_event_fires_once_at_its_tick(
            horizon in 1usize..16,
            delays in prop::collection::vec((0u64..64, any::<bool>()), 1..24),
            cancel_mask in prop::collection::vec(any::<bool>(), 24),
        ) {
            let mut calendar = Calendar::new(horizon).unwrap();
            let (id, name) = owner();
            let mut expected = Vec::new();

            for (key, (delay, late)) in delays.iter().enumerate() {
                let phase = if *late { Phase::Late } else { Phase::Early };
                let event = calendar.allocate(id, name.clone(), key as u32);
                calendar.schedule(event, *delay, phase).unwrap();
                if cancel_mask[key] {
                    calendar.cancel(event).unwrap();
                } else {
                    expected.push((*delay, phase, key as u32));
                }
            }

            let mut log = Vec::new();
            for _ in 0..70 {
                run_tick(&mut calendar, &mut log);
            }

            expected.sort();
            log.sort();
            prop_assert_eq!(log, expected);
            prop_assert_eq!(calendar.pending(), 0);
        }
    }
}
