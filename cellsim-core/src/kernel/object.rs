//! Simulated objects, their link table and the context handed to callbacks.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::clock::{DeterministicRng, Phase, Tick};
use crate::error::{ConfigError, SimError, SimResult};
use crate::item::{DataItem, TypeRegistry, TypeTag};
use crate::kernel::calendar::{Activation, Calendar, EventHandle};

/// Index of an object inside one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Wraps a raw index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiver's answer to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sender may keep sending
    Continue,
    /// Item accepted; sender must pause until woken
    Stop,
    /// Receiver logically accepted only this many bytes of the item
    PartialAccept(u32),
}

/// Behaviour of one node of the simulated topology.
///
/// Every callback receives a [`Context`] through which the object reads the
/// clock, manages its own events and sends items downstream. Returning an
/// error aborts the whole simulation.
pub trait SimObject: Any {
    /// Short type name used in logs and reports.
    fn kind(&self) -> &'static str;

    /// Number of input ports.
    fn inputs(&self) -> usize {
        0
    }

    /// Number of output ports.
    fn outputs(&self) -> usize {
        0
    }

    /// Type accepted on `input`.
    fn input_type(&self, _input: usize) -> TypeTag {
        TypeTag::DATA
    }

    /// Type produced on `output`.
    fn output_type(&self, _output: usize) -> TypeTag {
        TypeTag::DATA
    }

    /// Called once before the first tick; allocate and arm events here.
    ///
    /// # Errors
    ///
    /// Any fatal condition; the simulation aborts.
    fn start(&mut self, _ctx: &mut Context<'_>) -> SimResult<()> {
        Ok(())
    }

    /// Early-phase activation.
    ///
    /// # Errors
    ///
    /// Any fatal condition; the simulation aborts.
    fn on_early(&mut self, _ctx: &mut Context<'_>, _activation: Activation) -> SimResult<()> {
        Ok(())
    }

    /// Late-phase activation.
    ///
    /// # Errors
    ///
    /// Any fatal condition; the simulation aborts.
    fn on_late(&mut self, _ctx: &mut Context<'_>, _activation: Activation) -> SimResult<()> {
        Ok(())
    }

    /// Takes ownership of an item arriving on `input`.
    ///
    /// # Errors
    ///
    /// Any fatal condition; the simulation aborts. The default rejects
    /// every item because the object declares no inputs.
    fn deliver(
        &mut self,
        _ctx: &mut Context<'_>,
        _item: DataItem,
        input: usize,
    ) -> SimResult<Delivery> {
        Err(ConfigError::PortOutOfRange {
            object: self.kind().to_string(),
            kind: "input",
            port: input,
            count: self.inputs(),
        }
        .into())
    }

    /// Downstream of `output` asked a stopped sender to resume.
    ///
    /// # Errors
    ///
    /// Any fatal condition; the simulation aborts.
    fn on_wakeup(&mut self, _ctx: &mut Context<'_>, _output: usize) -> SimResult<()> {
        Ok(())
    }

    /// The clock was renormalized; every stored tick must drop by `delta`.
    fn on_clock_reset(&mut self, _delta: Tick) {}

    /// Returns to the freshly constructed state. Event handles are invalid
    /// afterwards and are allocated again by [`SimObject::start`].
    fn reset(&mut self) {}

    /// Zeroes statistics without touching queued data.
    fn reset_counters(&mut self) {}

    /// Named statistic, if the object exposes it.
    fn value(&self, _name: &str) -> Option<f64> {
        None
    }

    /// Names accepted by [`SimObject::value`].
    fn value_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Downcast helper.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast helper.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Endpoint of a link: an object and one of its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    /// Object at this end
    pub object: ObjectId,
    /// Port index on that object
    pub port: usize,
}

struct ObjectEntry {
    name: Arc<str>,
    object: Option<Box<dyn SimObject>>,
    outputs: Vec<Option<Link>>,
    upstream: Vec<Option<Link>>,
    input_types: Vec<TypeTag>,
}

/// Objects of one simulation and the links between them.
///
/// An object is moved out of its slot while one of its callbacks runs, so a
/// delivery cycle finds the slot empty and is reported instead of aliasing.
#[derive(Default)]
pub struct ObjectTable {
    entries: Vec<ObjectEntry>,
    by_name: HashMap<Arc<str>, ObjectId>,
    wakeups: VecDeque<Link>,
}

impl fmt::Debug for ObjectTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.name))
            .finish()
    }
}

impl ObjectTable {
    /// Adds an object under a unique name.
    ///
    /// # Errors
    ///
    /// - `ConfigError::DuplicateName` - If the name is taken
    pub fn insert(
        &mut self,
        name: &str,
        object: Box<dyn SimObject>,
    ) -> Result<ObjectId, ConfigError> {
        if self.by_name.contains_key(name) {
            return Err(ConfigError::DuplicateName {
                name: name.to_string(),
            });
        }
        let id = ObjectId(self.entries.len() as u32);
        let name: Arc<str> = Arc::from(name);
        let input_types = (0..object.inputs())
            .map(|input| object.input_type(input))
            .collect();
        self.entries.push(ObjectEntry {
            name: name.clone(),
            outputs: vec![None; object.outputs()],
            upstream: vec![None; object.inputs()],
            input_types,
            object: Some(object),
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Links `from[output]` to `to[input]` after checking ports and types.
    ///
    /// # Errors
    ///
    /// - `ConfigError::PortOutOfRange` - If either port index is not declared
    /// - `ConfigError::PortInUse` - If either port is already linked
    /// - `ConfigError::TypeMismatch` - If the output type is not assignable to the input type
    pub fn connect(
        &mut self,
        from: ObjectId,
        output: usize,
        to: ObjectId,
        input: usize,
        types: &TypeRegistry,
    ) -> Result<(), ConfigError> {
        let from_entry = &self.entries[from.index()];
        let to_entry = &self.entries[to.index()];

        if output >= from_entry.outputs.len() {
            return Err(ConfigError::PortOutOfRange {
                object: from_entry.name.to_string(),
                kind: "output",
                port: output,
                count: from_entry.outputs.len(),
            });
        }
        if input >= to_entry.upstream.len() {
            return Err(ConfigError::PortOutOfRange {
                object: to_entry.name.to_string(),
                kind: "input",
                port: input,
                count: to_entry.upstream.len(),
            });
        }
        if from_entry.outputs[output].is_some() {
            return Err(ConfigError::PortInUse {
                object: from_entry.name.to_string(),
                kind: "output",
                port: output,
            });
        }
        if to_entry.upstream[input].is_some() {
            return Err(ConfigError::PortInUse {
                object: to_entry.name.to_string(),
                kind: "input",
                port: input,
            });
        }

        let offered = from_entry
            .object
            .as_ref()
            .map_or(TypeTag::DATA, |object| object.output_type(output));
        let expected = to_entry.input_types[input];
        if !types.is_assignable(offered, expected) {
            return Err(ConfigError::TypeMismatch {
                link: self.describe_link(from, output, to, input),
                actual: types.name(offered).to_string(),
                expected: types.name(expected).to_string(),
            });
        }

        self.entries[from.index()].outputs[output] = Some(Link {
            object: to,
            port: input,
        });
        self.entries[to.index()].upstream[input] = Some(Link {
            object: from,
            port: output,
        });
        Ok(())
    }

    /// Looks up an object by name.
    pub fn lookup(&self, name: &str) -> Option<ObjectId> {
        self.by_name.get(name).copied()
    }

    /// Name of an object.
    pub fn name(&self, id: ObjectId) -> &Arc<str> {
        &self.entries[id.index()].name
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no objects.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + use<> {
        (0..self.entries.len() as u32).map(ObjectId)
    }

    /// Borrow an object that is not currently active.
    pub fn get(&self, id: ObjectId) -> Option<&dyn SimObject> {
        self.entries.get(id.index())?.object.as_deref()
    }

    /// Mutably borrow an object that is not currently active.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut (dyn SimObject + 'static)> {
        self.entries.get_mut(id.index())?.object.as_deref_mut()
    }

    /// Link fed by `output` of `id`.
    pub fn output_link(&self, id: ObjectId, output: usize) -> Option<Link> {
        self.entries[id.index()].outputs.get(output).copied().flatten()
    }

    /// Link feeding `input` of `id`.
    pub fn upstream_link(&self, id: ObjectId, input: usize) -> Option<Link> {
        self.entries[id.index()].upstream.get(input).copied().flatten()
    }

    /// Unconnected `(object, kind, port)` triples, for diagnostics.
    pub fn dangling_ports(&self) -> Vec<(Arc<str>, &'static str, usize)> {
        let mut dangling = Vec::new();
        for entry in &self.entries {
            for (port, link) in entry.upstream.iter().enumerate() {
                if link.is_none() {
                    dangling.push((entry.name.clone(), "input", port));
                }
            }
            for (port, link) in entry.outputs.iter().enumerate() {
                if link.is_none() {
                    dangling.push((entry.name.clone(), "output", port));
                }
            }
        }
        dangling
    }

    /// Moves an object out of its slot for the duration of a callback.
    ///
    /// # Errors
    ///
    /// - `SimError::ReentrantDelivery` - If the object is already active
    pub fn take(&mut self, id: ObjectId) -> SimResult<Box<dyn SimObject>> {
        let entry = &mut self.entries[id.index()];
        entry
            .object
            .take()
            .ok_or_else(|| SimError::ReentrantDelivery {
                object: entry.name.to_string(),
            })
    }

    /// Puts an object back after [`ObjectTable::take`].
    pub fn restore(&mut self, id: ObjectId, object: Box<dyn SimObject>) {
        self.entries[id.index()].object = Some(object);
    }

    /// Queues an `on_wakeup` call; duplicates are merged.
    pub fn push_wakeup(&mut self, link: Link) {
        if !self.wakeups.contains(&link) {
            self.wakeups.push_back(link);
        }
    }

    /// Next queued wakeup.
    pub fn pop_wakeup(&mut self) -> Option<Link> {
        self.wakeups.pop_front()
    }

    /// Drops every queued wakeup.
    pub fn clear_wakeups(&mut self) {
        self.wakeups.clear();
    }

    fn describe_link(&self, from: ObjectId, output: usize, to: ObjectId, input: usize) -> String {
        format!(
            "{}[{output}] -> {}[{input}]",
            self.entries[from.index()].name,
            self.entries[to.index()].name
        )
    }
}

/// Kernel services available to the object whose callback is running.
pub struct Context<'a> {
    calendar: &'a mut Calendar,
    objects: &'a mut ObjectTable,
    rng: &'a mut DeterministicRng,
    types: &'a TypeRegistry,
    current: ObjectId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        calendar: &'a mut Calendar,
        objects: &'a mut ObjectTable,
        rng: &'a mut DeterministicRng,
        types: &'a TypeRegistry,
        current: ObjectId,
    ) -> Self {
        Self {
            calendar,
            objects,
            rng,
            types,
            current,
        }
    }

    /// Current tick.
    pub fn now(&self) -> Tick {
        self.calendar.now()
    }

    /// Phase being swept, or `None` between ticks (e.g. during start).
    pub fn phase(&self) -> Option<Phase> {
        self.calendar.current_phase()
    }

    /// Whether the sweep of `phase` has begun this tick.
    pub fn phase_started(&self, phase: Phase) -> bool {
        self.calendar.phase_started(phase)
    }

    /// Smallest delay that still lands in `phase` without error.
    pub fn earliest_delay(&self, phase: Phase) -> Tick {
        if self.calendar.phase_started(phase) {
            1
        } else {
            0
        }
    }

    /// Id of the running object.
    pub fn object_id(&self) -> ObjectId {
        self.current
    }

    /// Name of the running object.
    pub fn name(&self) -> &str {
        self.objects.name(self.current)
    }

    /// Shared seeded random stream.
    pub fn rng(&mut self) -> &mut DeterministicRng {
        self.rng
    }

    /// Type-derivation table.
    pub fn types(&self) -> &TypeRegistry {
        self.types
    }

    /// Allocates an idle event owned by the running object.
    pub fn new_event(&mut self, key: u32) -> EventHandle {
        let name = self.objects.name(self.current).clone();
        self.calendar.allocate(self.current, name, key)
    }

    /// Schedules one of the running object's events.
    ///
    /// # Errors
    ///
    /// - `SimError::ForeignEvent` - If the event belongs to another object
    /// - Every error of [`Calendar::schedule`]
    pub fn schedule(&mut self, event: EventHandle, delay: Tick, phase: Phase) -> SimResult<Tick> {
        self.check_owner(event)?;
        self.calendar.schedule(event, delay, phase)
    }

    /// Cancels one of the running object's pending events.
    ///
    /// # Errors
    ///
    /// - `SimError::ForeignEvent` - If the event belongs to another object
    /// - Every error of [`Calendar::cancel`]
    pub fn cancel(&mut self, event: EventHandle) -> SimResult<()> {
        self.check_owner(event)?;
        self.calendar.cancel(event)
    }

    /// Whether the event is pending.
    pub fn is_scheduled(&self, event: EventHandle) -> bool {
        self.calendar.is_scheduled(event)
    }

    /// Target tick of a pending event.
    pub fn target(&self, event: EventHandle) -> Option<Tick> {
        self.calendar.target(event)
    }

    /// Activates the running object in `phase` of every tick with `key`.
    pub fn register_per_tick(&mut self, key: u32, phase: Phase) {
        self.calendar.register_per_tick(self.current, key, phase);
    }

    /// Removes a per-tick registration of the running object.
    pub fn unregister_per_tick(&mut self, key: u32, phase: Phase) -> bool {
        self.calendar.unregister_per_tick(self.current, key, phase)
    }

    /// Whether `output` of the running object has a link.
    pub fn is_connected(&self, output: usize) -> bool {
        self.objects.output_link(self.current, output).is_some()
    }

    /// Delivers `item` through `output` and returns the receiver's answer.
    ///
    /// # Errors
    ///
    /// - `SimError::UnconnectedOutput` - If the output has no link
    /// - `SimError::Config` - If the item tag is not assignable to the receiving input
    /// - `SimError::ReentrantDelivery` - If the receiver is already active
    /// - Every error returned by the receiver
    pub fn send(&mut self, output: usize, item: DataItem) -> SimResult<Delivery> {
        let Some(link) = self.objects.output_link(self.current, output) else {
            return Err(SimError::UnconnectedOutput {
                object: self.name().to_string(),
                output,
            });
        };

        let expected = self.objects.entries[link.object.index()].input_types[link.port];
        if !self.types.is_assignable(item.tag, expected) {
            return Err(ConfigError::TypeMismatch {
                link: self
                    .objects
                    .describe_link(self.current, output, link.object, link.port),
                actual: self.types.name(item.tag).to_string(),
                expected: self.types.name(expected).to_string(),
            }
            .into());
        }

        let mut receiver = self.objects.take(link.object)?;
        let answer = {
            let mut nested = Context::new(
                &mut *self.calendar,
                &mut *self.objects,
                &mut *self.rng,
                self.types,
                link.object,
            );
            receiver.deliver(&mut nested, item, link.port)
        };
        self.objects.restore(link.object, receiver);
        answer
    }

    /// Asks whatever feeds `input` to resume sending.
    ///
    /// The upstream `on_wakeup` runs right after the current callback
    /// returns. Returns `false` when the input is not linked.
    pub fn wake_upstream(&mut self, input: usize) -> bool {
        match self.objects.upstream_link(self.current, input) {
            Some(link) => {
                self.objects.push_wakeup(link);
                true
            }
            None => false,
        }
    }

    fn check_owner(&self, event: EventHandle) -> SimResult<()> {
        let owner = self.calendar.owner(event)?;
        if owner != self.current {
            return Err(SimError::ForeignEvent {
                object: self.name().to_string(),
                owner: self.objects.name(owner).to_string(),
                key: self.calendar.key(event)?,
            });
        }
        Ok(())
    }
}
