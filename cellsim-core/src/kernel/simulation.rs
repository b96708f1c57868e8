//! Topology construction and the tick-by-tick driver.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::{DeterministicRng, Phase, Tick};
use crate::config::SimulationConfig;
use crate::error::{ConfigError, SimError, SimResult};
use crate::item::TypeRegistry;
use crate::kernel::calendar::{Activation, Calendar};
use crate::kernel::object::{Context, ObjectId, ObjectTable, SimObject};

/// Lifecycle of a [`Simulation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Topology fixed, objects not started yet
    Connected,
    /// At least one tick executed or started
    Running,
    /// A fatal error occurred; the reason is kept for every later call
    Aborted(String),
}

/// Collects objects and links before a run.
#[derive(Debug)]
pub struct SimulationBuilder {
    config: SimulationConfig,
    types: TypeRegistry,
    objects: ObjectTable,
}

impl SimulationBuilder {
    /// Starts an empty topology.
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            types: TypeRegistry::new(),
            objects: ObjectTable::default(),
        }
    }

    /// Type-derivation table, for registering custom item types.
    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// Type-derivation table.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Adds an object under a unique name.
    ///
    /// # Errors
    ///
    /// - `ConfigError::DuplicateName` - If the name is taken
    pub fn add<T: SimObject>(&mut self, name: &str, object: T) -> Result<ObjectId, ConfigError> {
        self.add_boxed(name, Box::new(object))
    }

    /// Adds an already boxed object.
    ///
    /// # Errors
    ///
    /// - `ConfigError::DuplicateName` - If the name is taken
    pub fn add_boxed(
        &mut self,
        name: &str,
        object: Box<dyn SimObject>,
    ) -> Result<ObjectId, ConfigError> {
        let kind = object.kind();
        let id = self.objects.insert(name, object)?;
        debug!(object = name, kind, %id, "object added");
        Ok(id)
    }

    /// Links output `output` of `from` to input `input` of `to`.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownObject` - If either name is not registered
    /// - Every error of [`ObjectTable::connect`]
    pub fn connect(
        &mut self,
        from: &str,
        output: usize,
        to: &str,
        input: usize,
    ) -> Result<(), ConfigError> {
        let from_id = self.resolve(from)?;
        let to_id = self.resolve(to)?;
        self.objects
            .connect(from_id, output, to_id, input, &self.types)?;
        debug!("connected {from}[{output}] -> {to}[{input}]");
        Ok(())
    }

    /// Fixes the topology.
    ///
    /// # Errors
    ///
    /// - Every error of [`SimulationConfig::validate`]
    pub fn build(self) -> Result<Simulation, ConfigError> {
        self.config.validate()?;
        for (object, kind, port) in self.objects.dangling_ports() {
            warn!(object = %object, "{kind} {port} is not connected");
        }

        let calendar = Calendar::new(self.config.horizon)?;
        let rng = DeterministicRng::from_seed(self.config.seed);
        info!(
            objects = self.objects.len(),
            seed = self.config.seed,
            horizon = self.config.horizon,
            "simulation built"
        );

        Ok(Simulation {
            config: self.config,
            calendar,
            objects: self.objects,
            rng,
            types: self.types,
            state: RunState::Connected,
            ticks_elapsed: 0,
            renormalizations: 0,
        })
    }

    fn resolve(&self, name: &str) -> Result<ObjectId, ConfigError> {
        self.objects
            .lookup(name)
            .ok_or_else(|| ConfigError::UnknownObject {
                name: name.to_string(),
            })
    }
}

/// Statistics of one object in a [`SimulationReport`].
#[derive(Debug, Clone, Serialize)]
pub struct ObjectReport {
    /// Object name
    pub name: String,
    /// Object kind
    pub kind: String,
    /// Every exposed value
    pub values: BTreeMap<String, f64>,
}

/// Snapshot of a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Seed used for reproduction
    pub seed: u64,
    /// Clock value (after renormalizations)
    pub now: Tick,
    /// Ticks executed since the last reset
    pub ticks_elapsed: u64,
    /// Number of clock rebases
    pub renormalizations: u64,
    /// Events still pending
    pub pending_events: usize,
    /// Lifecycle at the time of the snapshot
    pub state: RunState,
    /// Per-object statistics in insertion order
    pub objects: Vec<ObjectReport>,
}

impl SimulationReport {
    /// Generates human-readable summary.
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        summary.push_str(&format!("Simulation Report (seed: {})\n", self.seed));
        summary.push_str(&format!("Ticks elapsed: {}\n", self.ticks_elapsed));
        summary.push_str(&format!(
            "Clock: {} ({} renormalizations)\n",
            self.now, self.renormalizations
        ));
        summary.push_str(&format!("Pending events: {}\n", self.pending_events));
        if let RunState::Aborted(reason) = &self.state {
            summary.push_str(&format!("Aborted: {reason}\n"));
        }

        for object in &self.objects {
            summary.push_str(&format!("\n{} ({}):\n", object.name, object.kind));
            for (name, value) in &object.values {
                summary.push_str(&format!("  {name}: {value}\n"));
            }
        }

        summary
    }

    /// Values of one object, if present.
    pub fn object(&self, name: &str) -> Option<&ObjectReport> {
        self.objects.iter().find(|object| object.name == name)
    }
}

/// A built topology driven one tick at a time.
#[derive(Debug)]
pub struct Simulation {
    config: SimulationConfig,
    calendar: Calendar,
    objects: ObjectTable,
    rng: DeterministicRng,
    types: TypeRegistry,
    state: RunState,
    ticks_elapsed: u64,
    renormalizations: u64,
}

impl Simulation {
    /// Current tick.
    pub fn now(&self) -> Tick {
        self.calendar.now()
    }

    /// Ticks executed since the last reset, unaffected by renormalization.
    pub fn ticks_elapsed(&self) -> u64 {
        self.ticks_elapsed
    }

    /// Seed of the shared random stream.
    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    /// Lifecycle state.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Configuration the simulation was built with.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Events currently pending.
    pub fn pending_events(&self) -> usize {
        self.calendar.pending()
    }

    /// Executes one tick.
    ///
    /// The first call starts every object in insertion order. Any error
    /// aborts the simulation; it is logged, kept, and returned again as
    /// `SimError::Aborted` by every later call.
    ///
    /// # Errors
    ///
    /// - `SimError::Aborted` - If an earlier tick failed
    /// - Any fatal error raised by the calendar or an object during this tick
    pub fn advance(&mut self) -> SimResult<()> {
        if let RunState::Aborted(reason) = &self.state {
            return Err(SimError::Aborted {
                reason: reason.clone(),
            });
        }
        let result = if self.state == RunState::Connected {
            self.start_objects().and_then(|()| self.step())
        } else {
            self.step()
        };
        if let Err(err) = &result {
            self.abort(err);
        }
        result
    }

    /// Executes `ticks` ticks, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Every error of [`Simulation::advance`].
    pub fn run(&mut self, ticks: u64) -> SimResult<()> {
        for _ in 0..ticks {
            self.advance()?;
        }
        Ok(())
    }

    /// Rebases the clock to zero and notifies every object.
    ///
    /// Returns the amount subtracted from every tick value.
    ///
    /// # Errors
    ///
    /// - `SimError::Aborted` - If an earlier tick failed
    /// - Every error of [`Calendar::renormalize`]
    pub fn renormalize(&mut self) -> SimResult<Tick> {
        if let RunState::Aborted(reason) = &self.state {
            return Err(SimError::Aborted {
                reason: reason.clone(),
            });
        }
        let delta = match self.calendar.renormalize() {
            Ok(delta) => delta,
            Err(err) => {
                self.abort(&err);
                return Err(err);
            }
        };
        for id in self.objects.ids() {
            if let Some(object) = self.objects.get_mut(id) {
                object.on_clock_reset(delta);
            }
        }
        self.renormalizations += 1;
        info!(delta, ticks_elapsed = self.ticks_elapsed, "clock renormalized");
        Ok(delta)
    }

    /// Returns every object and the clock to the state right after build.
    ///
    /// The random stream restarts from the configured seed, so a reset
    /// simulation replays the same run.
    pub fn reset(&mut self) {
        self.calendar.reset();
        self.objects.clear_wakeups();
        for id in self.objects.ids() {
            if let Some(object) = self.objects.get_mut(id) {
                object.reset();
            }
        }
        self.rng.reseed(self.config.seed);
        self.state = RunState::Connected;
        self.ticks_elapsed = 0;
        self.renormalizations = 0;
        info!("simulation reset");
    }

    /// Named value of an object; `None` if either name is unknown.
    pub fn value(&self, object: &str, name: &str) -> Option<f64> {
        let id = self.objects.lookup(object)?;
        self.objects.get(id)?.value(name)
    }

    /// Value names exposed by an object.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownObject` - If no object has that name
    pub fn value_names(&self, object: &str) -> Result<Vec<String>, ConfigError> {
        let id = self.resolve(object)?;
        Ok(self
            .objects
            .get(id)
            .map(|object| object.value_names())
            .unwrap_or_default())
    }

    /// Borrows an object with its concrete type.
    pub fn object<T: SimObject>(&self, name: &str) -> Option<&T> {
        let id = self.objects.lookup(name)?;
        self.objects.get(id)?.as_any().downcast_ref::<T>()
    }

    /// Mutably borrows an object with its concrete type, e.g. to change a
    /// capacity between runs.
    pub fn object_mut<T: SimObject>(&mut self, name: &str) -> Option<&mut T> {
        let id = self.objects.lookup(name)?;
        self.objects.get_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Zeroes the statistics of one object.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownObject` - If no object has that name
    pub fn reset_counters(&mut self, object: &str) -> Result<(), ConfigError> {
        let id = self.resolve(object)?;
        if let Some(object) = self.objects.get_mut(id) {
            object.reset_counters();
        }
        Ok(())
    }

    /// Zeroes the statistics of every object.
    pub fn reset_all_counters(&mut self) {
        for id in self.objects.ids() {
            if let Some(object) = self.objects.get_mut(id) {
                object.reset_counters();
            }
        }
    }

    /// Snapshot of the clock and every object's values.
    pub fn report(&self) -> SimulationReport {
        let objects = self
            .objects
            .ids()
            .filter_map(|id| {
                let object = self.objects.get(id)?;
                let values = object
                    .value_names()
                    .into_iter()
                    .filter_map(|name| object.value(&name).map(|value| (name, value)))
                    .collect();
                Some(ObjectReport {
                    name: self.objects.name(id).to_string(),
                    kind: object.kind().to_string(),
                    values,
                })
            })
            .collect();

        SimulationReport {
            seed: self.config.seed,
            now: self.calendar.now(),
            ticks_elapsed: self.ticks_elapsed,
            renormalizations: self.renormalizations,
            pending_events: self.calendar.pending(),
            state: self.state.clone(),
            objects,
        }
    }

    fn start_objects(&mut self) -> SimResult<()> {
        self.state = RunState::Running;
        for id in self.objects.ids() {
            let mut object = self.objects.take(id)?;
            let result = {
                let mut ctx = Context::new(
                    &mut self.calendar,
                    &mut self.objects,
                    &mut self.rng,
                    &self.types,
                    id,
                );
                object.start(&mut ctx)
            };
            self.objects.restore(id, object);
            result?;
            deliver_wakeups(
                &mut self.calendar,
                &mut self.objects,
                &mut self.rng,
                &self.types,
            )?;
        }
        info!(objects = self.objects.len(), "simulation started");
        Ok(())
    }

    fn step(&mut self) -> SimResult<()> {
        let objects = &mut self.objects;
        let rng = &mut self.rng;
        let types = &self.types;
        self.calendar.advance(|calendar, activation| {
            dispatch(calendar, objects, rng, types, activation)
        })?;
        self.ticks_elapsed += 1;

        if self.calendar.now() >= self.config.renormalize_threshold {
            self.renormalize()?;
        }
        Ok(())
    }

    fn abort(&mut self, err: &SimError) {
        error!(now = self.calendar.now(), "simulation aborted: {err}");
        self.state = RunState::Aborted(err.to_string());
    }

    fn resolve(&self, name: &str) -> Result<ObjectId, ConfigError> {
        self.objects
            .lookup(name)
            .ok_or_else(|| ConfigError::UnknownObject {
                name: name.to_string(),
            })
    }
}

fn dispatch(
    calendar: &mut Calendar,
    objects: &mut ObjectTable,
    rng: &mut DeterministicRng,
    types: &TypeRegistry,
    activation: Activation,
) -> SimResult<()> {
    let id = activation.owner;
    let mut object = objects.take(id)?;
    let result = {
        let mut ctx = Context::new(calendar, objects, rng, types, id);
        match activation.phase {
            Phase::Early => object.on_early(&mut ctx, activation),
            Phase::Late => object.on_late(&mut ctx, activation),
        }
    };
    objects.restore(id, object);
    result?;
    deliver_wakeups(calendar, objects, rng, types)
}

fn deliver_wakeups(
    calendar: &mut Calendar,
    objects: &mut ObjectTable,
    rng: &mut DeterministicRng,
    types: &TypeRegistry,
) -> SimResult<()> {
    while let Some(link) = objects.pop_wakeup() {
        let mut object = objects.take(link.object)?;
        let result = {
            let mut ctx = Context::new(calendar, objects, rng, types, link.object);
            object.on_wakeup(&mut ctx, link.port)
        };
        objects.restore(link.object, object);
        result?;
    }
    Ok(())
}
