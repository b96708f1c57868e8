//! Generic multiplexer: arrival batching, loss accounting and the server.
//!
//! Items delivered during a tick are held until the late phase, then offered
//! to the discipline in a uniformly random order so that no input is
//! systematically favoured when the buffer runs full. The server works in
//! the early phase, either one item every `period` ticks or at a byte rate.

use std::any::Any;

use cellsim_core::{
    Activation, ConfigError, ConnectionId, Context, Counter, DataItem, Delivery, EventHandle,
    Phase, SimError, SimObject, SimResult, Tick, TypeTag,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::connection::ConnectionTable;
use crate::discipline::{
    Admission, AdmissionContext, Discipline, DropReason, ServiceContext, require_at_least,
};

const ARRIVAL: u32 = 0;
const SERVICE: u32 = 1;

/// How the server drains the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMode {
    /// One item per service instant; instants are multiples of `period`
    Synchronous {
        /// Ticks between service instants
        period: Tick,
    },
    /// Items occupy the server for `ceil(length / bytes_per_tick)` ticks
    Asynchronous {
        /// Link rate
        bytes_per_tick: u64,
    },
}

/// Multiplexer parameters; the discipline is configured separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Number of input ports
    pub inputs: usize,
    /// Server behaviour
    pub service: ServiceMode,
    /// Type accepted on every input and produced on the output
    pub item_type: TypeTag,
}

impl MuxConfig {
    /// Slotted server serving one item every `period` ticks.
    pub fn synchronous(inputs: usize, period: Tick) -> Self {
        Self {
            inputs,
            service: ServiceMode::Synchronous { period },
            item_type: TypeTag::DATA,
        }
    }

    /// Rate-based server.
    pub fn asynchronous(inputs: usize, bytes_per_tick: u64) -> Self {
        Self {
            inputs,
            service: ServiceMode::Asynchronous { bytes_per_tick },
            item_type: TypeTag::DATA,
        }
    }

    /// Restricts the ports to one item type.
    pub fn with_item_type(mut self, item_type: TypeTag) -> Self {
        self.item_type = item_type;
        self
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If there is no input, or the period or rate is zero
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "inputs", 1, self.inputs as u64)?;
        match self.service {
            ServiceMode::Synchronous { period } => require_at_least(object, "period", 1, period),
            ServiceMode::Asynchronous { bytes_per_tick } => {
                require_at_least(object, "bytes_per_tick", 1, bytes_per_tick)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Arrival {
    item: DataItem,
    input: usize,
    batch: Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Server {
    Idle,
    Busy,
    Blocked,
}

#[derive(Debug, Clone, Copy)]
struct Events {
    arrival: EventHandle,
    service: EventHandle,
}

#[derive(Debug, Clone, Default)]
struct Statistics {
    received: Counter,
    served: Counter,
    served_bytes: Counter,
    lost: Counter,
    partial_accepts: Counter,
    lost_by_reason: [Counter; DropReason::ALL.len()],
    lost_by_input: Vec<Counter>,
}

impl Statistics {
    fn new(inputs: usize) -> Self {
        Self {
            lost_by_input: vec![Counter::ZERO; inputs],
            ..Self::default()
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.lost_by_input.len());
    }
}

/// Buffered multiplexer driven by a [`Discipline`].
#[derive(Debug)]
pub struct Multiplexer<D: Discipline> {
    config: MuxConfig,
    discipline: D,
    connections: ConnectionTable,
    name: String,
    events: Option<Events>,
    arrivals: Vec<Arrival>,
    last_arrival: Vec<Option<Tick>>,
    server: Server,
    in_service: Option<DataItem>,
    stats: Statistics,
}

impl<D: Discipline> Multiplexer<D> {
    /// Creates a multiplexer around `discipline`.
    ///
    /// # Errors
    ///
    /// Every error of [`MuxConfig::validate`].
    pub fn new(config: MuxConfig, discipline: D) -> Result<Self, ConfigError> {
        config.validate(discipline.kind())?;
        Ok(Self {
            connections: ConnectionTable::default(),
            name: discipline.kind().to_string(),
            events: None,
            arrivals: Vec::new(),
            last_arrival: vec![None; config.inputs],
            server: Server::Idle,
            in_service: None,
            stats: Statistics::new(config.inputs),
            discipline,
            config,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// The plugged-in discipline.
    pub fn discipline(&self) -> &D {
        &self.discipline
    }

    /// Mutable access to the discipline, e.g. to change a capacity between runs.
    pub fn discipline_mut(&mut self) -> &mut D {
        &mut self.discipline
    }

    /// Resizes the discipline's buffer between ticks.
    ///
    /// # Errors
    ///
    /// The discipline's validation error; the old size stays in effect.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), ConfigError> {
        let previous = self.discipline.capacity();
        self.discipline.set_capacity(capacity)?;
        debug!(object = %self.name, previous, capacity, "buffer resized");
        Ok(())
    }

    /// Per-connection records.
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Items waiting in the buffer.
    pub fn queue_length(&self) -> usize {
        self.discipline.len()
    }

    /// Whether downstream answered `Stop` and has not woken the server yet.
    pub fn is_blocked(&self) -> bool {
        self.server == Server::Blocked
    }

    /// Item currently held by a rate-based server.
    pub fn in_service(&self) -> Option<&DataItem> {
        self.in_service.as_ref()
    }

    fn events(&self) -> SimResult<Events> {
        self.events.ok_or_else(|| SimError::NotStarted {
            object: self.name.clone(),
        })
    }

    fn admit_arrivals(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        let now = ctx.now();
        let (mut ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.arrivals)
            .into_iter()
            .partition(|arrival| arrival.batch <= now);
        self.arrivals = later;
        trace!(object = %self.name, now, batch = ready.len(), "admitting arrivals");

        while !ready.is_empty() {
            let pick = ctx.rng().random_index(ready.len());
            let arrival = ready.swap_remove(pick);
            self.admit_one(ctx, arrival)?;
        }

        let events = self.events()?;
        if !self.arrivals.is_empty() && !ctx.is_scheduled(events.arrival) {
            ctx.schedule(events.arrival, 1, Phase::Late)?;
        }
        self.kick_service(ctx)
    }

    fn admit_one(&mut self, ctx: &mut Context<'_>, arrival: Arrival) -> SimResult<()> {
        let Arrival { item, input, .. } = arrival;
        let (connection, length) = (item.connection, item.length);

        let discipline = &self.discipline;
        self.connections
            .ensure(connection, |id, state| discipline.configure_connection(id, state))
            .received
            .increment(&self.name, "received.connection")?;
        self.stats.received.increment(&self.name, "received")?;

        let mut admission_ctx = AdmissionContext {
            owner: &self.name,
            now: ctx.now(),
            input,
            rng: ctx.rng(),
            connections: &mut self.connections,
        };
        match self.discipline.admit(&mut admission_ctx, item)? {
            Admission::Queued => {
                self.connections.state_mut(connection).on_queued(length);
                trace!(object = %self.name, %connection, input, "queued");
            }
            Admission::Dropped { reason, .. } => {
                self.record_loss(connection, input, reason)?;
            }
        }
        Ok(())
    }

    fn record_loss(
        &mut self,
        connection: ConnectionId,
        input: usize,
        reason: DropReason,
    ) -> SimResult<()> {
        let name = &self.name;
        self.stats.lost.increment(name, "lost")?;
        self.stats.lost_by_reason[reason.index()].increment(name, reason.name())?;
        self.stats.lost_by_input[input].increment(name, "lost.input")?;
        self.connections
            .state_mut(connection)
            .lost
            .increment(name, "lost.connection")?;
        trace!(object = %name, %connection, input, %reason, "item lost");
        Ok(())
    }

    /// Arms the service event if the server is idle and has work.
    fn kick_service(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        if self.server != Server::Idle
            || (self.discipline.is_empty() && self.in_service.is_none())
        {
            return Ok(());
        }
        let events = self.events()?;
        let earliest = ctx.earliest_delay(Phase::Early);
        let delay = match self.config.service {
            ServiceMode::Synchronous { period } => {
                let first = ctx.now().saturating_add(earliest);
                first.div_ceil(period).saturating_mul(period) - ctx.now()
            }
            ServiceMode::Asynchronous { .. } => earliest,
        };
        ctx.schedule(events.service, delay, Phase::Early)?;
        self.server = Server::Busy;
        Ok(())
    }

    fn serve(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        self.server = Server::Idle;
        let events = self.events()?;
        match self.config.service {
            ServiceMode::Synchronous { period } => {
                let Some(item) = self.next_item(ctx)? else {
                    return Ok(());
                };
                if self.transmit(ctx, item)? == Delivery::Stop {
                    self.server = Server::Blocked;
                    return Ok(());
                }
                if !self.discipline.is_empty() {
                    ctx.schedule(events.service, period, Phase::Early)?;
                    self.server = Server::Busy;
                }
            }
            ServiceMode::Asynchronous { bytes_per_tick } => {
                let finished = self.in_service.take();
                if let Some(item) = finished {
                    if self.transmit(ctx, item)? == Delivery::Stop {
                        self.server = Server::Blocked;
                        return Ok(());
                    }
                }
                let Some(item) = self.next_item(ctx)? else {
                    return Ok(());
                };
                let hold = u64::from(item.length).div_ceil(bytes_per_tick).max(1);
                trace!(object = %self.name, connection = %item.connection, hold, "transmission started");
                self.in_service = Some(item);
                ctx.schedule(events.service, hold, Phase::Early)?;
                self.server = Server::Busy;
            }
        }
        Ok(())
    }

    fn next_item(&mut self, ctx: &mut Context<'_>) -> SimResult<Option<DataItem>> {
        let mut service_ctx = ServiceContext {
            owner: &self.name,
            now: ctx.now(),
            connections: &mut self.connections,
        };
        let item = self.discipline.dequeue(&mut service_ctx)?;
        if let Some(item) = &item {
            self.connections
                .state_mut(item.connection)
                .on_dequeued(item.length);
        }
        Ok(item)
    }

    fn transmit(&mut self, ctx: &mut Context<'_>, item: DataItem) -> SimResult<Delivery> {
        let (connection, length) = (item.connection, item.length);
        let answer = ctx.send(0, item)?;

        let name = &self.name;
        self.stats.served.increment(name, "served")?;
        self.stats
            .served_bytes
            .add(u64::from(length), name, "served_bytes")?;
        self.connections
            .state_mut(connection)
            .served
            .increment(name, "served.connection")?;
        match answer {
            Delivery::Continue => {}
            Delivery::Stop => debug!(object = %name, now = ctx.now(), "downstream stopped the server"),
            Delivery::PartialAccept(bytes) => {
                self.stats
                    .partial_accepts
                    .increment(name, "partial_accepts")?;
                trace!(object = %name, %connection, bytes, length, "partially accepted");
            }
        }
        Ok(answer)
    }

    fn connection_value(&self, name: &str) -> Option<f64> {
        let (prefix, id) = name.rsplit_once('.')?;
        let state = self.connections.get(ConnectionId(id.parse().ok()?))?;
        match prefix {
            "received.connection" => Some(state.received.into()),
            "served.connection" => Some(state.served.into()),
            "lost.connection" => Some(state.lost.into()),
            "queue.connection" => Some(state.queued_items as f64),
            _ => None,
        }
    }
}

impl<D: Discipline> SimObject for Multiplexer<D> {
    fn kind(&self) -> &'static str {
        self.discipline.kind()
    }

    fn inputs(&self) -> usize {
        self.config.inputs
    }

    fn outputs(&self) -> usize {
        1
    }

    fn input_type(&self, _input: usize) -> TypeTag {
        self.config.item_type
    }

    fn output_type(&self, _output: usize) -> TypeTag {
        self.config.item_type
    }

    fn start(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        self.name = ctx.name().to_string();
        self.events = Some(Events {
            arrival: ctx.new_event(ARRIVAL),
            service: ctx.new_event(SERVICE),
        });
        debug!(
            object = %self.name,
            discipline = self.discipline.kind(),
            inputs = self.config.inputs,
            service = ?self.config.service,
            "multiplexer started"
        );
        Ok(())
    }

    fn on_early(&mut self, ctx: &mut Context<'_>, activation: Activation) -> SimResult<()> {
        match activation.key {
            SERVICE => self.serve(ctx),
            _ => Ok(()),
        }
    }

    fn on_late(&mut self, ctx: &mut Context<'_>, activation: Activation) -> SimResult<()> {
        match activation.key {
            ARRIVAL => self.admit_arrivals(ctx),
            _ => Ok(()),
        }
    }

    fn deliver(
        &mut self,
        ctx: &mut Context<'_>,
        item: DataItem,
        input: usize,
    ) -> SimResult<Delivery> {
        if input >= self.config.inputs {
            return Err(ConfigError::PortOutOfRange {
                object: self.name.clone(),
                kind: "input",
                port: input,
                count: self.config.inputs,
            }
            .into());
        }
        let events = self.events()?;

        let batch = ctx.now() + ctx.earliest_delay(Phase::Late);
        if self.last_arrival[input] == Some(batch) {
            return Err(SimError::DuplicateArrival {
                object: self.name.clone(),
                input,
                tick: batch,
            });
        }
        self.last_arrival[input] = Some(batch);
        self.arrivals.push(Arrival { item, input, batch });

        if !ctx.is_scheduled(events.arrival) {
            ctx.schedule(events.arrival, ctx.earliest_delay(Phase::Late), Phase::Late)?;
        }
        Ok(Delivery::Continue)
    }

    fn on_wakeup(&mut self, ctx: &mut Context<'_>, _output: usize) -> SimResult<()> {
        if self.server == Server::Blocked {
            debug!(object = %self.name, now = ctx.now(), "server resumed");
            self.server = Server::Idle;
            self.kick_service(ctx)?;
        }
        Ok(())
    }

    fn on_clock_reset(&mut self, delta: Tick) {
        for last in &mut self.last_arrival {
            *last = last.and_then(|tick| tick.checked_sub(delta));
        }
        let rebase = |item: &mut DataItem| item.created = item.created.wrapping_sub(delta);
        for arrival in &mut self.arrivals {
            arrival.batch = arrival.batch.saturating_sub(delta);
            rebase(&mut arrival.item);
        }
        if let Some(item) = &mut self.in_service {
            rebase(item);
        }
        self.discipline
            .for_each_item(&mut |item: &mut DataItem| rebase(item));
    }

    fn reset(&mut self) {
        self.discipline.drain();
        self.connections.clear();
        self.events = None;
        self.arrivals.clear();
        self.last_arrival.fill(None);
        self.server = Server::Idle;
        self.in_service = None;
        self.stats.reset();
    }

    fn reset_counters(&mut self) {
        self.stats.reset();
        self.connections.reset_counters();
        self.discipline.reset_counters();
    }

    fn value(&self, name: &str) -> Option<f64> {
        let stats = &self.stats;
        match name {
            "received" => return Some(stats.received.into()),
            "served" => return Some(stats.served.into()),
            "served_bytes" => return Some(stats.served_bytes.into()),
            "lost" => return Some(stats.lost.into()),
            "partial_accepts" => return Some(stats.partial_accepts.into()),
            "queue_length" => return Some(self.discipline.len() as f64),
            _ => {}
        }
        if let Some(suffix) = name.strip_prefix("lost.") {
            if let Some(input) = suffix.strip_prefix("input.") {
                let input: usize = input.parse().ok()?;
                return stats.lost_by_input.get(input).map(|counter| (*counter).into());
            }
            if let Some(reason) = DropReason::ALL.iter().find(|reason| reason.name() == suffix) {
                return Some(stats.lost_by_reason[reason.index()].into());
            }
        }
        self.connection_value(name)
            .or_else(|| self.discipline.value(name))
    }

    fn value_names(&self) -> Vec<String> {
        let mut names: Vec<String> = [
            "received",
            "served",
            "served_bytes",
            "lost",
            "partial_accepts",
            "queue_length",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        names.extend(DropReason::ALL.iter().map(|reason| format!("lost.{reason}")));
        names.extend((0..self.config.inputs).map(|input| format!("lost.input.{input}")));
        for (id, _) in self.connections.iter() {
            for prefix in [
                "received.connection",
                "served.connection",
                "lost.connection",
                "queue.connection",
            ] {
                names.push(format!("{prefix}.{}", id.0));
            }
        }
        names.extend(self.discipline.value_names());
        names
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
