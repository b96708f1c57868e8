//! Traffic terminator with delay statistics and optional back-pressure.

use std::any::Any;
use std::collections::BTreeMap;

use cellsim_core::{
    Activation, ConfigError, ConnectionId, Context, Counter, DataItem, Delivery, EventHandle,
    Phase, SimError, SimObject, SimResult, Tick, TypeTag,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::discipline::require_at_least;

const WAKE: u32 = 0;

/// Delivery budget per aligned window of ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    /// Deliveries accepted per window before answering `Stop`
    pub items: u64,
    /// Window length in ticks
    pub window: Tick,
}

/// Sink parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Number of input ports
    pub inputs: usize,
    /// Optional flow control
    pub credit: Option<Credit>,
    /// Items longer than this are only partially accepted
    pub accept_length: Option<u32>,
    /// Type accepted on every input
    pub item_type: TypeTag,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            inputs: 1,
            credit: None,
            accept_length: None,
            item_type: TypeTag::DATA,
        }
    }
}

impl SinkConfig {
    /// Plain sink with `inputs` ports.
    pub fn with_inputs(inputs: usize) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If there is no input or a credit field is zero
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "inputs", 1, self.inputs as u64)?;
        if let Some(credit) = self.credit {
            require_at_least(object, "credit_items", 1, credit.items)?;
            require_at_least(object, "credit_window", 1, credit.window)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ConnectionStats {
    received: Counter,
    bytes: Counter,
}

/// Absorbs every item and measures what arrives.
#[derive(Debug, Clone)]
pub struct Sink {
    config: SinkConfig,
    name: String,
    wake: Option<EventHandle>,
    window_end: Option<Tick>,
    window_count: u64,
    stopped: Vec<bool>,
    received: Counter,
    bytes: Counter,
    frames: Counter,
    delay_sum: Counter,
    delay_max: Tick,
    stops: Counter,
    partial_accepts: Counter,
    per_connection: BTreeMap<ConnectionId, ConnectionStats>,
}

impl Sink {
    /// Creates a sink.
    ///
    /// # Errors
    ///
    /// Every error of [`SinkConfig::validate`].
    pub fn new(config: SinkConfig) -> Result<Self, ConfigError> {
        config.validate("sink")?;
        Ok(Self {
            stopped: vec![false; config.inputs],
            config,
            name: "sink".to_string(),
            wake: None,
            window_end: None,
            window_count: 0,
            received: Counter::ZERO,
            bytes: Counter::ZERO,
            frames: Counter::ZERO,
            delay_sum: Counter::ZERO,
            delay_max: 0,
            stops: Counter::ZERO,
            partial_accepts: Counter::ZERO,
            per_connection: BTreeMap::new(),
        })
    }

    /// Items received from one connection.
    pub fn received_from(&self, connection: ConnectionId) -> u64 {
        self.per_connection
            .get(&connection)
            .map_or(0, |stats| stats.received.get())
    }

    /// Mean delay in ticks, 0 before the first item.
    pub fn mean_delay(&self) -> f64 {
        match self.received.get() {
            0 => 0.0,
            received => self.delay_sum.get() as f64 / received as f64,
        }
    }

    fn record(&mut self, item: &DataItem, now: Tick) -> SimResult<()> {
        let name = &self.name;
        let delay = item.age(now);
        self.received.increment(name, "received")?;
        self.bytes.add(u64::from(item.length), name, "bytes")?;
        self.delay_sum.add(delay, name, "delay_sum")?;
        self.delay_max = self.delay_max.max(delay);
        if item.end_of_frame {
            self.frames.increment(name, "frames")?;
        }
        let stats = self.per_connection.entry(item.connection).or_default();
        stats.received.increment(name, "received.connection")?;
        stats.bytes.add(u64::from(item.length), name, "bytes.connection")
    }

    /// Counts one delivery against the credit; `true` when it exhausts the window.
    fn consume_credit(&mut self, credit: Credit, now: Tick) -> bool {
        if self.window_end.is_none_or(|end| now > end) {
            let start = now - now % credit.window;
            self.window_end = Some(start.saturating_add(credit.window - 1));
            self.window_count = 0;
        }
        self.window_count += 1;
        self.window_count >= credit.items
    }

    fn arm_wake(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        let event = self.wake.ok_or_else(|| SimError::NotStarted {
            object: self.name.clone(),
        })?;
        if ctx.is_scheduled(event) {
            return Ok(());
        }
        let end = self.window_end.unwrap_or_else(|| ctx.now());
        let delay = end
            .saturating_sub(ctx.now())
            .max(ctx.earliest_delay(Phase::Late));
        ctx.schedule(event, delay, Phase::Late)?;
        Ok(())
    }
}

impl SimObject for Sink {
    fn kind(&self) -> &'static str {
        "sink"
    }

    fn inputs(&self) -> usize {
        self.config.inputs
    }

    fn input_type(&self, _input: usize) -> TypeTag {
        self.config.item_type
    }

    fn start(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        self.name = ctx.name().to_string();
        self.wake = Some(ctx.new_event(WAKE));
        Ok(())
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
        let now = ctx.now();
        self.record(&item, now)?;
        trace!(object = %self.name, connection = %item.connection, delay = item.age(now), "item absorbed");

        let mut answer = match self.config.accept_length {
            Some(limit) if item.length > limit => {
                self.partial_accepts
                    .increment(&self.name, "partial_accepts")?;
                Delivery::PartialAccept(limit)
            }
            _ => Delivery::Continue,
        };

        let exhausted = match self.config.credit {
            Some(credit) => self.consume_credit(credit, now),
            None => false,
        };
        if exhausted {
            self.stopped[input] = true;
            self.stops.increment(&self.name, "stops")?;
            self.arm_wake(ctx)?;
            debug!(object = %self.name, input, now, "credit exhausted");
            answer = Delivery::Stop;
        }
        Ok(answer)
    }

    fn on_late(&mut self, ctx: &mut Context<'_>, activation: Activation) -> SimResult<()> {
        if activation.key != WAKE {
            return Ok(());
        }
        for (input, stopped) in self.stopped.iter_mut().enumerate() {
            if *stopped {
                *stopped = false;
                ctx.wake_upstream(input);
            }
        }
        debug!(object = %self.name, now = ctx.now(), "credit window closed");
        Ok(())
    }

    fn on_clock_reset(&mut self, delta: Tick) {
        self.window_end = self.window_end.and_then(|end| end.checked_sub(delta));
    }

    fn reset(&mut self) {
        self.wake = None;
        self.window_end = None;
        self.window_count = 0;
        self.stopped.fill(false);
        self.reset_counters();
    }

    fn reset_counters(&mut self) {
        for counter in [
            &mut self.received,
            &mut self.bytes,
            &mut self.frames,
            &mut self.delay_sum,
            &mut self.stops,
            &mut self.partial_accepts,
        ] {
            counter.reset();
        }
        self.delay_max = 0;
        self.per_connection.clear();
    }

    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "received" => Some(self.received.into()),
            "bytes" => Some(self.bytes.into()),
            "frames" => Some(self.frames.into()),
            "mean_delay" => Some(self.mean_delay()),
            "max_delay" => Some(self.delay_max as f64),
            "stops" => Some(self.stops.into()),
            "partial_accepts" => Some(self.partial_accepts.into()),
            _ => {
                let id: u32 = name.strip_prefix("received.connection.")?.parse().ok()?;
                Some(self.received_from(ConnectionId(id)) as f64)
            }
        }
    }

    fn value_names(&self) -> Vec<String> {
        let mut names: Vec<String> = [
            "received",
            "bytes",
            "frames",
            "mean_delay",
            "max_delay",
            "stops",
            "partial_accepts",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        names.extend(
            self.per_connection
                .keys()
                .map(|id| format!("received.connection.{}", id.0)),
        );
        names
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use cellsim_core::{Simulation, SimulationBuilder, SimulationConfig};

    use super::*;
    use crate::source::{Source, SourceConfig};

    fn fed_by(sources: &[SourceConfig], sink: SinkConfig) -> Simulation {
        let mut builder = SimulationBuilder::new(SimulationConfig::deterministic_testing());
        builder.add("sink", Sink::new(sink).unwrap()).unwrap();
        for (input, source) in sources.iter().enumerate() {
            let name = format!("src{input}");
            builder
                .add(&name, Source::new(source.clone()).unwrap())
                .unwrap();
            builder.connect(&name, 0, "sink", input).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_zero_credit_rejected() {
        let config = SinkConfig {
            credit: Some(Credit {
                items: 0,
                window: 4,
            }),
            ..SinkConfig::default()
        };
        assert!(matches!(
            Sink::new(config),
            Err(ConfigError::BelowMinimum { parameter: "credit_items", .. })
        ));
    }

    #[test]
    fn test_counts_per_connection() {
        let mut sim = fed_by(
            &[
                SourceConfig::constant(ConnectionId(1), 1),
                SourceConfig::constant(ConnectionId(2), 2).with_frame_length(2),
            ],
            SinkConfig::with_inputs(2),
        );
        sim.run(10).unwrap();
        assert_eq!(sim.value("sink", "received"), Some(15.0));
        assert_eq!(sim.value("sink", "received.connection.1"), Some(10.0));
        assert_eq!(sim.value("sink", "received.connection.2"), Some(5.0));
        // Ten single-cell frames plus two complete two-cell frames.
        assert_eq!(sim.value("sink", "frames"), Some(12.0));
        assert_eq!(sim.value("sink", "mean_delay"), Some(0.0));
        assert_eq!(sim.value("sink", "bytes"), Some(15.0 * 53.0));
    }

    #[test]
    fn test_credit_pauses_source_for_rest_of_window() {
        let sink = SinkConfig {
            credit: Some(Credit {
                items: 3,
                window: 10,
            }),
            ..SinkConfig::default()
        };
        let mut sim = fed_by(&[SourceConfig::constant(ConnectionId(1), 1)], sink);

        sim.run(10).unwrap();
        assert_eq!(sim.value("sink", "received"), Some(3.0));
        assert_eq!(sim.value("src0", "suppressed"), Some(7.0));
        assert!(!sim.object::<Source>("src0").unwrap().is_stopped());

        sim.run(10).unwrap();
        assert_eq!(sim.value("sink", "received"), Some(6.0));
        assert_eq!(sim.value("sink", "stops"), Some(2.0));
        assert_eq!(sim.value("src0", "stops"), Some(2.0));
    }

    #[test]
    fn test_reset_counters_keeps_flow_state() {
        let mut sim = fed_by(
            &[SourceConfig::constant(ConnectionId(1), 1)],
            SinkConfig::default(),
        );
        sim.run(5).unwrap();
        sim.reset_counters("sink").unwrap();
        assert_eq!(sim.value("sink", "received"), Some(0.0));
        assert_eq!(sim.value("sink", "received.connection.1"), Some(0.0));
        sim.run(5).unwrap();
        assert_eq!(sim.value("sink", "received"), Some(5.0));
        assert!(sim.reset_counters("missing").is_err());
    }
}
