//! Traffic generator feeding one output.

use std::any::Any;

use cellsim_core::{
    Activation, ConfigError, ConnectionId, Context, Counter, DEFAULT_CELL_LENGTH, DataItem,
    Delivery, EventHandle, Phase, SimError, SimObject, SimResult, Tick, TypeTag,
};
use tracing::{debug, trace};

use crate::discipline::{require_at_least, require_probability};

const EMIT: u32 = 0;

/// When a source emits a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePattern {
    /// Every `period` ticks, the first at `offset` after start
    Constant {
        /// Ticks between emissions
        period: Tick,
        /// Delay of the first emission
        offset: Tick,
    },
    /// One independent draw per tick
    Bernoulli {
        /// Emission probability per tick
        probability: f64,
    },
    /// Strictly increasing ticks, relative to start
    Script(Vec<Tick>),
}

/// Source parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    /// Connection stamped on every cell
    pub connection: ConnectionId,
    /// Emission times
    pub pattern: SourcePattern,
    /// Cells per frame; the last carries the end-of-frame mark
    pub frame_length: u32,
    /// Bytes per cell
    pub item_length: u32,
    /// Type of the emitted items
    pub tag: TypeTag,
    /// Stop for good after this many cells
    pub limit: Option<u64>,
}

impl SourceConfig {
    /// One single-cell frame every `period` ticks from tick 0.
    pub fn constant(connection: ConnectionId, period: Tick) -> Self {
        Self {
            connection,
            pattern: SourcePattern::Constant { period, offset: 0 },
            frame_length: 1,
            item_length: DEFAULT_CELL_LENGTH,
            tag: TypeTag::CELL,
            limit: None,
        }
    }

    /// One cell per tick with `probability`.
    pub fn bernoulli(connection: ConnectionId, probability: f64) -> Self {
        Self {
            pattern: SourcePattern::Bernoulli { probability },
            ..Self::constant(connection, 1)
        }
    }

    /// Cells at the given ticks after start.
    pub fn script(connection: ConnectionId, ticks: Vec<Tick>) -> Self {
        Self {
            pattern: SourcePattern::Script(ticks),
            ..Self::constant(connection, 1)
        }
    }

    /// Groups cells into frames of `frame_length`.
    pub fn with_frame_length(mut self, frame_length: u32) -> Self {
        self.frame_length = frame_length;
        self
    }

    /// Caps the number of emitted cells.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If the period, frame length or item length is zero
    /// - `ConfigError::ProbabilityOutOfRange` - If the Bernoulli probability is outside `[0, 1]`
    /// - `ConfigError::Invalid` - If script ticks are not strictly increasing
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "frame_length", 1, u64::from(self.frame_length))?;
        require_at_least(object, "item_length", 1, u64::from(self.item_length))?;
        match &self.pattern {
            SourcePattern::Constant { period, .. } => {
                require_at_least(object, "period", 1, *period)
            }
            SourcePattern::Bernoulli { probability } => {
                require_probability(object, "probability", *probability)
            }
            SourcePattern::Script(ticks) => {
                match ticks.windows(2).find(|pair| pair[0] >= pair[1]) {
                    Some(pair) => Err(ConfigError::Invalid {
                        object: object.to_string(),
                        reason: format!("script tick {} does not follow {}", pair[1], pair[0]),
                    }),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Emits cells of one connection and honours flow control.
#[derive(Debug, Clone)]
pub struct Source {
    config: SourceConfig,
    name: String,
    event: Option<EventHandle>,
    started_at: Tick,
    next_script: usize,
    cell_in_frame: u32,
    stopped: bool,
    sent: Counter,
    frames: Counter,
    accepted_bytes: Counter,
    partial_accepts: Counter,
    stops: Counter,
    suppressed: Counter,
}

impl Source {
    /// Creates a source.
    ///
    /// # Errors
    ///
    /// Every error of [`SourceConfig::validate`].
    pub fn new(config: SourceConfig) -> Result<Self, ConfigError> {
        config.validate("source")?;
        Ok(Self {
            config,
            name: "source".to_string(),
            event: None,
            started_at: 0,
            next_script: 0,
            cell_in_frame: 0,
            stopped: false,
            sent: Counter::ZERO,
            frames: Counter::ZERO,
            accepted_bytes: Counter::ZERO,
            partial_accepts: Counter::ZERO,
            stops: Counter::ZERO,
            suppressed: Counter::ZERO,
        })
    }

    /// Whether downstream paused this source.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn exhausted(&self) -> bool {
        self.config.limit.is_some_and(|limit| self.sent.get() >= limit)
    }

    fn event(&self) -> SimResult<EventHandle> {
        self.event.ok_or_else(|| SimError::NotStarted {
            object: self.name.clone(),
        })
    }

    fn emit(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        if self.exhausted() {
            return Ok(());
        }
        if self.stopped {
            return self.suppressed.increment(&self.name, "suppressed");
        }

        let end_of_frame = self.cell_in_frame + 1 == self.config.frame_length;
        let item = DataItem::cell(self.config.connection, ctx.now())
            .with_tag(self.config.tag)
            .with_length(self.config.item_length)
            .with_end_of_frame(end_of_frame)
            .with_sequence(self.sent.get());
        self.sent.increment(&self.name, "sent")?;
        if end_of_frame {
            self.cell_in_frame = 0;
            self.frames.increment(&self.name, "frames")?;
        } else {
            self.cell_in_frame += 1;
        }

        let length = u64::from(self.config.item_length);
        match ctx.send(0, item)? {
            Delivery::Continue => self.accepted_bytes.add(length, &self.name, "accepted_bytes")?,
            Delivery::Stop => {
                self.accepted_bytes.add(length, &self.name, "accepted_bytes")?;
                self.stops.increment(&self.name, "stops")?;
                self.stopped = true;
                debug!(object = %self.name, now = ctx.now(), "source stopped");
            }
            Delivery::PartialAccept(bytes) => {
                self.accepted_bytes
                    .add(u64::from(bytes), &self.name, "accepted_bytes")?;
                self.partial_accepts.increment(&self.name, "partial_accepts")?;
            }
        }
        Ok(())
    }

    fn schedule_script(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        let SourcePattern::Script(ticks) = &self.config.pattern else {
            return Ok(());
        };
        if let Some(&tick) = ticks.get(self.next_script) {
            let delay = self.started_at.wrapping_add(tick).wrapping_sub(ctx.now());
            ctx.schedule(self.event()?, delay, Phase::Early)?;
        }
        Ok(())
    }
}

impl SimObject for Source {
    fn kind(&self) -> &'static str {
        "source"
    }

    fn outputs(&self) -> usize {
        1
    }

    fn output_type(&self, _output: usize) -> TypeTag {
        self.config.tag
    }

    fn start(&mut self, ctx: &mut Context<'_>) -> SimResult<()> {
        self.name = ctx.name().to_string();
        self.started_at = ctx.now();
        let event = ctx.new_event(EMIT);
        self.event = Some(event);
        match &self.config.pattern {
            SourcePattern::Constant { offset, .. } => {
                ctx.schedule(event, *offset, Phase::Early)?;
            }
            SourcePattern::Bernoulli { .. } => ctx.register_per_tick(EMIT, Phase::Early),
            SourcePattern::Script(_) => self.schedule_script(ctx)?,
        }
        trace!(object = %self.name, connection = %self.config.connection, "source started");
        Ok(())
    }

    fn on_early(&mut self, ctx: &mut Context<'_>, _activation: Activation) -> SimResult<()> {
        match self.config.pattern {
            SourcePattern::Constant { period, .. } => {
                self.emit(ctx)?;
                if !self.exhausted() {
                    ctx.schedule(self.event()?, period, Phase::Early)?;
                }
            }
            SourcePattern::Bernoulli { probability } => {
                if ctx.rng().random_bool(probability) {
                    self.emit(ctx)?;
                }
                if self.exhausted() {
                    ctx.unregister_per_tick(EMIT, Phase::Early);
                }
            }
            SourcePattern::Script(_) => {
                self.emit(ctx)?;
                self.next_script += 1;
                self.schedule_script(ctx)?;
            }
        }
        Ok(())
    }

    fn on_wakeup(&mut self, ctx: &mut Context<'_>, _output: usize) -> SimResult<()> {
        if self.stopped {
            debug!(object = %self.name, now = ctx.now(), "source resumed");
        }
        self.stopped = false;
        Ok(())
    }

    fn on_clock_reset(&mut self, delta: Tick) {
        self.started_at = self.started_at.wrapping_sub(delta);
    }

    fn reset(&mut self) {
        self.event = None;
        self.started_at = 0;
        self.next_script = 0;
        self.cell_in_frame = 0;
        self.stopped = false;
        self.reset_counters();
    }

    fn reset_counters(&mut self) {
        for counter in [
            &mut self.sent,
            &mut self.frames,
            &mut self.accepted_bytes,
            &mut self.partial_accepts,
            &mut self.stops,
            &mut self.suppressed,
        ] {
            counter.reset();
        }
    }

    fn value(&self, name: &str) -> Option<f64> {
        let counter = match name {
            "sent" => self.sent,
            "frames" => self.frames,
            "accepted_bytes" => self.accepted_bytes,
            "partial_accepts" => self.partial_accepts,
            "stops" => self.stops,
            "suppressed" => self.suppressed,
            _ => return None,
        };
        Some(counter.into())
    }

    fn value_names(&self) -> Vec<String> {
        [
            "sent",
            "frames",
            "accepted_bytes",
            "partial_accepts",
            "stops",
            "suppressed",
        ]
        .into_iter()
        .map(String::from)
        .collect()
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
    use crate::sink::{Sink, SinkConfig};

    fn into_sink(source: SourceConfig) -> Simulation {
        let mut builder = SimulationBuilder::new(SimulationConfig::deterministic_testing());
        builder.add("src", Source::new(source).unwrap()).unwrap();
        builder.add("sink", Sink::new(SinkConfig::default()).unwrap()).unwrap();
        builder.connect("src", 0, "sink", 0).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(Source::new(SourceConfig::constant(ConnectionId(1), 0)).is_err());
        assert!(matches!(
            Source::new(SourceConfig::bernoulli(ConnectionId(1), 1.5)),
            Err(ConfigError::ProbabilityOutOfRange { .. })
        ));
        assert!(matches!(
            Source::new(SourceConfig::script(ConnectionId(1), vec![0, 3, 3])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(Source::new(SourceConfig::constant(ConnectionId(1), 1).with_frame_length(0)).is_err());
    }

    #[test]
    fn test_constant_with_offset() {
        let mut config = SourceConfig::constant(ConnectionId(1), 3);
        config.pattern = SourcePattern::Constant {
            period: 3,
            offset: 2,
        };
        let mut sim = into_sink(config);
        // Emissions at 2, 5, 8.
        sim.run(9).unwrap();
        assert_eq!(sim.value("src", "sent"), Some(3.0));
        assert_eq!(sim.value("sink", "received"), Some(3.0));
    }

    #[test]
    fn test_frames_marked_and_limit_honoured() {
        let config = SourceConfig::constant(ConnectionId(4), 1)
            .with_frame_length(3)
            .with_limit(7);
        let mut sim = into_sink(config);
        sim.run(20).unwrap();
        assert_eq!(sim.value("src", "sent"), Some(7.0));
        assert_eq!(sim.value("src", "frames"), Some(2.0));
        assert_eq!(sim.value("sink", "frames"), Some(2.0));
        assert_eq!(sim.value("src", "accepted_bytes"), Some(7.0 * 53.0));
        assert_eq!(sim.pending_events(), 0);
    }

    #[test]
    fn test_script_is_relative_to_start() {
        let mut sim = into_sink(SourceConfig::script(ConnectionId(1), vec![0, 4, 5]));
        sim.run(5).unwrap();
        assert_eq!(sim.value("sink", "received"), Some(2.0));
        sim.run(1).unwrap();
        assert_eq!(sim.value("sink", "received"), Some(3.0));
    }

    #[test]
    fn test_bernoulli_rate_and_reproducibility() {
        let run = || {
            let mut sim = into_sink(SourceConfig::bernoulli(ConnectionId(1), 0.25));
            sim.run(4000).unwrap();
            sim.value("src", "sent").unwrap()
        };
        let sent = run();
        assert_eq!(sent, run());
        assert!((800.0..1200.0).contains(&sent), "{sent}");
    }

    #[test]
    fn test_bernoulli_extremes() {
        let mut never = into_sink(SourceConfig::bernoulli(ConnectionId(1), 0.0));
        never.run(50).unwrap();
        assert_eq!(never.value("src", "sent"), Some(0.0));

        let mut always = into_sink(SourceConfig::bernoulli(ConnectionId(1), 1.0));
        always.run(50).unwrap();
        assert_eq!(always.value("src", "sent"), Some(50.0));
    }
}
