//! CLI command implementations

use anyhow::{Context as _, ensure};
use cellsim_core::{
    ConnectionId, SimulationBuilder, SimulationConfig, SimulationReport, Tick, tracing_setup,
};
use cellsim_mux::{
    Averaging, Discipline, Epd, EpdConfig, Fifo, FifoConfig, Multiplexer, MuxConfig,
    PriorityConfig, Red, RedConfig, Sink, SinkConfig, Source, SourceConfig, StrictPriority, Wfq,
    WfqConfig,
};
use clap::{Subcommand, ValueEnum};
use tracing::info;

/// Scheduling discipline of the simulated multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DisciplineKind {
    /// Single bounded FIFO
    Fifo,
    /// Two strict-priority classes, odd connections high
    Priority,
    /// Weighted fair queueing, connection n weighted 1/n
    Wfq,
    /// Early packet discard with partial discard
    Epd,
    /// Random early detection
    Red,
    /// Dynamic fair buffer allocation
    Dfba,
}

impl DisciplineKind {
    /// Every discipline, in listing order.
    pub const ALL: [DisciplineKind; 6] = [
        DisciplineKind::Fifo,
        DisciplineKind::Priority,
        DisciplineKind::Wfq,
        DisciplineKind::Epd,
        DisciplineKind::Red,
        DisciplineKind::Dfba,
    ];

    fn name(self) -> &'static str {
        match self {
            DisciplineKind::Fifo => "fifo",
            DisciplineKind::Priority => "priority",
            DisciplineKind::Wfq => "wfq",
            DisciplineKind::Epd => "epd",
            DisciplineKind::Red => "red",
            DisciplineKind::Dfba => "dfba",
        }
    }

    fn description(self) -> &'static str {
        match self {
            DisciplineKind::Fifo => "one bounded queue served in arrival order",
            DisciplineKind::Priority => "per-class queues, highest non-empty class first",
            DisciplineKind::Wfq => "per-connection queues served by virtual spacing",
            DisciplineKind::Epd => "frame-level admission at a buffer threshold",
            DisciplineKind::Red => "probabilistic early drop on an averaged queue length",
            DisciplineKind::Dfba => "early drop that spares connections within their fair share",
        }
    }
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run one multiplexer fed by Bernoulli sources into a sink
    Run {
        /// Discipline of the multiplexer
        #[arg(short, long, value_enum, default_value = "fifo")]
        discipline: DisciplineKind,
        /// Number of sources (one input and connection each)
        #[arg(short, long, default_value = "4")]
        sources: usize,
        /// Offered load relative to one cell per tick
        #[arg(short, long, default_value = "0.9")]
        load: f64,
        /// Buffer size in cells
        #[arg(short, long, default_value = "64")]
        capacity: usize,
        /// Ticks to simulate
        #[arg(short, long, default_value = "10000")]
        ticks: Tick,
        /// Random seed (defaults to CELLSIM_SEED or the built-in seed)
        #[arg(long)]
        seed: Option<u64>,
        /// Cells per frame
        #[arg(short, long, default_value = "1")]
        frame_length: u32,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the available disciplines
    Disciplines,
}

/// Parameters of one `run` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    /// Discipline of the multiplexer
    pub discipline: DisciplineKind,
    /// Number of sources
    pub sources: usize,
    /// Offered load
    pub load: f64,
    /// Buffer size in cells
    pub capacity: usize,
    /// Ticks to simulate
    pub ticks: Tick,
    /// Seed override
    pub seed: Option<u64>,
    /// Cells per frame
    pub frame_length: u32,
}

/// Handle the CLI command
///
/// # Errors
///
/// Returns the configuration or simulation error of the failing command.
pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            discipline,
            sources,
            load,
            capacity,
            ticks,
            seed,
            frame_length,
            json,
        } => {
            let experiment = Experiment {
                discipline,
                sources,
                load,
                capacity,
                ticks,
                seed,
                frame_length,
            };
            let report = run_experiment(&experiment)?;
            print_report(&report, json)
        }
        Commands::Disciplines => {
            list_disciplines();
            Ok(())
        }
    }
}

/// Builds and runs the source -> multiplexer -> sink topology.
///
/// # Errors
///
/// - If the load per source is not a probability or there is no source
/// - Every configuration error of the objects and the topology
/// - Any fatal simulation error
pub fn run_experiment(experiment: &Experiment) -> anyhow::Result<SimulationReport> {
    ensure!(experiment.sources >= 1, "at least one source is required");
    let probability = experiment.load / experiment.sources as f64;
    ensure!(
        (0.0..=1.0).contains(&probability),
        "load {} cannot be offered by {} sources",
        experiment.load,
        experiment.sources
    );

    let mut config = SimulationConfig::from_env();
    if let Some(seed) = experiment.seed {
        config = config.with_seed(seed);
    }
    let mut builder = SimulationBuilder::new(config);

    for index in 0..experiment.sources {
        let connection = ConnectionId(index as u32 + 1);
        let source = SourceConfig::bernoulli(connection, probability)
            .with_frame_length(experiment.frame_length);
        builder.add(&format!("src{index}"), Source::new(source)?)?;
    }

    let mux = MuxConfig::synchronous(experiment.sources, 1);
    let capacity = experiment.capacity;
    let frames = experiment.frame_length > 1;
    match experiment.discipline {
        DisciplineKind::Fifo => add_mux(&mut builder, mux, Fifo::new(FifoConfig::new(capacity))?)?,
        DisciplineKind::Priority => {
            let mut config = PriorityConfig::uniform(2, capacity);
            for index in 0..experiment.sources as u32 {
                config = config.with_class(ConnectionId(index + 1), ((index + 1) % 2) as usize);
            }
            add_mux(&mut builder, mux, StrictPriority::new(config)?)?
        }
        DisciplineKind::Wfq => {
            let mut config = WfqConfig::new(capacity);
            for index in 0..experiment.sources as u64 {
                config = config.with_delta(ConnectionId(index as u32 + 1), index + 1);
            }
            add_mux(&mut builder, mux, Wfq::new(config)?)?
        }
        DisciplineKind::Epd => {
            let threshold = (capacity * 3 / 4).max(1);
            let config = EpdConfig::new(capacity, threshold).with_partial_discard();
            add_mux(&mut builder, mux, Epd::new(config)?)?
        }
        DisciplineKind::Red | DisciplineKind::Dfba => {
            let capacity_f = capacity as f64;
            let mut config = RedConfig::new(capacity, capacity_f / 4.0, capacity_f * 3.0 / 4.0, 0.1)
                .with_averaging(Averaging::Exponential { weight: 0.02 });
            if experiment.discipline == DisciplineKind::Dfba {
                config = config.dfba(0.5);
            }
            if frames {
                config = config.per_frame(true);
            }
            add_mux(&mut builder, mux, Red::new(config)?)?
        }
    }

    builder.add("sink", Sink::new(SinkConfig::default())?)?;
    for index in 0..experiment.sources {
        builder.connect(&format!("src{index}"), 0, "mux", index)?;
    }
    builder.connect("mux", 0, "sink", 0)?;

    let mut simulation = builder.build()?;
    let _run = tracing_setup::run_span(
        simulation.seed(),
        experiment.discipline.name(),
        simulation.now(),
    )
    .entered();
    info!(
        sources = experiment.sources,
        load = experiment.load,
        ticks = experiment.ticks,
        "running experiment"
    );
    simulation
        .run(experiment.ticks)
        .with_context(|| format!("simulation failed at tick {}", simulation.now()))?;
    Ok(simulation.report())
}

fn add_mux<D: Discipline>(
    builder: &mut SimulationBuilder,
    config: MuxConfig,
    discipline: D,
) -> anyhow::Result<()> {
    builder.add("mux", Multiplexer::new(config, discipline)?)?;
    Ok(())
}

fn print_report(report: &SimulationReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    print!("{}", report.summary());
    if let Some(mux) = report.object("mux") {
        let received = mux.values.get("received").copied().unwrap_or(0.0);
        let lost = mux.values.get("lost").copied().unwrap_or(0.0);
        if received > 0.0 {
            println!("\nLoss ratio: {:.6}", lost / received);
        }
    }
    Ok(())
}

fn list_disciplines() {
    println!("Available disciplines");
    println!("{:-<60}", "");
    for kind in DisciplineKind::ALL {
        println!("  {:<10} {}", kind.name(), kind.description());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment(discipline: DisciplineKind) -> Experiment {
        Experiment {
            discipline,
            sources: 3,
            load: 0.95,
            capacity: 8,
            ticks: 2000,
            seed: Some(11),
            frame_length: 3,
        }
    }

    fn value(report: &SimulationReport, object: &str, name: &str) -> f64 {
        report.object(object).unwrap().values[name]
    }

    #[test]
    fn test_every_discipline_conserves_items() {
        for kind in DisciplineKind::ALL {
            let report = run_experiment(&experiment(kind)).unwrap();
            let sent: f64 = (0..3).map(|i| value(&report, &format!("src{i}"), "sent")).sum();
            let received = value(&report, "mux", "received");
            let served = value(&report, "mux", "served");
            let lost = value(&report, "mux", "lost");
            let queued = value(&report, "mux", "queue_length");

            assert_eq!(sent, received, "{kind:?}");
            assert_eq!(received, served + lost + queued, "{kind:?}");
            assert_eq!(value(&report, "sink", "received"), served, "{kind:?}");
        }
    }

    #[test]
    fn test_same_seed_same_report() {
        let first = run_experiment(&experiment(DisciplineKind::Red)).unwrap();
        let second = run_experiment(&experiment(DisciplineKind::Red)).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_overload_per_source_rejected() {
        let mut invalid = experiment(DisciplineKind::Fifo);
        invalid.load = 4.0;
        assert!(run_experiment(&invalid).is_err());
        invalid.sources = 0;
        assert!(run_experiment(&invalid).is_err());
    }

    #[test]
    fn test_invalid_capacity_reported() {
        let mut invalid = experiment(DisciplineKind::Wfq);
        invalid.capacity = 0;
        let err = run_experiment(&invalid).unwrap_err();
        assert!(err.to_string().contains("capacity"), "{err}");
    }
}
