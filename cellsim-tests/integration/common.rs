//! Topology helpers shared by the integration tests.

use cellsim_core::{ConnectionId, Simulation, SimulationBuilder, SimulationConfig};
use cellsim_mux::{Discipline, Multiplexer, MuxConfig, Sink, SinkConfig, Source, SourceConfig};

/// `sources` feed one synchronous multiplexer (period 1) whose output goes to one sink.
///
/// Source `i` is named `src{i}` and drives input `i`; the others are `mux` and `sink`.
pub fn fan_in<D: Discipline>(
    config: SimulationConfig,
    sources: Vec<SourceConfig>,
    discipline: D,
    sink: SinkConfig,
) -> Simulation {
    let inputs = sources.len();
    let mut builder = SimulationBuilder::new(config);
    for (index, source) in sources.into_iter().enumerate() {
        builder
            .add(&format!("src{index}"), Source::new(source).unwrap())
            .unwrap();
    }
    builder
        .add(
            "mux",
            Multiplexer::new(MuxConfig::synchronous(inputs, 1), discipline).unwrap(),
        )
        .unwrap();
    builder.add("sink", Sink::new(sink).unwrap()).unwrap();
    for index in 0..inputs {
        builder
            .connect(&format!("src{index}"), 0, "mux", index)
            .unwrap();
    }
    builder.connect("mux", 0, "sink", 0).unwrap();
    builder.build().unwrap()
}

/// Source emitting one cell every tick on `connection`.
pub fn saturating(connection: u32) -> SourceConfig {
    SourceConfig::constant(ConnectionId(connection), 1)
}

/// Value that must exist.
pub fn value(sim: &Simulation, object: &str, name: &str) -> f64 {
    sim.value(object, name)
        .unwrap_or_else(|| panic!("{object} has no value '{name}'"))
}

/// Items offered to the multiplexer are served, lost or still queued.
pub fn assert_conserved(sim: &Simulation) {
    let received = value(sim, "mux", "received");
    let served = value(sim, "mux", "served");
    let lost = value(sim, "mux", "lost");
    let queued = value(sim, "mux", "queue_length");
    assert_eq!(
        received,
        served + lost + queued,
        "received {received}, served {served}, lost {lost}, queued {queued}"
    );
    assert_eq!(value(sim, "sink", "received"), served);
}
