//! Stop / wakeup between neighbours.

use cellsim_core::{ConnectionId, SimulationBuilder, SimulationConfig};
use cellsim_mux::{Credit, Fifo, FifoConfig, Multiplexer, Sink, SinkConfig, Source};

use crate::common::{assert_conserved, fan_in, saturating, value};

fn credit_sink(items: u64, window: u64) -> SinkConfig {
    SinkConfig {
        credit: Some(Credit { items, window }),
        ..SinkConfig::default()
    }
}

#[test]
fn test_source_pauses_until_window_closes() {
    let mut builder = SimulationBuilder::new(SimulationConfig::deterministic_testing());
    builder
        .add("src", Source::new(saturating(1)).unwrap())
        .unwrap();
    builder.add("sink", Sink::new(credit_sink(2, 4)).unwrap()).unwrap();
    builder.connect("src", 0, "sink", 0).unwrap();
    let mut sim = builder.build().unwrap();

    sim.run(2).unwrap();
    assert!(sim.object::<Source>("src").unwrap().is_stopped());

    sim.run(18).unwrap();

    // Two deliveries per four-tick window, the other two ticks suppressed.
    assert_eq!(value(&sim, "src", "sent"), 10.0);
    assert_eq!(value(&sim, "src", "suppressed"), 10.0);
    assert_eq!(value(&sim, "src", "stops"), 5.0);
    assert_eq!(value(&sim, "sink", "received"), 10.0);
    assert_eq!(value(&sim, "sink", "stops"), 5.0);
}

#[test]
fn test_multiplexer_blocks_and_buffers_behind_credit() {
    let fifo = Fifo::new(FifoConfig::new(8)).unwrap();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        vec![saturating(1)],
        fifo,
        credit_sink(1, 3),
    );

    sim.run(29).unwrap();

    // Served at ticks 1, 3, 6, 9, ..., 27: one item per window once the
    // first window has closed. The window ending at 29 has not closed yet.
    assert_eq!(value(&sim, "sink", "received"), 10.0);
    assert_eq!(value(&sim, "mux", "served"), 10.0);
    assert_eq!(value(&sim, "mux", "queue_length"), 8.0);
    assert_eq!(value(&sim, "mux", "lost"), 11.0);
    let mux = sim.object::<Multiplexer<Fifo>>("mux").unwrap();
    assert!(mux.is_blocked());
    assert_conserved(&sim);
}

#[test]
fn test_credit_throttles_every_connection_through_one_port() {
    let fifo = Fifo::new(FifoConfig::new(64)).unwrap();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        vec![saturating(1), saturating(2)],
        fifo,
        credit_sink(5, 10),
    );

    sim.run(200).unwrap();

    let sink = sim.object::<Sink>("sink").unwrap();
    let delivered = sink.received_from(ConnectionId(1)) + sink.received_from(ConnectionId(2));
    assert!(delivered <= 100, "{delivered} items passed a 5-per-10 credit");
    assert!(value(&sim, "sink", "stops") >= 18.0);
    assert!(value(&sim, "mux", "lost.buffer_full") > 0.0);
    assert_conserved(&sim);
}
