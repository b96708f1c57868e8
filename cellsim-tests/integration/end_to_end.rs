//! Whole-topology runs: timing, accounting and reproducibility.

use cellsim_core::{ConnectionId, SimulationConfig};
use cellsim_mux::{Fifo, FifoConfig, SinkConfig, SourceConfig};
use proptest::prelude::*;

use crate::common::{assert_conserved, fan_in, saturating, value};

#[test]
fn test_two_cells_into_single_slot_buffer() {
    let sources = vec![
        SourceConfig::script(ConnectionId(1), vec![0]),
        SourceConfig::script(ConnectionId(2), vec![0]),
    ];
    let fifo = Fifo::new(FifoConfig::new(1)).unwrap();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        sources,
        fifo,
        SinkConfig::default(),
    );

    sim.run(1).unwrap();
    assert_eq!(value(&sim, "mux", "received"), 2.0);
    assert_eq!(value(&sim, "mux", "queue_length"), 1.0);
    assert_eq!(value(&sim, "mux", "lost.buffer_full"), 1.0);
    assert_eq!(value(&sim, "sink", "received"), 0.0);

    sim.run(1).unwrap();
    assert_eq!(value(&sim, "sink", "received"), 1.0);
    assert_eq!(value(&sim, "sink", "mean_delay"), 1.0);
    assert_eq!(value(&sim, "mux", "queue_length"), 0.0);
    assert_conserved(&sim);
}

#[test]
fn test_periods_beyond_calendar_horizon() {
    let config = SimulationConfig::deterministic_testing();
    assert!(config.horizon < 150);
    let fifo = Fifo::new(FifoConfig::new(4)).unwrap();
    let mut sim = fan_in(
        config,
        vec![SourceConfig::constant(ConnectionId(1), 150)],
        fifo,
        SinkConfig::default(),
    );

    sim.run(1000).unwrap();

    // Emissions at 0, 150, ..., 900.
    assert_eq!(value(&sim, "src0", "sent"), 7.0);
    assert_eq!(value(&sim, "sink", "received"), 7.0);
    assert_eq!(value(&sim, "sink", "max_delay"), 1.0);
    assert_conserved(&sim);
}

#[test]
fn test_renormalization_is_invisible_to_objects() {
    let config = SimulationConfig::deterministic_testing().with_renormalize_threshold(100);
    let fifo = Fifo::new(FifoConfig::new(4)).unwrap();
    let mut sim = fan_in(config, vec![saturating(1)], fifo, SinkConfig::default());

    sim.run(1000).unwrap();

    assert!(sim.report().renormalizations >= 9);
    assert!(sim.now() < 100);
    assert_eq!(value(&sim, "src0", "sent"), 1000.0);
    assert_eq!(value(&sim, "sink", "received"), 999.0);
    assert_eq!(value(&sim, "sink", "max_delay"), 1.0);
    assert_eq!(value(&sim, "mux", "lost"), 0.0);
    assert_conserved(&sim);
}

#[test]
fn test_reset_replays_random_run() {
    let sources = (1..=3)
        .map(|connection| SourceConfig::bernoulli(ConnectionId(connection), 0.4))
        .collect();
    let fifo = Fifo::new(FifoConfig::new(3)).unwrap();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing().with_seed(5),
        sources,
        fifo,
        SinkConfig::default(),
    );

    sim.run(500).unwrap();
    let first = serde_json::to_string(&sim.report()).unwrap();
    assert!(value(&sim, "mux", "lost") > 0.0);

    sim.reset();
    sim.run(500).unwrap();
    let second = serde_json::to_string(&sim.report()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_counters_reset_without_disturbing_queue() {
    let sources = vec![saturating(1), saturating(2)];
    let fifo = Fifo::new(FifoConfig::new(5)).unwrap();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        sources,
        fifo,
        SinkConfig::default(),
    );

    sim.run(50).unwrap();
    let queued = value(&sim, "mux", "queue_length");
    assert_eq!(queued, 5.0);

    sim.reset_all_counters();
    assert_eq!(value(&sim, "mux", "received"), 0.0);
    assert_eq!(value(&sim, "mux", "lost"), 0.0);
    assert_eq!(value(&sim, "mux", "queue_length"), queued);

    sim.run(10).unwrap();
    assert_eq!(value(&sim, "mux", "received"), 20.0);
    assert_eq!(value(&sim, "mux", "served"), 10.0);
    assert_eq!(value(&sim, "mux", "lost"), 10.0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_bernoulli_fan_in_conserves_items(
        seed in any::<u64>(),
        capacity in 1usize..16,
        probability in 0.05f64..1.0,
        inputs in 1u32..5,
    ) {
        let sources = (1..=inputs)
            .map(|connection| SourceConfig::bernoulli(ConnectionId(connection), probability))
            .collect();
        let fifo = Fifo::new(FifoConfig::new(capacity)).unwrap();
        let mut sim = fan_in(
            SimulationConfig::deterministic_testing().with_seed(seed),
            sources,
            fifo,
            SinkConfig::default(),
        );
        sim.run(300).unwrap();

        let sent: f64 = (0..inputs)
            .map(|index| value(&sim, &format!("src{index}"), "sent"))
            .sum();
        prop_assert_eq!(sent, value(&sim, "mux", "received"));
        prop_assert!(value(&sim, "mux", "queue_length") <= capacity as f64);
        assert_conserved(&sim);
    }
}
