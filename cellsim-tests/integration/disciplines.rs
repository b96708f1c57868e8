//! Disciplines under sustained overload.

use cellsim_core::{ConnectionId, SimulationConfig};
use cellsim_mux::{
    Epd, EpdConfig, Fifo, FifoConfig, Multiplexer, PriorityConfig, Red, RedConfig, Sink,
    SinkConfig, SourceConfig, StrictPriority, Wfq, WfqConfig,
};

use crate::common::{assert_conserved, fan_in, saturating, value};

#[test]
fn test_wfq_splits_service_by_delta() {
    let config = WfqConfig::new(64)
        .with_delta(ConnectionId(1), 1)
        .with_delta(ConnectionId(2), 2)
        .with_connection_capacity(8);
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        vec![saturating(1), saturating(2)],
        Wfq::new(config).unwrap(),
        SinkConfig::default(),
    );

    sim.run(3000).unwrap();

    let sink = sim.object::<Sink>("sink").unwrap();
    let fast = sink.received_from(ConnectionId(1)) as f64;
    let slow = sink.received_from(ConnectionId(2)) as f64;
    let ratio = fast / slow;
    assert!((1.9..=2.1).contains(&ratio), "service ratio {ratio}");
    assert_eq!(value(&sim, "mux", "lost.buffer_full"), value(&sim, "mux", "lost"));
    assert_conserved(&sim);
}

#[test]
fn test_wfq_idle_connection_leaves_bandwidth_to_others() {
    let config = WfqConfig::new(64)
        .with_delta(ConnectionId(1), 1)
        .with_delta(ConnectionId(2), 8)
        .with_connection_capacity(8);
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        vec![
            SourceConfig::constant(ConnectionId(1), 2),
            saturating(2),
        ],
        Wfq::new(config).unwrap(),
        SinkConfig::default(),
    );

    sim.run(1000).unwrap();

    // Connection 1 never fills its share, so it loses nothing and
    // connection 2 picks up the remaining half of the link.
    assert_eq!(value(&sim, "mux", "lost.connection.1"), 0.0);
    let sink = sim.object::<Sink>("sink").unwrap();
    assert!(sink.received_from(ConnectionId(1)) >= 498);
    assert!(sink.received_from(ConnectionId(2)) >= 490);
    assert_conserved(&sim);
}

#[test]
fn test_priority_starves_low_class() {
    let config = PriorityConfig::uniform(2, 4).with_class(ConnectionId(1), 1);
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        vec![saturating(1), saturating(2)],
        StrictPriority::new(config).unwrap(),
        SinkConfig::default(),
    );

    sim.run(100).unwrap();

    let sink = sim.object::<Sink>("sink").unwrap();
    assert_eq!(sink.received_from(ConnectionId(1)), 99);
    assert_eq!(sink.received_from(ConnectionId(2)), 0);
    assert_eq!(value(&sim, "mux", "queue.class.0"), 4.0);
    assert_eq!(value(&sim, "mux", "queue.class.1"), 1.0);
    assert_eq!(value(&sim, "mux", "lost.connection.2"), 96.0);
    assert_conserved(&sim);
}

#[test]
fn test_epd_delivers_whole_frames_only() {
    let mut config = EpdConfig::new(64, 8);
    config.deliver_end_of_frame = false;
    let sources = (1..=3)
        .map(|connection| {
            saturating(connection)
                .with_frame_length(4)
                .with_limit(400)
        })
        .collect();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        sources,
        Epd::new(config).unwrap(),
        SinkConfig::default(),
    );

    sim.run(1000).unwrap();

    let received = value(&sim, "sink", "received");
    let frames = value(&sim, "sink", "frames");
    assert!(frames > 0.0);
    assert_eq!(received, 4.0 * frames);
    assert_eq!(value(&sim, "mux", "received"), 1200.0);
    assert_eq!(value(&sim, "mux", "queue_length"), 0.0);
    assert_eq!(value(&sim, "mux", "lost.buffer_full"), 0.0);
    assert!(value(&sim, "mux", "lost.frame_discard") > 0.0);
    assert!(value(&sim, "mux", "frames_refused") > 0.0);
    assert_conserved(&sim);
}

#[test]
fn test_partial_discard_truncates_overflowing_frames() {
    let mut config = EpdConfig::new(6, 6).with_partial_discard();
    config.deliver_end_of_frame = false;
    let sources = (1..=3)
        .map(|connection| saturating(connection).with_frame_length(4))
        .collect();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        sources,
        Epd::new(config).unwrap(),
        SinkConfig::default(),
    );

    sim.run(400).unwrap();

    assert!(value(&sim, "mux", "frames_truncated") > 0.0);
    assert!(value(&sim, "mux", "lost.buffer_full") > 0.0);
    assert!(value(&sim, "mux", "lost.partial_frame_discard") > 0.0);
    assert_conserved(&sim);
}

#[test]
fn test_red_keeps_queue_below_high_threshold() {
    let config = RedConfig::new(64, 4.0, 8.0, 1.0);
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        vec![saturating(1), saturating(2)],
        Red::new(config).unwrap(),
        SinkConfig::default(),
    );

    for _ in 0..500 {
        sim.run(1).unwrap();
        assert!(value(&sim, "mux", "queue_length") <= 8.0);
    }

    assert_eq!(value(&sim, "mux", "lost.buffer_full"), 0.0);
    assert!(value(&sim, "mux", "lost.early_drop") > 0.0);
    assert!(value(&sim, "mux", "average") >= 4.0);
    assert_conserved(&sim);
}

#[test]
fn test_dfba_spares_connection_within_fair_share() {
    let config = RedConfig::new(64, 8.0, 32.0, 0.5).dfba(0.5);
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing().with_seed(3),
        vec![
            saturating(1),
            SourceConfig::constant(ConnectionId(2), 4),
        ],
        Red::new(config).unwrap(),
        SinkConfig::default(),
    );

    sim.run(4000).unwrap();

    let heavy_ratio =
        value(&sim, "mux", "lost.connection.1") / value(&sim, "mux", "received.connection.1");
    let light_ratio =
        value(&sim, "mux", "lost.connection.2") / value(&sim, "mux", "received.connection.2");
    assert!(heavy_ratio > 0.1, "heavy loss ratio {heavy_ratio}");
    assert!(light_ratio < 0.01, "light loss ratio {light_ratio}");
    assert!(value(&sim, "mux", "lost.fair_share") > 0.0);
    assert_conserved(&sim);
}

#[test]
fn test_buffer_resized_between_runs() {
    let fifo = Fifo::new(FifoConfig::new(8)).unwrap();
    let mut sim = fan_in(
        SimulationConfig::deterministic_testing(),
        vec![saturating(1), saturating(2)],
        fifo,
        SinkConfig::default(),
    );

    sim.run(20).unwrap();
    assert_eq!(value(&sim, "mux", "queue_length"), 8.0);

    let mux = sim.object_mut::<Multiplexer<Fifo>>("mux").unwrap();
    mux.set_capacity(4).unwrap();
    assert!(mux.set_capacity(0).is_err());

    // The backlog drains one item per tick down to the new size.
    sim.run(20).unwrap();
    assert_eq!(value(&sim, "mux", "queue_length"), 4.0);
    assert_conserved(&sim);
}
