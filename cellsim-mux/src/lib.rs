//! Cellsim Mux - queueing elements built on the Cellsim kernel.
//!
//! One generic [`Multiplexer`] batches the arrivals of a tick, admits them in
//! random order through a pluggable [`Discipline`], accounts every loss and
//! serves the queue synchronously or at a byte rate. Disciplines:
//!
//! - **FIFO**: one bounded queue
//! - **Strict priority**: per-class queues, highest class first
//! - **WFQ**: virtual-spacing fair queueing over per-connection queues
//! - **EPD / PPD**: frame-aware early and partial packet discard
//! - **RED / DFBA**: probabilistic early drop, optionally fair-share aware
//!
//! [`Source`] and [`Sink`] close the loop for experiments.
//!
//! # Example
//!
//! ```rust
//! use cellsim_core::{ConnectionId, SimulationBuilder, SimulationConfig};
//! use cellsim_mux::{Fifo, FifoConfig, MuxConfig, Multiplexer, Sink, SinkConfig, Source, SourceConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = SimulationBuilder::new(SimulationConfig::default());
//! builder.add("src", Source::new(SourceConfig::constant(ConnectionId(1), 1))?)?;
//! builder.add("mux", Multiplexer::new(MuxConfig::synchronous(1, 1), Fifo::new(FifoConfig::new(8))?)?)?;
//! builder.add("sink", Sink::new(SinkConfig::default())?)?;
//! builder.connect("src", 0, "mux", 0)?;
//! builder.connect("mux", 0, "sink", 0)?;
//!
//! let mut sim = builder.build()?;
//! sim.run(100)?;
//! assert_eq!(sim.value("mux", "lost"), Some(0.0));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]

pub mod connection;
pub mod discipline;
pub mod multiplexer;
pub mod sink;
pub mod source;

// Re-export main types for convenient access
pub use connection::{ConnectionState, ConnectionTable};
pub use discipline::epd::{Epd, EpdConfig};
pub use discipline::fifo::{Fifo, FifoConfig};
pub use discipline::priority::{PriorityConfig, StrictPriority};
pub use discipline::red::{Averaging, DecisionScope, Red, RedConfig, RedCurve, RedVariant};
pub use discipline::wfq::{Wfq, WfqConfig};
pub use discipline::{Admission, AdmissionContext, Discipline, DropReason, ServiceContext};
pub use multiplexer::{Multiplexer, MuxConfig, ServiceMode};
pub use sink::{Credit, Sink, SinkConfig};
pub use source::{Source, SourceConfig, SourcePattern};

/// FIFO multiplexer.
pub type FifoMux = Multiplexer<Fifo>;
/// Strict-priority multiplexer.
pub type PriorityMux = Multiplexer<StrictPriority>;
/// Weighted fair queueing multiplexer.
pub type WfqMux = Multiplexer<Wfq>;
/// Early/partial packet discard multiplexer.
pub type EpdMux = Multiplexer<Epd>;
/// RED or DFBA multiplexer.
pub type RedMux = Multiplexer<Red>;
