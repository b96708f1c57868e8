//! Discrete-event kernel: calendar, object contract and simulation driver.
//!
//! A [`Simulation`] owns one [`Calendar`] and the objects of one topology.
//! Each call to [`Simulation::advance`] executes one tick: every early-phase
//! activation, then every late-phase activation, then the clock moves on.

mod calendar;
mod object;
mod simulation;

pub use calendar::{Activation, Calendar, EventHandle, Trigger};
pub use object::{Context, Delivery, Link, ObjectId, ObjectTable, SimObject};
pub use simulation::{ObjectReport, RunState, Simulation, SimulationBuilder, SimulationReport};
