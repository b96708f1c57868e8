//! Integration tests for Cellsim
//!
//! These tests wire real sources, multiplexers and sinks into topologies and
//! check what only shows up once the pieces run together: tick timing across
//! objects, loss accounting, discipline behaviour under sustained load and
//! flow control between neighbours.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/end_to_end.rs"]
mod end_to_end;
#[path = "integration/disciplines.rs"]
mod disciplines;
#[path = "integration/flow_control.rs"]
mod flow_control;
