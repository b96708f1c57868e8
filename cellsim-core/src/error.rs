//! Error types shared by the kernel and every simulated object.
//!
//! Two families exist. [`ConfigError`] is raised while a topology is being
//! built or an object is being configured; nothing runs after one. [`SimError`]
//! is a fatal invariant violation during a run: the simulation that observed it
//! is aborted and refuses further advances.

use thiserror::Error;

use crate::clock::{Phase, Tick};

/// Invalid configuration detected at construction or connect time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Integer parameter below its allowed minimum
    #[error("'{object}': parameter '{parameter}' must be at least {minimum}, got {value}")]
    BelowMinimum {
        /// Object or component being configured
        object: String,
        /// Offending parameter
        parameter: &'static str,
        /// Smallest accepted value
        minimum: u64,
        /// Value that was supplied
        value: u64,
    },

    /// Probability-like parameter outside `[0, 1]`
    #[error("'{object}': parameter '{parameter}' must lie in [0, 1], got {value}")]
    ProbabilityOutOfRange {
        /// Object or component being configured
        object: String,
        /// Offending parameter
        parameter: &'static str,
        /// Value that was supplied
        value: f64,
    },

    /// Two thresholds that must be strictly ordered are not
    #[error("'{object}': '{lower_name}' ({lower}) must be below '{upper_name}' ({upper})")]
    ThresholdOrder {
        /// Object or component being configured
        object: String,
        /// Name of the lower threshold
        lower_name: &'static str,
        /// Supplied lower threshold
        lower: f64,
        /// Name of the upper threshold
        upper_name: &'static str,
        /// Supplied upper threshold
        upper: f64,
    },

    /// Free-form invalid parameter combination
    #[error("'{object}': {reason}")]
    Invalid {
        /// Object or component being configured
        object: String,
        /// What is wrong
        reason: String,
    },

    /// Object name registered twice
    #[error("object name '{name}' is already in use")]
    DuplicateName {
        /// Conflicting name
        name: String,
    },

    /// Object name not registered
    #[error("no object named '{name}'")]
    UnknownObject {
        /// Requested name
        name: String,
    },

    /// Type name registered twice
    #[error("data type '{name}' is already registered")]
    DuplicateType {
        /// Conflicting type name
        name: String,
    },

    /// Port index beyond the object's declared ports
    #[error("'{object}' has {count} {kind} port(s), index {port} is out of range")]
    PortOutOfRange {
        /// Object owning the port
        object: String,
        /// `"input"` or `"output"`
        kind: &'static str,
        /// Requested index
        port: usize,
        /// Declared number of ports
        count: usize,
    },

    /// Port already linked
    #[error("{kind} {port} of '{object}' is already connected")]
    PortInUse {
        /// Object owning the port
        object: String,
        /// `"input"` or `"output"`
        kind: &'static str,
        /// Port index
        port: usize,
    },

    /// Item or link type not assignable to the receiving input
    #[error("link {link}: type '{actual}' is not assignable to '{expected}'")]
    TypeMismatch {
        /// Human-readable link, `from[out] -> to[in]`
        link: String,
        /// Type offered by the sender
        actual: String,
        /// Type declared by the receiving input
        expected: String,
    },
}

/// Fatal invariant violation observed while a simulation runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Event scheduled while it is still pending
    #[error(
        "event {key} of '{owner}' is already scheduled for tick {scheduled_for}, \
         cannot schedule it again for tick {requested}"
    )]
    DoubleSchedule {
        /// Owning object
        owner: String,
        /// Event key
        key: u32,
        /// Tick the event is pending for
        scheduled_for: Tick,
        /// Tick of the rejected request
        requested: Tick,
    },

    /// Cancel of an event that is not pending
    #[error("event {key} of '{owner}' is not scheduled (last target tick {last_target}, now {now})")]
    CancelNotScheduled {
        /// Owning object
        owner: String,
        /// Event key
        key: u32,
        /// Last tick the event was scheduled for
        last_target: Tick,
        /// Current tick
        now: Tick,
    },

    /// Zero-delay schedule into a phase that has already been swept
    #[error("'{owner}' scheduled event {key} into the {phase} phase of tick {tick} after it began")]
    ElapsedPhase {
        /// Owning object
        owner: String,
        /// Event key
        key: u32,
        /// Requested phase
        phase: Phase,
        /// Current tick
        tick: Tick,
    },

    /// Bucket member whose tick lies in the past
    #[error("event {key} of '{owner}' targets tick {time} but the clock is at {now}")]
    StaleEvent {
        /// Owning object
        owner: String,
        /// Event key
        key: u32,
        /// Recorded target tick
        time: Tick,
        /// Current tick
        now: Tick,
    },

    /// Handle that does not name an allocated event
    #[error("unknown event handle {index}")]
    UnknownEvent {
        /// Raw handle index
        index: usize,
    },

    /// Object tried to use an event it does not own
    #[error("'{object}' used event {key} owned by '{owner}'")]
    ForeignEvent {
        /// Object making the call
        object: String,
        /// Actual owner
        owner: String,
        /// Event key
        key: u32,
    },

    /// Tick counter would wrap
    #[error("tick counter overflow at tick {now} (delay {delay})")]
    TickOverflow {
        /// Current tick
        now: Tick,
        /// Requested delay
        delay: Tick,
    },

    /// Renormalization requested while a tick is being swept
    #[error("cannot renormalize the clock while tick {now} is in progress")]
    RenormalizeDuringTick {
        /// Current tick
        now: Tick,
    },

    /// Monotonic counter would wrap
    #[error("counter '{counter}' of '{object}' overflowed")]
    CounterOverflow {
        /// Owning object
        object: String,
        /// Counter name
        counter: String,
    },

    /// Scheduling structure empty although items are queued
    #[error("'{object}' has {queued} queued item(s) but its {structure} is empty")]
    EmptySchedule {
        /// Owning object
        object: String,
        /// Name of the inconsistent structure
        structure: &'static str,
        /// Items the discipline reports as queued
        queued: usize,
    },

    /// Second arrival on one input within a single tick
    #[error("'{object}' received a second item on input {input} during tick {tick}")]
    DuplicateArrival {
        /// Receiving object
        object: String,
        /// Input index
        input: usize,
        /// Current tick
        tick: Tick,
    },

    /// Delivery cycle reached an object that is already active
    #[error("delivery re-entered '{object}' while it is active")]
    ReentrantDelivery {
        /// Object that was re-entered
        object: String,
    },

    /// Send on an output without a link
    #[error("output {output} of '{object}' is not connected")]
    UnconnectedOutput {
        /// Sending object
        object: String,
        /// Output index
        output: usize,
    },

    /// Object used before the simulation started it
    #[error("'{object}' was activated before it was started")]
    NotStarted {
        /// Object name
        object: String,
    },

    /// Simulation refused to continue after an earlier fatal error
    #[error("simulation aborted: {reason}")]
    Aborted {
        /// Rendering of the original error
        reason: String,
    },

    /// Configuration error detected during the run
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience alias for results carrying a [`SimError`].
pub type SimResult<T> = Result<T, SimError>;

impl SimError {
    /// Whether the error stems from configuration rather than a kernel invariant.
    pub fn is_config_error(&self) -> bool {
        matches!(self, SimError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_schedule_names_owner_and_ticks() {
        let err = SimError::DoubleSchedule {
            owner: "mux0".to_string(),
            key: 1,
            scheduled_for: 10,
            requested: 12,
        };
        let text = err.to_string();
        assert!(text.contains("mux0"));
        assert!(text.contains("10"));
        assert!(text.contains("12"));
    }

    #[test]
    fn test_config_error_converts_into_sim_error() {
        let err: SimError = ConfigError::UnknownObject {
            name: "sink".to_string(),
        }
        .into();
        assert!(err.is_config_error());
        assert_eq!(err.to_string(), "no object named 'sink'");
    }

    #[test]
    fn test_threshold_order_message() {
        let err = ConfigError::ThresholdOrder {
            object: "red".to_string(),
            lower_name: "low_threshold",
            lower: 8.0,
            upper_name: "high_threshold",
            upper: 4.0,
        };
        assert!(err.to_string().contains("low_threshold"));
    }
}
