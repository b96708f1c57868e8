//! Early and partial packet discard over a cell stream.
//!
//! A frame is judged once, at its first cell: it is admissible while the
//! shared buffer (and optionally the connection's share of it) is below its
//! threshold. The verdict holds until the end-of-frame cell. With partial
//! discard enabled, an admitted frame that loses a cell to a full buffer
//! drops the rest of its cells too.

use cellsim_core::{ConfigError, DataItem, Queue, SimResult};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{
    Admission, AdmissionContext, Discipline, DropReason, ServiceContext, require_at_least,
};

/// EPD / PPD parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpdConfig {
    /// Buffer size in cells
    pub capacity: usize,
    /// New frames are refused once this many cells are queued
    pub threshold: usize,
    /// New frames of a connection are refused once it has this many cells queued
    pub connection_threshold: Option<usize>,
    /// Queue the end-of-frame cell of a discarded frame if space allows
    pub deliver_end_of_frame: bool,
    /// Discard the remainder of an admitted frame after a buffer-full loss
    pub partial_discard: bool,
}

impl EpdConfig {
    /// Plain EPD with the end-of-frame cell delivered.
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            capacity,
            threshold,
            connection_threshold: None,
            deliver_end_of_frame: true,
            partial_discard: false,
        }
    }

    /// Enables partial packet discard.
    pub fn with_partial_discard(mut self) -> Self {
        self.partial_discard = true;
        self
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If the capacity or a threshold is zero
    /// - `ConfigError::ThresholdOrder` - If a threshold exceeds the capacity
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "capacity", 1, self.capacity as u64)?;
        require_at_least(object, "threshold", 1, self.threshold as u64)?;
        if self.threshold > self.capacity {
            return Err(ConfigError::ThresholdOrder {
                object: object.to_string(),
                lower_name: "threshold",
                lower: self.threshold as f64,
                upper_name: "capacity",
                upper: self.capacity as f64,
            });
        }
        if let Some(threshold) = self.connection_threshold {
            require_at_least(object, "connection_threshold", 1, threshold as u64)?;
            if threshold > self.capacity {
                return Err(ConfigError::ThresholdOrder {
                    object: object.to_string(),
                    lower_name: "connection_threshold",
                    lower: threshold as f64,
                    upper_name: "capacity",
                    upper: self.capacity as f64,
                });
            }
        }
        Ok(())
    }
}

/// FIFO buffer with frame-level admission.
#[derive(Debug, Clone)]
pub struct Epd {
    config: EpdConfig,
    queue: Queue<DataItem>,
    frames_refused: u64,
    frames_truncated: u64,
}

impl Epd {
    /// Creates the discipline.
    ///
    /// # Errors
    ///
    /// Every error of [`EpdConfig::validate`].
    pub fn new(config: EpdConfig) -> Result<Self, ConfigError> {
        config.validate("epd")?;
        Ok(Self {
            queue: Queue::bounded(config.capacity),
            config,
            frames_refused: 0,
            frames_truncated: 0,
        })
    }

    /// The end-of-frame cell of a discarded multi-cell frame is still queued
    /// when configured; a single-cell frame is dropped whole.
    fn end_of_frame_or_drop(
        &mut self,
        item: DataItem,
        first_cell: bool,
        reason: DropReason,
    ) -> Admission {
        if item.end_of_frame && !first_cell && self.config.deliver_end_of_frame {
            Admission::from_enqueue(self.queue.enqueue(item))
        } else {
            Admission::dropped(item, reason)
        }
    }
}

impl Discipline for Epd {
    fn kind(&self) -> &'static str {
        "epd"
    }

    fn admit(&mut self, ctx: &mut AdmissionContext<'_>, item: DataItem) -> SimResult<Admission> {
        let total = self.queue.len();
        let end_of_frame = item.end_of_frame;
        let connection = item.connection;
        let state = ctx.connection(connection);
        let first_cell = state.first;

        if first_cell {
            let connection_ok = self
                .config
                .connection_threshold
                .is_none_or(|threshold| state.queued_items < threshold);
            state.admissible = total < self.config.threshold && connection_ok;
            state.truncated = false;
            if !state.admissible {
                self.frames_refused += 1;
                trace!(%connection, total, "frame refused");
            }
        }
        let admissible = state.admissible;
        let truncated = state.truncated;

        let admission = if !admissible {
            self.end_of_frame_or_drop(item, first_cell, DropReason::FrameDiscard)
        } else if truncated {
            self.end_of_frame_or_drop(item, first_cell, DropReason::PartialFrameDiscard)
        } else {
            match self.queue.enqueue(item) {
                Ok(()) => Admission::Queued,
                Err(item) => {
                    if self.config.partial_discard && !end_of_frame {
                        ctx.connection(connection).truncated = true;
                        self.frames_truncated += 1;
                        trace!(%connection, "frame truncated");
                    }
                    Admission::dropped(item, DropReason::BufferFull)
                }
            }
        };

        ctx.connection(connection).first = end_of_frame;
        Ok(admission)
    }

    fn dequeue(&mut self, _ctx: &mut ServiceContext<'_>) -> SimResult<Option<DataItem>> {
        Ok(self.queue.dequeue())
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn set_capacity(&mut self, capacity: usize) -> Result<(), ConfigError> {
        let resized = EpdConfig {
            capacity,
            ..self.config.clone()
        };
        resized.validate("epd")?;
        self.queue.set_capacity(Some(capacity));
        self.config = resized;
        Ok(())
    }

    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "frames_refused" => Some(self.frames_refused as f64),
            "frames_truncated" => Some(self.frames_truncated as f64),
            _ => None,
        }
    }

    fn value_names(&self) -> Vec<String> {
        vec!["frames_refused".to_string(), "frames_truncated".to_string()]
    }

    fn for_each_item(&mut self, visit: &mut dyn FnMut(&mut DataItem)) {
        self.queue.iter_mut().for_each(visit);
    }

    fn reset_counters(&mut self) {
        self.frames_refused = 0;
        self.frames_truncated = 0;
    }

    fn drain(&mut self) -> Vec<DataItem> {
        self.queue.drain()
    }
}
