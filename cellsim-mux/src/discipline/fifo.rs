//! Plain first-in first-out buffer.

use cellsim_core::{ConfigError, DataItem, Queue, SimResult};
use serde::{Deserialize, Serialize};

use super::{Admission, AdmissionContext, Discipline, ServiceContext, require_at_least};

/// FIFO parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoConfig {
    /// Buffer size in items
    pub capacity: usize,
}

impl FifoConfig {
    /// Buffer of `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If the capacity is zero
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "capacity", 1, self.capacity as u64)
    }
}

/// One bounded queue served in arrival order.
#[derive(Debug, Clone)]
pub struct Fifo {
    queue: Queue<DataItem>,
}

impl Fifo {
    /// Creates the discipline.
    ///
    /// # Errors
    ///
    /// Every error of [`FifoConfig::validate`].
    pub fn new(config: FifoConfig) -> Result<Self, ConfigError> {
        config.validate("fifo")?;
        Ok(Self {
            queue: Queue::bounded(config.capacity),
        })
    }
}

impl Discipline for Fifo {
    fn kind(&self) -> &'static str {
        "fifo"
    }

    fn admit(&mut self, _ctx: &mut AdmissionContext<'_>, item: DataItem) -> SimResult<Admission> {
        Ok(Admission::from_enqueue(self.queue.enqueue(item)))
    }

    fn dequeue(&mut self, _ctx: &mut ServiceContext<'_>) -> SimResult<Option<DataItem>> {
        Ok(self.queue.dequeue())
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> usize {
        self.queue.capacity().unwrap_or(usize::MAX)
    }

    fn set_capacity(&mut self, capacity: usize) -> Result<(), ConfigError> {
        require_at_least("fifo", "capacity", 1, capacity as u64)?;
        self.queue.set_capacity(Some(capacity));
        Ok(())
    }

    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "capacity" => Some(self.capacity() as f64),
            _ => None,
        }
    }

    fn value_names(&self) -> Vec<String> {
        vec!["capacity".to_string()]
    }

    fn for_each_item(&mut self, visit: &mut dyn FnMut(&mut DataItem)) {
        self.queue.iter_mut().for_each(visit);
    }

    fn drain(&mut self) -> Vec<DataItem> {
        self.queue.drain()
    }
}
