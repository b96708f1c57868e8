//! Strict priority: the highest non-empty class is always served first.

use std::collections::BTreeMap;

use cellsim_core::{ConfigError, ConnectionId, DataItem, Queue, SimResult};
use serde::{Deserialize, Serialize};

use super::{Admission, AdmissionContext, Discipline, ServiceContext, require_at_least};
use crate::connection::ConnectionState;

/// Strict-priority parameters.
///
/// Class `n - 1` has the highest priority. Connections missing from
/// `classes` use `default_class`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityConfig {
    /// Buffer size of every class, lowest class first
    pub class_capacities: Vec<usize>,
    /// Explicit connection-to-class table
    pub classes: BTreeMap<ConnectionId, usize>,
    /// Class of unlisted connections
    pub default_class: usize,
}

impl PriorityConfig {
    /// `classes` classes of `capacity` items each; unlisted connections go lowest.
    pub fn uniform(classes: usize, capacity: usize) -> Self {
        Self {
            class_capacities: vec![capacity; classes],
            classes: BTreeMap::new(),
            default_class: 0,
        }
    }

    /// Assigns a connection to a class.
    pub fn with_class(mut self, connection: ConnectionId, class: usize) -> Self {
        self.classes.insert(connection, class);
        self
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If there is no class or a class has no buffer
    /// - `ConfigError::Invalid` - If the default or a mapped class does not exist
    pub fn validate(&self, object: &str) -> Result<(), ConfigError> {
        require_at_least(object, "classes", 1, self.class_capacities.len() as u64)?;
        for capacity in &self.class_capacities {
            require_at_least(object, "class_capacity", 1, *capacity as u64)?;
        }
        let count = self.class_capacities.len();
        if self.default_class >= count {
            return Err(ConfigError::Invalid {
                object: object.to_string(),
                reason: format!("default class {} of {count} classes", self.default_class),
            });
        }
        if let Some((connection, class)) = self.classes.iter().find(|(_, class)| **class >= count) {
            return Err(ConfigError::Invalid {
                object: object.to_string(),
                reason: format!("{connection} mapped to class {class} of {count} classes"),
            });
        }
        Ok(())
    }
}

/// One FIFO per class, drained from the top.
#[derive(Debug, Clone)]
pub struct StrictPriority {
    classes: Vec<Queue<DataItem>>,
    table: BTreeMap<ConnectionId, usize>,
    default_class: usize,
}

impl StrictPriority {
    /// Creates the discipline.
    ///
    /// # Errors
    ///
    /// Every error of [`PriorityConfig::validate`].
    pub fn new(config: PriorityConfig) -> Result<Self, ConfigError> {
        config.validate("priority")?;
        Ok(Self {
            classes: config
                .class_capacities
                .iter()
                .map(|capacity| Queue::bounded(*capacity))
                .collect(),
            table: config.classes,
            default_class: config.default_class,
        })
    }

    /// Class a connection is served in.
    pub fn class_of(&self, connection: ConnectionId) -> usize {
        self.table
            .get(&connection)
            .copied()
            .unwrap_or(self.default_class)
    }

    /// Items queued in `class`.
    pub fn class_len(&self, class: usize) -> usize {
        self.classes.get(class).map_or(0, Queue::len)
    }
}

impl Discipline for StrictPriority {
    fn kind(&self) -> &'static str {
        "priority"
    }

    fn configure_connection(&self, id: ConnectionId, state: &mut ConnectionState) {
        state.priority = self.class_of(id);
    }

    fn admit(&mut self, ctx: &mut AdmissionContext<'_>, item: DataItem) -> SimResult<Admission> {
        let class = ctx.connection(item.connection).priority;
        Ok(Admission::from_enqueue(self.classes[class].enqueue(item)))
    }

    fn dequeue(&mut self, _ctx: &mut ServiceContext<'_>) -> SimResult<Option<DataItem>> {
        Ok(self
            .classes
            .iter_mut()
            .rev()
            .find(|queue| !queue.is_empty())
            .and_then(Queue::dequeue))
    }

    fn len(&self) -> usize {
        self.classes.iter().map(Queue::len).sum()
    }

    fn capacity(&self) -> usize {
        self.classes
            .iter()
            .map(|queue| queue.capacity().unwrap_or(usize::MAX))
            .fold(0, usize::saturating_add)
    }

    fn set_capacity(&mut self, capacity: usize) -> Result<(), ConfigError> {
        require_at_least("priority", "class_capacity", 1, capacity as u64)?;
        for queue in &mut self.classes {
            queue.set_capacity(Some(capacity));
        }
        Ok(())
    }

    fn value(&self, name: &str) -> Option<f64> {
        let class: usize = name.strip_prefix("queue.class.")?.parse().ok()?;
        self.classes.get(class).map(|queue| queue.len() as f64)
    }

    fn value_names(&self) -> Vec<String> {
        (0..self.classes.len())
            .map(|class| format!("queue.class.{class}"))
            .collect()
    }

    fn for_each_item(&mut self, visit: &mut dyn FnMut(&mut DataItem)) {
        for queue in &mut self.classes {
            queue.iter_mut().for_each(&mut *visit);
        }
    }

    fn drain(&mut self) -> Vec<DataItem> {
        self.classes
            .iter_mut()
            .rev()
            .flat_map(Queue::drain)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discipline::DropReason;
    use crate::discipline::test_support::Harness;

    fn three_classes() -> StrictPriority {
        StrictPriority::new(
            PriorityConfig::uniform(3, 2)
                .with_class(ConnectionId(10), 2)
                .with_class(ConnectionId(5), 1),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_class_tables_rejected() {
        assert!(StrictPriority::new(PriorityConfig::uniform(0, 4)).is_err());
        assert!(StrictPriority::new(PriorityConfig::uniform(2, 0)).is_err());
        assert!(matches!(
            StrictPriority::new(PriorityConfig::uniform(2, 4).with_class(ConnectionId(1), 2)),
            Err(ConfigError::Invalid { .. })
        ));
        let mut config = PriorityConfig::uniform(2, 4);
        config.default_class = 5;
        assert!(StrictPriority::new(config).is_err());
    }

    #[test]
    fn test_highest_class_always_served_first() {
        let mut harness = Harness::new(three_classes());
        harness.cell(1, true);
        harness.cell(5, true);
        harness.cell(10, true);
        harness.cell(1, true);
        harness.cell(10, true);

        let order: Vec<u32> = std::iter::from_fn(|| harness.serve())
            .map(|item| item.connection.0)
            .collect();
        assert_eq!(order, vec![10, 10, 5, 1, 1]);
    }

    #[test]
    fn test_class_buffers_are_independent() {
        let mut harness = Harness::new(three_classes());
        harness.cell(1, true);
        harness.cell(1, true);
        assert!(matches!(
            harness.cell(1, true),
            Admission::Dropped {
                reason: DropReason::BufferFull,
                ..
            }
        ));
        assert_eq!(harness.cell(10, true), Admission::Queued);
        assert_eq!(harness.discipline.class_len(0), 2);
        assert_eq!(harness.discipline.value("queue.class.2"), Some(1.0));
        assert_eq!(harness.connections.get(ConnectionId(10)).unwrap().priority, 2);
    }

    #[test]
    fn test_resize_applies_to_every_class() {
        let mut harness = Harness::new(three_classes());
        assert_eq!(harness.discipline.capacity(), 6);

        harness.discipline.set_capacity(1).unwrap();
        assert_eq!(harness.discipline.capacity(), 3);
        assert_eq!(harness.cell(10, true), Admission::Queued);
        assert!(matches!(
            harness.cell(10, true),
            Admission::Dropped {
                reason: DropReason::BufferFull,
                ..
            }
        ));
        assert_eq!(harness.cell(5, true), Admission::Queued);

        assert!(matches!(
            harness.discipline.set_capacity(0),
            Err(ConfigError::BelowMinimum { .. })
        ));
        assert_eq!(harness.discipline.capacity(), 3);
    }
}
