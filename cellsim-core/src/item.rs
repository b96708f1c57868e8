//! Data items moved between simulated objects and their runtime type tags.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::error::ConfigError;

/// Default item length in bytes (one ATM cell).
pub const DEFAULT_CELL_LENGTH: u32 = 53;

/// Identifier of a logical connection (VC / flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vc{}", self.0)
    }
}

/// Runtime type tag of a [`DataItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(u16);

impl TypeTag {
    /// Root of the derivation tree; every tag is assignable to it.
    pub const DATA: TypeTag = TypeTag(0);
    /// Fixed-size transport unit.
    pub const CELL: TypeTag = TypeTag(1);
    /// Variable-length frame.
    pub const FRAME: TypeTag = TypeTag(2);

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Type-derivation table answering "is A assignable where B is expected".
///
/// The transitive closure is recomputed whenever a type is registered, which
/// only happens while a topology is being set up; lookups are a table read.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    names: Vec<String>,
    parents: Vec<Option<TypeTag>>,
    assignable: Vec<bool>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Registry holding the built-in `data`, `cell` and `frame` types.
    pub fn new() -> Self {
        let mut registry = Self {
            names: vec!["data".to_string(), "cell".to_string(), "frame".to_string()],
            parents: vec![None, Some(TypeTag::DATA), Some(TypeTag::DATA)],
            assignable: Vec::new(),
        };
        registry.rebuild();
        registry
    }

    /// Registers `name` as a subtype of `parent`.
    ///
    /// # Errors
    ///
    /// - `ConfigError::DuplicateType` - If the name is already registered
    /// - `ConfigError::Invalid` - If `parent` is unknown or the table is full
    pub fn register(&mut self, name: &str, parent: TypeTag) -> Result<TypeTag, ConfigError> {
        if self.lookup(name).is_some() {
            return Err(ConfigError::DuplicateType {
                name: name.to_string(),
            });
        }
        if parent.index() >= self.names.len() {
            return Err(ConfigError::Invalid {
                object: "types".to_string(),
                reason: format!("unknown parent type tag {} for '{name}'", parent.0),
            });
        }
        let raw = u16::try_from(self.names.len()).map_err(|_| ConfigError::Invalid {
            object: "types".to_string(),
            reason: "too many registered data types".to_string(),
        })?;

        self.names.push(name.to_string());
        self.parents.push(Some(parent));
        self.rebuild();
        Ok(TypeTag(raw))
    }

    /// Finds a tag by name.
    pub fn lookup(&self, name: &str) -> Option<TypeTag> {
        self.names
            .iter()
            .position(|known| known == name)
            .and_then(|index| u16::try_from(index).ok())
            .map(TypeTag)
    }

    /// Name of a tag, or `"?"` for a foreign tag.
    pub fn name(&self, tag: TypeTag) -> &str {
        self.names.get(tag.index()).map_or("?", String::as_str)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false; the built-in types are present.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether an item tagged `actual` may be consumed where `expected` is declared.
    pub fn is_assignable(&self, actual: TypeTag, expected: TypeTag) -> bool {
        let count = self.names.len();
        if actual.index() >= count || expected.index() >= count {
            return false;
        }
        self.assignable[actual.index() * count + expected.index()]
    }

    fn rebuild(&mut self) {
        let count = self.names.len();
        self.assignable = vec![false; count * count];
        for start in 0..count {
            let mut current = Some(start);
            while let Some(ancestor) = current {
                self.assignable[start * count + ancestor] = true;
                current = self.parents[ancestor].map(TypeTag::index);
            }
        }
    }
}

/// Unit of data moving through the object graph.
///
/// Ownership moves with every successful delivery; dropping the value
/// releases it.
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    /// Runtime type tag
    pub tag: TypeTag,
    /// Connection the item belongs to
    pub connection: ConnectionId,
    /// Length in bytes
    pub length: u32,
    /// Marks the last cell of a frame
    pub end_of_frame: bool,
    /// Tick at which the item was created
    pub created: Tick,
    /// Per-source sequence number
    pub sequence: u64,
    /// Opaque user payload
    pub payload: Bytes,
}

impl DataItem {
    /// Single-cell item of default length, closing its own frame.
    pub fn cell(connection: ConnectionId, created: Tick) -> Self {
        Self {
            tag: TypeTag::CELL,
            connection,
            length: DEFAULT_CELL_LENGTH,
            end_of_frame: true,
            created,
            sequence: 0,
            payload: Bytes::new(),
        }
    }

    /// Replaces the type tag.
    pub fn with_tag(mut self, tag: TypeTag) -> Self {
        self.tag = tag;
        self
    }

    /// Replaces the length in bytes.
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    /// Sets the end-of-frame marker.
    pub fn with_end_of_frame(mut self, end_of_frame: bool) -> Self {
        self.end_of_frame = end_of_frame;
        self
    }

    /// Sets the sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Attaches an opaque payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Ticks elapsed since creation.
    ///
    /// Wrapping arithmetic keeps the difference exact across clock
    /// renormalization, which rebases `created` the same way.
    pub fn age(&self, now: Tick) -> Tick {
        now.wrapping_sub(self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_derivations() {
        let types = TypeRegistry::new();
        assert!(types.is_assignable(TypeTag::CELL, TypeTag::DATA));
        assert!(types.is_assignable(TypeTag::FRAME, TypeTag::DATA));
        assert!(types.is_assignable(TypeTag::CELL, TypeTag::CELL));
        assert!(!types.is_assignable(TypeTag::DATA, TypeTag::CELL));
        assert!(!types.is_assignable(TypeTag::CELL, TypeTag::FRAME));
    }

    #[test]
    fn test_registered_subtype_is_transitive() {
        let mut types = TypeRegistry::new();
        let aal5 = types.register("aal5-cell", TypeTag::CELL).unwrap();
        let marked = types.register("marked-aal5-cell", aal5).unwrap();

        assert!(types.is_assignable(marked, TypeTag::CELL));
        assert!(types.is_assignable(marked, TypeTag::DATA));
        assert!(!types.is_assignable(aal5, marked));
        assert_eq!(types.lookup("aal5-cell"), Some(aal5));
        assert_eq!(types.name(marked), "marked-aal5-cell");
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut types = TypeRegistry::new();
        let err = types.register("cell", TypeTag::DATA).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateType { .. }));
    }

    #[test]
    fn test_item_age_survives_rebase() {
        let item = DataItem::cell(ConnectionId(1), 5);
        assert_eq!(item.age(12), 7);

        // Clock rebased by 10: both sides shift, the difference stays.
        let rebased = DataItem {
            created: item.created.wrapping_sub(10),
            ..item
        };
        assert_eq!(rebased.age(2), 7);
    }
}
