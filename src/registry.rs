//! Name to id bookkeeping for the entries of one log.
//!
//! The registry only tracks state; emitting the matching control records is
//! up to the caller, which holds the same lock while doing so.

use std::collections::HashMap;

/// Prefix of the entry names that carry schema bodies.
pub const SCHEMA_PREFIX: &str = "/.schema/";

/// A live entry as currently known to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: u32,
    pub name: String,
    pub r#type: String,
    pub metadata: String,
    pub ref_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StartOutcome {
    /// A new id was allocated and a Start record is owed.
    Created(u32),
    /// The name was already live with the same type.
    Existing(u32),
    /// The name is live under another type; nothing was allocated.
    Conflict { existing_type: String },
    /// Every id has been handed out.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SchemaRecord {
    pub entry: u32,
    pub data: Box<[u8]>,
}

/// What must be written to make a fresh segment self-describing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RegistrySnapshot {
    /// Live entries, ordered by id.
    pub entries: Vec<EntryInfo>,
    /// Schema bodies, ordered by the id of the entry carrying them.
    pub schemas: Vec<SchemaRecord>,
}

#[derive(Debug, Default)]
pub(crate) struct EntryRegistry {
    by_name: HashMap<String, u32>,
    entries: HashMap<u32, EntryInfo>,
    schemas: HashMap<String, SchemaRecord>,
    last_id: u32,
}

impl EntryRegistry {
    pub fn start(&mut self, name: &str, r#type: &str, metadata: &str) -> StartOutcome {
        if let Some(entry) = self.by_name.get(name).and_then(|id| self.entries.get_mut(id)) {
            if entry.r#type != r#type {
                return StartOutcome::Conflict {
                    existing_type: entry.r#type.clone(),
                };
            }

            entry.ref_count += 1;
            return StartOutcome::Existing(entry.id);
        }

        let Some(id) = self.last_id.checked_add(1) else {
            return StartOutcome::Exhausted;
        };
        self.last_id = id;

        self.by_name.insert(name.to_string(), id);
        self.entries.insert(
            id,
            EntryInfo {
                id,
                name: name.to_string(),
                r#type: r#type.to_string(),
                metadata: metadata.to_string(),
                ref_count: 1,
            },
        );

        StartOutcome::Created(id)
    }

    /// Drops one reference. Returns the references left, or `None` for an
    /// unknown id. The entry is forgotten once nothing references it; its id
    /// is never handed out again.
    pub fn finish(&mut self, id: u32) -> Option<u32> {
        let entry = self.entries.get_mut(&id)?;
        entry.ref_count -= 1;

        let remaining = entry.ref_count;
        if remaining == 0 {
            if let Some(entry) = self.entries.remove(&id) {
                self.by_name.remove(&entry.name);
            }
        }

        Some(remaining)
    }

    /// Returns `false` for an unknown id.
    pub fn set_metadata(&mut self, id: u32, metadata: &str) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                metadata.clone_into(&mut entry.metadata);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn get(&self, id: u32) -> Option<&EntryInfo> {
        self.entries.get(&id)
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Records the body for a schema already started under `entry`.
    /// The first registration of a name wins.
    pub fn add_schema(&mut self, name: &str, entry: u32, data: &[u8]) -> bool {
        if self.schemas.contains_key(name) {
            return false;
        }

        self.schemas.insert(
            name.to_string(),
            SchemaRecord {
                entry,
                data: data.into(),
            },
        );
        true
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut entries: Vec<EntryInfo> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.id);

        let mut schemas: Vec<SchemaRecord> = self
            .schemas
            .values()
            .filter(|schema| self.entries.contains_key(&schema.entry))
            .cloned()
            .collect();
        schemas.sort_by_key(|schema| schema.entry);

        RegistrySnapshot { entries, schemas }
    }
}
