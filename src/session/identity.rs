use std::collections::BTreeMap;

use serde_json::Value;

use crate::{Result, entity::Entity};

/// Map key for an identifier value. `serde_json` keeps object keys sorted, so equal
/// identifiers always produce the same key.
pub(crate) fn key_of(id: &Value) -> String {
    id.to_string()
}

#[derive(Debug)]
enum EntryState {
    /// Persisted in this session, not yet written.
    New,
    /// Last known backend document.
    Clean(Value),
    Removed,
}

#[derive(Debug)]
struct IdentityEntry<E> {
    id: Value,
    entity: E,
    state: EntryState,
}

/// A write produced by [`IdentityMap::pending`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PendingWrite {
    Insert { id: Value, doc: Value },
    Update { id: Value, doc: Value },
    Delete { id: Value },
}

impl PendingWrite {
    pub(crate) fn id(&self) -> &Value {
        match self {
            PendingWrite::Insert { id, .. }
            | PendingWrite::Update { id, .. }
            | PendingWrite::Delete { id } => id,
        }
    }
}

/// Managed instances of one entity type, keyed by identifier.
#[derive(Debug)]
pub(crate) struct IdentityMap<E> {
    entries: BTreeMap<String, IdentityEntry<E>>,
}

impl<E> Default for IdentityMap<E> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<E: Entity> IdentityMap<E> {
    #[cfg(test)]
    pub(crate) fn contains(&self, id: &Value) -> bool {
        self.get(id).is_some()
    }

    /// `true` when the key is tracked at all, including entries staged for removal.
    pub(crate) fn tracks(&self, id: &Value) -> bool {
        self.entries.contains_key(&key_of(id))
    }

    pub(crate) fn get(&self, id: &Value) -> Option<&E> {
        self.entries
            .get(&key_of(id))
            .filter(|e| !matches!(e.state, EntryState::Removed))
            .map(|e| &e.entity)
    }

    pub(crate) fn get_mut(&mut self, id: &Value) -> Option<&mut E> {
        self.entries
            .get_mut(&key_of(id))
            .filter(|e| !matches!(e.state, EntryState::Removed))
            .map(|e| &mut e.entity)
    }

    pub(crate) fn take(&mut self, id: &Value) -> Option<E> {
        let key = key_of(id);
        match self.entries.get(&key) {
            Some(entry) if !matches!(entry.state, EntryState::Removed) => {
                self.entries.remove(&key).map(|e| e.entity)
            }
            _ => None,
        }
    }

    /// State the backend has not seen yet for `id`: `Some(true)` for a new or modified
    /// instance, `Some(false)` for one staged for removal. `None` means the backend copy
    /// is authoritative and should be read again.
    pub(crate) fn unwritten(&self, id: &Value) -> Result<Option<bool>> {
        let Some(entry) = self.entries.get(&key_of(id)) else {
            return Ok(None);
        };
        Ok(match &entry.state {
            EntryState::New => Some(true),
            EntryState::Removed => Some(false),
            EntryState::Clean(snapshot) => {
                (&serde_json::to_value(&entry.entity)? != snapshot).then_some(true)
            }
        })
    }

    pub(crate) fn forget(&mut self, id: &Value) {
        self.entries.remove(&key_of(id));
    }

    /// Track an instance read from the backend, replacing any unmodified copy.
    pub(crate) fn attach_clean(&mut self, id: Value, entity: E) -> Result<()> {
        let snapshot = serde_json::to_value(&entity)?;
        self.entries.insert(
            key_of(&id),
            IdentityEntry {
                id,
                entity,
                state: EntryState::Clean(snapshot),
            },
        );
        Ok(())
    }

    /// Track an instance the backend has not seen yet.
    pub(crate) fn attach_new(&mut self, id: Value, entity: E) {
        self.entries.insert(
            key_of(&id),
            IdentityEntry {
                id,
                entity,
                state: EntryState::New,
            },
        );
    }

    /// Swap in new state for an already tracked instance, keeping its snapshot.
    /// Hands `entity` back when `id` is not tracked.
    pub(crate) fn replace(&mut self, id: &Value, entity: E) -> Option<E> {
        match self.entries.get_mut(&key_of(id)) {
            Some(entry) => {
                entry.entity = entity;
                if matches!(entry.state, EntryState::Removed) {
                    entry.state = EntryState::Clean(Value::Null);
                }
                None
            }
            None => Some(entity),
        }
    }

    pub(crate) fn mark_removed(&mut self, id: &Value) {
        let key = key_of(id);
        let drop_entry = match self.entries.get_mut(&key) {
            Some(entry) => match entry.state {
                EntryState::New => true,
                _ => {
                    entry.state = EntryState::Removed;
                    false
                }
            },
            None => false,
        };
        if drop_entry {
            self.entries.remove(&key);
        }
    }

    /// Writes needed to bring the backend in line with the managed instances.
    /// Clean entries whose serialized form is unchanged produce nothing.
    pub(crate) fn pending(&self) -> Result<Vec<PendingWrite>> {
        let mut writes = Vec::new();
        for entry in self.entries.values() {
            match &entry.state {
                EntryState::New => writes.push(PendingWrite::Insert {
                    id: entry.id.clone(),
                    doc: serde_json::to_value(&entry.entity)?,
                }),
                EntryState::Clean(snapshot) => {
                    let doc = serde_json::to_value(&entry.entity)?;
                    if &doc != snapshot {
                        writes.push(PendingWrite::Update {
                            id: entry.id.clone(),
                            doc,
                        });
                    }
                }
                EntryState::Removed => writes.push(PendingWrite::Delete {
                    id: entry.id.clone(),
                }),
            }
        }
        Ok(writes)
    }

    /// Record that `write` reached the backend.
    pub(crate) fn mark_written(&mut self, write: &PendingWrite) {
        let key = key_of(write.id());
        match write {
            PendingWrite::Insert { doc, .. } | PendingWrite::Update { doc, .. } => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.state = EntryState::Clean(doc.clone());
                }
            }
            PendingWrite::Delete { .. } => {
                self.entries.remove(&key);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Detacher, EntityMetadata, from_property, to_property};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        body: String,
    }

    impl Entity for Note {
        type Id = i64;

        fn metadata() -> EntityMetadata<Self> {
            EntityMetadata::builder("note", "id", Detacher::DeepCopy(Note::clone))
                .property("id", |n| to_property(&n.id), |n, v| {
                    n.id = from_property(v)?;
                    Ok(())
                })
                .build()
        }
    }

    fn note(id: i64, body: &str) -> Note {
        Note {
            id,
            body: body.into(),
        }
    }

    #[test]
    fn unchanged_clean_entries_produce_no_writes() {
        let mut map = IdentityMap::default();
        map.attach_clean(json!(1), note(1, "a")).unwrap();
        assert!(map.pending().unwrap().is_empty());

        map.get_mut(&json!(1)).unwrap().body = "b".into();
        assert_eq!(
            map.pending().unwrap(),
            vec![PendingWrite::Update {
                id: json!(1),
                doc: json!({"id": 1, "body": "b"}),
            }]
        );
        for write in map.pending().unwrap() {
            map.mark_written(&write);
        }
        assert!(map.pending().unwrap().is_empty());
    }

    #[test]
    fn removing_a_new_entry_forgets_it() {
        let mut map = IdentityMap::default();
        map.attach_new(json!(2), note(2, "x"));
        map.mark_removed(&json!(2));
        assert_eq!(map.len(), 0);

        map.attach_clean(json!(3), note(3, "y")).unwrap();
        map.mark_removed(&json!(3));
        assert!(!map.contains(&json!(3)));
        assert!(map.tracks(&json!(3)));
        assert_eq!(
            map.pending().unwrap(),
            vec![PendingWrite::Delete { id: json!(3) }]
        );
        map.mark_written(&PendingWrite::Delete { id: json!(3) });
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn only_unmodified_clean_entries_defer_to_the_backend() {
        let mut map = IdentityMap::default();
        assert_eq!(map.unwritten(&json!(1)).unwrap(), None);

        map.attach_clean(json!(1), note(1, "a")).unwrap();
        assert_eq!(map.unwritten(&json!(1)).unwrap(), None);
        map.get_mut(&json!(1)).unwrap().body = "edited".into();
        assert_eq!(map.unwritten(&json!(1)).unwrap(), Some(true));

        map.attach_new(json!(2), note(2, "b"));
        assert_eq!(map.unwritten(&json!(2)).unwrap(), Some(true));

        map.attach_clean(json!(3), note(3, "c")).unwrap();
        map.mark_removed(&json!(3));
        assert_eq!(map.unwritten(&json!(3)).unwrap(), Some(false));
    }
}
