//! COMMAND-mode row tracking.
//!
//! A COMMAND subscription maintains a two-level structure: each item holds a
//! set of rows keyed by the `key` field, maintained through ADD/UPDATE/DELETE
//! commands. The tracker resolves delta updates against the stored row of
//! the same key and keeps the key set consistent, so a DELETE followed by an
//! ADD of the same key always reaches the listener as two distinct events.

use std::collections::HashMap;

use crate::protocol::FieldValue;
use crate::subscription::UpdateCommand;

/// Resolved COMMAND update ready for delivery.
#[derive(Debug)]
pub(crate) struct CommandUpdate {
    pub key: String,
    pub command: UpdateCommand,
    pub values: Vec<Option<String>>,
    pub changed: Vec<bool>,
}

/// Per-subscription row state for COMMAND mode.
#[derive(Debug)]
pub(crate) struct CommandTracker {
    key_pos: u64,
    command_pos: u64,
    rows: HashMap<(u64, String), Vec<Option<String>>>,
}

impl CommandTracker {
    pub(crate) fn new(key_pos: u64, command_pos: u64) -> Self {
        Self {
            key_pos,
            command_pos,
            rows: HashMap::new(),
        }
    }

    /// Resolve one update against the stored row of its key.
    ///
    /// Returns `None` when the update carries no usable key, which indicates
    /// a server bug rather than a client state; the update is dropped.
    pub(crate) fn apply(&mut self, item: u64, fields: &[FieldValue]) -> Option<CommandUpdate> {
        let key = match field_at(fields, self.key_pos) {
            Some(FieldValue::Value(key)) => key.clone(),
            _ => return None,
        };
        let command = match field_at(fields, self.command_pos) {
            Some(FieldValue::Value(raw)) => UpdateCommand::parse(raw)?,
            // A delta without an explicit command refreshes the row.
            Some(FieldValue::Unchanged) => UpdateCommand::Update,
            _ => return None,
        };

        let slot = (item, key.clone());
        let previous = self.rows.get(&slot);
        let mut values = Vec::with_capacity(fields.len());
        let mut changed = Vec::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            match field {
                FieldValue::Unchanged => {
                    values.push(previous.and_then(|row| row.get(index).cloned().flatten()));
                    changed.push(false);
                }
                FieldValue::Null => {
                    values.push(None);
                    changed.push(true);
                }
                FieldValue::Value(value) => {
                    values.push(Some(value.clone()));
                    changed.push(true);
                }
            }
        }

        match command {
            UpdateCommand::Delete => {
                self.rows.remove(&slot);
            }
            UpdateCommand::Add | UpdateCommand::Update => {
                self.rows.insert(slot, values.clone());
            }
        }

        Some(CommandUpdate {
            key,
            command,
            values,
            changed,
        })
    }

    /// Drop every row of one item (clear snapshot).
    pub(crate) fn clear_item(&mut self, item: u64) {
        self.rows.retain(|(row_item, _), _| *row_item != item);
    }
}

fn field_at(fields: &[FieldValue], pos: u64) -> Option<&FieldValue> {
    usize::try_from(pos.checked_sub(1)?)
        .ok()
        .and_then(|index| fields.get(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> FieldValue {
        FieldValue::Value(s.to_string())
    }

    #[test]
    fn add_then_delta_resolves_against_row() {
        let mut tracker = CommandTracker::new(1, 2);
        let add = tracker
            .apply(1, &[value("k1"), value("ADD"), value("100")])
            .unwrap();
        assert_eq!(add.command, UpdateCommand::Add);
        assert_eq!(add.values[2].as_deref(), Some("100"));

        let update = tracker
            .apply(
                1,
                &[value("k1"), value("UPDATE"), FieldValue::Unchanged],
            )
            .unwrap();
        assert_eq!(update.command, UpdateCommand::Update);
        assert_eq!(update.values[2].as_deref(), Some("100"));
        assert!(!update.changed[2]);
    }

    #[test]
    fn delete_then_add_are_two_distinct_events() {
        let mut tracker = CommandTracker::new(1, 2);
        tracker
            .apply(1, &[value("k1"), value("ADD"), value("100")])
            .unwrap();

        let delete = tracker
            .apply(1, &[value("k1"), value("DELETE"), FieldValue::Null])
            .unwrap();
        assert_eq!(delete.command, UpdateCommand::Delete);

        // The re-added row must not inherit pre-delete state.
        let add = tracker
            .apply(1, &[value("k1"), value("ADD"), FieldValue::Unchanged])
            .unwrap();
        assert_eq!(add.command, UpdateCommand::Add);
        assert_eq!(add.values[2], None);
    }

    #[test]
    fn keys_are_scoped_per_item() {
        let mut tracker = CommandTracker::new(1, 2);
        tracker
            .apply(1, &[value("k"), value("ADD"), value("one")])
            .unwrap();
        let other_item = tracker
            .apply(2, &[value("k"), value("ADD"), FieldValue::Unchanged])
            .unwrap();
        assert_eq!(other_item.values[2], None);
    }

    #[test]
    fn missing_key_drops_update() {
        let mut tracker = CommandTracker::new(1, 2);
        assert!(
            tracker
                .apply(1, &[FieldValue::Null, value("ADD"), value("x")])
                .is_none()
        );
    }

    #[test]
    fn clear_item_drops_rows() {
        let mut tracker = CommandTracker::new(1, 2);
        tracker
            .apply(1, &[value("k"), value("ADD"), value("one")])
            .unwrap();
        tracker.clear_item(1);
        let after = tracker
            .apply(1, &[value("k"), value("UPDATE"), FieldValue::Unchanged])
            .unwrap();
        assert_eq!(after.values[2], None);
    }
}
