//! Subscription manager.
//!
//! Owns the set of active subscriptions on the session thread and reconciles
//! it with server state across sessions: every time a fresh session reaches
//! its receiving state, the whole set is re-issued as a batch under fresh
//! subscription ids. A recovered session keeps its server-side state, so
//! nothing is re-sent. Control requests for a given subscription are sent in
//! the order received from the application; a request that fails with
//! `REQERR` is never re-sent.

use std::collections::{HashMap, HashSet};

use crate::protocol::{ControlOp, FieldValue, Notification};
use crate::scheduler::{EventDispatcher, PendingRequest};
use crate::session::RequestChannel;

use super::command::CommandTracker;
use super::{Activity, ItemUpdate, Subscription, SubscriptionMode};

/// Per-subscription server-side state. Reset on every fresh session.
struct SubRecord {
    sub: Subscription,
    sub_id: Option<u64>,
    pending_add: Option<u64>,
    num_fields: Option<usize>,
    snapshot_pending: HashSet<u64>,
    values: HashMap<u64, Vec<Option<String>>>,
    command: Option<CommandTracker>,
}

impl SubRecord {
    fn new(sub: Subscription) -> Self {
        Self {
            sub,
            sub_id: None,
            pending_add: None,
            num_fields: None,
            snapshot_pending: HashSet::new(),
            values: HashMap::new(),
            command: None,
        }
    }

    fn reset_server_state(&mut self) {
        self.sub_id = None;
        self.pending_add = None;
        self.num_fields = None;
        self.snapshot_pending.clear();
        self.values.clear();
        self.command = None;
    }
}

/// Maintains client-side subscriptions and reconciles them with the server.
pub(crate) struct SubscriptionManager {
    records: Vec<SubRecord>,
    next_sub_id: u64,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::new(),
            next_sub_id: 1,
        }
    }

    /// Register a subscription; sends the subscribe request right away when
    /// a session is receiving.
    pub(crate) fn register(
        &mut self,
        sub: Subscription,
        chan: Option<&mut RequestChannel<'_>>,
    ) {
        let mut record = SubRecord::new(sub.clone());
        match chan {
            Some(chan) => {
                send_add(&mut record, &mut self.next_sub_id, chan);
                sub.set_activity(Activity::Subscribing);
            }
            None => sub.set_activity(Activity::Paused),
        }
        self.records.push(record);
    }

    /// Deactivate a subscription and, when one is held, release its server
    /// id.
    pub(crate) fn deactivate(
        &mut self,
        sub: &Subscription,
        chan: Option<&mut RequestChannel<'_>>,
        dispatcher: &EventDispatcher,
    ) {
        let Some(index) = self.records.iter().position(|r| r.sub.same_as(sub)) else {
            return;
        };
        let record = self.records.remove(index);
        if let (Some(sub_id), Some(chan)) = (record.sub_id, chan) {
            chan.send_control(
                ControlOp::Delete { sub_id },
                PendingRequest::SubscriptionDelete { sub_id },
            );
        }
        let was_subscribed = record.sub.activity() == Activity::Subscribed;
        record.sub.set_activity(Activity::Inactive);
        if was_subscribed {
            dispatch_to(&record.sub, dispatcher, |l| l.on_unsubscription());
        }
    }

    /// A session became receiving.
    ///
    /// On a fresh session every subscription is re-issued under a fresh id;
    /// on a recovered session the server kept its state and nothing is sent.
    pub(crate) fn on_session_start(&mut self, recovered: bool, chan: &mut RequestChannel<'_>) {
        for record in &mut self.records {
            if recovered {
                // The server kept its state: re-issue only what it has never
                // seen (registered while no session was receiving).
                if record.sub_id.is_some() {
                    record.sub.set_activity(Activity::Subscribed);
                    continue;
                }
            } else {
                record.reset_server_state();
            }
            send_add(record, &mut self.next_sub_id, chan);
            record.sub.set_activity(Activity::Subscribing);
        }
        if !recovered && !self.records.is_empty() {
            tracing::debug!(count = self.records.len(), "re-issued subscriptions");
        }
    }

    /// The carrying session went away; subscriptions pause until the next
    /// one.
    pub(crate) fn on_session_close(&mut self) {
        for record in &mut self.records {
            record.pending_add = None;
            if record.sub.activity() != Activity::Inactive {
                record.sub.set_activity(Activity::Paused);
            }
        }
    }

    /// Route one subscription-related notification. Returns `false` when the
    /// notification does not belong to this manager.
    pub(crate) fn on_notification(
        &mut self,
        notification: &Notification,
        dispatcher: &EventDispatcher,
    ) -> bool {
        match notification {
            Notification::SubOk {
                sub_id,
                num_items,
                num_fields,
            } => {
                self.on_subscribed(*sub_id, *num_items, *num_fields, None, dispatcher);
                true
            }
            Notification::SubCmd {
                sub_id,
                num_items,
                num_fields,
                key_pos,
                command_pos,
            } => {
                self.on_subscribed(
                    *sub_id,
                    *num_items,
                    *num_fields,
                    Some(CommandTracker::new(*key_pos, *command_pos)),
                    dispatcher,
                );
                true
            }
            Notification::Unsub { sub_id } => {
                self.on_unsub(*sub_id, dispatcher);
                true
            }
            Notification::Update {
                sub_id,
                item,
                fields,
            } => {
                self.on_update(*sub_id, *item, fields, dispatcher);
                true
            }
            Notification::EndOfSnapshot { sub_id, item } => {
                if let Some(record) = self.record_mut(*sub_id) {
                    record.snapshot_pending.remove(item);
                    let item = *item;
                    let name = record.sub.items().name_at(item).map(str::to_string);
                    dispatch_to(&record.sub, dispatcher, move |l| {
                        l.on_end_of_snapshot(item, name.as_deref());
                    });
                }
                true
            }
            Notification::ClearSnapshot { sub_id, item } => {
                if let Some(record) = self.record_mut(*sub_id) {
                    record.values.remove(item);
                    if let Some(tracker) = record.command.as_mut() {
                        tracker.clear_item(*item);
                    }
                    let item = *item;
                    let name = record.sub.items().name_at(item).map(str::to_string);
                    dispatch_to(&record.sub, dispatcher, move |l| {
                        l.on_clear_snapshot(item, name.as_deref());
                    });
                }
                true
            }
            Notification::Overflow { sub_id, item, lost } => {
                if let Some(record) = self.record_mut(*sub_id) {
                    let (item, lost) = (*item, *lost);
                    dispatch_to(&record.sub, dispatcher, move |l| {
                        l.on_item_lost_updates(item, lost);
                    });
                }
                true
            }
            Notification::Configuration {
                sub_id,
                max_frequency,
                ..
            } => {
                if let Some(record) = self.record_mut(*sub_id) {
                    let frequency = *max_frequency;
                    dispatch_to(&record.sub, dispatcher, move |l| {
                        l.on_real_max_frequency(frequency);
                    });
                }
                true
            }
            _ => false,
        }
    }

    /// A control request of ours was accepted.
    pub(crate) fn on_reqok(&mut self, req_id: u64) {
        for record in &mut self.records {
            if record.pending_add == Some(req_id) {
                record.pending_add = None;
            }
        }
    }

    /// A control request of ours was refused. Returns `true` when the
    /// request belonged to a subscription, which is then treated as a
    /// subscription failure and never re-sent.
    pub(crate) fn on_reqerr(
        &mut self,
        req_id: u64,
        code: u32,
        message: &str,
        dispatcher: &EventDispatcher,
    ) -> bool {
        let Some(index) = self
            .records
            .iter()
            .position(|r| r.pending_add == Some(req_id))
        else {
            return false;
        };
        let record = self.records.remove(index);
        record.sub.set_activity(Activity::Inactive);
        record.sub.mark_unregistered();
        let message = message.to_string();
        dispatch_to(&record.sub, dispatcher, move |l| {
            l.on_subscription_error(code, &message);
        });
        true
    }

    fn on_subscribed(
        &mut self,
        sub_id: u64,
        num_items: u64,
        num_fields: u64,
        tracker: Option<CommandTracker>,
        dispatcher: &EventDispatcher,
    ) {
        let Some(record) = self.record_mut(sub_id) else {
            tracing::debug!(sub_id, "SUBOK for unknown subscription, ignored");
            return;
        };
        record.num_fields = usize::try_from(num_fields).ok();
        record.command = tracker;
        if record.sub.snapshot_requested() {
            record.snapshot_pending = (1..=num_items).collect();
        }
        record.sub.set_activity(Activity::Subscribed);
        dispatch_to(&record.sub, dispatcher, |l| l.on_subscription());
    }

    fn on_unsub(&mut self, sub_id: u64, dispatcher: &EventDispatcher) {
        let Some(record) = self.record_mut(sub_id) else {
            // Likely a subscription removed before SUBOK arrived.
            tracing::debug!(sub_id, "UNSUB for unknown subscription, ignored");
            return;
        };
        record.reset_server_state();
        record.sub.set_activity(Activity::Paused);
        dispatch_to(&record.sub, dispatcher, |l| l.on_unsubscription());
    }

    fn on_update(
        &mut self,
        sub_id: u64,
        item: u64,
        fields: &[FieldValue],
        dispatcher: &EventDispatcher,
    ) {
        let Some(record) = self.record_mut(sub_id) else {
            tracing::trace!(sub_id, "update for unknown subscription, ignored");
            return;
        };

        // Trailing unchanged fields may be omitted on the wire.
        let width = record.num_fields.unwrap_or(fields.len()).max(fields.len());
        let mut padded;
        let fields = if fields.len() < width {
            padded = fields.to_vec();
            padded.resize(width, FieldValue::Unchanged);
            &padded[..]
        } else {
            fields
        };

        let snapshot = record.snapshot_pending.contains(&item);
        let (values, changed, key, command) = if record.sub.mode() == SubscriptionMode::Command {
            let Some(tracker) = record.command.as_mut() else {
                tracing::debug!(sub_id, "update before SUBCMD, ignored");
                return;
            };
            let Some(update) = tracker.apply(item, fields) else {
                tracing::debug!(sub_id, item, "command update without key, ignored");
                return;
            };
            (
                update.values,
                update.changed,
                Some(update.key),
                Some(update.command),
            )
        } else {
            let previous = record.values.get(&item);
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
            record.values.insert(item, values.clone());
            (values, changed, None, None)
        };

        let update = ItemUpdate {
            item_pos: item,
            item_name: record.sub.items().name_at(item).map(str::to_string),
            field_names: record.sub.fields().names().map(<[String]>::to_vec),
            values,
            changed,
            snapshot,
            key,
            command,
        };
        let listeners = record.sub.listeners_snapshot();
        dispatcher.dispatch(move || {
            for listener in &listeners {
                listener.on_item_update(&update);
            }
        });
    }

    fn record_mut(&mut self, sub_id: u64) -> Option<&mut SubRecord> {
        self.records.iter_mut().find(|r| r.sub_id == Some(sub_id))
    }
}

fn send_add(record: &mut SubRecord, next_sub_id: &mut u64, chan: &mut RequestChannel<'_>) {
    let sub_id = *next_sub_id;
    *next_sub_id += 1;
    record.sub_id = Some(sub_id);
    let req_id = chan.send_control(
        ControlOp::Add {
            sub_id,
            mode: record.sub.mode(),
            group: record.sub.items().wire_value(),
            schema: record.sub.fields().wire_value(),
            snapshot: record.sub.snapshot_requested(),
            max_frequency: record.sub.requested_max_frequency(),
            buffer_size: record.sub.requested_buffer_size(),
        },
        PendingRequest::SubscriptionAdd { sub_id },
    );
    record.pending_add = Some(req_id);
}

fn dispatch_to(
    sub: &Subscription,
    dispatcher: &EventDispatcher,
    f: impl Fn(&dyn crate::client::listener::SubscriptionListener) + Send + 'static,
) {
    let listeners = sub.listeners_snapshot();
    dispatcher.dispatch(move || {
        for listener in &listeners {
            f(listener.as_ref());
        }
    });
}
