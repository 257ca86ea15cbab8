//! Subscriptions.
//!
//! A [`Subscription`] is a client-side declaration of interest in one or
//! more server items with a given mode and field set. It is inert until
//! passed to [`PushClient::subscribe`](crate::client::PushClient::subscribe),
//! active until unsubscribed, and survives session turnover: the manager
//! re-issues it with a fresh subscription id on every new session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::client::listener::SubscriptionListener;
use crate::error::ClientError;

pub(crate) mod command;
pub(crate) mod manager;

// =============================================================================
// Mode
// =============================================================================

/// Delivery semantics of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    /// Per-field merging; unchanged fields travel as deltas.
    Merge,
    /// Every update delivered, in order, no merging.
    Distinct,
    /// Like `Distinct` but unfiltered: no frequency limits applied.
    Raw,
    /// Two-level structure: rows keyed within each item, maintained by
    /// ADD/UPDATE/DELETE commands.
    Command,
}

impl SubscriptionMode {
    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "MERGE",
            Self::Distinct => "DISTINCT",
            Self::Raw => "RAW",
            Self::Command => "COMMAND",
        }
    }

    /// Parse the wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MERGE" => Some(Self::Merge),
            "DISTINCT" => Some(Self::Distinct),
            "RAW" => Some(Self::Raw),
            "COMMAND" => Some(Self::Command),
            _ => None,
        }
    }
}

// =============================================================================
// Item and field specifications
// =============================================================================

/// Items addressed by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ItemSpec {
    /// A server-side item group name.
    Group(String),
    /// An explicit item list; positions on the wire are 1-based indexes
    /// into it.
    List(Vec<String>),
}

impl ItemSpec {
    pub(crate) fn wire_value(&self) -> String {
        match self {
            Self::Group(group) => group.clone(),
            Self::List(items) => items.join(" "),
        }
    }

    pub(crate) fn name_at(&self, pos: u64) -> Option<&str> {
        match self {
            Self::Group(_) => None,
            Self::List(items) => {
                let index = usize::try_from(pos.checked_sub(1)?).ok()?;
                items.get(index).map(String::as_str)
            }
        }
    }
}

/// Fields addressed by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldSpec {
    /// A server-side field schema name.
    Schema(String),
    /// An explicit field list; update slots map to it positionally.
    List(Vec<String>),
}

impl FieldSpec {
    pub(crate) fn wire_value(&self) -> String {
        match self {
            Self::Schema(schema) => schema.clone(),
            Self::List(fields) => fields.join(" "),
        }
    }

    pub(crate) fn names(&self) -> Option<&[String]> {
        match self {
            Self::Schema(_) => None,
            Self::List(fields) => Some(fields),
        }
    }
}

// =============================================================================
// Activity
// =============================================================================

/// Client-side lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    /// Not registered with the manager.
    Inactive,
    /// Registered; subscribe request outstanding or queued.
    Subscribing,
    /// Active on the server.
    Subscribed,
    /// Registered but no session currently carries it.
    Paused,
}

// =============================================================================
// Subscription
// =============================================================================

/// Requested tuning, mutable only while inactive.
#[derive(Debug, Clone)]
struct Settings {
    snapshot: bool,
    max_frequency: Option<f64>,
    buffer_size: Option<u64>,
}

struct Inner {
    mode: SubscriptionMode,
    items: ItemSpec,
    fields: FieldSpec,
    settings: Mutex<Settings>,
    listeners: RwLock<Vec<Arc<dyn SubscriptionListener>>>,
    activity: Mutex<Activity>,
    registered: AtomicBool,
}

/// A declaration of interest in server items.
///
/// Cheap to clone; clones share identity, and identity is what
/// [`PushClient::unsubscribe`](crate::client::PushClient::unsubscribe)
/// matches on.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    /// Subscription addressing a server-defined item group and field schema.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if either name is empty.
    pub fn with_item_group(
        mode: SubscriptionMode,
        group: &str,
        schema: &str,
    ) -> Result<Self, ClientError> {
        if group.is_empty() {
            return Err(ClientError::Argument("empty item group".to_string()));
        }
        if schema.is_empty() {
            return Err(ClientError::Argument("empty field schema".to_string()));
        }
        Ok(Self::build(
            mode,
            ItemSpec::Group(group.to_string()),
            FieldSpec::Schema(schema.to_string()),
        ))
    }

    /// Subscription addressing explicit item and field lists.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if a list is empty, an entry
    /// contains spaces, or a `COMMAND` subscription omits the `key` or
    /// `command` field.
    pub fn with_item_list(
        mode: SubscriptionMode,
        items: &[&str],
        fields: &[&str],
    ) -> Result<Self, ClientError> {
        validate_names("item", items)?;
        validate_names("field", fields)?;
        if mode == SubscriptionMode::Command
            && (!fields.contains(&"key") || !fields.contains(&"command"))
        {
            return Err(ClientError::Argument(
                "COMMAND subscriptions require the key and command fields".to_string(),
            ));
        }
        Ok(Self::build(
            mode,
            ItemSpec::List(items.iter().map(|s| (*s).to_string()).collect()),
            FieldSpec::List(fields.iter().map(|s| (*s).to_string()).collect()),
        ))
    }

    fn build(mode: SubscriptionMode, items: ItemSpec, fields: FieldSpec) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                items,
                fields,
                settings: Mutex::new(Settings {
                    snapshot: mode != SubscriptionMode::Raw,
                    max_frequency: None,
                    buffer_size: None,
                }),
                listeners: RwLock::new(Vec::new()),
                activity: Mutex::new(Activity::Inactive),
                registered: AtomicBool::new(false),
            }),
        }
    }

    /// The subscription mode.
    #[must_use]
    pub fn mode(&self) -> SubscriptionMode {
        self.inner.mode
    }

    /// Whether the subscription is registered with a client.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// Whether the subscription is currently active on the server.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        *self.inner.activity.lock() == Activity::Subscribed
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Remove a previously registered listener (matched by identity).
    pub fn remove_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        self.inner
            .listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Request (or suppress) an initial snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Usage`] while the subscription is active.
    pub fn set_requested_snapshot(&self, snapshot: bool) -> Result<(), ClientError> {
        self.ensure_inactive("requested snapshot")?;
        self.inner.settings.lock().snapshot = snapshot;
        Ok(())
    }

    /// Cap the update frequency, in updates per second; `None` leaves the
    /// limit to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Usage`] while the subscription is active, or
    /// [`ClientError::Argument`] for a non-positive limit.
    pub fn set_requested_max_frequency(&self, frequency: Option<f64>) -> Result<(), ClientError> {
        if let Some(f) = frequency {
            if f.is_nan() || f <= 0.0 {
                return Err(ClientError::Argument(
                    "max frequency must be positive".to_string(),
                ));
            }
        }
        self.ensure_inactive("requested max frequency")?;
        self.inner.settings.lock().max_frequency = frequency;
        Ok(())
    }

    /// Size the server-side buffer; `None` leaves it to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Usage`] while the subscription is active.
    pub fn set_requested_buffer_size(&self, size: Option<u64>) -> Result<(), ClientError> {
        self.ensure_inactive("requested buffer size")?;
        self.inner.settings.lock().buffer_size = size;
        Ok(())
    }

    fn ensure_inactive(&self, what: &str) -> Result<(), ClientError> {
        if self.is_active() {
            return Err(ClientError::Usage(format!(
                "cannot change {what} while the subscription is active"
            )));
        }
        Ok(())
    }

    // -- crate-internal accessors -------------------------------------------

    pub(crate) fn mark_registered(&self) -> bool {
        !self.inner.registered.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_unregistered(&self) -> bool {
        self.inner.registered.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_activity(&self, activity: Activity) {
        *self.inner.activity.lock() = activity;
    }

    pub(crate) fn activity(&self) -> Activity {
        *self.inner.activity.lock()
    }

    pub(crate) fn items(&self) -> &ItemSpec {
        &self.inner.items
    }

    pub(crate) fn fields(&self) -> &FieldSpec {
        &self.inner.fields
    }

    pub(crate) fn snapshot_requested(&self) -> bool {
        self.inner.settings.lock().snapshot
    }

    pub(crate) fn requested_max_frequency(&self) -> Option<f64> {
        self.inner.settings.lock().max_frequency
    }

    pub(crate) fn requested_buffer_size(&self) -> Option<u64> {
        self.inner.settings.lock().buffer_size
    }

    pub(crate) fn listeners_snapshot(&self) -> Vec<Arc<dyn SubscriptionListener>> {
        self.inner.listeners.read().clone()
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("mode", &self.inner.mode)
            .field("items", &self.inner.items)
            .field("fields", &self.inner.fields)
            .field("activity", &*self.inner.activity.lock())
            .finish_non_exhaustive()
    }
}

fn validate_names(what: &str, names: &[&str]) -> Result<(), ClientError> {
    if names.is_empty() {
        return Err(ClientError::Argument(format!("empty {what} list")));
    }
    for name in names {
        if name.is_empty() || name.contains(' ') {
            return Err(ClientError::Argument(format!(
                "invalid {what} name: {name:?}"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Item updates
// =============================================================================

/// Row maintenance command of a `COMMAND`-mode update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCommand {
    /// A new row appeared under the key.
    Add,
    /// An existing row changed.
    Update,
    /// The row under the key disappeared.
    Delete,
}

impl UpdateCommand {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "ADD" => Some(Self::Add),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One update delivered to
/// [`SubscriptionListener::on_item_update`](crate::client::SubscriptionListener::on_item_update).
///
/// Field values are fully resolved: "unchanged" slots already carry the
/// previous value of the item (or of the keyed row in `COMMAND` mode).
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub(crate) item_pos: u64,
    pub(crate) item_name: Option<String>,
    pub(crate) field_names: Option<Vec<String>>,
    pub(crate) values: Vec<Option<String>>,
    pub(crate) changed: Vec<bool>,
    pub(crate) snapshot: bool,
    pub(crate) key: Option<String>,
    pub(crate) command: Option<UpdateCommand>,
}

impl ItemUpdate {
    /// 1-based position of the item within the subscription.
    #[must_use]
    pub fn item_pos(&self) -> u64 {
        self.item_pos
    }

    /// Item name, when the subscription was built from an item list.
    #[must_use]
    pub fn item_name(&self) -> Option<&str> {
        self.item_name.as_deref()
    }

    /// Whether this update carries snapshot (rather than live) state.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    /// Number of fields carried.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.values.len()
    }

    /// Value of the field at a 1-based position; `None` when null.
    #[must_use]
    pub fn value(&self, pos: usize) -> Option<&str> {
        pos.checked_sub(1)
            .and_then(|index| self.values.get(index))
            .and_then(Option::as_deref)
    }

    /// Value of a field by name, when the subscription was built from a
    /// field list.
    #[must_use]
    pub fn value_by_name(&self, name: &str) -> Option<&str> {
        let names = self.field_names.as_ref()?;
        let index = names.iter().position(|n| n == name)?;
        self.values.get(index).and_then(Option::as_deref)
    }

    /// Whether the field at a 1-based position changed with this update.
    #[must_use]
    pub fn is_changed(&self, pos: usize) -> bool {
        pos.checked_sub(1)
            .and_then(|index| self.changed.get(index))
            .copied()
            .unwrap_or(false)
    }

    /// Row key, for `COMMAND`-mode subscriptions.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Row maintenance command, for `COMMAND`-mode subscriptions.
    #[must_use]
    pub fn command(&self) -> Option<UpdateCommand> {
        self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_wire_names_round_trip() {
        for mode in [
            SubscriptionMode::Merge,
            SubscriptionMode::Distinct,
            SubscriptionMode::Raw,
            SubscriptionMode::Command,
        ] {
            assert_eq!(SubscriptionMode::parse(mode.as_str()), Some(mode));
        }
        assert!(SubscriptionMode::parse("BROADCAST").is_none());
    }

    #[test]
    fn item_list_validation() {
        assert!(Subscription::with_item_list(SubscriptionMode::Merge, &[], &["bid"]).is_err());
        assert!(
            Subscription::with_item_list(SubscriptionMode::Merge, &["item 1"], &["bid"]).is_err()
        );
        assert!(
            Subscription::with_item_list(SubscriptionMode::Merge, &["item1"], &["bid", "ask"])
                .is_ok()
        );
    }

    #[test]
    fn command_mode_requires_key_and_command_fields() {
        assert!(
            Subscription::with_item_list(SubscriptionMode::Command, &["book"], &["key", "qty"])
                .is_err()
        );
        assert!(
            Subscription::with_item_list(
                SubscriptionMode::Command,
                &["book"],
                &["key", "command", "qty"],
            )
            .is_ok()
        );
    }

    #[test]
    fn settings_frozen_while_registered() {
        let sub =
            Subscription::with_item_list(SubscriptionMode::Merge, &["item1"], &["bid"]).unwrap();
        sub.set_requested_snapshot(false).unwrap();
        assert!(sub.mark_registered());
        assert!(matches!(
            sub.set_requested_snapshot(true),
            Err(ClientError::Usage(_))
        ));
        assert!(sub.mark_unregistered());
        sub.set_requested_snapshot(true).unwrap();
    }

    #[test]
    fn raw_mode_defaults_to_no_snapshot() {
        let raw = Subscription::with_item_list(SubscriptionMode::Raw, &["i"], &["f"]).unwrap();
        assert!(!raw.snapshot_requested());
        let merge = Subscription::with_item_list(SubscriptionMode::Merge, &["i"], &["f"]).unwrap();
        assert!(merge.snapshot_requested());
    }

    #[test]
    fn item_update_accessors() {
        let update = ItemUpdate {
            item_pos: 2,
            item_name: Some("item2".to_string()),
            field_names: Some(vec!["bid".to_string(), "ask".to_string()]),
            values: vec![Some("1.5".to_string()), None],
            changed: vec![true, false],
            snapshot: true,
            key: None,
            command: None,
        };
        assert_eq!(update.value(1), Some("1.5"));
        assert_eq!(update.value(2), None);
        assert_eq!(update.value_by_name("bid"), Some("1.5"));
        assert!(update.is_changed(1));
        assert!(!update.is_changed(2));
        assert!(update.is_snapshot());
        assert_eq!(update.item_name(), Some("item2"));
    }

    #[test]
    fn clones_share_identity() {
        let sub = Subscription::with_item_list(SubscriptionMode::Merge, &["i"], &["f"]).unwrap();
        let clone = sub.clone();
        assert!(sub.same_as(&clone));
        let other = Subscription::with_item_list(SubscriptionMode::Merge, &["i"], &["f"]).unwrap();
        assert!(!sub.same_as(&other));
    }
}
