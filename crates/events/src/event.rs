use chrono::{DateTime, Utc};

/// A fact the ledger committed: a resource created or adjusted, a request
/// opened or moved, a donation registered or accepted.
///
/// Events are immutable and only ever appended. The inventory transaction log
/// is the durable record; events are notifications about it.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name, `<context>.<aggregate>.<fact>` (e.g. "inventory.resource.adjusted").
    fn event_type(&self) -> &'static str;

    /// Payload schema revision. Bump when a payload field changes meaning.
    fn schema_version(&self) -> u32 {
        1
    }

    /// Business time of the change.
    fn occurred_at(&self) -> DateTime<Utc>;
}
