use chrono::{DateTime, Utc};

/// A fact recorded in an aggregate stream.
///
/// `event_type` names are dotted and stable (`"invoicing.invoice.issued"`); they are
/// persisted next to the payload and must never be renamed once written.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;

    /// Payload schema version.
    fn version(&self) -> u32;

    /// Business time of the fact.
    fn occurred_at(&self) -> DateTime<Utc>;
}
