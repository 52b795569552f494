use engage_core::AggregateId;

/// Intent addressed to one aggregate stream.
///
/// Tenancy is not part of the command: the dispatcher attaches the tenant from
/// the request context when it persists the resulting events.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
