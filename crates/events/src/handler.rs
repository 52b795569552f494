use engage_core::Aggregate;

/// Decide and evolve in one step, without persistence.
///
/// On error the aggregate is left untouched. Used by aggregate unit tests and by
/// code that needs the post-command state without going through the dispatcher.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = aggregate.handle(command)?;
    for event in &events {
        aggregate.apply(event);
    }
    Ok(events)
}
