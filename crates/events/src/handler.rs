/// Decide then evolve: run `handle` and apply the resulting events in place.
///
/// Persistence and publication are the caller's job (see the catalog service).
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: forgelist_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
