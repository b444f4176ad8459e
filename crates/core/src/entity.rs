//! Entity trait: identity + continuity across state changes.

/// Something that keeps its identity while its attributes change
/// (a sync event moving through its statuses, a platform link being re-confirmed).
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
