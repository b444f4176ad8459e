//! Value object trait: equality by value, not identity.

/// Marker trait for immutable values compared by their attributes
/// (e.g. [`crate::Price`]). To "change" one, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
