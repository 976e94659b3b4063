//! Entity trait: identity that survives state changes.

/// Something that is the same thing across edits because its id is.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
