//! Multi-version data model.
//!
//! Every write adds a [`VersionRecord`] under a [`VersionedKey`]; the
//! [`VersionIndex`] answers floor/ceiling lookups over those keys and the
//! [`ReadMarkerSet`] remembers which transactions already read a key. The
//! [`MvccStore`] combines them into the visibility and conflict rules.

pub mod index;
pub mod markers;
pub mod store;
pub mod version;

pub use index::VersionIndex;
pub use markers::ReadMarkerSet;
pub use store::{FutureReadConflict, MvccStore, Resolution};
pub use version::{Payload, VersionRecord};
