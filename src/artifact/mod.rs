//! Versioned artifact storage.
//!
//! Every completed generation and every manual edit becomes a new immutable
//! [`ArtifactVersion`] in its section's history. A per-section cursor picks
//! which version is shown; moving it never changes the history.
//!
//! # Example
//!
//! ```rust
//! use artifact_forge::artifact::{ArtifactSection, ArtifactVersionStore};
//!
//! let mut store = ArtifactVersionStore::new();
//! store.append(ArtifactSection::Research, "first draft");
//! store.append(ArtifactSection::Research, "second draft");
//! store.cycle(ArtifactSection::Research, -1);
//!
//! assert_eq!(store.current(ArtifactSection::Research).unwrap().content, "first draft");
//! assert_eq!(store.version_label(ArtifactSection::Research), "1/2");
//! ```

mod store;

pub use store::{ArtifactSection, ArtifactVersion, ArtifactVersionStore};
