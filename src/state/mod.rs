//! State tree operations.
//!
//! Every write produces a new root that shares all untouched branches
//! with the previous one, so change detection downstream can rely on
//! identity for the common case.

mod draft;
mod operations;
mod path;

pub use draft::Draft;
pub use operations::{apply_patch, Patch};
pub use path::{build_minimal_diff, child, get_at_path, set_at_path, Path, PathSegment};
