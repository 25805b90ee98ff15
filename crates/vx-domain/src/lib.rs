//! Data model for vx: user-authored version specs and resolver-produced locks.
//!
//! A [`VersionSpec`] describes a pinnable configuration of the engine, its
//! extensions, model artifacts, and extra Python packages. The resolver turns
//! it into a [`ResolvedLock`] in which every floating ref has been replaced by
//! a concrete commit. Both serialize as canonical JSON (sorted keys, 2-space
//! indent, trailing newline) so repeated resolution is byte-identical.

mod canon;
mod checksum;
mod lock;
mod paths;
mod spec;

pub use canon::{canonical_json_bytes, sort_json_value};
pub use checksum::{Checksum, ChecksumAlgo};
pub use lock::{
    load_lock, lock_path, write_lock, LockedModel, LockedSource, ResolvedLock, LOCK_EXTENSION,
};
pub use paths::{safe_relative, PathSafetyError};
pub use spec::{
    load_spec, spec_digest, spec_path_for, write_spec, looks_like_commit, normalize_commit,
    ModelEntry, SourceEntry, SpecError, SpecOptions, VersionSpec, SCHEMA_VERSION,
};
