//! Cache key computation
//!
//! Every hashed structure is serialized to JSON with sorted collections and
//! digested with SHA-256, so equal inputs always produce equal keys.

pub mod file;
pub mod global;
pub mod task;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::HashError;

pub use file::{expand_outputs, hash_dot_env, hash_file, hash_globs, hash_package_files};
pub use global::{
    calculate_global_hash, get_global_hash_inputs, GlobalHashInputs, GlobalHashSummary,
};
pub use task::{TaskHashInputs, TaskHashTracker};

/// SHA-256 of the JSON encoding of `value`
pub fn hash_of<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
