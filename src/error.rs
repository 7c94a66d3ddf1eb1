use std::path::PathBuf;

use thiserror::Error;

/// Fatal error conditions for an image pipeline.
///
/// Per-path attribute failures are deliberately *not* represented here: they
/// are collected as warnings in [`crate::reconcile::Reconciliation`] and
/// never abort a run.
#[derive(Error, Debug)]
pub enum RomforgeError {
    #[error("{0:?} not found")]
    NotFound(PathBuf),

    #[error("unable to mount image {0:?}, even after raw conversion")]
    UnmountableImage(PathBuf),

    #[error("filesystem in {image:?} is beyond repair: {detail}")]
    CorruptFilesystem { image: PathBuf, detail: String },

    #[error("content does not fit: {required} {unit} required, {available} {unit} available")]
    CapacityExceeded {
        required: u64,
        available: u64,
        unit: &'static str,
    },

    #[error("{tool} failed: {detail}")]
    BuilderFailure { tool: String, detail: String },

    #[error("malformed metadata in {file:?} line {line}: {detail}")]
    Metadata {
        file: PathBuf,
        line: usize,
        detail: String,
    },
}
