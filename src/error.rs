use std::path::PathBuf;

use thiserror::Error;

use crate::sink::SinkError;

/// Fatal input errors. Any of these aborts the run before the first
/// classifier call and names the offending path, token or key.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("archive not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("malformed archive {}: {reason}", path.display())]
    MalformedArchive { path: PathBuf, reason: String },

    #[error("no emails_YYYY archive files found in {}", dir.display())]
    NoArchives { dir: PathBuf },

    #[error("invalid year selector token '{token}': {reason}")]
    InvalidYearToken { token: String, reason: String },

    #[error("invalid taxonomy {source_name}: {reason}")]
    Taxonomy { source_name: String, reason: String },

    #[error("duplicate taxonomy key '{key}' in {source_name}")]
    DuplicateTaxonomyKey { key: String, source_name: String },

    #[error("config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("{0}")]
    Relation(String),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),
}
