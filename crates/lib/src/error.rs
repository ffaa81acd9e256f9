//! Errors raised by the boot entry codec and its reconciliation.

use camino::Utf8PathBuf;

use crate::entry::EntryId;

/// Errors from parsing, editing and committing `custom.cfg` entries.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A line mentions `iso_boot` or `amorce_iso` but matches neither
    /// entry form.
    #[error("line {line}: malformed boot entry ({reason}): {text}")]
    MalformedLine {
        /// 1-based line number
        line: usize,
        /// The offending line, without its terminator
        text: String,
        /// What did not match
        reason: String,
    },
    /// No mount point could be determined for a path.
    #[error("cannot resolve mount point of {path}: {reason}")]
    UnresolvedMount {
        /// The path being resolved
        path: Utf8PathBuf,
        /// Underlying cause
        reason: String,
    },
    /// Reading, writing or linking a file failed.
    #[error("{context}")]
    FilesystemIo {
        /// What we were doing
        context: String,
        /// The I/O failure
        #[source]
        source: std::io::Error,
    },
    /// The entry does not belong to this store.
    #[error("entry {0} not found")]
    NotFound(EntryId),
    /// A whitespace-free alias could not be established.
    #[error("cannot alias {target} as {alias}: {reason}")]
    AliasConflict {
        /// The alias that was to be created
        alias: Utf8PathBuf,
        /// The file being aliased
        target: Utf8PathBuf,
        /// Why it failed
        reason: String,
    },
    /// A value cannot be written to the line-oriented grammar.
    #[error("{field} cannot be written to custom.cfg: {value:?}")]
    Unrepresentable {
        /// Which field
        field: &'static str,
        /// The rejected value
        value: String,
    },
    /// The configuration directory cannot host permanent entries.
    #[error("permanent entries are not supported for {0}")]
    PermanenceUnsupported(Utf8PathBuf),
}

impl ConfigError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::FilesystemIo {
            context: context.into(),
            source,
        }
    }
}

/// Extension trait to attach a [`ConfigError::FilesystemIo`] context to I/O results.
pub(crate) trait IoResultExt<T> {
    fn io_context<F, S>(self, f: F) -> Result<T, ConfigError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T, ConfigError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| ConfigError::io(f(), e))
    }
}
