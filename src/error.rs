use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the driver and tag store.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy exposed to callers of this crate.
///
/// Every public operation returns one of these variants rather than an
/// opaque boxed error, so a caller can match `NotFound` vs `AlreadyExists`
/// vs `Conflict` the way the external interface table promises.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel lacks overlay support, or is older than the minimum
    /// supported version. Only ever returned from `Init`.
    #[error("overlay filesystem not supported: {0}")]
    NotSupported(String),

    /// A layer id has no `layers/<id>` chain file.
    #[error("layer not found: {0}")]
    NotFound(String),

    /// A tag store reference has no binding.
    #[error("reference does not exist: {0}")]
    DoesNotExist(String),

    /// `Create` was called with an id that already has on-disk state.
    #[error("layer already exists: {0}")]
    AlreadyExists(String),

    /// Tag store `Add` with `force = false` would overwrite a distinct id.
    ///
    /// The message always begins with `Conflict:`, matching the contract
    /// callers are allowed to depend on.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The overlay mount syscall failed.
    #[error("failed to mount overlay at {target}: {source}")]
    MountFailed {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// The constructed `lowerdir=...` options string would exceed the
    /// kernel's page-sized mount options buffer. See the "known bound" in
    /// the design notes: this driver does not split lower layers across
    /// chained mounts, it fails loudly instead.
    #[error("overlay options string for {id} is {len} bytes, exceeding the {max}-byte limit")]
    OptionsTooLong { id: String, len: usize, max: usize },

    /// Any other filesystem error, with the underlying cause preserved.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed tag-store JSON on disk.
    #[error("malformed tag store file: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound(id.into())
    }

    pub fn already_exists(id: impl Into<String>) -> Self {
        Error::AlreadyExists(id.into())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}
