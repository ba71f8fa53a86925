//! Error kinds surfaced by the engine.

/// A reason an engine operation could not be completed.
///
/// Lock contention is deliberately absent: a contended target blocks the
/// caller until the owning transaction finishes, it never surfaces as an
/// error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Bad root directory, invalid FAT16 short name, or an over-long path.
	#[error("invalid name: {0}")]
	InvalidName(String),

	/// Parent directory absent, path is not a directory, or a target is
	/// missing for an operation that requires it.
	#[error("missing prerequisite: {0}")]
	MissingPrerequisite(String),

	/// A staged temp file could not be set up or written.
	#[error("staging failed: {0}")]
	Staging(String),

	/// The `.txn` → `.cmt` descriptor rename failed. The transaction was
	/// discarded safely; no target was touched.
	#[error("commit point rename failed for {0}")]
	CommitPoint(String),

	/// A filesystem operation failed *after* the commit point. The error
	/// hook has fired and the work directory will be resumed by the next
	/// [`fsck`](crate::CardStore::open).
	#[error("apply failed after commit point: {0}")]
	PostCommitApply(String),

	/// Refused to save a typed document whose serial version is older than
	/// the version it was deserialized from.
	#[error("refusing to save v{serial} document over deserialized v{deserialized}")]
	VersionRefused { serial: u16, deserialized: u16 },

	/// An index key was absent for an operation that requires it.
	#[error("key not found: {0}")]
	NotFound(String),

	/// An index key (or file) already exists where it must not.
	#[error("already exists: {0}")]
	AlreadyExists(String),

	/// Startup recovery could not complete; no new transactions are
	/// accepted until it does.
	#[error("filesystem check failed: {0}")]
	Fsck(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
