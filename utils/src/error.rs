#[doc(hidden)]
pub trait Ext<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

#[doc(hidden)]
pub trait ExtOpaque<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T> {
		match self {
			Some(_) => {}
			None => f(),
		}

		self
	}
}

pub type Result<T = (), E = ()> = result::Result<T, E>;

use core::result;

pub use Ext as _;

/// The kinds of failure the transport surfaces at its API boundary.
///
/// This is distinct from the inner `Result<T, E = ()>` above, which stays in
/// use for protocol-internal frame parsing that is dropped and logged, never
/// surfaced to an application.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	#[error("success")]
	Success,
	#[error("failed")]
	Failed,
	#[error("broken pipe")]
	BrokenPipe,
	#[error("no buffer space")]
	NoBufferSpace,
	#[error("timed out")]
	TimedOut,
	#[error("not connected")]
	NotConnected,
	#[error("already connected")]
	AlreadyConnected,
	#[error("bad file descriptor")]
	BadFileDescriptor,
	#[error("invalid argument")]
	InvalidArgument,
	#[error("resource busy")]
	ResourceBusy,
	#[error("operation canceled")]
	OperationCanceled,
	#[error("operation in progress")]
	OperationInProgress,
	#[error("connection reset")]
	ConnectionReset,
	#[error("network unreachable")]
	NetworkUnreachable,
}

impl ErrorKind {
	/// Attach a detail string, producing a full [Error].
	pub fn detail(self, detail: impl Into<String>) -> Error {
		Error { kind: self, detail: detail.into() }
	}
}

/// A typed error with a free-form detail string, used at the transport's
/// public API boundary. The detail is for logs, not for programmatic
/// matching — match on `kind` instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct Error {
	pub kind: ErrorKind,
	pub detail: String,
}

impl Error {
	pub fn new(kind: ErrorKind) -> Self {
		Self { kind, detail: String::new() }
	}
}

impl From<ErrorKind> for Error {
	fn from(kind: ErrorKind) -> Self {
		Self::new(kind)
	}
}

/// The result type used at the transport's public API boundary.
pub type RudpResult<T = ()> = result::Result<T, Error>;
