use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

/// A result alias that defaults to `Error` as the error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error.
#[derive(Clone, Debug, Error, serde::Deserialize, serde::Serialize)]
#[error("{message}")]
pub struct Error {
	/// The error's message.
	pub message: String,

	/// The category of failure, used to pick the exit status.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<Kind>,

	/// The optional location of where the error occurred.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub location: Option<Location>,

	/// An optional error that this error wraps.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source: Option<Arc<Error>>,

	/// A map of key/value pairs of context associated with the error.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub values: BTreeMap<String, String>,
}

/// The category of an error.
#[derive(
	Clone,
	Copy,
	Debug,
	PartialEq,
	Eq,
	derive_more::Display,
	serde::Deserialize,
	serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
	/// The caller passed a bad path or an unknown operation. Never retried.
	#[display("invalid argument")]
	InvalidArgument,

	/// A mount, an unmount, or the lease lock failed. May be retried.
	#[display("mount failure")]
	Mount,

	/// A precondition such as active mounts was not met.
	#[display("validation failure")]
	Validation,

	/// The staged script itself exited unsuccessfully.
	#[display("execution failure")]
	Execution,

	/// A worker request was malformed.
	#[display("protocol fault")]
	Protocol,

	/// The staged script ran past its deadline and was killed.
	#[display("timeout")]
	Timeout,
}

/// An error location.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Location {
	pub source: String,
	pub line: u32,
	pub column: u32,
}

pub struct Trace<'a>(&'a Error);

impl Error {
	/// Construct a [Trace] from an error, which can be used to display a helpful error trace.
	#[must_use]
	pub fn trace(&self) -> Trace<'_> {
		Trace(self)
	}

	/// Get the first kind found on this error or any of its sources.
	#[must_use]
	pub fn kind(&self) -> Option<Kind> {
		let mut error = self;
		loop {
			if let Some(kind) = error.kind {
				return Some(kind);
			}
			error = error.source.as_deref()?;
		}
	}

	/// Get a value recorded on this error or any of its sources.
	#[must_use]
	pub fn value(&self, name: &str) -> Option<&str> {
		let mut error = self;
		loop {
			if let Some(value) = error.values.get(name) {
				return Some(value);
			}
			error = error.source.as_deref()?;
		}
	}

	#[must_use]
	pub fn is(&self, kind: Kind) -> bool {
		self.kind() == Some(kind)
	}

	/// The process exit status for this error.
	#[must_use]
	pub fn exit_code(&self) -> u8 {
		self.kind().map_or(1, Kind::exit_code)
	}

	/// Iterate over this error and its sources, outermost first.
	pub fn chain(&self) -> impl Iterator<Item = &Error> {
		std::iter::successors(Some(self), |error| error.source.as_deref())
	}
}

impl Kind {
	#[must_use]
	pub fn exit_code(self) -> u8 {
		match self {
			Self::InvalidArgument => 2,
			Self::Mount => 3,
			Self::Execution => 4,
			Self::Validation => 5,
			Self::Protocol => 6,
			Self::Timeout => 124,
		}
	}

	#[must_use]
	pub fn from_exit_code(code: i32) -> Option<Self> {
		match code {
			2 => Some(Self::InvalidArgument),
			3 => Some(Self::Mount),
			4 => Some(Self::Execution),
			5 => Some(Self::Validation),
			6 => Some(Self::Protocol),
			124 => Some(Self::Timeout),
			_ => None,
		}
	}
}

impl<'a> From<&'a std::panic::Location<'a>> for Location {
	fn from(location: &'a std::panic::Location<'a>) -> Self {
		Self {
			source: location.file().to_owned(),
			line: location.line() - 1,
			column: location.column() - 1,
		}
	}
}

impl From<Box<dyn std::error::Error + Send + Sync + 'static>> for Error {
	fn from(value: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
		match value.downcast::<Error>() {
			Ok(error) => *error,
			Err(error) => Self {
				message: error.to_string(),
				kind: None,
				location: None,
				source: error.source().map(Into::into).map(Arc::new),
				values: BTreeMap::new(),
			},
		}
	}
}

impl From<&(dyn std::error::Error + 'static)> for Error {
	fn from(value: &(dyn std::error::Error + 'static)) -> Self {
		if let Some(error) = value.downcast_ref::<Error>() {
			return error.clone();
		}
		Self {
			message: value.to_string(),
			kind: None,
			location: None,
			source: value.source().map(Into::into).map(Arc::new),
			values: BTreeMap::new(),
		}
	}
}

impl std::fmt::Display for Trace<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut first = true;
		for error in self.0.chain() {
			if !first {
				writeln!(f)?;
			}
			first = false;
			write!(f, "-> {}", error.message)?;
			if let Some(kind) = error.kind {
				write!(f, " ({kind})")?;
			}
			if let Some(location) = &error.location {
				write!(f, " {location}")?;
			}
			for (name, value) in &error.values {
				writeln!(f)?;
				write!(f, "   {name} = {value}")?;
			}
		}
		Ok(())
	}
}

impl std::fmt::Display for Location {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}:{}", self.source, self.line + 1, self.column + 1)
	}
}

/// Generate an [Error].
///
/// Usage:
/// ```rust,ignore
/// error!("error message");
/// error!("error message with interpolation {}", 42);
///
/// let name = "value";
/// error!(%name, "error message with a named value (pretty printed)");
/// error!(?name, "error message with a named value (debug printed)");
/// error!(%path = path.display(), "error message with an expression value");
///
/// let error = std::io::Error::last_os_error();
/// error!(!error, "an error that wraps an existing error");
/// error!(source = error, "an error that wraps an existing error");
///
/// error!(kind = Kind::Validation, "an error with an exit category");
/// ```
#[macro_export]
macro_rules! error {
	({ $error:ident }, %$name:ident, $($arg:tt)*) => {
		$error.values.insert(stringify!($name).to_owned(), $name.to_string());
		$crate::error!({ $error }, $($arg)*)
	};
	({ $error:ident }, ?$name:ident, $($arg:tt)*) => {
		$error.values.insert(stringify!($name).to_owned(), format!("{:?}", $name));
		$crate::error!({ $error }, $($arg)*)
	};
	({ $error:ident }, %$name:ident = $value:expr, $($arg:tt)*) => {
		$error.values.insert(stringify!($name).to_owned(), $value.to_string());
		$crate::error!({ $error }, $($arg)*)
	};
	({ $error:ident }, ?$name:ident = $value:expr, $($arg:tt)*) => {
		$error.values.insert(stringify!($name).to_owned(), format!("{:?}", $value));
		$crate::error!({ $error }, $($arg)*)
	};
	({ $error:ident }, !$source:expr, $($arg:tt)*) => {
		$error.source.replace(std::sync::Arc::new({
			let source: Box<dyn std::error::Error + Send + Sync + 'static> = Box::new($source);
			source.into()
		}));
		$crate::error!({ $error }, $($arg)*)
	};
	({ $error:ident }, source = $source:expr, $($arg:tt)*) => {
		$error.source.replace(std::sync::Arc::new({
			let source: Box<dyn std::error::Error + Send + Sync + 'static> = Box::new($source);
			source.into()
		}));
		$crate::error!({ $error }, $($arg)*)
	};
	({ $error:ident }, kind = $kind:expr, $($arg:tt)*) => {
		$error.kind.replace($kind);
		$crate::error!({ $error }, $($arg)*)
	};
	({ $error:ident }, $($arg:tt)*) => {
		$error.message = format!($($arg)*);
	};
	($($arg:tt)*) => {{
		let mut __error = $crate::Error {
			message: String::new(),
			kind: None,
			location: Some($crate::Location {
				source: file!().to_owned(),
				line: line!() - 1,
				column: column!() - 1,
			}),
			source: None,
			values: std::collections::BTreeMap::new(),
		};
		$crate::error!({ __error }, $($arg)*);
		$crate::Error::from(__error)
	}};
}

#[cfg(test)]
mod tests {
	use crate::{Error, Kind, error};

	#[test]
	fn error_macro() {
		let foo = "foo";
		let bar = "bar";
		let error = error!(?foo, %bar, %baz = 42, "{} message", foo);
		assert_eq!(error.message, "foo message");
		assert_eq!(error.values["foo"], "\"foo\"");
		assert_eq!(error.values["bar"], "bar");
		assert_eq!(error.values["baz"], "42");
		let trace = error.trace().to_string();
		assert!(trace.starts_with("-> foo message packages/error/src/lib.rs:"));
		assert!(trace.contains("\n   bar = bar"));

		let source = std::io::Error::other("unexpected error");
		let error = error!(!source, "an error occurred");
		let trace = error.trace().to_string();
		assert!(trace.ends_with("\n-> unexpected error"));
	}

	#[test]
	fn kind_is_found_through_sources() {
		let inner = error!(kind = Kind::Mount, "failed to mount the proc filesystem");
		let outer = error!(!inner, "failed to acquire the lease");
		assert_eq!(outer.kind, None);
		assert_eq!(outer.kind(), Some(Kind::Mount));
		assert_eq!(outer.exit_code(), 3);
		assert!(outer.trace().to_string().contains("(mount failure)"));
	}

	#[test]
	fn uncategorized_errors_exit_with_one() {
		let error = error!("something went wrong");
		assert_eq!(error.kind(), None);
		assert_eq!(error.exit_code(), 1);
	}

	#[test]
	fn exit_codes_round_trip_through_kinds() {
		for kind in [
			Kind::InvalidArgument,
			Kind::Mount,
			Kind::Validation,
			Kind::Execution,
			Kind::Protocol,
			Kind::Timeout,
		] {
			let code = i32::from(kind.exit_code());
			assert_eq!(Kind::from_exit_code(code), Some(kind));
		}
		assert_eq!(Kind::from_exit_code(0), None);
		assert_eq!(Kind::from_exit_code(1), None);
	}

	#[test]
	fn serialized_errors_keep_their_kind() {
		let error = error!(kind = Kind::Execution, %code = 2, "the build script failed");
		let json = serde_json::to_string(&error).unwrap();
		let error: Error = serde_json::from_str(&json).unwrap();
		assert_eq!(error.kind(), Some(Kind::Execution));
		assert_eq!(error.value("code"), Some("2"));
	}
}
