use std::{
	collections::BTreeMap,
	ffi::{OsStr, OsString},
	path::{Path, PathBuf},
};

pub use self::{chroot::Chroot, host::Host};

mod chroot;
mod host;

/// A program to run inside a root file system: an argument list, an environment, and a working directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
	pub executable: PathBuf,
	pub args: Vec<OsString>,

	/// The complete environment. Nothing is inherited from the caller.
	pub env: BTreeMap<String, String>,

	/// The working directory, as seen from inside the root.
	pub cwd: PathBuf,
}

/// Where a command's output goes. Standard input is always closed.
#[derive(Debug)]
pub enum Stdio {
	Inherit,
	Null,

	/// Standard output and standard error are both written to the file.
	File(std::fs::File),
}

/// How a command finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
	Code(i32),
	Signal(i32),
}

/// Runs a command with a directory as its root.
pub trait Executor: Send + Sync + 'static {
	fn execute(
		&self,
		root: &Path,
		command: &Command,
		stdio: Stdio,
	) -> impl Future<Output = std::io::Result<ExitStatus>> + Send;
}

impl Command {
	pub fn new(executable: impl Into<PathBuf>) -> Self {
		Self {
			executable: executable.into(),
			args: Vec::new(),
			env: BTreeMap::new(),
			cwd: "/".into(),
		}
	}

	#[must_use]
	pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
		self.args.push(arg.as_ref().to_owned());
		self
	}

	#[must_use]
	pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Self {
		self.args
			.extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
		self
	}

	#[must_use]
	pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.env.insert(name.into(), value.into());
		self
	}

	#[must_use]
	pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
		self.cwd = cwd.into();
		self
	}
}

impl Stdio {
	/// Split into the standard output and standard error handles for a child process.
	fn split(self) -> std::io::Result<(std::process::Stdio, std::process::Stdio)> {
		match self {
			Self::Inherit => Ok((std::process::Stdio::inherit(), std::process::Stdio::inherit())),
			Self::Null => Ok((std::process::Stdio::null(), std::process::Stdio::null())),
			Self::File(file) => {
				let stderr = file.try_clone()?;
				Ok((file.into(), stderr.into()))
			},
		}
	}
}

impl ExitStatus {
	#[must_use]
	pub fn success(self) -> bool {
		matches!(self, Self::Code(0))
	}

	/// The status a shell would report: the exit code, or 128 plus the signal number.
	#[must_use]
	pub fn code(self) -> i32 {
		match self {
			Self::Code(code) => code,
			Self::Signal(signal) => 128 + signal,
		}
	}
}

impl From<std::process::ExitStatus> for ExitStatus {
	fn from(value: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt as _;
		match (value.code(), value.signal()) {
			(Some(code), _) => Self::Code(code),
			(None, Some(signal)) => Self::Signal(signal),
			(None, None) => Self::Code(1),
		}
	}
}

impl std::fmt::Display for ExitStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Code(code) => write!(f, "exited with code {code}"),
			Self::Signal(signal) => write!(f, "terminated by signal {signal}"),
		}
	}
}

/// Spawn a prepared process in its own process group and wait for it. If the returned future is dropped first, the whole group is killed.
async fn wait(mut command: tokio::process::Command) -> std::io::Result<ExitStatus> {
	command.process_group(0).kill_on_drop(true);
	let mut child = command.spawn()?;
	let pid = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok());
	let group = scopeguard::guard(pid, |pid| {
		if let Some(pid) = pid {
			unsafe { libc::kill(-pid, libc::SIGKILL) };
		}
	});
	let status = child.wait().await?;
	scopeguard::ScopeGuard::into_inner(group);
	Ok(status.into())
}
