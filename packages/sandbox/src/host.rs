use {
	crate::{Command, Executor, ExitStatus, Stdio},
	std::{
		ffi::OsString,
		path::{Path, PathBuf},
	},
};

/// Runs commands without changing root. Absolute arguments that name something inside the root, and the working directory, are rebased onto it. Used where `chroot(2)` is unavailable, such as unprivileged tests.
#[derive(Clone, Debug, Default)]
pub struct Host {
	executable: Option<PathBuf>,
}

impl Host {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Run every command with this host program instead of the command's own executable.
	#[must_use]
	pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
		Self {
			executable: Some(executable.into()),
		}
	}
}

impl Executor for Host {
	async fn execute(
		&self,
		root: &Path,
		command: &Command,
		stdio: Stdio,
	) -> std::io::Result<ExitStatus> {
		let executable = self
			.executable
			.clone()
			.unwrap_or_else(|| command.executable.clone());
		let args = command
			.args
			.iter()
			.map(|arg| rebase_arg(root, arg))
			.collect::<Vec<_>>();
		let cwd = rebase(root, &command.cwd);
		let (stdout, stderr) = stdio.split()?;

		let mut process = tokio::process::Command::new(executable);
		process
			.args(args)
			.env_clear()
			.envs(&command.env)
			.current_dir(cwd)
			.stdin(std::process::Stdio::null())
			.stdout(stdout)
			.stderr(stderr);
		crate::wait(process).await
	}
}

fn rebase(root: &Path, path: &Path) -> PathBuf {
	match path.strip_prefix("/") {
		Ok(relative) => root.join(relative),
		Err(_) => path.to_owned(),
	}
}

fn rebase_arg(root: &Path, arg: &OsString) -> OsString {
	let path = Path::new(arg);
	if !path.is_absolute() {
		return arg.clone();
	}
	let rebased = rebase(root, path);
	if rebased.exists() {
		rebased.into_os_string()
	} else {
		arg.clone()
	}
}
