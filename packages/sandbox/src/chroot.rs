use {
	crate::{Command, Executor, ExitStatus, Stdio},
	std::{ffi::CString, os::unix::ffi::OsStrExt as _, path::Path},
};

/// Runs commands with `chroot(2)`. Requires `CAP_SYS_CHROOT`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Chroot;

impl Chroot {
	#[must_use]
	pub fn new() -> Self {
		Self
	}
}

impl Executor for Chroot {
	async fn execute(
		&self,
		root: &Path,
		command: &Command,
		stdio: Stdio,
	) -> std::io::Result<ExitStatus> {
		let root_ = cstring(root)?;
		let cwd = cstring(&command.cwd)?;
		let (stdout, stderr) = stdio.split()?;

		let mut process = tokio::process::Command::new(&command.executable);
		process
			.args(&command.args)
			.env_clear()
			.envs(&command.env)
			.stdin(std::process::Stdio::null())
			.stdout(stdout)
			.stderr(stderr);
		unsafe {
			process.pre_exec(move || {
				if libc::chroot(root_.as_ptr()) != 0 {
					return Err(std::io::Error::last_os_error());
				}
				if libc::chdir(cwd.as_ptr()) != 0 {
					return Err(std::io::Error::last_os_error());
				}
				Ok(())
			});
		}

		tracing::debug!(root = %root.display(), executable = %command.executable.display(), "spawning");
		crate::wait(process).await
	}
}

fn cstring(path: &Path) -> std::io::Result<CString> {
	CString::new(path.as_os_str().as_bytes())
		.map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "the path contains a nul byte"))
}
