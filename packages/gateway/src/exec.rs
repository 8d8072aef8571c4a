use {
	crate::{Gateway, create_dir_within, validate_file, validate_tree},
	std::{os::unix::fs::PermissionsExt as _, path::Path, time::Duration},
	sysroot_error::{Kind, Result, error},
	sysroot_sandbox::{Command, Executor, Stdio},
	sysroot_temp::Temp,
};

/// Where staged scripts live, relative to the root of the tree.
const SCRIPTS: &str = "tmp/.sysroot";

impl<E> Gateway<E>
where
	E: Executor,
{
	/// Copy a script into the tree and run it with the tree as root. The mounts must already be present. Past `timeout`, the script's process group is killed.
	pub async fn exec(
		&self,
		tree: &Path,
		script: &Path,
		timeout: Option<Duration>,
		stdio: Stdio,
	) -> Result<()> {
		let tree = validate_tree(tree)?;
		validate_file(script)?;

		let report = self.check(&tree).await?;
		if !report.is_ok() {
			return Err(error!(
				kind = Kind::Validation,
				%tree = tree.display(),
				"the tree is not mounted, run the mount operation first"
			));
		}

		// Stage the script. The copy is removed when the temp is dropped.
		let directory = create_dir_within(&tree, Path::new(SCRIPTS)).await?;
		let staged = Temp::new_in(&directory).with_extension("sh");
		tokio::fs::copy(script, staged.path()).await.map_err(|source| {
			error!(!source, %script = script.display(), "failed to stage the script")
		})?;
		tokio::fs::set_permissions(staged.path(), std::fs::Permissions::from_mode(0o755))
			.await
			.map_err(|source| error!(!source, "failed to make the script executable"))?;
		let guest = Path::new("/").join(staged.path().strip_prefix(&tree).map_err(
			|source| error!(!source, "the staged script is outside the tree"),
		)?);

		let command = self.command(&guest);
		tracing::info!(script = %script.display(), staged = %guest.display(), "executing");
		let execute = self.executor.execute(&tree, &command, stdio);
		let status = match timeout {
			Some(timeout) => tokio::time::timeout(timeout, execute).await.ok(),
			None => Some(execute.await),
		};
		drop(staged);
		let Some(status) = status else {
			let timeout = timeout.unwrap_or_default();
			tracing::warn!(?timeout, "killed the script at its deadline");
			return Err(error!(
				kind = Kind::Timeout,
				%seconds = timeout.as_secs(),
				%script = script.display(),
				"the script ran past its deadline"
			));
		};
		let status = status.map_err(
			|source| error!(!source, %shell = self.options.shell.display(), "failed to spawn the script"),
		)?;

		if !status.success() {
			return Err(error!(
				kind = Kind::Execution,
				%code = status.code(),
				%script = script.display(),
				"the script {status}"
			));
		}
		Ok(())
	}

	/// The login shell invocation for a staged script, with a clean environment.
	pub(crate) fn command(&self, script: &Path) -> Command {
		Command::new(&self.options.shell)
			.arg("--login")
			.arg(script)
			.cwd("/")
			.env("HOME", "/root")
			.env("LC_ALL", "C")
			.env("LFS", "/")
			.env("MAKEFLAGS", format!("-j{}", parallelism()))
			.env("PATH", "/usr/bin:/usr/sbin:/bin:/sbin")
			.env("TERM", std::env::var("TERM").unwrap_or_else(|_| "linux".to_owned()))
	}
}

fn parallelism() -> usize {
	std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
