use {
	std::{
		io::Write as _,
		path::{Path, PathBuf},
		time::Duration,
	},
	sysroot_error::{Error, Kind, Result, error},
	sysroot_gateway::{Operation, Privileged, operation},
};

/// Runs build scripts in a tree through the privileged gateway, holding a mount lease for the duration of each one.
pub struct Engine<P> {
	privileged: P,
	tree: PathBuf,
	keep_mounts: bool,
}

/// How a build ended, when the bridge itself worked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
	Succeeded,

	/// The script exited unsuccessfully.
	Failed { code: i32 },

	/// The script ran past its deadline and was killed.
	TimedOut { timeout: Duration },
}

impl<P> Engine<P>
where
	P: Privileged,
{
	pub fn new(privileged: P, tree: impl Into<PathBuf>) -> Self {
		Self {
			privileged,
			tree: tree.into(),
			keep_mounts: false,
		}
	}

	/// Leave the mounts standing after the last release, for chains of steps that would otherwise remount each time.
	#[must_use]
	pub fn keep_mounts(mut self, keep_mounts: bool) -> Self {
		self.keep_mounts = keep_mounts;
		self
	}

	#[must_use]
	pub fn tree(&self) -> &Path {
		&self.tree
	}

	/// Run a script with its combined output written to `log`. An error means the bridge failed, not the script.
	#[tracing::instrument(level = "info", skip_all, fields(script = %script.display()))]
	pub async fn run(&self, script: &Path, log: &Path, timeout: Option<Duration>) -> Result<Outcome> {
		if let Some(parent) = log.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(
				|source| error!(!source, %log = log.display(), "failed to create the log directory"),
			)?;
		}
		let file = std::fs::File::create(log)
			.map_err(|source| error!(!source, %log = log.display(), "failed to create the log"))?;

		self.privileged
			.run(
				Operation::Mount(operation::Mount {
					tree: self.tree.clone(),
					owner: None,
				}),
				None,
			)
			.await
			.map_err(|source| error!(!source, "failed to acquire the mounts"))?;

		// The gateway enforces the deadline so that the kill happens with its privileges.
		let result = self
			.privileged
			.run(
				Operation::Exec(operation::Exec {
					tree: self.tree.clone(),
					script: script.to_owned(),
					timeout,
				}),
				Some(file),
			)
			.await;

		let released = self
			.privileged
			.run(
				Operation::Release(operation::Release {
					tree: self.tree.clone(),
					owner: None,
					keep_mounts: self.keep_mounts,
				}),
				None,
			)
			.await;

		let outcome = match result {
			Ok(()) => Outcome::Succeeded,
			Err(error) if error.is(Kind::Timeout) => {
				let timeout = timeout.unwrap_or_default();
				append(log, &format!("BUILD TIMEOUT: Exceeded {} seconds\n", timeout.as_secs()));
				tracing::warn!(?timeout, "the build timed out");
				Outcome::TimedOut { timeout }
			},
			Err(error) if error.is(Kind::Execution) => {
				let code = script_code(&error);
				tracing::info!(code, "the build script failed");
				Outcome::Failed { code }
			},
			Err(error) => {
				released.ok();
				return Err(error!(!error, "the bridge failed to run the script"));
			},
		};
		released.map_err(|source| error!(!source, "failed to release the mounts"))?;
		Ok(outcome)
	}

	/// Copy host files into the tree.
	pub async fn stage(&self, destination: &Path, sources: Vec<PathBuf>) -> Result<()> {
		self.privileged
			.run(
				Operation::Stage(operation::Stage {
					tree: self.tree.clone(),
					destination: destination.to_owned(),
					sources,
				}),
				None,
			)
			.await
	}

	/// Drop every lease on the tree and unmount it.
	pub async fn reclaim(&self) -> Result<()> {
		self.privileged
			.run(
				Operation::Unmount(operation::Unmount {
					tree: self.tree.clone(),
					force: true,
				}),
				None,
			)
			.await
	}
}

/// The script's own exit code if the gateway recorded it, otherwise the execution failure status.
fn script_code(error: &Error) -> i32 {
	error
		.value("code")
		.and_then(|code| code.parse().ok())
		.unwrap_or_else(|| i32::from(error.exit_code()))
}

fn append(path: &Path, contents: &str) {
	let result = std::fs::OpenOptions::new()
		.append(true)
		.create(true)
		.open(path)
		.and_then(|mut file| file.write_all(contents.as_bytes()));
	if let Err(error) = result {
		tracing::warn!(log = %path.display(), %error, "failed to write to the log");
	}
}
