use {
	std::{ffi::OsString, path::PathBuf},
	sysroot_error::{Kind, Result, error},
	tokio::signal::unix::{SignalKind, signal},
};


/// The label that marks every container started by a session.
pub const LABEL: &str = "sysroot.session";

/// Where the tree and the build inputs appear inside the sandbox.
pub const TREE: &str = "/lfs";
pub const EXECROOT: &str = "/execroot";

/// Starts the worker in a container and removes the container however the session ends.
#[derive(Clone, Debug)]
pub struct Supervisor {
	options: Options,
}

#[derive(Clone, Debug)]
pub struct Options {
	/// The container runtime.
	pub program: PathBuf,

	pub image: String,

	/// The command that builds the image, shown when it is missing.
	pub build_command: String,

	/// The tree on the host.
	pub tree: PathBuf,

	/// The build inputs on the host.
	pub execroot: PathBuf,

	/// Host directories that symlinks in the build inputs point into. Each is bound at its own path.
	pub externals: Vec<PathBuf>,

	/// The worker command inside the image.
	pub worker: Vec<String>,
}

impl Supervisor {
	#[must_use]
	pub fn new(options: Options) -> Self {
		Self { options }
	}

	/// Fail with guidance if the image has not been built.
	pub async fn preflight(&self) -> Result<()> {
		let status = tokio::process::Command::new(&self.options.program)
			.args(["image", "exists", &self.options.image])
			.stdin(std::process::Stdio::null())
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null())
			.status()
			.await
			.map_err(|source| {
				error!(
					!source,
					kind = Kind::Validation,
					%program = self.options.program.display(),
					"failed to run the container runtime, is it installed?"
				)
			})?;
		if !status.success() {
			return Err(error!(
				kind = Kind::Validation,
				%image = self.options.image,
				"the sandbox image does not exist, build it with `{}`",
				self.options.build_command
			));
		}
		Ok(())
	}

	/// The arguments that start the worker's container.
	#[must_use]
	pub fn args(&self, id: &str) -> Vec<OsString> {
		let label = format!("{LABEL}={id}");
		let mut args: Vec<OsString> = [
			"run",
			"--rm",
			"--interactive",
			"--name",
			id,
			"--label",
			label.as_str(),
			"--network",
			"none",
			"--privileged",
			"--security-opt",
			"label=disable",
		]
		.into_iter()
		.map(Into::into)
		.collect();
		let mut volume = |host: &std::path::Path, guest: &std::path::Path| {
			let mut value = host.as_os_str().to_owned();
			value.push(":");
			value.push(guest);
			args.push("--volume".into());
			args.push(value);
		};
		volume(&self.options.tree, TREE.as_ref());
		volume(&self.options.execroot, EXECROOT.as_ref());
		for external in &self.options.externals {
			volume(external, external);
		}
		args.push(self.options.image.clone().into());
		args.extend(self.options.worker.iter().map(Into::into));
		args.extend(["--tree".into(), TREE.into(), "--execroot".into(), EXECROOT.into()]);
		for external in &self.options.externals {
			args.push("--bind".into());
			args.push(external.into());
		}
		args
	}

	/// Run a session to completion. Returns the worker's exit code, or 128 plus the signal that ended the session.
	pub async fn run(&self) -> Result<i32> {
		self.preflight().await?;

		let mut terminate = listen(SignalKind::terminate())?;
		let mut interrupt = listen(SignalKind::interrupt())?;
		let mut hangup = listen(SignalKind::hangup())?;

		let id = session_id();
		tracing::info!(%id, image = %self.options.image, "starting the sandbox");
		let mut child = tokio::process::Command::new(&self.options.program)
			.args(self.args(&id))
			.stdin(std::process::Stdio::inherit())
			.stdout(std::process::Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.map_err(|source| error!(!source, %id, "failed to start the sandbox"))?;

		let code = tokio::select! {
			status = child.wait() => {
				status
					.map(exit_code)
					.map_err(|source| error!(!source, %id, "failed to wait for the sandbox"))
			},
			_ = terminate.recv() => Ok(signaled(&id, libc::SIGTERM)),
			_ = interrupt.recv() => Ok(signaled(&id, libc::SIGINT)),
			_ = hangup.recv() => Ok(signaled(&id, libc::SIGHUP)),
		};

		self.remove(&id).await;
		child.start_kill().ok();
		child.wait().await.ok();
		let code = code?;
		tracing::info!(%id, code, "the session ended");
		Ok(code)
	}

	/// Force removal of a session's container. Failures are logged, not returned.
	pub async fn remove(&self, id: &str) {
		let result = tokio::process::Command::new(&self.options.program)
			.args(["rm", "--force", "--ignore", id])
			.stdin(std::process::Stdio::null())
			.stdout(std::process::Stdio::null())
			.status()
			.await;
		match result {
			Ok(status) if status.success() => tracing::debug!(%id, "removed the sandbox"),
			Ok(status) => tracing::warn!(%id, ?status, "failed to remove the sandbox"),
			Err(error) => tracing::warn!(%id, %error, "failed to remove the sandbox"),
		}
	}
}

/// A unique session id that sorts by creation time.
#[must_use]
pub fn session_id() -> String {
	const ENCODING: data_encoding::Encoding = data_encoding_macro::new_encoding! {
		symbols: "0123456789abcdefghjkmnpqrstvwxyz",
	};
	let id = uuid::Uuid::now_v7();
	format!("sysroot-{}", ENCODING.encode(&id.into_bytes()))
}

fn listen(kind: SignalKind) -> Result<tokio::signal::unix::Signal> {
	signal(kind).map_err(|source| error!(!source, "failed to install a signal handler"))
}

fn signaled(id: &str, signal: i32) -> i32 {
	tracing::warn!(%id, signal, "received a signal, tearing down the sandbox");
	128 + signal
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
	use std::os::unix::process::ExitStatusExt as _;
	status
		.code()
		.or_else(|| status.signal().map(|signal| 128 + signal))
		.unwrap_or(1)
}
