use {
	crate::Cli,
	std::{path::PathBuf, sync::Arc, time::Duration},
	sysroot_error::{Result, error},
	sysroot_gateway::{Gateway, InProcess},
	sysroot_lease::{Set, System},
	sysroot_sandbox::Chroot,
	sysroot_worker::{Engine, Worker},
	tokio::signal::unix::{SignalKind, signal},
};

/// Serve build requests on stdin and stdout. Must run as root, usually inside the sandbox.
#[derive(Clone, Debug, clap::Args)]
pub struct Args {
	#[arg(default_value = "/lfs", long)]
	pub tree: PathBuf,

	/// The directory that request paths are relative to. It is also bound into the tree at the same path.
	#[arg(default_value = "/execroot", long)]
	pub execroot: PathBuf,

	/// Bind a directory into the tree at the same path, so symlinks into it resolve.
	#[arg(action = clap::ArgAction::Append, long = "bind", num_args = 1)]
	pub binds: Vec<PathBuf>,

	/// The deadline in seconds for requests that do not carry one.
	#[arg(long)]
	pub timeout: Option<u64>,

	/// Leave the mounts standing between requests.
	#[arg(long)]
	pub keep_mounts: bool,

	/// Do not reset ownership of system directories after each build.
	#[arg(long)]
	pub no_normalize: bool,

	/// Do not create the test suite user at startup.
	#[arg(long)]
	pub no_test_user: bool,

	/// Passed by build tools that start persistent workers.
	#[arg(hide = true, long = "persistent_worker")]
	pub persistent_worker: bool,
}

impl Cli {
	pub async fn command_worker(&mut self, args: Args) -> Result<()> {
		let config = self.worker_config().cloned().unwrap_or_default();

		let mut mounts = Set::standard().with_mirror(&args.execroot);
		for bind in &args.binds {
			mounts = mounts.with_mirror(bind);
		}
		// Leases taken for requests belong to the worker, which outlives them.
		let options = sysroot_gateway::Options {
			owner: std::process::id(),
			..self.gateway_options(mounts)
		};
		tracing::debug!(owner = options.owner, "leases are owned by the worker");
		let gateway = Gateway::new(Chroot::new(), Arc::new(System::new()), options);

		let keep_mounts = args.keep_mounts || config.keep_mounts.unwrap_or_default();
		let engine = Engine::new(InProcess::new(Arc::new(gateway)), &args.tree).keep_mounts(keep_mounts);
		let defaults = sysroot_worker::Options::default();
		let options = sysroot_worker::Options {
			execroot: args.execroot,
			timeout: args
				.timeout
				.map(Duration::from_secs)
				.or(config.timeout)
				.unwrap_or(defaults.timeout),
			normalize: !args.no_normalize && config.normalize.unwrap_or(defaults.normalize),
			test_user: !args.no_test_user && config.test_user.unwrap_or(defaults.test_user),
			private_mounts: defaults.private_mounts,
		};
		let mut worker = Worker::new(engine, options);

		let mut terminate = signal(SignalKind::terminate())
			.map_err(|source| error!(!source, "failed to install a signal handler"))?;
		let mut interrupt = signal(SignalKind::interrupt())
			.map_err(|source| error!(!source, "failed to install a signal handler"))?;

		worker.prepare().await;
		let result = tokio::select! {
			result = worker.serve(tokio::io::stdin(), tokio::io::stdout()) => result,
			_ = terminate.recv() => {
				tracing::info!("received SIGTERM");
				Ok(())
			},
			_ = interrupt.recv() => {
				tracing::info!("received SIGINT");
				Ok(())
			},
		};

		if let Err(error) = worker.shutdown().await {
			tracing::error!(error = %error.trace(), "failed to reclaim the mounts");
		}
		result
	}
}
