use {
	crate::{Cli, absolute},
	std::{path::PathBuf, time::Duration},
	sysroot_error::{Kind, Result, error},
	sysroot_worker::{Engine, Outcome, TIMEOUT_EXIT_CODE},
};

/// Run a build script inside the tree, elevating through the configured program.
#[derive(Clone, Debug, clap::Args)]
pub struct Args {
	/// The tree to run in.
	#[arg(env = "SYSROOT_TREE", long)]
	pub tree: PathBuf,

	/// The script to run.
	#[arg(index = 1)]
	pub script: PathBuf,

	/// Where to write the script's output.
	#[arg(long)]
	pub log: PathBuf,

	/// Kill the script after this many seconds.
	#[arg(long)]
	pub timeout: Option<u64>,

	/// Leave the mounts standing after the run.
	#[arg(long)]
	pub keep_mounts: bool,
}

impl Cli {
	pub async fn command_run(&mut self, args: Args) -> Result<()> {
		let script = absolute(&args.script)?;
		let log = absolute(&args.log)?;
		let keep_mounts = args.keep_mounts
			|| self
				.worker_config()
				.and_then(|worker| worker.keep_mounts)
				.unwrap_or_default();
		let engine = Engine::new(self.elevated()?, args.tree).keep_mounts(keep_mounts);
		let timeout = args.timeout.map(Duration::from_secs);
		match engine.run(&script, &log, timeout).await? {
			Outcome::Succeeded => Ok(()),
			Outcome::Failed { code } => Err(error!(
				kind = Kind::Execution,
				%code,
				%log = log.display(),
				"the build script failed"
			)),
			Outcome::TimedOut { timeout } => {
				let message = format!("BUILD TIMEOUT: Exceeded {} seconds", timeout.as_secs());
				Self::print_error_message(&message);
				self.exit = u8::try_from(TIMEOUT_EXIT_CODE).ok();
				Ok(())
			},
		}
	}
}
