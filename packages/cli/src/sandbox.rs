use {
	crate::{Cli, absolute},
	std::{collections::BTreeSet, path::PathBuf},
	sysroot_error::{Result, error},
	sysroot_supervisor::{Options, Supervisor},
};

const IMAGE: &str = "sysroot-worker:latest";

/// Run the worker in a disposable container. The container is removed however the session ends.
#[derive(Clone, Debug, clap::Args)]
pub struct Args {
	/// The tree on the host.
	#[arg(env = "SYSROOT_TREE", long)]
	pub tree: PathBuf,

	/// The build inputs on the host. Defaults to the current directory.
	#[arg(long)]
	pub execroot: Option<PathBuf>,

	/// Bind a host directory into the container at the same path.
	#[arg(action = clap::ArgAction::Append, long = "bind", num_args = 1)]
	pub binds: Vec<PathBuf>,

	#[arg(long)]
	pub image: Option<String>,

	/// The container runtime.
	#[arg(long)]
	pub program: Option<PathBuf>,

	#[arg(hide = true, long = "persistent_worker")]
	pub persistent_worker: bool,
}

impl Cli {
	pub async fn command_sandbox(&mut self, args: Args) -> Result<()> {
		let config = self
			.config
			.as_ref()
			.and_then(|config| config.sandbox.clone())
			.unwrap_or_default();

		let execroot = match args.execroot {
			Some(execroot) => absolute(&execroot)?,
			None => std::env::current_dir()
				.map_err(|source| error!(!source, "failed to get the current directory"))?,
		};
		let externals = externals(config.binds.iter().chain(&args.binds))?;
		let image = args
			.image
			.or(config.image)
			.unwrap_or_else(|| IMAGE.to_owned());
		let options = Options {
			program: args
				.program
				.or(config.program)
				.unwrap_or_else(|| "podman".into()),
			build_command: config
				.build_command
				.unwrap_or_else(|| format!("podman build --tag {image} --file Containerfile .")),
			image,
			tree: absolute(&args.tree)?,
			execroot,
			externals,
			worker: config
				.worker_command
				.unwrap_or_else(|| vec!["sysroot".to_owned(), "worker".to_owned()]),
		};

		let code = Supervisor::new(options).run().await?;
		self.exit = Some(u8::try_from(code).unwrap_or(1));
		Ok(())
	}
}

/// The distinct absolute paths to bind. A path named twice would be a duplicate volume.
fn externals<'a>(binds: impl IntoIterator<Item = &'a PathBuf>) -> Result<Vec<PathBuf>> {
	let externals = binds
		.into_iter()
		.map(|path| absolute(path))
		.collect::<Result<BTreeSet<_>>>()?;
	Ok(externals.into_iter().collect())
}
