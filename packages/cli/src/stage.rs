use {
	crate::{Cli, absolute},
	std::path::PathBuf,
	sysroot_error::Result,
	sysroot_worker::Engine,
};

/// Copy host files into the tree, elevating through the configured program.
#[derive(Clone, Debug, clap::Args)]
pub struct Args {
	#[arg(env = "SYSROOT_TREE", long)]
	pub tree: PathBuf,

	/// The destination directory, relative to the tree.
	#[arg(index = 1)]
	pub destination: PathBuf,

	#[arg(index = 2, num_args = 1.., required = true)]
	pub sources: Vec<PathBuf>,
}

impl Cli {
	pub async fn command_stage(&mut self, args: Args) -> Result<()> {
		let sources = args
			.sources
			.iter()
			.map(|source| absolute(source))
			.collect::<Result<Vec<_>>>()?;
		let engine = Engine::new(self.elevated()?, args.tree);
		engine.stage(&args.destination, sources).await
	}
}
