use {
	crate::Cli,
	std::sync::Arc,
	sysroot_error::Result,
	sysroot_gateway::{Gateway, Operation},
	sysroot_lease::{Set, System},
	sysroot_sandbox::{Chroot, Stdio},
};

/// Perform one privileged operation on a tree. Must run as root.
#[derive(Clone, Debug, clap::Args)]
pub struct Args {
	#[command(subcommand)]
	pub operation: Operation,
}

impl Cli {
	pub async fn command_gateway(&mut self, args: Args) -> Result<()> {
		let options = self.gateway_options(Set::standard());
		tracing::debug!(owner = options.owner, "resolved the caller");
		let gateway = Gateway::new(Chroot::new(), Arc::new(System::new()), options);
		let output = gateway.run(args.operation, Stdio::Inherit).await?;
		Self::print_output(&output);
		Ok(())
	}
}
