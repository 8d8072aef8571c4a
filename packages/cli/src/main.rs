use {
	clap::Parser as _,
	futures::FutureExt as _,
	std::{path::PathBuf, time::Duration},
	sysroot_error::{Kind, Result, error},
	sysroot_gateway::Elevated,
	tracing_subscriber::prelude::*,
};

mod config;
mod gateway;
mod print;
mod run;
mod sandbox;
mod stage;
mod worker;

pub use self::config::Config;

pub struct Cli {
	args: Args,
	config: Option<Config>,
	exit: Option<u8>,
}

#[derive(Clone, Debug, clap::Parser)]
#[command(
	about = "Sysroot mounts, enters, and builds a Linux system from source.",
	arg_required_else_help = true,
	disable_help_subcommand = true,
	name = "sysroot",
	version
)]
struct Args {
	#[command(subcommand)]
	command: Command,

	/// The path to the config file.
	#[arg(env = "SYSROOT_CONFIG", global = true, long, short)]
	config: Option<PathBuf>,

	/// Override the tracing filter.
	#[arg(env = "SYSROOT_TRACING", global = true, long)]
	tracing: Option<String>,
}

#[derive(Clone, Debug, clap::Subcommand)]
enum Command {
	Gateway(self::gateway::Args),

	Run(self::run::Args),

	Sandbox(self::sandbox::Args),

	Stage(self::stage::Args),

	Worker(self::worker::Args),
}

fn main() -> std::process::ExitCode {
	// Parse the args. Usage errors exit with 2.
	let args = Args::parse();

	// Read the config.
	let config = match Cli::read_config(args.config.clone()) {
		Ok(config) => config,
		Err(error) => {
			Cli::print_error_message("failed to read the config");
			Cli::print_error(&error);
			return error.exit_code().into();
		},
	};

	// Initialize tracing.
	Cli::initialize_tracing(config.as_ref(), args.tracing.as_ref());

	// Create the tokio runtime.
	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
	{
		Ok(runtime) => runtime,
		Err(source) => {
			let error = error!(!source, "failed to create the tokio runtime");
			Cli::print_error_message("an error occurred");
			Cli::print_error(&error);
			return std::process::ExitCode::FAILURE;
		},
	};

	// Create the CLI.
	let mut cli = Cli {
		args: args.clone(),
		config,
		exit: None,
	};

	// Run the command.
	let result = runtime.block_on(cli.command(args.command).boxed());

	// Handle the result.
	let exit = match result {
		Ok(()) => cli.exit.unwrap_or_default().into(),
		Err(error) => {
			Cli::print_error_message("an error occurred");
			Cli::print_error(&error);
			error.exit_code().into()
		},
	};

	// Do not wait on a blocked read of stdin.
	runtime.shutdown_timeout(Duration::from_millis(100));

	exit
}

impl Cli {
	async fn command(&mut self, command: Command) -> Result<()> {
		match command {
			Command::Gateway(args) => self.command_gateway(args).await,
			Command::Run(args) => self.command_run(args).await,
			Command::Sandbox(args) => self.command_sandbox(args).await,
			Command::Stage(args) => self.command_stage(args).await,
			Command::Worker(args) => self.command_worker(args).await,
		}
	}

	fn default_config_path() -> Option<PathBuf> {
		if let Some(directory) = std::env::var_os("XDG_CONFIG_HOME") {
			return Some(PathBuf::from(directory).join("sysroot/config.json"));
		}
		let home = std::env::var_os("HOME")?;
		Some(PathBuf::from(home).join(".config/sysroot/config.json"))
	}

	/// Read the config. A missing file is only an error if it was named explicitly.
	fn read_config(path: Option<PathBuf>) -> Result<Option<Config>> {
		let explicit = path.is_some();
		let Some(path) = path.or_else(Self::default_config_path) else {
			return Ok(None);
		};
		let config = match std::fs::read_to_string(&path) {
			Ok(config) => config,
			Err(error) if error.kind() == std::io::ErrorKind::NotFound && !explicit => {
				return Ok(None);
			},
			Err(source) => {
				return Err(error!(
					!source,
					kind = Kind::InvalidArgument,
					%path = path.display(),
					"failed to read the config file"
				));
			},
		};
		let config = serde_json::from_str(&config).map_err(|source| {
			error!(
				!source,
				kind = Kind::InvalidArgument,
				%path = path.display(),
				"failed to deserialize the config"
			)
		})?;
		Ok(Some(config))
	}

	/// Initialize tracing. Everything goes to stderr, so stdout stays free for worker responses.
	fn initialize_tracing(config: Option<&Config>, tracing_filter: Option<&String>) {
		let config_tracing = config.and_then(|config| config.tracing.as_ref());
		let filter_string = tracing_filter
			.or(config_tracing.map(|tracing| &tracing.filter))
			.filter(|filter| !filter.is_empty())
			.cloned()
			.unwrap_or_else(|| "warn".to_owned());
		let filter = match tracing_subscriber::filter::EnvFilter::try_new(&filter_string) {
			Ok(filter) => filter,
			Err(error) => {
				Self::print_warning_message(&format!("invalid tracing filter {filter_string:?}: {error}"));
				tracing_subscriber::filter::EnvFilter::new("warn")
			},
		};
		let format = config_tracing
			.and_then(|tracing| tracing.format)
			.unwrap_or_default();
		let output_layer = match format {
			self::config::TracingFormat::Json => tracing_subscriber::fmt::layer()
				.with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
				.with_writer(std::io::stderr)
				.json()
				.boxed(),
			self::config::TracingFormat::Pretty => tracing_tree::HierarchicalLayer::new(2)
				.with_writer(std::io::stderr)
				.with_bracketed_fields(true)
				.with_span_retrace(true)
				.boxed(),
		};
		tracing_subscriber::registry()
			.with(output_layer.with_filter(filter))
			.init();
		std::panic::set_hook(Box::new(|info| {
			let payload = info.payload_as_str();
			let location = info.location().map(ToString::to_string);
			let backtrace = std::backtrace::Backtrace::force_capture();
			tracing::error!(payload, location, %backtrace, "panic");
		}));
	}

	/// Gateway options from the config. Operations that name no owner are attributed to the process that invoked the gateway, looking past the elevation program.
	fn gateway_options(&self, mounts: sysroot_lease::Set) -> sysroot_gateway::Options {
		let lease = self.config.as_ref().and_then(|config| config.lease.as_ref());
		let elevation = self
			.config
			.as_ref()
			.and_then(|config| config.elevation.as_ref())
			.and_then(|elevation| elevation.program.to_str());
		let defaults = sysroot_gateway::Options::default();
		sysroot_gateway::Options {
			owner: sysroot_gateway::caller(&["sudo", elevation.unwrap_or("sudo")]),
			lock_timeout: lease
				.and_then(|lease| lease.lock_timeout)
				.unwrap_or(defaults.lock_timeout),
			lease_directory: lease.and_then(|lease| lease.directory.clone()),
			mounts,
			..defaults
		}
	}

	/// The route to the gateway for unprivileged commands.
	fn elevated(&self) -> Result<Elevated> {
		let mut elevated = Elevated::sudo()?;
		if let Some(elevation) = self.config.as_ref().and_then(|config| config.elevation.as_ref()) {
			elevated.program.clone_from(&elevation.program);
			elevated.args = elevation.args.iter().map(Into::into).collect();
		}
		elevated.config.clone_from(&self.args.config);
		Ok(elevated)
	}

	fn worker_config(&self) -> Option<&config::Worker> {
		self.config.as_ref().and_then(|config| config.worker.as_ref())
	}
}

fn absolute(path: &std::path::Path) -> Result<PathBuf> {
	std::path::absolute(path).map_err(|source| {
		error!(!source, kind = Kind::InvalidArgument, %path = path.display(), "failed to make the path absolute")
	})
}
