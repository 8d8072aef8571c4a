use std::{ffi::OsString, path::PathBuf, time::Duration};

/// The operations the gateway performs. Nothing outside this set can be requested.
#[derive(Clone, Debug, PartialEq, Eq, clap::Subcommand)]
pub enum Operation {
	Mount(Mount),
	Release(Release),
	Unmount(Unmount),
	Check(Check),
	Exec(Exec),
	Stage(Stage),
}

/// Acquire a lease on the tree's mounts, mounting them if needed.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
#[group(skip)]
pub struct Mount {
	#[arg(index = 1)]
	pub tree: PathBuf,

	/// The process that holds the lease. Defaults to the caller.
	#[arg(long)]
	pub owner: Option<u32>,
}

/// Release a lease, unmounting when it was the last one.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
#[group(skip)]
pub struct Release {
	#[arg(index = 1)]
	pub tree: PathBuf,

	#[arg(long)]
	pub owner: Option<u32>,

	/// Leave the mounts standing for the next acquirer.
	#[arg(long)]
	pub keep_mounts: bool,
}

/// Drop leases held by processes that no longer exist, and unmount if none remain.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
#[group(skip)]
pub struct Unmount {
	#[arg(index = 1)]
	pub tree: PathBuf,

	/// Unmount even if live processes still hold leases.
	#[arg(long)]
	pub force: bool,
}

/// Verify that every mount is present.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
#[group(skip)]
pub struct Check {
	#[arg(index = 1)]
	pub tree: PathBuf,
}

/// Run a script with the tree as its root. The tree must already be mounted.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
#[group(skip)]
pub struct Exec {
	#[arg(index = 1)]
	pub tree: PathBuf,

	/// The absolute path of the script on the host.
	#[arg(index = 2)]
	pub script: PathBuf,

	/// Kill the script's process group after this many seconds.
	#[arg(long, value_parser = parse_seconds)]
	pub timeout: Option<Duration>,
}

/// Copy host files into a directory inside the tree.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
#[group(skip)]
pub struct Stage {
	#[arg(index = 1)]
	pub tree: PathBuf,

	/// The destination directory, relative to the tree.
	#[arg(index = 2)]
	pub destination: PathBuf,

	/// The absolute paths of the files to copy.
	#[arg(index = 3, num_args = 1.., required = true)]
	pub sources: Vec<PathBuf>,
}

impl Operation {
	#[must_use]
	pub fn name(&self) -> &'static str {
		match self {
			Self::Mount(_) => "mount",
			Self::Release(_) => "release",
			Self::Unmount(_) => "unmount",
			Self::Check(_) => "check",
			Self::Exec(_) => "exec",
			Self::Stage(_) => "stage",
		}
	}

	#[must_use]
	pub fn tree(&self) -> &PathBuf {
		match self {
			Self::Mount(Mount { tree, .. })
			| Self::Release(Release { tree, .. })
			| Self::Unmount(Unmount { tree, .. })
			| Self::Check(Check { tree })
			| Self::Exec(Exec { tree, .. })
			| Self::Stage(Stage { tree, .. }) => tree,
		}
	}

	/// Fill in the owner of a mount or release that has none.
	#[must_use]
	pub fn with_owner(mut self, pid: u32) -> Self {
		match &mut self {
			Self::Mount(Mount { owner, .. }) | Self::Release(Release { owner, .. }) => {
				owner.get_or_insert(pid);
			},
			_ => (),
		}
		self
	}

	/// Render the operation as command line arguments that parse back to it.
	#[must_use]
	pub fn to_args(&self) -> Vec<OsString> {
		let mut args: Vec<OsString> = vec![self.name().into(), self.tree().into()];
		match self {
			Self::Mount(Mount { owner, .. }) => {
				if let Some(owner) = owner {
					args.extend(["--owner".into(), owner.to_string().into()]);
				}
			},
			Self::Release(Release {
				owner, keep_mounts, ..
			}) => {
				if let Some(owner) = owner {
					args.extend(["--owner".into(), owner.to_string().into()]);
				}
				if *keep_mounts {
					args.push("--keep-mounts".into());
				}
			},
			Self::Unmount(Unmount { force, .. }) => {
				if *force {
					args.push("--force".into());
				}
			},
			Self::Check(_) => (),
			Self::Exec(Exec {
				script, timeout, ..
			}) => {
				args.push(script.into());
				if let Some(timeout) = timeout {
					args.extend(["--timeout".into(), timeout.as_secs_f64().to_string().into()]);
				}
			},
			Self::Stage(Stage {
				destination,
				sources,
				..
			}) => {
				args.push("--".into());
				args.push(destination.into());
				args.extend(sources.iter().map(Into::into));
			},
		}
		args
	}
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
	let seconds = value.parse::<f64>().map_err(|error| error.to_string())?;
	Duration::try_from_secs_f64(seconds).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
	use {
		super::{Exec, Operation, Release, Stage},
		clap::Parser as _,
		pretty_assertions::assert_eq,
		std::time::Duration,
	};

	#[derive(clap::Parser)]
	struct Args {
		#[command(subcommand)]
		operation: Operation,
	}

	fn parse(args: &[&str]) -> Result<Operation, clap::Error> {
		Args::try_parse_from(std::iter::once("gateway").chain(args.iter().copied()))
			.map(|args| args.operation)
	}

	#[test]
	fn operations_parse_from_their_arguments() {
		let operation = parse(&["release", "/mnt/lfs", "--owner", "42", "--keep-mounts"]).unwrap();
		assert_eq!(
			operation,
			Operation::Release(Release {
				tree: "/mnt/lfs".into(),
				owner: Some(42),
				keep_mounts: true,
			})
		);
		let operation = parse(&["exec", "/mnt/lfs", "/tmp/build.sh"]).unwrap();
		assert_eq!(
			operation,
			Operation::Exec(Exec {
				tree: "/mnt/lfs".into(),
				script: "/tmp/build.sh".into(),
				timeout: None,
			})
		);
		let operation = parse(&["exec", "/mnt/lfs", "/tmp/build.sh", "--timeout", "1.5"]).unwrap();
		let Operation::Exec(exec) = operation else {
			panic!("expected an exec");
		};
		assert_eq!(exec.timeout, Some(Duration::from_millis(1500)));
		assert!(parse(&["exec", "/mnt/lfs", "/tmp/build.sh", "--timeout", "-1"]).is_err());
	}

	#[test]
	fn unknown_operations_are_usage_errors() {
		let error = parse(&["eval", "/mnt/lfs", "rm -rf /"]).unwrap_err();
		assert_eq!(error.kind(), clap::error::ErrorKind::InvalidSubcommand);
		assert_eq!(error.exit_code(), 2);
		let error = parse(&["stage", "/mnt/lfs", "sources"]).unwrap_err();
		assert_eq!(error.exit_code(), 2);
	}

	#[test]
	fn arguments_round_trip() {
		let operations = [
			Operation::Release(Release {
				tree: "/mnt/lfs".into(),
				owner: Some(7),
				keep_mounts: true,
			}),
			Operation::Stage(Stage {
				tree: "/mnt/lfs".into(),
				destination: "sources".into(),
				sources: vec!["/srv/a.tar.xz".into(), "/srv/b.patch".into()],
			}),
			Operation::Exec(Exec {
				tree: "/mnt/lfs".into(),
				script: "/tmp/build.sh".into(),
				timeout: Some(Duration::from_secs(30)),
			}),
		];
		for operation in operations {
			let args = operation.to_args();
			let args = args.iter().map(|arg| arg.to_str().unwrap()).collect::<Vec<_>>();
			assert_eq!(parse(&args).unwrap(), operation);
		}
	}

	#[test]
	fn owners_are_only_filled_in_when_missing() {
		let operation = parse(&["mount", "/mnt/lfs", "--owner", "9"]).unwrap().with_owner(1);
		assert_eq!(operation.to_args().last().unwrap(), "9");
		let operation = parse(&["check", "/mnt/lfs"]).unwrap().with_owner(1);
		assert_eq!(operation.to_args().len(), 2);
	}
}
