use {
	crate::{Gateway, Operation},
	std::{ffi::OsString, path::PathBuf, sync::Arc},
	sysroot_error::{Kind, Result, error},
	sysroot_sandbox::{Executor, Stdio},
};

/// The boundary between unprivileged callers and the gateway.
pub trait Privileged: Send + Sync + 'static {
	/// Perform an operation. Output from `exec` is written to `output`, if given.
	fn run(
		&self,
		operation: Operation,
		output: Option<std::fs::File>,
	) -> impl Future<Output = Result<()>> + Send;
}

/// Calls the gateway directly, for callers that already hold the privileges.
pub struct InProcess<E> {
	gateway: Arc<Gateway<E>>,
}

/// Runs the gateway in a child process through an elevation program such as `sudo`.
#[derive(Clone, Debug)]
pub struct Elevated {
	/// The elevation program and its leading arguments.
	pub program: PathBuf,
	pub args: Vec<OsString>,

	/// The `sysroot` executable to run elevated.
	pub executable: PathBuf,

	/// A config file for the elevated process.
	pub config: Option<PathBuf>,
}

impl<E> InProcess<E> {
	pub fn new(gateway: Arc<Gateway<E>>) -> Self {
		Self { gateway }
	}
}

impl<E> Privileged for InProcess<E>
where
	E: Executor,
{
	async fn run(&self, operation: Operation, output: Option<std::fs::File>) -> Result<()> {
		let stdio = output.map_or(Stdio::Null, Stdio::File);
		self.gateway.run(operation, stdio).await?;
		Ok(())
	}
}

impl Elevated {
	/// Elevate with `sudo -n`, running the current executable.
	pub fn sudo() -> Result<Self> {
		let executable = std::env::current_exe()
			.map_err(|source| error!(!source, "failed to get the current executable"))?;
		Ok(Self {
			program: "sudo".into(),
			args: vec!["-n".into()],
			executable,
			config: None,
		})
	}

	fn command(&self, operation: &Operation) -> tokio::process::Command {
		let mut command = tokio::process::Command::new(&self.program);
		command.args(&self.args).arg(&self.executable);
		if let Some(config) = &self.config {
			command.arg("--config").arg(config);
		}
		command.arg("gateway").args(operation.to_args());
		command
	}
}

impl Privileged for Elevated {
	async fn run(&self, operation: Operation, output: Option<std::fs::File>) -> Result<()> {
		let operation = operation.with_owner(std::process::id());
		let mut command = self.command(&operation);
		command.stdin(std::process::Stdio::null());
		match output {
			Some(output) => {
				let stderr = output
					.try_clone()
					.map_err(|source| error!(!source, "failed to clone the output file"))?;
				command.stdout(output).stderr(stderr);
			},
			None => {
				command.stdout(std::process::Stdio::null());
			},
		}
		let status = command.status().await.map_err(|source| {
			error!(!source, %program = self.program.display(), "failed to run the elevation program")
		})?;
		if status.success() {
			return Ok(());
		}
		let name = operation.name();
		match status.code() {
			Some(code) => {
				let kind = Kind::from_exit_code(code);
				let mut error = error!(%code, %operation = name, "the privileged operation failed");
				error.kind = kind;
				Err(error)
			},
			None => Err(error!(%operation = name, "the privileged operation was terminated by a signal")),
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::{Elevated, Privileged as _},
		crate::{Operation, operation},
		sysroot_error::Kind,
	};

	fn exiting_with(code: i32) -> Elevated {
		Elevated {
			program: "/bin/sh".into(),
			args: vec!["-c".into(), format!("exit {code}").into(), "sh".into()],
			executable: "/usr/local/bin/sysroot".into(),
			config: None,
		}
	}

	fn check() -> Operation {
		Operation::Check(operation::Check {
			tree: "/mnt/lfs".into(),
		})
	}

	#[tokio::test]
	async fn helper_exit_codes_map_back_to_kinds() {
		exiting_with(0).run(check(), None).await.unwrap();
		let cases = [
			(2, Some(Kind::InvalidArgument)),
			(4, Some(Kind::Execution)),
			(5, Some(Kind::Validation)),
			(124, Some(Kind::Timeout)),
			(1, None),
		];
		for (code, kind) in cases {
			let error = exiting_with(code).run(check(), None).await.unwrap_err();
			assert_eq!(error.kind(), kind, "{code}");
			assert_eq!(error.value("code"), Some(code.to_string().as_str()));
		}
	}

	#[tokio::test]
	async fn missing_elevation_programs_are_reported() {
		let mut elevated = exiting_with(0);
		elevated.program = "/nonexistent/sudo".into();
		let error = elevated.run(check(), None).await.unwrap_err();
		assert_eq!(error.kind(), None);
		assert!(error.to_string().contains("failed to run the elevation program"));
	}

	#[test]
	fn elevated_invocations_name_the_owner() {
		let elevated = Elevated {
			program: "sudo".into(),
			args: vec!["-n".into()],
			executable: "/usr/local/bin/sysroot".into(),
			config: Some("/etc/sysroot.json".into()),
		};
		let operation = Operation::Mount(operation::Mount {
			tree: "/mnt/lfs".into(),
			owner: None,
		})
		.with_owner(1234);
		let command = elevated.command(&operation);
		let command = command.as_std();
		assert_eq!(command.get_program(), "sudo");
		let args = command
			.get_args()
			.map(|arg| arg.to_str().unwrap())
			.collect::<Vec<_>>();
		assert_eq!(
			args,
			[
				"-n",
				"/usr/local/bin/sysroot",
				"--config",
				"/etc/sysroot.json",
				"gateway",
				"mount",
				"/mnt/lfs",
				"--owner",
				"1234"
			]
		);
	}
}
