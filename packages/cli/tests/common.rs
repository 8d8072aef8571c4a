#![cfg(test)]
#![allow(dead_code)]
use {
	std::{
		os::unix::fs::PermissionsExt as _,
		path::{Path, PathBuf},
		process::Stdio,
	},
	sysroot_temp::Temp,
};

const SYSROOT: &str = env!("CARGO_BIN_EXE_sysroot");

/// A scratch directory with an empty tree and no config.
pub struct Environment {
	temp: Temp,
	pub tree: PathBuf,
}

pub struct Output {
	pub code: Option<i32>,
	pub stdout: String,
	pub stderr: String,
}

impl Environment {
	pub fn new() -> Self {
		let temp = Temp::new();
		let tree = temp.path().join("lfs");
		std::fs::create_dir_all(tree.join("usr")).unwrap();
		Self { temp, tree }
	}

	pub fn path(&self) -> &Path {
		self.temp.path()
	}

	/// A `sysroot` command isolated from the caller's config and environment.
	pub fn sysroot(&self) -> tokio::process::Command {
		self.command(Path::new(SYSROOT))
	}

	/// Any program, with the same isolation as [`Self::sysroot`].
	pub fn command(&self, program: &Path) -> tokio::process::Command {
		let mut command = tokio::process::Command::new(program);
		command
			.env_remove("SYSROOT_CONFIG")
			.env_remove("SYSROOT_TRACING")
			.env_remove("SYSROOT_TREE")
			.env("HOME", self.temp.path())
			.env("XDG_CONFIG_HOME", self.temp.path().join(".config"))
			.stdin(Stdio::null());
		command
	}

	pub async fn run(&self, args: &[&str]) -> Output {
		Self::output(self.sysroot().args(args)).await
	}

	pub async fn output(command: &mut tokio::process::Command) -> Output {
		let output = command.output().await.unwrap();
		Output {
			code: output.status.code(),
			stdout: String::from_utf8(output.stdout).unwrap(),
			stderr: String::from_utf8(output.stderr).unwrap(),
		}
	}

	pub fn file(&self, name: &str, contents: &str) -> PathBuf {
		let path = self.temp.path().join(name);
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		std::fs::write(&path, contents).unwrap();
		path
	}

	pub fn executable(&self, name: &str, contents: &str) -> PathBuf {
		let path = self.file(name, contents);
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	pub fn sysroot_path() -> &'static str {
		SYSROOT
	}

	pub fn tree(&self) -> &str {
		self.tree.to_str().unwrap()
	}
}
