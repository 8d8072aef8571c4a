use {
	serde_with::{DurationSecondsWithFrac, serde_as},
	std::{path::PathBuf, time::Duration},
};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tracing: Option<Tracing>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lease: Option<Lease>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub elevation: Option<Elevation>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub worker: Option<Worker>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sandbox: Option<Sandbox>,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Tracing {
	#[serde(default)]
	pub filter: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub format: Option<TracingFormat>,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracingFormat {
	Json,
	#[default]
	Pretty,
}

#[serde_as]
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Lease {
	/// How long to wait for the lease lock.
	#[serde_as(as = "Option<DurationSecondsWithFrac>")]
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lock_timeout: Option<Duration>,

	/// Keep lease and lock files here instead of next to the tree.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub directory: Option<PathBuf>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Elevation {
	pub program: PathBuf,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub args: Vec<String>,
}

#[serde_as]
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Worker {
	/// The deadline for requests that do not carry one.
	#[serde_as(as = "Option<DurationSecondsWithFrac>")]
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<Duration>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub keep_mounts: Option<bool>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub normalize: Option<bool>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub test_user: Option<bool>,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Sandbox {
	/// The container runtime.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub program: Option<PathBuf>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,

	/// The command that builds the image.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub build_command: Option<String>,

	/// The worker command inside the image.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub worker_command: Option<Vec<String>>,

	/// Host directories bound at their own paths in every session.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub binds: Vec<PathBuf>,
}
