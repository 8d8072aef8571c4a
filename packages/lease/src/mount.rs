use std::path::{Path, PathBuf};

/// A virtual file system mounted inside the target tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
	/// The host path for binds, or the file system's name for kernel file systems.
	pub source: PathBuf,

	/// The mount point, relative to the root of the tree.
	pub target: PathBuf,

	/// The file system type. Binds have none.
	pub fstype: Option<String>,

	pub flags: libc::c_ulong,

	/// File system specific options.
	pub data: Option<String>,

	/// Whether a pre-existing symlink at the target is an acceptable substitute for the mount.
	pub symlink: bool,
}

/// The ordered list of mounts a tree needs. Mounts are made in order and unmounted in reverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Set {
	mounts: Vec<Mount>,
}

impl Mount {
	#[must_use]
	pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
		Self {
			source: source.into(),
			target: target.into(),
			fstype: None,
			flags: libc::MS_BIND | libc::MS_REC,
			data: None,
			symlink: false,
		}
	}

	#[must_use]
	pub fn filesystem(fstype: &str, target: impl Into<PathBuf>) -> Self {
		Self {
			source: fstype.into(),
			target: target.into(),
			fstype: Some(fstype.to_owned()),
			flags: 0,
			data: None,
			symlink: false,
		}
	}

	#[must_use]
	pub fn is_bind(&self) -> bool {
		self.fstype.is_none()
	}

	/// The absolute mount point for a tree.
	#[must_use]
	pub fn target_in(&self, tree: &Path) -> PathBuf {
		tree.join(&self.target)
	}
}

impl Set {
	/// The kernel file systems programs need to run inside the tree.
	#[must_use]
	pub fn standard() -> Self {
		let dev = Mount {
			flags: libc::MS_BIND,
			..Mount::bind("/dev", "dev")
		};
		let pts = Mount {
			data: Some("gid=5,mode=0620".to_owned()),
			..Mount::filesystem("devpts", "dev/pts")
		};
		let proc = Mount::filesystem("proc", "proc");
		let sys = Mount::filesystem("sysfs", "sys");
		let run = Mount::filesystem("tmpfs", "run");
		let shm = Mount {
			flags: libc::MS_NOSUID | libc::MS_NODEV,
			symlink: true,
			..Mount::filesystem("tmpfs", "dev/shm")
		};
		Self {
			mounts: vec![dev, pts, proc, sys, run, shm],
		}
	}

	#[must_use]
	pub fn empty() -> Self {
		Self { mounts: Vec::new() }
	}

	/// Append a recursive bind of a host directory.
	#[must_use]
	pub fn with(mut self, mount: Mount) -> Self {
		self.mounts.push(mount);
		self
	}

	/// Append a recursive bind of a host path at the same absolute path inside the tree, so that symlinks pointing into it resolve.
	#[must_use]
	pub fn with_mirror(self, path: &Path) -> Self {
		let target = path.strip_prefix("/").unwrap_or(path).to_owned();
		self.with(Mount::bind(path, target))
	}

	pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Mount> {
		self.mounts.iter()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.mounts.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.mounts.is_empty()
	}
}

impl Default for Set {
	fn default() -> Self {
		Self::standard()
	}
}
