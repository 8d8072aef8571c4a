use {
	self::store::{Holder, Lease, Store, alive},
	std::{
		collections::BTreeSet,
		os::unix::fs::PermissionsExt as _,
		path::{Path, PathBuf},
		sync::Arc,
		time::Duration,
	},
	sysroot_error::{Kind, Result, error},
};

pub use self::{
	mount::{Mount, Set},
	simulated::Simulated,
	system::System,
};

pub mod mount;
pub mod simulated;
pub mod store;
pub mod system;


/// Mounts and unmounts a tree's kernel file systems on behalf of any number of concurrent holders.
#[derive(Clone)]
pub struct Manager {
	tree: PathBuf,
	options: Options,
	store: Arc<dyn Store>,
	mounter: Arc<dyn Mounter>,
}

#[derive(Clone, Debug)]
pub struct Options {
	/// How long to wait for the lease lock before failing.
	pub lock_timeout: Duration,

	pub mounts: Set,
}

/// Mounts and unmounts file systems and reports what is mounted.
pub trait Mounter: Send + Sync {
	/// The current mount points, read fresh on every call.
	fn mountpoints(&self) -> Result<BTreeSet<PathBuf>>;

	fn mount(&self, mount: &Mount, target: &Path) -> Result<()>;

	fn unmount(&self, target: &Path) -> Result<Unmount>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unmount {
	Unmounted,

	/// The target was busy and was lazily detached.
	Detached,
}

/// The outcome of a release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
	/// There was no outstanding acquire, so nothing changed.
	Inactive,

	/// Other holders remain, so the mounts stay.
	Held { count: usize },

	/// The last holder released and asked for the mounts to be left standing.
	Kept,

	/// The last holder released and the mounts were removed.
	Unmounted,
}

/// The result of a check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
	/// Mount points that are neither mounted nor an acceptable symlink.
	pub missing: Vec<PathBuf>,

	/// The number of outstanding holders.
	pub count: usize,

	/// Holders whose process no longer exists.
	pub stale: Vec<Holder>,
}

/// The result of a reclaim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reclaim {
	/// The number of dead holders dropped from the lease.
	pub stale: usize,

	/// The number of live holders still in the lease.
	pub remaining: usize,

	pub unmounted: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			lock_timeout: Duration::from_secs(10),
			mounts: Set::standard(),
		}
	}
}

impl Report {
	#[must_use]
	pub fn is_ok(&self) -> bool {
		self.missing.is_empty()
	}
}

impl Manager {
	pub fn new(
		tree: impl Into<PathBuf>,
		store: Arc<dyn Store>,
		mounter: Arc<dyn Mounter>,
		options: Options,
	) -> Self {
		Self {
			tree: tree.into(),
			options,
			store,
			mounter,
		}
	}

	/// A manager that mounts with the host kernel and keeps its lease in files next to the tree, or in `directory` if given.
	pub fn system(tree: &Path, directory: Option<&Path>, options: Options) -> Result<Self> {
		let store = match directory {
			Some(directory) => store::File::with_directory(tree, directory)?,
			None => store::File::new(tree)?,
		};
		Ok(Self::new(tree, Arc::new(store), Arc::new(System::new()), options))
	}

	#[must_use]
	pub fn tree(&self) -> &Path {
		&self.tree
	}

	#[must_use]
	pub fn mounts(&self) -> &Set {
		&self.options.mounts
	}

	/// Ensure every mount is present and add a holder for `owner`.
	#[tracing::instrument(level = "debug", skip(self), fields(tree = %self.tree.display()))]
	pub fn acquire(&self, owner: u32) -> Result<Lease> {
		let guard = self.store.lock(self.options.lock_timeout)?;
		let lease = self.store.get(&guard)?;
		if lease.count() == 0 {
			tracing::debug!("first holder, mounting");
		}
		self.mount_all()?;
		let lease = self.store.increment(&guard, Holder::new(owner))?;
		tracing::info!(count = lease.count(), "acquired the lease");
		Ok(lease)
	}

	/// Remove a holder. When the last one leaves, unmount everything unless `keep_mounts` is set.
	#[tracing::instrument(level = "debug", skip(self), fields(tree = %self.tree.display()))]
	pub fn release(&self, owner: u32, keep_mounts: bool) -> Result<Release> {
		let guard = self.store.lock(self.options.lock_timeout)?;
		let Some(lease) = self.store.decrement(&guard, owner)? else {
			tracing::debug!("no active lease, nothing to release");
			return Ok(Release::Inactive);
		};
		let count = lease.count();
		if count > 0 {
			tracing::info!(count, "released the lease, mounts remain for other holders");
			return Ok(Release::Held { count });
		}
		if keep_mounts {
			tracing::info!("released the last holder, keeping the mounts");
			return Ok(Release::Kept);
		}
		self.unmount_all()?;
		tracing::info!("released the last holder and unmounted");
		Ok(Release::Unmounted)
	}

	/// Report which mounts are missing, without changing anything.
	pub fn check(&self) -> Result<Report> {
		let lease = self.store.read(self.options.lock_timeout)?;
		let mountpoints = self.mounter.mountpoints()?;
		let missing = self
			.options
			.mounts
			.iter()
			.map(|mount| (mount, mount.target_in(&self.tree)))
			.filter(|(mount, target)| {
				!(mountpoints.contains(target) || (mount.symlink && is_symlink(target)))
			})
			.map(|(_, target)| target)
			.collect();
		Ok(Report {
			missing,
			count: lease.count(),
			stale: lease.stale(),
		})
	}

	/// Drop holders whose process is gone. If no live holders remain, or `force` is set, unmount everything and delete the lease.
	#[tracing::instrument(level = "debug", skip(self), fields(tree = %self.tree.display()))]
	pub fn reclaim(&self, force: bool) -> Result<Reclaim> {
		let guard = self.store.lock(self.options.lock_timeout)?;
		let mut lease = self.store.get(&guard)?;
		let before = lease.count();
		lease.holders.retain(|holder| alive(holder.pid));
		let stale = before - lease.count();
		if stale > 0 {
			tracing::warn!(stale, "dropping holders whose process no longer exists");
		}
		if !lease.holders.is_empty() && !force {
			self.store.put(&guard, &lease)?;
			return Ok(Reclaim {
				stale,
				remaining: lease.count(),
				unmounted: false,
			});
		}
		if !lease.holders.is_empty() {
			tracing::warn!(count = lease.count(), "forcibly dropping live holders");
		}
		self.store.remove(&guard)?;
		self.unmount_all()?;
		Ok(Reclaim {
			stale,
			remaining: 0,
			unmounted: true,
		})
	}

	fn mount_all(&self) -> Result<()> {
		let mountpoints = self.mounter.mountpoints()?;
		for mount in self.options.mounts.iter() {
			let target = mount.target_in(&self.tree);
			if mountpoints.contains(&target) {
				tracing::debug!(path = %target.display(), "already mounted");
				continue;
			}
			if mount.symlink && is_symlink(&target) {
				self.prepare_symlink(&target)?;
				continue;
			}
			std::fs::create_dir_all(&target).map_err(|source| {
				error!(!source, kind = Kind::Mount, %target = target.display(), "failed to create the mount point")
			})?;
			self.mounter.mount(mount, &target)?;
			tracing::debug!(path = %target.display(), "mounted");
		}
		Ok(())
	}

	/// Create the directory a symlinked mount point refers to, inside the tree.
	fn prepare_symlink(&self, target: &Path) -> Result<()> {
		let link = std::fs::read_link(target).map_err(
			|source| error!(!source, kind = Kind::Mount, %target = target.display(), "failed to read the symlink"),
		)?;
		let directory = match link.strip_prefix("/") {
			Ok(path) => self.tree.join(path),
			Err(_) => target.parent().unwrap_or(&self.tree).join(link),
		};
		std::fs::create_dir_all(&directory)
			.and_then(|()| {
				std::fs::set_permissions(&directory, std::fs::Permissions::from_mode(0o1777))
			})
			.map_err(|source| {
				error!(!source, kind = Kind::Mount, %directory = directory.display(), "failed to create the symlink's target")
			})?;
		tracing::debug!(path = %target.display(), "the mount point is a symlink");
		Ok(())
	}

	/// Unmount in reverse order, skipping symlinks and entries that are not mounted. Every entry is attempted and the first failure is returned.
	fn unmount_all(&self) -> Result<()> {
		let mountpoints = self.mounter.mountpoints()?;
		let mut result = Ok(());
		for mount in self.options.mounts.iter().rev() {
			let target = mount.target_in(&self.tree);
			if !mountpoints.contains(&target) {
				continue;
			}
			match self.mounter.unmount(&target) {
				Ok(Unmount::Unmounted) => {
					tracing::debug!(path = %target.display(), "unmounted");
				},
				Ok(Unmount::Detached) => {
					tracing::debug!(path = %target.display(), "detached");
				},
				Err(error) => {
					tracing::error!(path = %target.display(), error = %error.trace(), "failed to unmount");
					if result.is_ok() {
						result = Err(error);
					}
				},
			}
		}
		result
	}
}

fn is_symlink(path: &Path) -> bool {
	std::fs::symlink_metadata(path).is_ok_and(|metadata| metadata.file_type().is_symlink())
}
