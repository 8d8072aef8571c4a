use {
	std::{
		path::{Path, PathBuf},
		sync::Arc,
		time::Duration,
	},
	sysroot_error::{Kind, Result, error},
	sysroot_lease::{self as lease, Manager, Mounter},
	sysroot_sandbox::{Executor, Stdio},
};

pub use self::{
	caller::caller,
	operation::Operation,
	privileged::{Elevated, InProcess, Privileged},
};

mod caller;
mod exec;
pub mod operation;
mod privileged;
mod stage;
#[cfg(test)]
mod tests;

/// Performs the privileged operations on a tree after validating their arguments.
pub struct Gateway<E> {
	executor: E,
	mounter: Arc<dyn Mounter>,
	options: Options,
}

#[derive(Clone, Debug)]
pub struct Options {
	/// The owner recorded for a mount or release that does not name one.
	pub owner: u32,

	pub lock_timeout: Duration,

	/// Keep lease and lock files here instead of next to the tree.
	pub lease_directory: Option<PathBuf>,

	pub mounts: lease::Set,

	/// The shell that runs staged scripts, as seen from inside the tree.
	pub shell: PathBuf,
}

/// What an operation did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
	Mounted { count: usize },
	Released(lease::Release),
	Reclaimed(lease::Reclaim),
	Checked(lease::Report),
	Executed,
	Staged(Vec<PathBuf>),
}

impl Default for Options {
	fn default() -> Self {
		Self {
			owner: std::process::id(),
			lock_timeout: Duration::from_secs(10),
			lease_directory: None,
			mounts: lease::Set::standard(),
			shell: "/usr/bin/bash".into(),
		}
	}
}

impl<E> Gateway<E>
where
	E: Executor,
{
	pub fn new(executor: E, mounter: Arc<dyn Mounter>, options: Options) -> Self {
		Self {
			executor,
			mounter,
			options,
		}
	}

	#[must_use]
	pub fn options(&self) -> &Options {
		&self.options
	}

	/// Validate and perform an operation. Output from `exec` goes to `stdio`.
	#[tracing::instrument(level = "info", skip_all, fields(operation = operation.name(), tree = %operation.tree().display()))]
	pub async fn run(&self, operation: Operation, stdio: Stdio) -> Result<Output> {
		match operation {
			Operation::Mount(operation::Mount { tree, owner }) => {
				let manager = self.manager(&tree)?;
				let owner = owner.unwrap_or(self.options.owner);
				let lease = blocking(move || manager.acquire(owner)).await?;
				Ok(Output::Mounted {
					count: lease.count(),
				})
			},
			Operation::Release(operation::Release {
				tree,
				owner,
				keep_mounts,
			}) => {
				let manager = self.manager(&tree)?;
				let owner = owner.unwrap_or(self.options.owner);
				let release = blocking(move || manager.release(owner, keep_mounts)).await?;
				Ok(Output::Released(release))
			},
			Operation::Unmount(operation::Unmount { tree, force }) => {
				let manager = self.manager(&tree)?;
				let reclaim = blocking(move || manager.reclaim(force)).await?;
				Ok(Output::Reclaimed(reclaim))
			},
			Operation::Check(operation::Check { tree }) => {
				let report = self.check(&tree).await?;
				if !report.is_ok() {
					let missing = report
						.missing
						.iter()
						.map(|path| path.display().to_string())
						.collect::<Vec<_>>()
						.join(", ");
					return Err(error!(
						kind = Kind::Validation,
						%missing,
						"the tree is not mounted"
					));
				}
				Ok(Output::Checked(report))
			},
			Operation::Exec(operation::Exec {
				tree,
				script,
				timeout,
			}) => {
				self.exec(&tree, &script, timeout, stdio).await?;
				Ok(Output::Executed)
			},
			Operation::Stage(operation::Stage {
				tree,
				destination,
				sources,
			}) => {
				let staged = self.stage(&tree, &destination, &sources).await?;
				Ok(Output::Staged(staged))
			},
		}
	}

	/// Report which mounts are missing from the tree.
	pub async fn check(&self, tree: &Path) -> Result<lease::Report> {
		let manager = self.manager(tree)?;
		blocking(move || manager.check()).await
	}

	/// Validate the tree and build a lease manager for it.
	pub fn manager(&self, tree: &Path) -> Result<Manager> {
		let tree = validate_tree(tree)?;
		let options = lease::Options {
			lock_timeout: self.options.lock_timeout,
			mounts: self.options.mounts.clone(),
		};
		let store = match &self.options.lease_directory {
			Some(directory) => lease::store::File::with_directory(&tree, directory)?,
			None => lease::store::File::new(&tree)?,
		};
		Ok(Manager::new(
			tree,
			Arc::new(store),
			self.mounter.clone(),
			options,
		))
	}
}

/// Check that a tree is an absolute path to an existing directory, and return its canonical form.
pub fn validate_tree(tree: &Path) -> Result<PathBuf> {
	if !tree.is_absolute() {
		return Err(error!(
			kind = Kind::InvalidArgument,
			%tree = tree.display(),
			"the tree must be an absolute path"
		));
	}
	let metadata = std::fs::metadata(tree).map_err(|source| {
		error!(!source, kind = Kind::InvalidArgument, %tree = tree.display(), "the tree does not exist")
	})?;
	if !metadata.is_dir() {
		return Err(error!(
			kind = Kind::InvalidArgument,
			%tree = tree.display(),
			"the tree is not a directory"
		));
	}
	let tree = tree.canonicalize().map_err(|source| {
		error!(!source, kind = Kind::InvalidArgument, %tree = tree.display(), "failed to canonicalize the tree")
	})?;
	if !tree.join("usr").is_dir() {
		tracing::warn!(tree = %tree.display(), "the tree has no usr directory, is this the right path?");
	}
	Ok(tree)
}

/// Create `relative` inside the tree one component at a time, refusing any existing component that resolves outside it. Returns the canonical directory.
async fn create_dir_within(tree: &Path, relative: &Path) -> Result<PathBuf> {
	let mut directory = tree.to_owned();
	for component in relative.components() {
		let std::path::Component::Normal(name) = component else {
			continue;
		};
		directory.push(name);
		match tokio::fs::symlink_metadata(&directory).await {
			Ok(_) => {
				let canonical = tokio::fs::canonicalize(&directory).await.map_err(|source| {
					error!(!source, %directory = directory.display(), "failed to canonicalize the directory")
				})?;
				if !canonical.starts_with(tree) {
					return Err(error!(
						kind = Kind::InvalidArgument,
						%directory = directory.display(),
						%target = canonical.display(),
						"the directory resolves outside the tree"
					));
				}
				directory = canonical;
			},
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
				tokio::fs::create_dir(&directory).await.map_err(|source| {
					error!(!source, %directory = directory.display(), "failed to create the directory")
				})?;
			},
			Err(source) => {
				return Err(error!(
					!source,
					%directory = directory.display(),
					"failed to get the metadata"
				));
			},
		}
	}
	Ok(directory)
}

/// Check that a caller supplied file is an absolute path to an existing regular file.
fn validate_file(path: &Path) -> Result<()> {
	if !path.is_absolute() {
		return Err(error!(
			kind = Kind::InvalidArgument,
			%path = path.display(),
			"the path must be absolute"
		));
	}
	if !path.is_file() {
		return Err(error!(
			kind = Kind::InvalidArgument,
			%path = path.display(),
			"the path is not an existing file"
		));
	}
	Ok(())
}

async fn blocking<T>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T>
where
	T: Send + 'static,
{
	tokio::task::spawn_blocking(f)
		.await
		.map_err(|source| error!(!source, "the task panicked"))?
}
