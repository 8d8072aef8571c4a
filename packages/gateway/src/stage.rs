use {
	crate::{Gateway, create_dir_within, validate_file, validate_tree},
	std::path::{Component, Path, PathBuf},
	sysroot_error::{Kind, Result, error},
	sysroot_sandbox::Executor,
};

impl<E> Gateway<E>
where
	E: Executor,
{
	/// Copy host files into `destination` inside the tree, creating it if needed. Returns the staged paths.
	pub async fn stage(
		&self,
		tree: &Path,
		destination: &Path,
		sources: &[PathBuf],
	) -> Result<Vec<PathBuf>> {
		validate_destination(destination)?;
		if sources.is_empty() {
			return Err(error!(kind = Kind::InvalidArgument, "no files to stage"));
		}
		for source in sources {
			validate_file(source)?;
		}
		let tree = validate_tree(tree)?;

		let directory = create_dir_within(&tree, destination).await?;
		let mut staged = Vec::with_capacity(sources.len());
		for source in sources {
			let name = source.file_name().ok_or_else(|| {
				error!(kind = Kind::InvalidArgument, %source = source.display(), "the source has no file name")
			})?;
			let target = directory.join(name);
			if tokio::fs::symlink_metadata(&target)
				.await
				.is_ok_and(|metadata| metadata.is_symlink())
			{
				tokio::fs::remove_file(&target).await.map_err(|source| {
					error!(!source, %target = target.display(), "failed to replace the symlink")
				})?;
			}
			tokio::fs::copy(source, &target).await.map_err(|error| {
				error!(
					!error,
					%source = source.display(),
					%target = target.display(),
					"failed to copy the file"
				)
			})?;
			tracing::debug!(source = %source.display(), target = %target.display(), "staged");
			staged.push(target);
		}
		Ok(staged)
	}
}

/// A destination must be relative and must not climb out of the tree.
fn validate_destination(destination: &Path) -> Result<()> {
	for component in destination.components() {
		match component {
			Component::ParentDir => {
				return Err(error!(
					kind = Kind::InvalidArgument,
					%destination = destination.display(),
					"the destination must not contain '..'"
				));
			},
			Component::RootDir | Component::Prefix(_) => {
				return Err(error!(
					kind = Kind::InvalidArgument,
					%destination = destination.display(),
					"the destination must be relative to the tree"
				));
			},
			Component::CurDir | Component::Normal(_) => (),
		}
	}
	Ok(())
}
