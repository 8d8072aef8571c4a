use std::path::{Path, PathBuf};

/// The directories whose ownership is reset after each successful build.
pub const DIRECTORIES: [&str; 7] = ["usr", "etc", "var", "lib", "lib64", "bin", "sbin"];

/// What an ownership pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Normalized {
	pub changed: usize,

	/// Entries that could not be changed or directories that could not be listed. Each one is logged and skipped.
	pub failed: usize,
}

/// Recursively change the owner of the tree's system directories to `root:root`.
pub fn normalize_ownership(tree: &Path) -> Normalized {
	change_ownership(tree, 0, 0)
}

/// Recursively change the owner of the tree's system directories, without following symlinks.
pub fn change_ownership(tree: &Path, uid: u32, gid: u32) -> Normalized {
	let mut normalized = Normalized::default();
	let mut stack = DIRECTORIES
		.iter()
		.map(|name| tree.join(name))
		.filter(|path| path.symlink_metadata().is_ok_and(|metadata| metadata.is_dir()))
		.collect::<Vec<PathBuf>>();
	while let Some(path) = stack.pop() {
		match std::os::unix::fs::lchown(&path, Some(uid), Some(gid)) {
			Ok(()) => normalized.changed += 1,
			Err(error) => {
				tracing::warn!(path = %path.display(), %error, "failed to change the owner");
				normalized.failed += 1;
			},
		}
		if !path.symlink_metadata().is_ok_and(|metadata| metadata.is_dir()) {
			continue;
		}
		let entries = match std::fs::read_dir(&path) {
			Ok(entries) => entries,
			Err(error) => {
				tracing::warn!(path = %path.display(), %error, "failed to read the directory");
				normalized.failed += 1;
				continue;
			},
		};
		for entry in entries {
			match entry {
				Ok(entry) => stack.push(entry.path()),
				Err(error) => {
					tracing::warn!(path = %path.display(), %error, "failed to read the directory entry");
					normalized.failed += 1;
				},
			}
		}
	}
	normalized
}

#[cfg(test)]
mod tests {
	use {
		super::{Normalized, change_ownership},
		pretty_assertions::assert_eq,
		std::os::unix::fs::{MetadataExt as _, PermissionsExt as _},
		sysroot_temp::Temp,
	};

	#[test]
	fn symlinks_are_changed_but_not_followed() {
		let temp = Temp::new();
		let tree = temp.path().join("lfs");
		let outside = temp.path().join("outside");
		std::fs::create_dir_all(tree.join("usr/lib")).unwrap();
		std::fs::create_dir_all(tree.join("home/tester")).unwrap();
		std::fs::create_dir_all(&outside).unwrap();
		std::fs::write(tree.join("usr/lib/libc.so"), "").unwrap();
		std::fs::write(outside.join("a"), "").unwrap();
		std::fs::write(outside.join("b"), "").unwrap();
		std::os::unix::fs::symlink(&outside, tree.join("usr/outside")).unwrap();
		std::os::unix::fs::symlink("usr/lib", tree.join("lib")).unwrap();

		let metadata = tree.join("usr").metadata().unwrap();
		let normalized = change_ownership(&tree, metadata.uid(), metadata.gid());

		// usr, usr/lib, usr/lib/libc.so, and the usr/outside link itself.
		assert_eq!(
			normalized,
			Normalized {
				changed: 4,
				failed: 0,
			}
		);
	}

	#[test]
	fn failures_are_skipped() {
		let temp = Temp::new();
		let tree = temp.path().join("lfs");
		std::fs::create_dir_all(tree.join("usr/locked")).unwrap();
		std::fs::create_dir_all(tree.join("etc")).unwrap();
		std::fs::write(tree.join("usr/locked/x"), "").unwrap();
		std::fs::write(tree.join("etc/passwd"), "").unwrap();
		let locked = tree.join("usr/locked");
		std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

		let metadata = tree.join("usr").metadata().unwrap();
		let normalized = change_ownership(&tree, metadata.uid(), metadata.gid());
		std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

		// Without privileges the locked directory cannot be listed, but the walk still reaches etc.
		assert_eq!(normalized.changed + normalized.failed, 5);
		assert!(normalized.changed >= 4);
	}
}
