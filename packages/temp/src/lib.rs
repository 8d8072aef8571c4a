use std::path::{Path, PathBuf};

/// A path in the system temp directory that is removed when dropped.
pub struct Temp {
	path: PathBuf,
	preserve: bool,
}

impl Temp {
	#[must_use]
	pub fn new() -> Self {
		Self::new_in(std::env::temp_dir())
	}

	#[must_use]
	pub fn new_in(parent: impl AsRef<Path>) -> Self {
		const ENCODING: data_encoding::Encoding = data_encoding_macro::new_encoding! {
			symbols: "0123456789abcdefghjkmnpqrstvwxyz",
		};
		let id = uuid::Uuid::now_v7();
		let id = ENCODING.encode(&id.into_bytes());
		let path = parent.as_ref().join(id);
		let preserve = std::env::var_os("SYSROOT_PRESERVE_TEMP").is_some();
		Self { path, preserve }
	}

	#[must_use]
	pub fn with_extension(mut self, extension: &str) -> Self {
		self.path.set_extension(extension);
		self
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl AsRef<Path> for Temp {
	fn as_ref(&self) -> &Path {
		self.path()
	}
}

impl Default for Temp {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for Temp {
	fn drop(&mut self) {
		if self.preserve {
			return;
		}
		std::fs::remove_file(&self.path)
			.or_else(|_| std::fs::remove_dir_all(&self.path))
			.ok();
	}
}
