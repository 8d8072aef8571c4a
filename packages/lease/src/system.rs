use {
	crate::{Mount, Mounter, Unmount},
	std::{
		collections::BTreeSet,
		ffi::CString,
		os::unix::ffi::OsStrExt as _,
		path::{Path, PathBuf},
	},
	sysroot_error::{Kind, Result, error},
};

/// Mounts with the host kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct System;

impl System {
	#[must_use]
	pub fn new() -> Self {
		Self
	}

	/// Stop mount events under `tree` from propagating back to the host.
	pub fn make_private(tree: &Path) -> Result<()> {
		let target = cstring(tree)?;
		let ret = unsafe {
			libc::mount(
				std::ptr::null(),
				target.as_ptr(),
				std::ptr::null(),
				libc::MS_REC | libc::MS_PRIVATE,
				std::ptr::null(),
			)
		};
		if ret != 0 {
			let source = std::io::Error::last_os_error();
			return Err(error!(
				!source,
				kind = Kind::Mount,
				%tree = tree.display(),
				"failed to make the tree's mounts private"
			));
		}
		Ok(())
	}
}

impl Mounter for System {
	fn mountpoints(&self) -> Result<BTreeSet<PathBuf>> {
		let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")
			.map_err(|source| error!(!source, kind = Kind::Mount, "failed to read the mount table"))?;
		Ok(parse_mountinfo(&mountinfo))
	}

	fn mount(&self, mount: &Mount, target: &Path) -> Result<()> {
		let source = cstring(&mount.source)?;
		let target_ = cstring(target)?;
		let fstype = mount
			.fstype
			.as_deref()
			.map(CString::new)
			.transpose()
			.map_err(|source| error!(!source, kind = Kind::InvalidArgument, "invalid file system type"))?;
		let data = mount
			.data
			.as_deref()
			.map(CString::new)
			.transpose()
			.map_err(|source| error!(!source, kind = Kind::InvalidArgument, "invalid mount options"))?;
		let ret = unsafe {
			libc::mount(
				source.as_ptr(),
				target_.as_ptr(),
				fstype.as_ref().map_or(std::ptr::null(), |fstype| fstype.as_ptr()),
				mount.flags,
				data.as_ref()
					.map_or(std::ptr::null(), |data| data.as_ptr().cast()),
			)
		};
		if ret != 0 {
			let source = std::io::Error::last_os_error();
			return Err(error!(
				!source,
				kind = Kind::Mount,
				%target = target.display(),
				"failed to mount"
			));
		}
		Ok(())
	}

	fn unmount(&self, target: &Path) -> Result<Unmount> {
		let target_ = cstring(target)?;
		let ret = unsafe { libc::umount2(target_.as_ptr(), 0) };
		if ret == 0 {
			return Ok(Unmount::Unmounted);
		}
		let source = std::io::Error::last_os_error();
		if source.raw_os_error() != Some(libc::EBUSY) {
			return Err(error!(
				!source,
				kind = Kind::Mount,
				%target = target.display(),
				"failed to unmount"
			));
		}
		tracing::warn!(path = %target.display(), "the mount is busy, detaching it");
		let ret = unsafe { libc::umount2(target_.as_ptr(), libc::MNT_DETACH) };
		if ret != 0 {
			let source = std::io::Error::last_os_error();
			return Err(error!(
				!source,
				kind = Kind::Mount,
				%target = target.display(),
				"failed to detach the mount"
			));
		}
		Ok(Unmount::Detached)
	}
}

fn cstring(path: &Path) -> Result<CString> {
	CString::new(path.as_os_str().as_bytes())
		.map_err(|source| error!(!source, kind = Kind::InvalidArgument, %path = path.display(), "invalid path"))
}

/// Collect the mount points from a `/proc/<pid>/mountinfo` table.
#[must_use]
pub fn parse_mountinfo(mountinfo: &str) -> BTreeSet<PathBuf> {
	mountinfo
		.lines()
		.filter_map(|line| line.split(' ').nth(4))
		.map(|field| PathBuf::from(unescape(field)))
		.collect()
}

/// Decode the octal escapes the kernel uses for whitespace and backslashes.
fn unescape(field: &str) -> String {
	let bytes = field.as_bytes();
	let mut output = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'\\'
			&& i + 3 < bytes.len()
			&& bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
		{
			let value = bytes[i + 1..i + 4]
				.iter()
				.fold(0u32, |value, b| value * 8 + u32::from(b - b'0'));
			if let Ok(byte) = u8::try_from(value) {
				output.push(byte);
				i += 4;
				continue;
			}
		}
		output.push(bytes[i]);
		i += 1;
	}
	String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
	use {super::parse_mountinfo, indoc::indoc, std::path::PathBuf};

	#[test]
	fn mountinfo() {
		let mountinfo = indoc!(
			r"
			22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
			41 22 0:5 / /mnt/lfs/dev rw,nosuid master:2 - devtmpfs udev rw
			42 41 0:24 / /mnt/lfs/dev/pts rw,relatime - devpts devpts rw,gid=5,mode=620
			43 22 0:40 / /mnt/my\040tree/proc rw - proc proc rw
			"
		);
		let mountpoints = parse_mountinfo(mountinfo);
		assert_eq!(mountpoints.len(), 4);
		assert!(mountpoints.contains(&PathBuf::from("/mnt/lfs/dev/pts")));
		assert!(mountpoints.contains(&PathBuf::from("/mnt/my tree/proc")));
	}
}
