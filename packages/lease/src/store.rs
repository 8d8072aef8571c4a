use {
	std::{
		os::{fd::AsRawFd as _, unix::fs::OpenOptionsExt as _},
		path::{Path, PathBuf},
		sync::{Arc, Condvar, Mutex},
		time::{Duration, Instant, SystemTime},
	},
	sysroot_error::{Kind, Result, error},
};

/// How long to sleep between attempts to take a contended lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The outstanding acquirers of a tree's mounts.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Lease {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub holders: Vec<Holder>,
}

/// One outstanding acquire.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Holder {
	/// The process that owns this acquire.
	pub pid: u32,

	/// A unique, time-ordered token for this acquire.
	pub token: String,

	/// Seconds since the epoch.
	pub acquired_at: u64,
}

/// Proof that the store's exclusive lock is held. The lock is released when the guard is dropped.
pub struct Guard {
	release: Option<Box<dyn FnOnce() + Send>>,
}

/// Persistence for a tree's lease. Every read and write requires the lock to be held.
pub trait Store: Send + Sync {
	/// Take the exclusive lock, failing if it cannot be taken within `timeout`.
	fn lock(&self, timeout: Duration) -> Result<Guard>;

	/// Read the lease. An absent lease has no holders.
	fn get(&self, guard: &Guard) -> Result<Lease>;

	fn put(&self, guard: &Guard, lease: &Lease) -> Result<()>;

	fn remove(&self, guard: &Guard) -> Result<()>;

	/// Read the lease for reporting. Unlike [`Store::lock`], this must not create anything.
	fn read(&self, timeout: Duration) -> Result<Lease> {
		let guard = self.lock(timeout)?;
		self.get(&guard)
	}

	/// Add a holder and persist the lease.
	fn increment(&self, guard: &Guard, holder: Holder) -> Result<Lease> {
		let mut lease = self.get(guard)?;
		lease.holders.push(holder);
		self.put(guard, &lease)?;
		Ok(lease)
	}

	/// Remove one holder and persist the lease, removing it entirely when no holders remain. Returns `None` if there was no holder to remove.
	fn decrement(&self, guard: &Guard, pid: u32) -> Result<Option<Lease>> {
		let mut lease = self.get(guard)?;
		let Some(index) = lease.position_for_release(pid) else {
			return Ok(None);
		};
		lease.holders.remove(index);
		if lease.holders.is_empty() {
			self.remove(guard)?;
		} else {
			self.put(guard, &lease)?;
		}
		Ok(Some(lease))
	}
}

impl Lease {
	#[must_use]
	pub fn count(&self) -> usize {
		self.holders.len()
	}

	/// Holders whose process no longer exists.
	#[must_use]
	pub fn stale(&self) -> Vec<Holder> {
		self.holders
			.iter()
			.filter(|holder| !alive(holder.pid))
			.cloned()
			.collect()
	}

	/// Pick the holder a release by `pid` retires: the most recent one owned by `pid`, otherwise the most recent one whose process is gone, otherwise the most recent one.
	fn position_for_release(&self, pid: u32) -> Option<usize> {
		self.holders
			.iter()
			.rposition(|holder| holder.pid == pid)
			.or_else(|| self.holders.iter().rposition(|holder| !alive(holder.pid)))
			.or_else(|| self.holders.len().checked_sub(1))
	}
}

impl Holder {
	#[must_use]
	pub fn new(pid: u32) -> Self {
		let token = uuid::Uuid::now_v7().to_string();
		let acquired_at = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map_or(0, |duration| duration.as_secs());
		Self {
			pid,
			token,
			acquired_at,
		}
	}
}

impl Guard {
	pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
		Self {
			release: Some(Box::new(release)),
		}
	}
}

impl Drop for Guard {
	fn drop(&mut self) {
		if let Some(release) = self.release.take() {
			release();
		}
	}
}

/// Whether a process exists.
#[must_use]
pub fn alive(pid: u32) -> bool {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return false;
	};
	// Zero would address the caller's own process group.
	if pid == 0 {
		return false;
	}
	let ret = unsafe { libc::kill(pid, 0) };
	ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A lease persisted as JSON next to the tree, guarded by an `flock` on a sibling lock file.
pub struct File {
	lease: PathBuf,
	lock: PathBuf,
}

impl File {
	/// Place the lease and lock files alongside the tree, as `.<name>.lease` and `.<name>.lock` in its parent directory.
	pub fn new(tree: &Path) -> Result<Self> {
		let parent = tree
			.parent()
			.ok_or_else(|| error!(kind = Kind::InvalidArgument, %tree = tree.display(), "the tree has no parent directory"))?;
		Self::with_directory(tree, parent)
	}

	/// Place the lease and lock files in `directory`, named after the tree.
	pub fn with_directory(tree: &Path, directory: &Path) -> Result<Self> {
		let name = tree
			.file_name()
			.ok_or_else(|| error!(kind = Kind::InvalidArgument, %tree = tree.display(), "the tree has no name"))?
			.to_string_lossy();
		let lease = directory.join(format!(".{name}.lease"));
		let lock = directory.join(format!(".{name}.lock"));
		Ok(Self { lease, lock })
	}

	#[must_use]
	pub fn lease_path(&self) -> &Path {
		&self.lease
	}

	#[must_use]
	pub fn lock_path(&self) -> &Path {
		&self.lock
	}
}

impl File {
	/// Take `operation` on the lock file, polling until `timeout`.
	fn flock(&self, file: &std::fs::File, operation: libc::c_int, timeout: Duration) -> Result<()> {
		let deadline = Instant::now() + timeout;
		loop {
			let ret = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
			if ret == 0 {
				return Ok(());
			}
			let source = std::io::Error::last_os_error();
			match source.raw_os_error() {
				Some(libc::EINTR) => (),
				Some(libc::EWOULDBLOCK) if Instant::now() < deadline => {
					std::thread::sleep(LOCK_POLL_INTERVAL);
				},
				Some(libc::EWOULDBLOCK) => {
					return Err(error!(
						kind = Kind::Mount,
						%path = self.lock.display(),
						?timeout,
						"timed out waiting for the lease lock"
					));
				},
				_ => {
					return Err(error!(
						!source,
						kind = Kind::Mount,
						%path = self.lock.display(),
						"failed to lock the lock file"
					));
				},
			}
		}
	}
}

impl Store for File {
	fn lock(&self, timeout: Duration) -> Result<Guard> {
		let file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.mode(0o644)
			.open(&self.lock)
			.map_err(|source| {
				error!(!source, kind = Kind::Mount, %path = self.lock.display(), "failed to open the lock file")
			})?;
		self.flock(&file, libc::LOCK_EX, timeout)?;
		Ok(Guard::new(move || unsafe {
			libc::flock(file.as_raw_fd(), libc::LOCK_UN);
			drop(file);
		}))
	}

	fn read(&self, timeout: Duration) -> Result<Lease> {
		// The lock file is created by the first acquire. Without it there is no lease.
		let file = match std::fs::File::open(&self.lock) {
			Ok(file) => file,
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
				return Ok(Lease::default());
			},
			Err(source) => {
				return Err(error!(
					!source,
					kind = Kind::Mount,
					%path = self.lock.display(),
					"failed to open the lock file"
				));
			},
		};
		self.flock(&file, libc::LOCK_SH, timeout)?;
		let guard = Guard::new(move || unsafe {
			libc::flock(file.as_raw_fd(), libc::LOCK_UN);
			drop(file);
		});
		self.get(&guard)
	}

	fn get(&self, _guard: &Guard) -> Result<Lease> {
		let contents = match std::fs::read_to_string(&self.lease) {
			Ok(contents) => contents,
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
				return Ok(Lease::default());
			},
			Err(source) => {
				return Err(error!(
					!source,
					kind = Kind::Mount,
					%path = self.lease.display(),
					"failed to read the lease"
				));
			},
		};
		if contents.trim().is_empty() {
			return Ok(Lease::default());
		}
		serde_json::from_str(&contents).map_err(|source| {
			error!(!source, kind = Kind::Mount, %path = self.lease.display(), "the lease is corrupt")
		})
	}

	fn put(&self, _guard: &Guard, lease: &Lease) -> Result<()> {
		let contents = serde_json::to_vec_pretty(lease)
			.map_err(|source| error!(!source, "failed to serialize the lease"))?;
		let mut temp = self.lease.clone().into_os_string();
		temp.push(".tmp");
		let temp = PathBuf::from(temp);
		std::fs::write(&temp, contents)
			.and_then(|()| std::fs::rename(&temp, &self.lease))
			.map_err(|source| {
				error!(!source, kind = Kind::Mount, %path = self.lease.display(), "failed to write the lease")
			})
	}

	fn remove(&self, _guard: &Guard) -> Result<()> {
		match std::fs::remove_file(&self.lease) {
			Ok(()) => Ok(()),
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(source) => Err(error!(
				!source,
				kind = Kind::Mount,
				%path = self.lease.display(),
				"failed to remove the lease"
			)),
		}
	}
}

/// An in-process lease, for driving the manager without touching the file system.
#[derive(Clone, Default)]
pub struct Memory {
	state: Arc<(Mutex<MemoryState>, Condvar)>,
}

#[derive(Default)]
struct MemoryState {
	locked: bool,
	lease: Option<Lease>,
}

impl Memory {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Read the lease without taking the lock.
	#[must_use]
	pub fn snapshot(&self) -> Option<Lease> {
		self.state.0.lock().unwrap().lease.clone()
	}
}

impl Store for Memory {
	fn lock(&self, timeout: Duration) -> Result<Guard> {
		let (mutex, condvar) = &*self.state;
		let state = mutex.lock().unwrap();
		let (mut state, result) = condvar
			.wait_timeout_while(state, timeout, |state| state.locked)
			.unwrap();
		if result.timed_out() && state.locked {
			return Err(error!(kind = Kind::Mount, ?timeout, "timed out waiting for the lease lock"));
		}
		state.locked = true;
		let shared = self.state.clone();
		Ok(Guard::new(move || {
			let (mutex, condvar) = &*shared;
			mutex.lock().unwrap().locked = false;
			condvar.notify_all();
		}))
	}

	fn get(&self, _guard: &Guard) -> Result<Lease> {
		Ok(self.state.0.lock().unwrap().lease.clone().unwrap_or_default())
	}

	fn put(&self, _guard: &Guard, lease: &Lease) -> Result<()> {
		self.state.0.lock().unwrap().lease = Some(lease.clone());
		Ok(())
	}

	fn remove(&self, _guard: &Guard) -> Result<()> {
		self.state.0.lock().unwrap().lease = None;
		Ok(())
	}
}
