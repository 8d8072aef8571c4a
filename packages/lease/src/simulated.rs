use {
	crate::{Mount, Mounter, Unmount},
	std::{
		collections::BTreeSet,
		path::{Path, PathBuf},
		sync::{Arc, Mutex},
	},
	sysroot_error::{Kind, Result, error},
};

/// A mounter that only records what it was asked to do. Used to exercise lease accounting without privileges.
#[derive(Clone, Debug, Default)]
pub struct Simulated {
	state: Arc<Mutex<State>>,
}

#[derive(Clone, Debug, Default)]
pub struct State {
	pub mounted: BTreeSet<PathBuf>,
	pub mounts: usize,
	pub unmounts: usize,

	/// Mount points whose mount fails.
	pub failing: BTreeSet<PathBuf>,

	/// Mount points that report busy and must be detached.
	pub busy: BTreeSet<PathBuf>,
}

impl Simulated {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn state(&self) -> State {
		self.state.lock().unwrap().clone()
	}

	pub fn fail(&self, target: impl Into<PathBuf>) {
		self.state.lock().unwrap().failing.insert(target.into());
	}

	pub fn busy(&self, target: impl Into<PathBuf>) {
		self.state.lock().unwrap().busy.insert(target.into());
	}

	#[must_use]
	pub fn is_mounted(&self, target: &Path) -> bool {
		self.state.lock().unwrap().mounted.contains(target)
	}
}

impl Mounter for Simulated {
	fn mountpoints(&self) -> Result<BTreeSet<PathBuf>> {
		Ok(self.state.lock().unwrap().mounted.clone())
	}

	fn mount(&self, _mount: &Mount, target: &Path) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		if state.failing.contains(target) {
			return Err(error!(kind = Kind::Mount, %target = target.display(), "failed to mount"));
		}
		if !state.mounted.insert(target.to_owned()) {
			return Err(error!(kind = Kind::Mount, %target = target.display(), "already mounted"));
		}
		state.mounts += 1;
		Ok(())
	}

	fn unmount(&self, target: &Path) -> Result<Unmount> {
		let mut state = self.state.lock().unwrap();
		if !state.mounted.remove(target) {
			return Err(error!(kind = Kind::Mount, %target = target.display(), "not mounted"));
		}
		state.unmounts += 1;
		if state.busy.contains(target) {
			Ok(Unmount::Detached)
		} else {
			Ok(Unmount::Unmounted)
		}
	}
}
