use {
	crate::{Engine, Outcome, Request, Response, normalize},
	indoc::indoc,
	std::{
		collections::BTreeSet,
		path::{Path, PathBuf},
		time::Duration,
	},
	sysroot_error::{Kind, Result, error},
	sysroot_gateway::Privileged,
	sysroot_temp::Temp,
	tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _},
};

/// The exit code reported for a build that ran past its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Creates the unprivileged user that package test suites run as.
const TEST_USER_SCRIPT: &str = indoc!(
	r"
		if ! grep -q '^tester:' /etc/passwd 2>/dev/null; then
			/usr/bin/useradd -m -d /home/tester tester
		fi
	"
);

/// Serves build requests one at a time from a line-delimited JSON stream.
pub struct Worker<P> {
	engine: Engine<P>,
	options: Options,
	state: State,
	seen: BTreeSet<u64>,
}

#[derive(Clone, Debug)]
pub struct Options {
	/// The directory relative request paths resolve against.
	pub execroot: PathBuf,

	/// The deadline for a request that does not carry one.
	pub timeout: Duration,

	/// Reset ownership of the tree's system directories after each successful build.
	pub normalize: bool,

	/// Create the `tester` user in the tree at startup.
	pub test_user: bool,

	/// Stop mount events in the tree from propagating to the host at startup.
	pub private_mounts: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
	Idle,
	Processing,
	Stopped,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			execroot: "/execroot".into(),
			timeout: Duration::from_secs(7200),
			normalize: true,
			test_user: true,
			private_mounts: true,
		}
	}
}

impl<P> Worker<P>
where
	P: Privileged,
{
	pub fn new(engine: Engine<P>, options: Options) -> Self {
		Self {
			engine,
			options,
			state: State::Idle,
			seen: BTreeSet::new(),
		}
	}

	#[must_use]
	pub fn state(&self) -> State {
		self.state
	}

	#[must_use]
	pub fn engine(&self) -> &Engine<P> {
		&self.engine
	}

	/// One time setup before the first request. Every step is best effort.
	pub async fn prepare(&self) {
		let tree = self.engine.tree();
		if self.options.private_mounts {
			if let Err(error) = sysroot_lease::System::make_private(tree) {
				tracing::warn!(error = %error.trace(), "failed to make the tree's mounts private");
			}
		}
		if self.options.test_user {
			if let Err(error) = self.create_test_user().await {
				tracing::warn!(error = %error.trace(), "failed to create the test user");
			}
		}
		tracing::info!(tree = %tree.display(), "ready");
	}

	async fn create_test_user(&self) -> Result<()> {
		let script = Temp::new().with_extension("sh");
		let log = Temp::new();
		tokio::fs::write(script.path(), TEST_USER_SCRIPT)
			.await
			.map_err(|source| error!(!source, "failed to write the script"))?;
		let outcome = self
			.engine
			.run(script.path(), log.path(), Some(Duration::from_secs(60)))
			.await?;
		if outcome != Outcome::Succeeded {
			let output = tokio::fs::read_to_string(log.path()).await.unwrap_or_default();
			return Err(error!(?outcome, %output = output.trim(), "useradd failed"));
		}
		Ok(())
	}

	/// Read requests until the end of input, answering each before reading the next. Returns an error on a protocol fault, after which the worker is stopped.
	pub async fn serve<R, W>(&mut self, reader: R, writer: W) -> Result<()>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let result = self.serve_inner(reader, writer).await;
		self.state = State::Stopped;
		match &result {
			Ok(()) => tracing::info!("end of input"),
			Err(error) => tracing::error!(error = %error.trace(), "stopping"),
		}
		result
	}

	async fn serve_inner<R, W>(&mut self, reader: R, mut writer: W) -> Result<()>
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let mut lines = tokio::io::BufReader::new(reader).lines();
		loop {
			self.state = State::Idle;
			let line = lines
				.next_line()
				.await
				.map_err(|source| error!(!source, kind = Kind::Protocol, "failed to read a request"))?;
			let Some(line) = line else {
				return Ok(());
			};
			let line = line.trim();
			if line.is_empty() {
				continue;
			}
			let request = Request::parse(line)?;
			let response = self.handle(request).await?;
			let mut frame = serde_json::to_vec(&response)
				.map_err(|source| error!(!source, "failed to serialize the response"))?;
			frame.push(b'\n');
			writer
				.write_all(&frame)
				.await
				.map_err(|source| error!(!source, "failed to write the response"))?;
			writer
				.flush()
				.await
				.map_err(|source| error!(!source, "failed to flush the response"))?;
		}
	}

	/// Process one request. Only protocol faults are errors; build failures are responses.
	#[tracing::instrument(level = "info", skip_all, fields(request = request.request_id))]
	pub async fn handle(&mut self, request: Request) -> Result<Response> {
		let id = request.request_id;
		if id != 0 && !self.seen.insert(id) {
			return Err(error!(kind = Kind::Protocol, %id, "the request id was already used"));
		}
		let arguments = request.parse_arguments()?;
		self.state = State::Processing;

		let script = self.resolve(&arguments.script);
		let marker = self.resolve(&arguments.done);
		let log = self.resolve(&arguments.log);
		let timeout = request
			.timeout
			.map_or(self.options.timeout, Duration::from_secs);

		match tokio::fs::remove_file(&marker).await {
			Ok(()) => tracing::debug!(marker = %marker.display(), "removed a stale marker"),
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => (),
			Err(source) => {
				let error = error!(!source, %marker = marker.display(), "failed to remove the stale marker");
				return Ok(Response::new(id, 1).with_output(error.trace().to_string()));
			},
		}

		let outcome = match self.engine.run(&script, &log, Some(timeout)).await {
			Ok(outcome) => outcome,
			Err(error) => {
				tracing::error!(error = %error.trace(), "the build could not run");
				return Ok(Response::new(id, 1).with_output(error.trace().to_string()));
			},
		};

		let response = match outcome {
			Outcome::Succeeded => {
				if self.options.normalize {
					self.normalize().await;
				}
				if let Err(error) = touch(&marker).await {
					return Ok(Response::new(id, 1).with_output(error.trace().to_string()));
				}
				tracing::info!(marker = %marker.display(), "the build succeeded");
				Response::new(id, 0)
			},
			Outcome::Failed { code } => {
				let output = format!(
					"the build script exited with code {code}, see {}",
					log.display()
				);
				Response::new(id, code).with_output(output)
			},
			Outcome::TimedOut { timeout } => {
				let output = format!("BUILD TIMEOUT: Exceeded {} seconds", timeout.as_secs());
				Response::new(id, TIMEOUT_EXIT_CODE).with_output(output)
			},
		};
		Ok(response)
	}

	/// Drop every lease on the tree and unmount it. Run when the worker is told to stop.
	pub async fn shutdown(&mut self) -> Result<()> {
		self.state = State::Stopped;
		self.engine.reclaim().await
	}

	fn resolve(&self, path: &Path) -> PathBuf {
		if path.is_absolute() {
			path.to_owned()
		} else {
			self.options.execroot.join(path)
		}
	}

	async fn normalize(&self) {
		let tree = self.engine.tree().to_owned();
		let result = tokio::task::spawn_blocking(move || normalize::normalize_ownership(&tree)).await;
		match result {
			Ok(normalized) if normalized.failed == 0 => {
				tracing::debug!(changed = normalized.changed, "normalized ownership");
			},
			Ok(normalized) => tracing::warn!(
				changed = normalized.changed,
				failed = normalized.failed,
				"some entries kept their owner"
			),
			Err(error) => tracing::warn!(%error, "failed to normalize ownership"),
		}
	}
}

async fn touch(path: &Path) -> Result<()> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await.map_err(
			|source| error!(!source, %path = parent.display(), "failed to create the marker's directory"),
		)?;
	}
	tokio::fs::OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.await
		.map_err(|source| error!(!source, %path = path.display(), "failed to create the marker"))?;
	Ok(())
}
