use std::path::Path;

/// The longest command name the kernel records for a process.
const COMM_LENGTH: usize = 15;

/// How many ancestors to look through.
const MAX_DEPTH: usize = 16;

/// The process that asked for an operation. This is the gateway's parent, unless the parent is one of the `elevation` programs, in which case it is the first ancestor that is not.
#[must_use]
pub fn caller(elevation: &[&str]) -> u32 {
	let parent = std::os::unix::process::parent_id();
	if parent == 0 {
		return std::process::id();
	}
	caller_from(parent, elevation)
}

fn caller_from(mut pid: u32, elevation: &[&str]) -> u32 {
	for _ in 0..MAX_DEPTH {
		let Some((comm, ppid)) = stat(pid) else {
			break;
		};
		let elevated = elevation.iter().any(|program| comm == command_name(program));
		if !elevated || ppid == 0 {
			break;
		}
		tracing::debug!(pid, comm, ppid, "skipping the elevation program");
		pid = ppid;
	}
	pid
}

/// The name the kernel would record for a program.
fn command_name(program: &str) -> &str {
	let name = Path::new(program)
		.file_name()
		.and_then(|name| name.to_str())
		.unwrap_or(program);
	let mut end = name.len().min(COMM_LENGTH);
	while !name.is_char_boundary(end) {
		end -= 1;
	}
	&name[..end]
}

fn stat(pid: u32) -> Option<(String, u32)> {
	let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
	parse_stat(&contents)
}

/// Read the command name and parent pid from a `/proc/<pid>/stat` line. The name is parenthesized and may itself contain parentheses and spaces.
fn parse_stat(contents: &str) -> Option<(String, u32)> {
	let open = contents.find('(')?;
	let close = contents.rfind(')')?;
	let comm = contents.get(open + 1..close)?.to_owned();
	let ppid = contents
		.get(close + 1..)?
		.split_whitespace()
		.nth(1)?
		.parse()
		.ok()?;
	Some((comm, ppid))
}
