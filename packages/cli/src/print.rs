use {
	crate::Cli,
	anstream::{eprintln, println},
	crossterm::style::Stylize as _,
	sysroot_error::Error,
	sysroot_gateway::Output,
	sysroot_lease::Release,
};

impl Cli {
	pub fn print_error(error: &Error) {
		for error in error.chain() {
			eprintln!("{} {}", "->".red(), error.message);
			if let Some(kind) = error.kind {
				eprintln!("   {}", kind.to_string().magenta());
			}
			if let Some(location) = &error.location {
				eprintln!("   {}", location.to_string().yellow());
			}
			for (name, value) in &error.values {
				let name = name.as_str().blue();
				let value = value.as_str().green();
				eprintln!("   {name} = {value}");
			}
		}
	}

	pub fn print_warning_message(string: &str) {
		eprintln!("{} {string}", "warning".yellow().bold());
	}

	pub fn print_error_message(string: &str) {
		eprintln!("{} {string}", "error".red().bold());
	}

	/// Summarize what a gateway operation did.
	pub fn print_output(output: &Output) {
		match output {
			Output::Mounted { count } => println!("mounted ({count} active)"),
			Output::Released(Release::Inactive) => println!("no active lease"),
			Output::Released(Release::Held { count }) => println!("released ({count} active)"),
			Output::Released(Release::Kept) => println!("released, the mounts were kept"),
			Output::Released(Release::Unmounted) => println!("released and unmounted"),
			Output::Reclaimed(reclaim) => {
				println!(
					"reclaimed {} stale, {} remaining",
					reclaim.stale, reclaim.remaining
				);
				if reclaim.unmounted {
					println!("unmounted");
				}
			},
			Output::Checked(report) => {
				println!("mounted ({} active)", report.count);
				for holder in &report.stale {
					let message = format!(
						"process {} holds a lease but no longer exists, run `sysroot gateway unmount` to reclaim it",
						holder.pid
					);
					Self::print_warning_message(&message);
				}
			},
			Output::Executed => (),
			Output::Staged(paths) => {
				for path in paths {
					println!("{}", path.display());
				}
			},
		}
	}
}
