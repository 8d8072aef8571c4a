use {
	crate::{Gateway, Operation, Options, Output, operation, validate_tree},
	indoc::indoc,
	pretty_assertions::assert_eq,
	std::{
		os::unix::fs::PermissionsExt as _,
		path::{Path, PathBuf},
		sync::Arc,
		time::Duration,
	},
	sysroot_error::Kind,
	sysroot_lease::{Release, Simulated},
	sysroot_sandbox::{Host, Stdio},
	sysroot_temp::Temp,
};

struct Fixture {
	temp: Temp,
	tree: PathBuf,
	mounter: Simulated,
	gateway: Gateway<Host>,
}

fn fixture() -> Fixture {
	let temp = Temp::new();
	let tree = temp.path().join("lfs");
	std::fs::create_dir_all(tree.join("usr")).unwrap();
	let mounter = Simulated::new();
	let options = Options {
		owner: std::process::id(),
		lock_timeout: Duration::from_secs(5),
		lease_directory: None,
		mounts: sysroot_lease::Set::standard(),
		shell: "/bin/bash".into(),
	};
	let gateway = Gateway::new(Host::new(), Arc::new(mounter.clone()), options);
	Fixture {
		temp,
		tree,
		mounter,
		gateway,
	}
}

fn write_script(path: &Path, contents: &str) {
	std::fs::write(path, contents).unwrap();
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).unwrap();
}

fn listing(path: &Path) -> Vec<PathBuf> {
	let mut entries = std::fs::read_dir(path)
		.unwrap()
		.map(|entry| entry.unwrap().file_name().into())
		.collect::<Vec<_>>();
	entries.sort();
	entries
}

#[test]
fn trees_must_be_absolute_existing_directories() {
	let fixture = fixture();
	let error = validate_tree(Path::new("lfs")).unwrap_err();
	assert_eq!(error.kind(), Some(Kind::InvalidArgument));
	let error = validate_tree(&fixture.temp.path().join("missing")).unwrap_err();
	assert_eq!(error.kind(), Some(Kind::InvalidArgument));
	let file = fixture.temp.path().join("file");
	std::fs::write(&file, "").unwrap();
	let error = validate_tree(&file).unwrap_err();
	assert_eq!(error.kind(), Some(Kind::InvalidArgument));
	assert!(validate_tree(&fixture.tree).is_ok());
}

#[tokio::test]
async fn stage_rejects_bad_destinations_and_sources() {
	let fixture = fixture();
	let source = fixture.temp.path().join("binutils.tar.xz");
	std::fs::write(&source, "archive").unwrap();

	let cases: [(&str, PathBuf); 5] = [
		("../escape", source.clone()),
		("sources/../../escape", source.clone()),
		("/sources", source.clone()),
		("sources", PathBuf::from("relative.tar.xz")),
		("sources", fixture.temp.path().join("missing.tar.xz")),
	];
	for (destination, source) in cases {
		let error = fixture
			.gateway
			.stage(&fixture.tree, Path::new(destination), &[source])
			.await
			.unwrap_err();
		assert_eq!(error.kind(), Some(Kind::InvalidArgument), "{destination}");
	}
	assert_eq!(listing(&fixture.tree), vec![PathBuf::from("usr")]);
}

#[tokio::test]
async fn stage_copies_files_into_the_tree() {
	let fixture = fixture();
	let a = fixture.temp.path().join("a.patch");
	let b = fixture.temp.path().join("b.patch");
	std::fs::write(&a, "a").unwrap();
	std::fs::write(&b, "b").unwrap();
	let output = fixture
		.gateway
		.run(
			Operation::Stage(operation::Stage {
				tree: fixture.tree.clone(),
				destination: "sources/patches".into(),
				sources: vec![a, b],
			}),
			Stdio::Null,
		)
		.await
		.unwrap();
	let Output::Staged(staged) = output else {
		panic!("expected the staged paths");
	};
	assert_eq!(staged.len(), 2);
	let directory = fixture.tree.join("sources/patches");
	assert_eq!(std::fs::read_to_string(directory.join("a.patch")).unwrap(), "a");
	assert_eq!(std::fs::read_to_string(directory.join("b.patch")).unwrap(), "b");
}

#[tokio::test]
async fn exec_requires_the_mounts_and_changes_nothing_without_them() {
	let fixture = fixture();
	let script = fixture.temp.path().join("build.sh");
	write_script(&script, "touch built\n");
	let before = listing(&fixture.tree);
	let error = fixture
		.gateway
		.exec(&fixture.tree, &script, None, Stdio::Null)
		.await
		.unwrap_err();
	assert_eq!(error.kind(), Some(Kind::Validation));
	assert_eq!(error.exit_code(), 5);
	assert_eq!(listing(&fixture.tree), before);
	assert_eq!(fixture.mounter.state().mounts, 0);
	assert_eq!(
		listing(fixture.temp.path()),
		[PathBuf::from("build.sh"), PathBuf::from("lfs")]
	);
}

#[tokio::test]
async fn mount_exec_release() {
	let fixture = fixture();
	let tree = fixture.tree.clone();
	let script = fixture.temp.path().join("build.sh");
	write_script(
		&script,
		indoc!(
			r#"
				printf '%s' "hello from $LFS" > greeting.txt
				echo "jobs: $MAKEFLAGS"
			"#
		),
	);

	let output = fixture
		.gateway
		.run(
			Operation::Mount(operation::Mount {
				tree: tree.clone(),
				owner: None,
			}),
			Stdio::Null,
		)
		.await
		.unwrap();
	assert_eq!(output, Output::Mounted { count: 1 });
	fixture
		.gateway
		.run(
			Operation::Check(operation::Check { tree: tree.clone() }),
			Stdio::Null,
		)
		.await
		.unwrap();

	let log = fixture.temp.path().join("build.log");
	let file = std::fs::File::create(&log).unwrap();
	fixture
		.gateway
		.run(
			Operation::Exec(operation::Exec {
				tree: tree.clone(),
				script: script.clone(),
				timeout: None,
			}),
			Stdio::File(file),
		)
		.await
		.unwrap();
	assert_eq!(
		std::fs::read_to_string(tree.join("greeting.txt")).unwrap(),
		"hello from /"
	);
	assert!(std::fs::read_to_string(&log).unwrap().contains("jobs: -j"));
	assert!(listing(&tree.join("tmp/.sysroot")).is_empty());

	let output = fixture
		.gateway
		.run(
			Operation::Release(operation::Release {
				tree: tree.clone(),
				owner: None,
				keep_mounts: false,
			}),
			Stdio::Null,
		)
		.await
		.unwrap();
	assert_eq!(output, Output::Released(Release::Unmounted));
	let error = fixture
		.gateway
		.run(Operation::Check(operation::Check { tree }), Stdio::Null)
		.await
		.unwrap_err();
	assert_eq!(error.kind(), Some(Kind::Validation));
}

#[tokio::test]
async fn failing_scripts_are_execution_failures() {
	let fixture = fixture();
	let script = fixture.temp.path().join("build.sh");
	write_script(&script, "echo 'configure: error: no acceptable C compiler'\nexit 77\n");
	fixture
		.gateway
		.manager(&fixture.tree)
		.unwrap()
		.acquire(std::process::id())
		.unwrap();

	let log = fixture.temp.path().join("build.log");
	let file = std::fs::File::create(&log).unwrap();
	let error = fixture
		.gateway
		.exec(&fixture.tree, &script, None, Stdio::File(file))
		.await
		.unwrap_err();
	assert_eq!(error.kind(), Some(Kind::Execution));
	assert_eq!(error.value("code"), Some("77"));
	assert!(
		std::fs::read_to_string(&log)
			.unwrap()
			.contains("no acceptable C compiler")
	);
	assert!(listing(&fixture.tree.join("tmp/.sysroot")).is_empty());
}

#[test]
fn scripts_run_with_a_clean_login_environment() {
	let fixture = fixture();
	let command = fixture.gateway.command(Path::new("/tmp/.sysroot/x.sh"));
	assert_eq!(command.executable, PathBuf::from("/bin/bash"));
	assert_eq!(command.args, ["--login", "/tmp/.sysroot/x.sh"]);
	assert_eq!(command.cwd, PathBuf::from("/"));
	let names = command.env.keys().map(String::as_str).collect::<Vec<_>>();
	assert_eq!(names, ["HOME", "LC_ALL", "LFS", "MAKEFLAGS", "PATH", "TERM"]);
	assert_eq!(command.env["PATH"], "/usr/bin:/usr/sbin:/bin:/sbin");
}

#[tokio::test]
async fn scripts_past_their_deadline_are_killed() {
	let fixture = fixture();
	let script = fixture.temp.path().join("build.sh");
	write_script(&script, "sleep 3\ntouch built\n");
	fixture
		.gateway
		.manager(&fixture.tree)
		.unwrap()
		.acquire(std::process::id())
		.unwrap();

	let error = fixture
		.gateway
		.exec(
			&fixture.tree,
			&script,
			Some(Duration::from_millis(500)),
			Stdio::Null,
		)
		.await
		.unwrap_err();
	assert_eq!(error.kind(), Some(Kind::Timeout));
	assert_eq!(error.exit_code(), 124);
	assert!(listing(&fixture.tree.join("tmp/.sysroot")).is_empty());

	// Nothing in the script's process group survives the deadline.
	tokio::time::sleep(Duration::from_secs(4)).await;
	assert!(!fixture.tree.join("built").exists());
}

#[tokio::test]
async fn symlinks_in_the_tree_cannot_redirect_copies_outside_it() {
	let fixture = fixture();
	let outside = fixture.temp.path().join("outside");
	std::fs::create_dir_all(&outside).unwrap();
	std::os::unix::fs::symlink(&outside, fixture.tree.join("sources")).unwrap();
	let source = fixture.temp.path().join("a.patch");
	std::fs::write(&source, "a").unwrap();

	let error = fixture
		.gateway
		.stage(&fixture.tree, Path::new("sources"), &[source])
		.await
		.unwrap_err();
	assert_eq!(error.kind(), Some(Kind::InvalidArgument));
	assert!(listing(&outside).is_empty());

	std::os::unix::fs::symlink(&outside, fixture.tree.join("tmp")).unwrap();
	fixture
		.gateway
		.manager(&fixture.tree)
		.unwrap()
		.acquire(std::process::id())
		.unwrap();
	let script = fixture.temp.path().join("build.sh");
	write_script(&script, "true\n");
	let error = fixture
		.gateway
		.exec(&fixture.tree, &script, None, Stdio::Null)
		.await
		.unwrap_err();
	assert_eq!(error.kind(), Some(Kind::InvalidArgument));
	assert!(listing(&outside).is_empty());
}

#[tokio::test]
async fn staging_replaces_symlinks_instead_of_following_them() {
	let fixture = fixture();
	let victim = fixture.temp.path().join("victim");
	std::fs::write(&victim, "original").unwrap();
	std::fs::create_dir_all(fixture.tree.join("sources")).unwrap();
	std::os::unix::fs::symlink(&victim, fixture.tree.join("sources/a.patch")).unwrap();
	let source = fixture.temp.path().join("a.patch");
	std::fs::write(&source, "a").unwrap();

	fixture
		.gateway
		.stage(&fixture.tree, Path::new("sources"), &[source])
		.await
		.unwrap();
	assert_eq!(std::fs::read_to_string(&victim).unwrap(), "original");
	let target = fixture.tree.join("sources/a.patch");
	assert!(!target.symlink_metadata().unwrap().is_symlink());
	assert_eq!(std::fs::read_to_string(target).unwrap(), "a");
}
