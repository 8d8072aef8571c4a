use {common::Environment, insta::assert_snapshot, pretty_assertions::assert_eq};

mod common;

#[tokio::test]
async fn relative_trees_are_rejected() {
	let environment = Environment::new();
	let output = environment.run(&["gateway", "check", "mnt/lfs"]).await;
	assert_eq!(output.code, Some(2));
	assert!(output.stderr.contains("the tree must be an absolute path"));
	assert_snapshot!(output.stdout, @"");
}

#[tokio::test]
async fn unknown_operations_are_usage_errors() {
	let environment = Environment::new();
	let output = environment
		.run(&["gateway", "eval", environment.tree(), "rm -rf /"])
		.await;
	assert_eq!(output.code, Some(2));
	assert!(output.stderr.contains("eval"));
}

#[tokio::test]
async fn destinations_cannot_leave_the_tree() {
	let environment = Environment::new();
	let source = environment.file("sources/a.patch", "patch\n");
	let output = environment
		.run(&[
			"gateway",
			"stage",
			environment.tree(),
			"../escape",
			source.to_str().unwrap(),
		])
		.await;
	assert_eq!(output.code, Some(2));
	assert!(!environment.path().join("escape").exists());
}

#[tokio::test]
async fn files_are_staged_into_the_tree() {
	let environment = Environment::new();
	let source = environment.file("sources/a.patch", "patch\n");
	let output = environment
		.run(&[
			"gateway",
			"stage",
			environment.tree(),
			"sources",
			source.to_str().unwrap(),
		])
		.await;
	assert_eq!(output.code, Some(0), "{}", output.stderr);
	assert!(output.stdout.trim().ends_with("lfs/sources/a.patch"));
	let staged = std::fs::read_to_string(environment.tree.join("sources/a.patch")).unwrap();
	assert_eq!(staged, "patch\n");
}

#[tokio::test]
async fn unmounted_trees_fail_the_check() {
	let environment = Environment::new();
	let output = environment.run(&["gateway", "check", environment.tree()]).await;
	assert_eq!(output.code, Some(5));
	assert!(output.stderr.contains("the tree is not mounted"));
}

#[tokio::test]
async fn a_named_config_must_exist() {
	let environment = Environment::new();
	let missing = environment.path().join("missing.json");
	let output = environment
		.run(&[
			"--config",
			missing.to_str().unwrap(),
			"gateway",
			"check",
			environment.tree(),
		])
		.await;
	assert_eq!(output.code, Some(2));
	assert!(output.stderr.contains("failed to read the config file"));
}

#[tokio::test]
async fn unknown_config_sections_are_rejected() {
	let environment = Environment::new();
	environment.file(".config/sysroot/config.json", r#"{ "leases": {} }"#);
	let output = environment.run(&["gateway", "check", environment.tree()]).await;
	assert_eq!(output.code, Some(2));
	assert!(output.stderr.contains("failed to deserialize the config"));
}

#[tokio::test]
async fn operations_are_attributed_to_the_process_behind_the_elevation_program() {
	let environment = Environment::new();
	let elevate = environment.executable("bin/elevate", "#!/bin/sh\n\"$@\"\nexit $?\n");
	let config = environment.file(
		"config.json",
		&format!(r#"{{ "elevation": {{ "program": "{}" }} }}"#, elevate.display()),
	);
	let output = Environment::output(environment.command(&elevate).args([
		Environment::sysroot_path(),
		"--config",
		config.to_str().unwrap(),
		"--tracing",
		"debug",
		"gateway",
		"check",
		environment.tree(),
	]))
	.await;
	assert_eq!(output.code, Some(5), "{}", output.stderr);
	assert!(output.stderr.contains("skipping the elevation program"));
	let owner = format!("owner={}", std::process::id());
	assert!(output.stderr.contains(&owner), "{}", output.stderr);
}
