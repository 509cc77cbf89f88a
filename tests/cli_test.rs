//! Integration tests for the archoffline command line
//!
//! Covers argument handling, configuration errors and the commands that
//! need neither root nor network: `doctor` and `clean`.

mod common;

use common::{package_file, run_archoffline, TestBuild};

// ============================================
// Global options
// ============================================

/// Test: --help lists the commands
#[test]
fn test_help_lists_commands() {
    let build = TestBuild::new();
    let output = run_archoffline(&build.path(), &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["build", "boot", "clean", "doctor"] {
        assert!(stdout.contains(command), "help is missing '{command}': {stdout}");
    }
}

/// Test: --version prints the package version
#[test]
fn test_version() {
    let build = TestBuild::new();
    let output = run_archoffline(&build.path(), &["--version"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

/// Test: build --help documents the build options
#[test]
fn test_build_help_lists_options() {
    let build = TestBuild::new();
    let output = run_archoffline(&build.path(), &["build", "--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for option in ["--mirrors", "--aur-packages", "--breakpoint", "--save-cache", "--rebuild"] {
        assert!(stdout.contains(option), "build help is missing {option}");
    }
}

// ============================================
// Configuration errors
// ============================================

/// Test: A build without a mirror exits with the configuration code
#[test]
fn test_build_without_mirror_fails() {
    let build = TestBuild::new();
    let output = run_archoffline(&build.path(), &["build"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.to_lowercase().contains("mirror"), "stderr: {stderr}");
    assert!(!build.path().join("archiso_offline").exists());
}

/// Test: An invalid repository name exits with the configuration code
#[test]
fn test_build_with_invalid_repo_fails() {
    let build = TestBuild::new();
    let output = run_archoffline(
        &build.path(),
        &["build", "--mirrors", "Sweden", "--repo", "bad name"],
    );

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("repo"), "stderr: {stderr}");
}

/// Test: An unrecognized mirror specification is rejected
#[test]
fn test_build_with_unrecognized_mirror_fails() {
    let build = TestBuild::new();
    let output = run_archoffline(&build.path(), &["build", "--mirrors", "ftp://example.org"]);

    assert_eq!(output.status.code(), Some(2));
}

/// Test: A malformed project config file is reported
#[test]
fn test_malformed_project_config_fails() {
    let build = TestBuild::new();
    std::fs::write(build.path().join("archoffline.toml"), "mirrors = [unclosed").unwrap();
    let output = run_archoffline(&build.path(), &["build"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("archoffline.toml"), "stderr: {stderr}");
}

// ============================================
// doctor
// ============================================

/// Test: doctor reports on the image builder
#[test]
fn test_doctor_reports_tools() {
    let build = TestBuild::new();
    let output = run_archoffline(&build.path(), &["doctor"]);

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(combined.contains("mkarchiso"), "output: {combined}");
    assert!(combined.contains("qemu-system-x86_64"), "output: {combined}");
}

// ============================================
// clean
// ============================================

/// Test: clean on a missing directory succeeds
#[test]
fn test_clean_missing_directory() {
    let build = TestBuild::new();
    let output = run_archoffline(&build.path(), &["clean", "--builddir", "nothing-here"]);

    assert!(output.status.success());
}

/// Test: clean removes the build directory
#[test]
fn test_clean_removes_build_directory() {
    let build = TestBuild::new();
    std::fs::create_dir_all(build.build_dir().join("template")).unwrap();
    std::fs::create_dir_all(build.repo_dir()).unwrap();

    let output = run_archoffline(&build.path(), &["clean", "--builddir", "build"]);

    assert!(output.status.success());
    assert!(!build.build_dir().exists());
}

/// Test: clean --keep-cache parks the repository for the next build
#[test]
fn test_clean_keep_cache_parks_repository() {
    let build = TestBuild::new();
    std::fs::create_dir_all(build.build_dir().join("template")).unwrap();
    std::fs::create_dir_all(build.repo_dir()).unwrap();
    std::fs::write(build.repo_dir().join(package_file("nano")), "nano").unwrap();

    let output = run_archoffline(
        &build.path(),
        &["clean", "--builddir", "build", "--keep-cache"],
    );

    assert!(output.status.success());
    assert!(!build.build_dir().join("template").exists());
    assert!(!build.repo_dir().exists());
    assert!(build
        .build_dir()
        .join(".cache-saved/localrepo")
        .join(package_file("nano"))
        .is_file());
}
