//! Host tool checks
//!
//! Reports which external tools the build drives are installed.

use std::path::PathBuf;

/// A tool the build may need
struct Tool {
    name: &'static str,
    version_flag: Option<&'static str>,
    package: &'static str,
    required: bool,
}

const TOOLS: &[Tool] = &[
    Tool {
        name: "mkarchiso",
        version_flag: Some("-V"),
        package: "archiso",
        required: true,
    },
    Tool {
        name: "pacman",
        version_flag: Some("--version"),
        package: "pacman",
        required: true,
    },
    Tool {
        name: "repo-add",
        version_flag: Some("--version"),
        package: "pacman",
        required: true,
    },
    Tool {
        name: "makepkg",
        version_flag: Some("--version"),
        package: "pacman",
        required: true,
    },
    Tool {
        name: "useradd",
        version_flag: None,
        package: "shadow",
        required: true,
    },
    Tool {
        name: "visudo",
        version_flag: Some("--version"),
        package: "sudo",
        required: true,
    },
    Tool {
        name: "gpg",
        version_flag: Some("--version"),
        package: "gnupg",
        required: true,
    },
    Tool {
        name: "qemu-system-x86_64",
        version_flag: Some("--version"),
        package: "qemu-full",
        required: false,
    },
    Tool {
        name: "qemu-img",
        version_flag: Some("--version"),
        package: "qemu-img",
        required: false,
    },
];

/// Result of a single tool check
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Tool name
    pub name: String,
    /// Whether the tool was found
    pub passed: bool,
    /// Resolved path
    pub path: Option<PathBuf>,
    /// Version if it could be read
    pub version: Option<String>,
    /// How to install it
    pub suggestion: Option<String>,
    /// Whether a build can run without it
    pub required: bool,
}

/// Overall doctor report
#[derive(Debug, Default)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// Missing tools the build cannot do without
    pub fn failed_required(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.required && !c.passed)
            .collect()
    }
}

/// Extract a version number from tool output
fn extract_version(output: &str) -> Option<String> {
    let version_regex = regex::Regex::new(r"v?(\d+\.\d+(?:\.\d+)?(?:[-.]\w+)?)").ok()?;
    version_regex
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn tool_version(path: &PathBuf, flag: &str) -> Option<String> {
    let output = std::process::Command::new(path).arg(flag).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    extract_version(&combined)
}

fn check_tool(tool: &Tool) -> CheckResult {
    match which::which(tool.name) {
        Ok(path) => CheckResult {
            name: tool.name.to_string(),
            passed: true,
            version: tool.version_flag.and_then(|flag| tool_version(&path, flag)),
            path: Some(path),
            suggestion: None,
            required: tool.required,
        },
        Err(_) => CheckResult {
            name: tool.name.to_string(),
            passed: false,
            path: None,
            version: None,
            suggestion: Some(format!("pacman -S {}", tool.package)),
            required: tool.required,
        },
    }
}

/// Check every tool
pub fn run_doctor() -> DoctorReport {
    DoctorReport {
        checks: TOOLS.iter().map(check_tool).collect(),
    }
}
