//! CLI command for `archoffline doctor`

use anyhow::Result;

use crate::cli::output::{is_quiet, print_detail, print_info, print_success, print_warning, status};
use crate::core::doctor::run_doctor;

/// Execute the doctor command
pub fn execute() -> Result<()> {
    let report = run_doctor();

    if !is_quiet() {
        print_info("Checking host tools...");
        println!();
        for check in &report.checks {
            let version = check
                .version
                .as_ref()
                .map(|v| format!(" (v{v})"))
                .unwrap_or_default();
            let optional = if check.required { "" } else { " [optional]" };
            if check.passed {
                println!("  {} {}{version}{optional}", status::SUCCESS, check.name);
            } else {
                println!("  {} {}{optional}", status::ERROR, check.name);
                if let Some(suggestion) = &check.suggestion {
                    print_detail(&format!("  Install with: {suggestion}"));
                }
            }
        }
        println!();
    }

    let passed = report.passed_count();
    let total = report.checks.len();
    let missing = report.failed_required();

    if report.all_passed() {
        print_success(&format!("All checks passed ({passed}/{total})"));
    } else if missing.is_empty() {
        print_warning(&format!(
            "{passed}/{total} checks passed (optional tools missing)"
        ));
    } else {
        for check in &missing {
            eprintln!("{} Missing required tool: {}", status::ERROR, check.name);
        }
        anyhow::bail!("Missing required tools. Install them and re-run 'archoffline doctor'.");
    }
    Ok(())
}
