//! Test utilities
//!
//! Proptest generators plus a scriptable [`CommandRunner`] so pipeline
//! components can be exercised without root or the real package tools.

#[cfg(test)]
pub mod generators {
    use proptest::prelude::*;

    /// Generate a valid package name
    pub fn package_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,30}[a-z0-9]?".prop_filter("Name must not be empty", |s| !s.is_empty())
    }

    /// Generate a package version (`pkgver-pkgrel`)
    pub fn package_version() -> impl Strategy<Value = String> {
        ("[0-9]{1,3}(\\.[0-9]{1,3}){0,2}", 1u32..20).prop_map(|(ver, rel)| format!("{ver}-{rel}"))
    }

    /// Generate a package architecture
    pub fn package_arch() -> impl Strategy<Value = String> {
        prop_oneof![Just("x86_64".to_string()), Just("any".to_string())]
    }

    /// Generate a repository name
    pub fn repo_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,15}"
    }
}

#[cfg(test)]
pub mod fakes {
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    use crate::error::ToolInvocationError;
    use crate::infra::process::{CommandOutput, CommandRunner, CommandSpec};

    type Handler = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

    /// Exit status with the given code
    pub fn exit_status(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    /// Output with the given code and stdout
    pub fn output(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            status: exit_status(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Write a minimal archiso template into `dir`
    pub fn fake_template(dir: &Path) {
        let reflector = dir.join("airootfs/etc/systemd/system/reflector.service.d");
        std::fs::create_dir_all(&reflector).unwrap();
        std::fs::write(dir.join("profiledef.sh"), "iso_name=archlinux\n").unwrap();
        std::fs::write(dir.join("packages.x86_64"), "base\nlinux\n").unwrap();
        std::fs::write(
            dir.join("pacman.conf"),
            "[options]\nArchitecture = auto\n\n[core]\nInclude = /etc/pacman.d/mirrorlist\n\n[extra]\nInclude = /etc/pacman.d/mirrorlist\n",
        )
        .unwrap();
        std::fs::write(reflector.join("archiso.conf"), "[Service]\n").unwrap();
    }

    /// Records every command; programs without a handler succeed silently
    #[derive(Default)]
    pub struct ScriptedRunner {
        handlers: Vec<(String, Handler)>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Handle `program`; later handlers for the same program win
        #[must_use]
        pub fn on<F>(mut self, program: &str, handler: F) -> Self
        where
            F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
        {
            self.handlers.insert(0, (program.to_string(), Box::new(handler)));
            self
        }

        /// Every command run so far
        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        /// Argument lists of every run of `program`
        pub fn invocations(&self, program: &str) -> Vec<Vec<String>> {
            self.calls()
                .iter()
                .filter(|c| c.program == program)
                .map(CommandSpec::arg_strings)
                .collect()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ToolInvocationError> {
            self.calls.lock().unwrap().push(command.clone());
            Ok(self
                .handlers
                .iter()
                .find(|(program, _)| *program == command.program)
                .map(|(_, handler)| handler(command))
                .unwrap_or_else(|| output(0, "")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::generators::*;
    use crate::infra::process::{CommandRunner, CommandSpec};
    use proptest::prelude::*;

    #[test]
    fn test_scripted_runner_records_and_dispatches() {
        let runner = ScriptedRunner::new()
            .on("id", |_| output(1, ""))
            .on("id", |_| output(0, "0\n"));

        let out = runner.run(&CommandSpec::new("id").arg("-u")).unwrap();
        assert_eq!(out.stdout, "0\n");
        assert!(runner.run(&CommandSpec::new("true")).unwrap().success());
        assert_eq!(runner.invocations("id"), vec![vec!["-u".to_string()]]);
        assert_eq!(runner.calls().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_package_name_generator(name in package_name()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.chars().next().unwrap().is_ascii_lowercase());
        }

        #[test]
        fn test_package_version_generator(version in package_version()) {
            prop_assert_eq!(version.matches('-').count(), 1);
        }
    }
}
