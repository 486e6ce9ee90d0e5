//! Centralized command execution with consistent error handling.
//!
//! Every external tool the builder drives (mkfs, mcopy, losetup, mount,
//! chroot, snap) goes through [`Cmd`]. Failures carry the full command line
//! and the captured stderr so a failing step can be attributed precisely.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for the child process only.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// The command line as it would be typed in a shell (env prefix included).
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = self
            .envs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let output = cmd.output().with_context(|| {
            if which::which(&self.program).is_err() {
                format!(
                    "Failed to execute '{}': not found in PATH. Is it installed?",
                    self.program
                )
            } else {
                format!("Failed to execute '{}'", self.command_line())
            }
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        self.check(result)
    }

    /// Apply the failure policy to a finished command.
    ///
    /// Split out of [`Cmd::run`] so fake executors produce the same errors.
    pub fn check(&self, result: CommandResult) -> Result<CommandResult> {
        if !result.success() {
            let prefix = self
                .error_prefix
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program));

            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!(
                    "{} (exit code {})\n  command: {}",
                    prefix,
                    result.code(),
                    self.command_line()
                );
            } else {
                bail!(
                    "{} (exit code {})\n  command: {}\n{}",
                    prefix,
                    result.code(),
                    self.command_line(),
                    stderr
                );
            }
        }

        Ok(result)
    }
}

/// Check if a program exists in PATH (bool version).
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo disk is full >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = err.to_string();

        assert!(msg.contains("exit code 3"), "got: {}", msg);
        assert!(msg.ends_with("disk is full"), "got: {}", msg);
    }

    #[test]
    fn test_failure_includes_command_line() {
        let err = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .run()
            .unwrap_err();
        let msg = err.to_string();

        assert!(msg.contains("ls /nonexistent_path_12345"), "got: {}", msg);
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Custom build step failed")
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("Custom build step failed"));
    }

    #[test]
    fn test_env_is_scoped_to_child() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $RECIMG_PROCESS_TEST"])
            .env("RECIMG_PROCESS_TEST", "scoped")
            .run()
            .unwrap();

        assert_eq!(result.stdout_trimmed(), "scoped");
        assert!(std::env::var("RECIMG_PROCESS_TEST").is_err());
    }

    #[test]
    fn test_command_line_rendering() {
        let cmd = Cmd::new("mkfs.ext4")
            .env("MKE2FS_CONFIG", "/etc/mke2fs.conf")
            .args(["-L", "writable"])
            .arg_path(Path::new("/tmp/part0.img"));

        assert_eq!(
            cmd.command_line(),
            "MKE2FS_CONFIG=/etc/mke2fs.conf mkfs.ext4 -L writable /tmp/part0.img"
        );
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("nonexistent_program_12345"));
    }
}
