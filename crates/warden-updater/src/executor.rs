//! Allow-listed subprocess execution.
//!
//! Every external tool the updater runs goes through [`SafeExecutor`]:
//! - the tool is named by a short alias resolved to an absolute path
//! - arguments carrying shell composition sequences are rejected
//! - the executable is spawned directly with an argument vector, never
//!   through a shell
//! - each invocation is bounded by a wall-clock timeout, after which the
//!   child is killed
//!
//! Output is captured in full rather than streamed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::UpdateError;

/// Sequences that cause the whole call to be rejected.
const REJECTED_SEQUENCES: &[&str] = &["$(", "`", "||", "&&"];

/// Characters stripped from arguments that pass the rejection check.
const STRIPPED_CHARS: &[char] = &[';', '|', '$', '<', '>', '\n', '\r', '\0'];

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert a non-zero exit into [`UpdateError::CommandFailed`].
    pub fn into_result(self, tool: &str) -> Result<Self, UpdateError> {
        if self.success() {
            Ok(self)
        } else {
            Err(UpdateError::CommandFailed {
                tool: tool.to_string(),
                status: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs allow-listed tools without a shell.
#[derive(Debug, Clone)]
pub struct SafeExecutor {
    allowed: BTreeMap<String, PathBuf>,
}

impl SafeExecutor {
    /// Create an executor with an empty allow-list.
    pub fn empty() -> Self {
        Self {
            allowed: BTreeMap::new(),
        }
    }

    /// Create an executor with the platform tools the installer needs.
    pub fn with_system_tools() -> Self {
        let brew = ["/opt/homebrew/bin/brew", "/usr/local/bin/brew"]
            .into_iter()
            .find(|candidate| Path::new(candidate).exists())
            .unwrap_or("/opt/homebrew/bin/brew");

        Self::empty()
            .with_tool("hdiutil", "/usr/bin/hdiutil")
            .with_tool("installer", "/usr/sbin/installer")
            .with_tool("codesign", "/usr/bin/codesign")
            .with_tool("spctl", "/usr/sbin/spctl")
            .with_tool("ditto", "/usr/bin/ditto")
            .with_tool("tar", "/usr/bin/tar")
            .with_tool("xattr", "/usr/bin/xattr")
            .with_tool("brew", brew)
    }

    /// Register (or replace) a tool alias.
    pub fn with_tool(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.allowed.insert(name.to_string(), path.into());
        self
    }

    /// Resolve a tool alias to its absolute executable path.
    pub fn resolve(&self, tool: &str) -> Result<&Path, UpdateError> {
        let path = self
            .allowed
            .get(tool)
            .ok_or_else(|| UpdateError::InvalidExecutable(format!("{tool} is not allow-listed")))?;

        if !path.is_absolute() {
            return Err(UpdateError::InvalidExecutable(format!(
                "{} is not an absolute path",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(UpdateError::InvalidExecutable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Run `tool` with `args`, capturing output.
    ///
    /// # Errors
    ///
    /// - `InvalidExecutable` if the alias is unknown or the file is missing
    /// - `InvalidArguments` if any argument carries a rejected sequence
    /// - `Timeout` if the process outlives `timeout` (the child is killed)
    pub async fn execute<S: AsRef<str>>(
        &self,
        tool: &str,
        args: &[S],
        timeout: Duration,
        working_dir: Option<&Path>,
    ) -> Result<ExecOutput, UpdateError> {
        let args = sanitize_args(args)?;
        let program = self.resolve(tool)?;

        debug!(tool, program = %program.display(), ?args, "Spawning process");

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let result = ExecOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                };
                debug!(tool, exit_code = ?result.exit_code, "Process finished");
                Ok(result)
            }
            Err(_) => {
                warn!(tool, timeout_secs = timeout.as_secs(), "Process timed out, killed");
                Err(UpdateError::Timeout {
                    operation: tool.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }
}

impl Default for SafeExecutor {
    fn default() -> Self {
        Self::with_system_tools()
    }
}

/// Reject or clean an argument vector.
pub fn sanitize_args<S: AsRef<str>>(args: &[S]) -> Result<Vec<String>, UpdateError> {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if let Some(seq) = REJECTED_SEQUENCES.iter().find(|seq| arg.contains(*seq)) {
                return Err(UpdateError::InvalidArguments(format!(
                    "argument contains {seq:?}"
                )));
            }
            Ok(arg.chars().filter(|c| !STRIPPED_CHARS.contains(c)).collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix_executor() -> SafeExecutor {
        SafeExecutor::empty()
            .with_tool("echo", "/bin/echo")
            .with_tool("sleep", "/bin/sleep")
            .with_tool("false", "/usr/bin/false")
    }

    #[test]
    fn test_sanitize_rejects_command_substitution() {
        let result = sanitize_args(&["$(rm -rf /)"]);
        assert!(matches!(result, Err(UpdateError::InvalidArguments(_))));

        for bad in ["`id`", "a || b", "a && b"] {
            assert!(sanitize_args(&[bad]).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_sanitize_strips_dangerous_chars() {
        let cleaned = sanitize_args(&["a;b", "x|y", "keep me.app", "$HOME", "in>out"]).unwrap();
        assert_eq!(cleaned, vec!["ab", "xy", "keep me.app", "HOME", "inout"]);
    }

    #[tokio::test]
    async fn test_rejected_argument_spawns_nothing() {
        // An unknown tool would fail with InvalidExecutable; argument checks run first.
        let executor = SafeExecutor::empty();
        let result = executor
            .execute("nothing", &["$(rm -rf /)"], Duration::from_secs(1), None)
            .await;
        assert!(matches!(result, Err(UpdateError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_executable() {
        let executor = SafeExecutor::empty();
        let result = executor
            .execute("curl", &["https://example.com"], Duration::from_secs(1), None)
            .await;
        assert!(matches!(result, Err(UpdateError::InvalidExecutable(_))));
    }

    #[tokio::test]
    async fn test_missing_executable_is_invalid() {
        let executor = SafeExecutor::empty().with_tool("ghost", "/nonexistent/bin/ghost");
        let result = executor
            .execute::<&str>("ghost", &[], Duration::from_secs(1), None)
            .await;
        assert!(matches!(result, Err(UpdateError::InvalidExecutable(_))));
    }

    #[test]
    fn test_relative_path_is_invalid() {
        let executor = SafeExecutor::empty().with_tool("rel", "bin/rel");
        assert!(matches!(
            executor.resolve("rel"),
            Err(UpdateError::InvalidExecutable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_stdout() {
        let output = unix_executor()
            .execute("echo", &["hello", "world"], Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let output = unix_executor()
            .execute::<&str>("false", &[], Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(!output.success());
        assert!(matches!(
            output.into_result("false"),
            Err(UpdateError::CommandFailed { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_timeout() {
        let result = unix_executor()
            .execute("sleep", &["5"], Duration::from_millis(100), None)
            .await;
        assert!(matches!(result, Err(UpdateError::Timeout { .. })));
    }
}
