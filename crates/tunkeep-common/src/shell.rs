//! Shell command execution for the tunnel keeper.
//!
//! All host network state is read and changed through iproute2 and the
//! module utilities. Every argument that originates from configuration is
//! passed through [`shellquote`] before it reaches `/bin/sh`.
//!
//! # Example
//!
//! ```ignore
//! use tunkeep_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote("he-ipv6"));
//! shell::exec_or_throw(&cmd).await?;
//! ```

use std::process::{Output, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{KeeperError, KeeperResult};

/// Path to the `ip` command for link, address and route configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `ping` command used for reachability probes.
pub const PING_CMD: &str = "/bin/ping";

/// Path to the `modprobe` command for loading kernel modules.
pub const MODPROBE_CMD: &str = "/sbin/modprobe";

/// Kernel registry of loaded modules.
pub const PROC_MODULES: &str = "/proc/modules";

const SHELL: &str = "/bin/sh";

/// Exit code reported when the child was killed by a signal.
const SIGNALLED: i32 = -1;

/// `$`, `` ` ``, `"`, `\` and newline keep their meaning inside double quotes.
static DQUOTE_SPECIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[$`"\\\n]"#).expect("Invalid regex pattern"));

/// Wraps `s` in double quotes with every special character escaped.
///
/// ```
/// use tunkeep_common::shell::shellquote;
///
/// assert_eq!(shellquote("he-ipv6"), "\"he-ipv6\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let body = DQUOTE_SPECIALS.replace_all(s, r"\$0");
    format!("\"{}\"", body)
}

/// Captured outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// 0 on success, -1 when killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    fn from_output(output: Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(SIGNALLED),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined by a newline, skipping whichever is empty.
    pub fn combined_output(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// stdout on success, [`KeeperError::ShellCommandFailed`] otherwise.
    pub fn into_result(self, cmd: &str) -> KeeperResult<String> {
        if !self.success() {
            return Err(KeeperError::ShellCommandFailed {
                command: cmd.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            });
        }
        Ok(self.stdout)
    }
}

/// Runs `cmd` through `/bin/sh -c` with stdin closed.
///
/// A non-zero exit is returned as a normal [`ExecResult`]. Probes and
/// existence queries fail routinely, so it is only logged at debug.
pub async fn exec(cmd: &str) -> KeeperResult<ExecResult> {
    debug!(command = %cmd, "Running");

    let output = Command::new(SHELL)
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| KeeperError::ShellExec {
            command: cmd.to_string(),
            source,
        })?;
    let result = ExecResult::from_output(output);

    match result.exit_code {
        0 => trace!(command = %cmd, stdout = %result.stdout, "Command succeeded"),
        code => debug!(command = %cmd, exit_code = code, stderr = %result.stderr, "Command failed"),
    }
    Ok(result)
}

/// Runs `cmd` and returns its stdout; a non-zero exit is an error.
pub async fn exec_or_throw(cmd: &str) -> KeeperResult<String> {
    exec(cmd).await?.into_result(cmd)
}
