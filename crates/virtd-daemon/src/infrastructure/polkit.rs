//! Policy checks through polkit's `pkcheck` helper.
//!
//! The subject is passed as `pid,start_time,uid` so polkit can tell a
//! recycled pid from the process that actually connected. The helper's exit
//! status is the answer:
//!
//! | Status | Meaning                                        | Decision |
//! |--------|------------------------------------------------|----------|
//! | 0      | authorized                                     | allow    |
//! | 1      | not authorized                                 | deny     |
//! | 2      | needs interactive authentication, no agent     | deny     |
//! | 3      | authentication dialog dismissed                | deny     |
//! | other  | the check itself failed                        | error    |

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::application::auth::{PolicyDecision, PolicyEngine};
use crate::application::connection::PeerIdentity;

/// Helper looked up on `PATH` by [`PkcheckPolicy::new`].
pub const PKCHECK: &str = "pkcheck";

/// [`PolicyEngine`] that runs `pkcheck` once per check.
///
/// Checks run on the dispatch worker thread, so waiting for the child is
/// fine.
#[derive(Debug, Clone)]
pub struct PkcheckPolicy {
    program: PathBuf,
}

impl PkcheckPolicy {
    pub fn new() -> Self {
        Self::with_program(PKCHECK)
    }

    /// Uses `program` in place of `pkcheck`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PkcheckPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine for PkcheckPolicy {
    fn check(&self, action: &str, peer: &PeerIdentity) -> PolicyDecision {
        let start_time = match peer.start_time {
            Some(t) => t,
            None => return PolicyDecision::Error(format!("no start time for pid {}", peer.pid)),
        };
        let subject = format!("{},{},{}", peer.pid, start_time, peer.uid);
        let output = Command::new(&self.program)
            .args(["--action-id", action, "--process", &subject])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        match output {
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                debug!(action, subject = %subject, status = ?out.status.code(), "pkcheck finished");
                decision_from_status(out.status.code(), &stderr)
            }
            Err(e) => PolicyDecision::Error(format!("cannot run {}: {e}", self.program.display())),
        }
    }
}

/// Maps a `pkcheck` exit status onto a decision. `None` means the helper
/// was killed by a signal.
pub fn decision_from_status(code: Option<i32>, stderr: &str) -> PolicyDecision {
    match code {
        Some(0) => PolicyDecision::Allow,
        Some(1..=3) => PolicyDecision::Deny,
        Some(code) => PolicyDecision::Error(format!("pkcheck exited with {code}: {}", stderr.trim())),
        None => PolicyDecision::Error("pkcheck was killed by a signal".to_string()),
    }
}
