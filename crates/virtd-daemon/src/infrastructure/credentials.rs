//! Peer credential lookup for local sockets.
//!
//! The kernel reports uid, gid and pid of the connecting process. The
//! process start time is read from `/proc/<pid>/stat` so that a policy
//! engine can tell a recycled pid from the original process.

use std::path::PathBuf;

use tokio::net::UnixStream;
use tracing::debug;

use crate::application::connection::PeerIdentity;

/// Field number of `starttime` in `/proc/<pid>/stat` (1-based).
const STAT_START_TIME_FIELD: usize = 22;

/// Reads the identity of the process on the other end of `stream`.
///
/// # Errors
///
/// Returns the I/O error from the credentials query. A missing start time is
/// not an error; it is reported as `None`.
pub fn peer_identity(stream: &UnixStream) -> std::io::Result<PeerIdentity> {
    let cred = stream.peer_cred()?;
    let pid = cred.pid().unwrap_or(0);
    let start_time = if pid > 0 { process_start_time(pid) } else { None };
    Ok(PeerIdentity {
        uid: cred.uid(),
        gid: cred.gid(),
        pid,
        start_time,
    })
}

fn process_start_time(pid: i32) -> Option<u64> {
    let path = PathBuf::from(format!("/proc/{pid}/stat"));
    match std::fs::read_to_string(&path) {
        Ok(stat) => parse_start_time(&stat),
        Err(e) => {
            debug!("cannot read {}: {e}", path.display());
            None
        }
    }
}

/// Extracts `starttime` from the contents of a `/proc/<pid>/stat` file.
///
/// The command name (field 2) is parenthesised and may itself contain spaces
/// or parentheses, so fields are counted from the last `)`.
pub fn parse_start_time(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    // `rest` starts at field 3.
    rest.split_whitespace()
        .nth(STAT_START_TIME_FIELD - 3)
        .and_then(|f| f.parse().ok())
        .filter(|t| *t > 0)
}
