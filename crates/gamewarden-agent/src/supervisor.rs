use std::{
    io::PipeReader,
    path::Path,
    process::Stdio,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::process::{Child, Command};

use crate::error::ServerError;
use crate::pid_store::PidRecord;
use crate::procfs;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A freshly launched process group leader.
///
/// `output` carries stdout and stderr interleaved in the order the child wrote them.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub child: Child,
    pub output: PipeReader,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationOutcome {
    /// Nothing was left to signal.
    pub already_gone: bool,
    pub signalled: Vec<u32>,
    /// Survived the grace period and were SIGKILLed.
    pub forced: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanStatus {
    pub alive: bool,
    pub name: String,
    pub started_at: u64,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, the direct child gets SIGTERM. Grandchildren are
    // not covered; those are what orphan recovery is for.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn signal_group(pgid: u32, sig: libc::c_int) -> bool {
    unsafe { libc::kill(-(pgid as i32), sig) == 0 }
}

fn signal_pid(pid: u32, sig: libc::c_int) -> bool {
    unsafe { libc::kill(pid as i32, sig) == 0 }
}

/// Leader, its descendants and every other member of its group that is still alive.
fn tree_of(pid: u32) -> Vec<u32> {
    let mut targets = vec![pid];
    for p in procfs::descendants(pid)
        .into_iter()
        .chain(procfs::group_members(pid))
    {
        if !targets.contains(&p) {
            targets.push(p);
        }
    }
    targets.retain(|p| procfs::is_alive(*p));
    targets
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    term_grace: Duration,
}

impl Supervisor {
    pub fn new(term_grace: Duration) -> Self {
        Self { term_grace }
    }

    /// Launches `command` as the leader of a new session so the whole tree can be
    /// signalled through its process group.
    pub fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<SpawnedProcess, ServerError> {
        if !cwd.is_dir() {
            return Err(ServerError::InvalidWorkingDir {
                path: cwd.to_path_buf(),
            });
        }

        let spawn_err = |source: std::io::Error| ServerError::Spawn {
            command: command.to_string(),
            source,
        };

        let (reader, writer) = std::io::pipe().map_err(spawn_err)?;
        let writer_err = writer.try_clone().map_err(spawn_err)?;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_err);

        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        // Drop our copies of the write end, otherwise the reader never sees EOF.
        drop(cmd);

        let pid = child.id().ok_or_else(|| {
            spawn_err(std::io::Error::other("process exited before its pid was known"))
        })?;

        tracing::info!(pid, command, cwd = %cwd.display(), "spawned process group");
        Ok(SpawnedProcess {
            pid,
            child,
            output: reader,
        })
    }

    /// Snapshot of what the OS reports for `pid`, falling back to what we launched.
    pub fn describe(&self, pid: u32, command: &str) -> PidRecord {
        let fallback_name = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.to_string());
        PidRecord {
            pid,
            name: procfs::process_name(pid).unwrap_or(fallback_name),
            started_at: procfs::process_started_at(pid).unwrap_or_else(now_epoch_secs),
        }
    }

    /// SIGTERM to the group and every descendant, then SIGKILL whatever outlives the grace period.
    ///
    /// `pid` is the group leader. The group is signalled even when the leader has
    /// already exited, since launch scripts often background the real server and
    /// return.
    pub async fn terminate(&self, pid: u32) -> TerminationOutcome {
        let targets = tree_of(pid);
        if targets.is_empty() && !procfs::group_alive(pid) {
            tracing::info!(pid, "process already gone");
            return TerminationOutcome {
                already_gone: true,
                ..Default::default()
            };
        }

        tracing::info!(pid, tree = ?targets, "terminating process tree");
        signal_group(pid, libc::SIGTERM);
        for p in &targets {
            signal_pid(*p, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + self.term_grace;
        let (survivors, group_remains) = loop {
            let alive: Vec<u32> = targets
                .iter()
                .copied()
                .filter(|p| procfs::is_alive(*p))
                .collect();
            let group_remains = procfs::group_alive(pid);
            if (alive.is_empty() && !group_remains) || tokio::time::Instant::now() >= deadline {
                break (alive, group_remains);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let mut forced = survivors;
        for p in procfs::group_members(pid) {
            if !forced.contains(&p) {
                forced.push(p);
            }
        }
        if !forced.is_empty() || group_remains {
            tracing::warn!(
                pid,
                forced = ?forced,
                grace_secs = self.term_grace.as_secs(),
                "graceful termination timed out; sending SIGKILL"
            );
            signal_group(pid, libc::SIGKILL);
            for p in &forced {
                signal_pid(*p, libc::SIGKILL);
            }
        }

        TerminationOutcome {
            already_gone: false,
            signalled: targets,
            forced,
        }
    }

    /// Whether a persisted record still names a live process.
    ///
    /// A live process whose start time disagrees with the record is a recycled PID
    /// and reported as not alive. Names are not compared: launch scripts often
    /// `exec` into the real server binary.
    pub fn detect_orphan(&self, record: &PidRecord) -> OrphanStatus {
        let alive = procfs::is_alive(record.pid);
        let live_name = procfs::process_name(record.pid);
        let live_started = procfs::process_started_at(record.pid);

        let recycled = alive
            && record.started_at != 0
            && live_started.is_some_and(|s| s.abs_diff(record.started_at) > 2);
        if recycled {
            tracing::warn!(
                pid = record.pid,
                recorded = %record.name,
                live = ?live_name,
                "pid was reused by an unrelated process"
            );
        }

        OrphanStatus {
            alive: alive && !recycled,
            name: if recycled {
                record.name.clone()
            } else {
                live_name.unwrap_or_else(|| record.name.clone())
            },
            started_at: if recycled {
                record.started_at
            } else {
                live_started.unwrap_or(record.started_at)
            },
        }
    }
}
