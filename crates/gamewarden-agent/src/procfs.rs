//! Thin process-table queries. Linux reads `/proc`; other unixes only get liveness.

#[cfg(target_os = "linux")]
use std::{collections::HashMap, sync::OnceLock};

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

/// Fields after the `comm` field of `/proc/<pid>/stat`, starting at `state`.
#[cfg(target_os = "linux")]
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parens; the last ')' closes it.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    Some(rest.split_whitespace().map(str::to_string).collect())
}

pub(crate) fn pid_exists(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(target_os = "linux")]
pub(crate) fn process_state(pid: u32) -> Option<char> {
    stat_fields(pid)?.first()?.chars().next()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_state(_pid: u32) -> Option<char> {
    None
}

/// Exists and is not a zombie/dead entry waiting to be reaped.
pub(crate) fn is_alive(pid: u32) -> bool {
    if !pid_exists(pid) {
        return false;
    }
    !matches!(process_state(pid), Some('Z' | 'X' | 'x'))
}

#[cfg(target_os = "linux")]
pub(crate) fn process_name(pid: u32) -> Option<String> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let name = s.trim_end_matches('\n').to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_name(_pid: u32) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn boot_time() -> Option<u64> {
    let s = std::fs::read_to_string("/proc/stat").ok()?;
    s.lines()
        .find_map(|l| l.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

/// Process start time in epoch seconds.
#[cfg(target_os = "linux")]
pub(crate) fn process_started_at(pid: u32) -> Option<u64> {
    // `starttime` is field 22 overall, index 19 counting from `state`.
    let ticks: u64 = stat_fields(pid)?.get(19)?.parse().ok()?;
    Some(boot_time()? + ticks / ticks_per_sec())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_started_at(_pid: u32) -> Option<u64> {
    None
}

/// All descendants of `root` (children, grandchildren, ...), breadth first.
#[cfg(target_os = "linux")]
pub(crate) fn descendants(root: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Some(ppid) = stat_fields(pid).and_then(|f| f.get(1)?.parse::<u32>().ok()) else {
            continue;
        };
        children.entry(ppid).or_default().push(pid);
    }

    let mut out = Vec::new();
    let mut queue = vec![root];
    while let Some(p) = queue.pop() {
        if let Some(kids) = children.get(&p) {
            for &k in kids {
                if k != root && !out.contains(&k) {
                    out.push(k);
                    queue.push(k);
                }
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

/// Live members of process group `pgid`, including ones reparented away from the leader.
#[cfg(target_os = "linux")]
pub(crate) fn group_members(pgid: u32) -> Vec<u32> {
    if !group_exists(pgid) {
        return Vec::new();
    }
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut out: Vec<u32> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| {
            // `pgrp` is index 2 counting from `state`.
            stat_fields(pid).and_then(|f| f.get(2)?.parse::<u32>().ok()) == Some(pgid)
        })
        .filter(|&pid| is_alive(pid))
        .collect();
    out.sort_unstable();
    out
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn group_members(_pgid: u32) -> Vec<u32> {
    Vec::new()
}

/// Whether any process, zombies included, still belongs to group `pgid`.
pub(crate) fn group_exists(pgid: u32) -> bool {
    if pgid <= 1 || pgid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(-(pgid as i32), 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Group has at least one member that is not waiting to be reaped.
pub(crate) fn group_alive(pgid: u32) -> bool {
    if cfg!(target_os = "linux") {
        !group_members(pgid).is_empty()
    } else {
        group_exists(pgid)
    }
}
