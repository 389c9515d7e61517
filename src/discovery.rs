//! Thread enumeration through /proc/<pid>/task

use std::path::Path;

use nix::unistd::Pid;

use crate::error::{Result, TraceError};

/// Parse a task directory entry name into a thread id
///
/// Returns None for anything that is not a positive decimal integer.
pub fn parse_tid(name: &str) -> Option<Pid> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match name.parse::<i32>() {
        Ok(tid) if tid > 0 => Some(Pid::from_raw(tid)),
        _ => None,
    }
}

/// List the threads of `pid` under an arbitrary procfs root
///
/// The result is sorted and free of duplicates. Malformed entries are
/// skipped; an unreadable task directory is an error, never an empty list.
pub fn list_threads_in(proc_root: &Path, pid: Pid) -> Result<Vec<Pid>> {
    let task_dir = proc_root.join(pid.to_string()).join("task");
    let discovery_error = |source| TraceError::Discovery { pid, source };

    let mut tids = Vec::new();
    for entry in std::fs::read_dir(&task_dir).map_err(discovery_error)? {
        let entry = entry.map_err(discovery_error)?;
        let name = entry.file_name();
        match name.to_str().and_then(parse_tid) {
            Some(tid) => tids.push(tid),
            None => tracing::debug!("Skipping malformed task entry {:?}", name),
        }
    }

    tids.sort_unstable_by_key(|tid| tid.as_raw());
    tids.dedup();
    tracing::debug!("Process {} has {} threads", pid, tids.len());
    Ok(tids)
}

/// Whether the process still has a /proc entry
pub fn process_exists(proc_root: &Path, pid: Pid) -> bool {
    proc_root.join(pid.to_string()).exists()
}
