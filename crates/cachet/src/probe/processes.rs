//! Host process enumeration for infra-group task matching.

use std::collections::HashMap;
use std::path::Path;

/// A running process: its PID and command line.
#[derive(Debug, Clone)]
pub struct Process {
    /// Process ID.
    pub pid: i32,
    /// Command line with NUL separators replaced by spaces.
    pub cmdline: String,
}

/// Enumerate all processes on the host, keyed by PID string.
///
/// Processes that vanish mid-scan are skipped silently.
#[must_use]
pub fn list_processes() -> HashMap<String, Process> {
    list_processes_under(Path::new("/proc"))
}

fn list_processes_under(proc_root: &Path) -> HashMap<String, Process> {
    let mut processes = HashMap::new();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return processes;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(pid) = name.parse::<i32>() else {
            continue;
        };
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw)
            .replace('\0', " ")
            .trim_end()
            .to_string();
        processes.insert(name, Process { pid, cmdline });
    }

    processes
}
