use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use smartvision_contracts::events::{EventPayload, LogLevel};
use smartvision_contracts::Emitter;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use thiserror::Error;

const EXIT_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("`{tool}` could not be run: {source}")]
    Probe {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("process {pid} is already gone")]
    Gone { pid: u32 },
    #[error("process {pid} refused the termination signal")]
    Refused { pid: u32 },
    #[error("process {pid} still running after {waited:?}")]
    StillRunning { pid: u32, waited: Duration },
}

/// Platform capability for finding and stopping processes that hold a file open.
pub trait HolderProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_supported(&self) -> bool {
        true
    }

    /// `path` is already normalized by the caller.
    fn enumerate_holders(&self, path: &Path) -> Result<Vec<ProcessHandle>, LockError>;

    fn terminate(&self, handle: &ProcessHandle) -> Result<(), LockError> {
        terminate_process(handle)
    }
}

/// Uses the `lsof` file-handle listing utility.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsofProbe;

impl HolderProbe for LsofProbe {
    fn name(&self) -> &'static str {
        "lsof"
    }

    fn enumerate_holders(&self, path: &Path) -> Result<Vec<ProcessHandle>, LockError> {
        let output = Command::new("lsof")
            .arg(path)
            .output()
            .map_err(|source| LockError::Probe {
                tool: "lsof",
                source,
            })?;
        // lsof exits 1 with no output when nothing holds the file.
        Ok(parse_lsof_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Walks the `/proc/<pid>/fd` handle tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcFdProbe;

impl HolderProbe for ProcFdProbe {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn enumerate_holders(&self, path: &Path) -> Result<Vec<ProcessHandle>, LockError> {
        let entries = fs::read_dir("/proc").map_err(|source| LockError::Probe {
            tool: "procfs",
            source,
        })?;
        let mut holders = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes owned by other users are unreadable; skip them.
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds = fds
                .flatten()
                .filter_map(|fd| fs::read_link(fd.path()).ok())
                .any(|target| normalize_path(&target) == path);
            if holds {
                let name = fs::read_to_string(entry.path().join("comm"))
                    .map(|comm| comm.trim().to_string())
                    .unwrap_or_default();
                holders.push(ProcessHandle { pid, name });
            }
        }
        Ok(holders)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedProbe;

impl HolderProbe for UnsupportedProbe {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn enumerate_holders(&self, _path: &Path) -> Result<Vec<ProcessHandle>, LockError> {
        Ok(Vec::new())
    }
}

pub fn default_probe() -> Box<dyn HolderProbe> {
    if cfg!(target_os = "macos") {
        Box::new(LsofProbe)
    } else if cfg!(target_os = "linux") {
        Box::new(ProcFdProbe)
    } else {
        Box::new(UnsupportedProbe)
    }
}

/// Frees a file from other processes before it is rewritten.
///
/// Holders are terminated one at a time with a settle pause after each. Nothing here
/// fails the caller: every problem becomes an event and the commit is attempted anyway.
pub struct LockReleaser {
    probe: Box<dyn HolderProbe>,
    settle: Duration,
    events: Emitter,
}

impl LockReleaser {
    pub fn new(probe: Box<dyn HolderProbe>, settle: Duration, events: Emitter) -> Self {
        Self {
            probe,
            settle,
            events,
        }
    }

    /// Returns how many holders were terminated.
    pub fn release(&self, path: &Path) -> usize {
        let target = normalize_path(path);
        if !self.probe.is_supported() {
            self.emit(
                LogLevel::Error,
                "lock_probe_unsupported",
                format!(
                    "Cannot check for processes holding {} on this platform",
                    target.display()
                ),
                &target,
                None,
            );
            return 0;
        }

        let holders = match self.probe.enumerate_holders(&target) {
            Ok(holders) => holders,
            Err(err) => {
                self.emit(
                    LogLevel::Warning,
                    "lock_release_failed",
                    format!("Could not list holders of {}: {err}", target.display()),
                    &target,
                    None,
                );
                return 0;
            }
        };

        let own_pid = std::process::id();
        let mut terminated = 0;
        for holder in holders.iter().filter(|holder| holder.pid != own_pid) {
            match self.probe.terminate(holder) {
                Ok(()) => {
                    terminated += 1;
                    self.emit(
                        LogLevel::Info,
                        "lock_holder_terminated",
                        format!(
                            "Terminated process {} ({}) using {}",
                            holder.name,
                            holder.pid,
                            target.display()
                        ),
                        &target,
                        Some(holder),
                    );
                }
                Err(err) => self.emit(
                    LogLevel::Warning,
                    "lock_release_failed",
                    format!(
                        "Could not terminate process {} ({}): {err}",
                        holder.name, holder.pid
                    ),
                    &target,
                    Some(holder),
                ),
            }
            if !self.settle.is_zero() {
                thread::sleep(self.settle);
            }
        }
        terminated
    }

    fn emit(
        &self,
        level: LogLevel,
        kind: &str,
        message: String,
        target: &Path,
        holder: Option<&ProcessHandle>,
    ) {
        let mut fields = EventPayload::new();
        fields.insert("path".to_string(), json!(target.display().to_string()));
        fields.insert("probe".to_string(), json!(self.probe.name()));
        if let Some(holder) = holder {
            fields.insert("pid".to_string(), json!(holder.pid));
            fields.insert("process".to_string(), json!(holder.name));
        }
        self.events.log(level, kind, message, fields);
    }
}

/// Absolute, symlink-resolved where possible, case-folded on case-insensitive platforms.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    });
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        PathBuf::from(absolute.to_string_lossy().to_lowercase())
    } else {
        absolute
    }
}

fn parse_lsof_output(stdout: &str) -> Vec<ProcessHandle> {
    let mut holders: Vec<ProcessHandle> = Vec::new();
    for line in stdout.lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let (Some(name), Some(pid)) = (columns.first(), columns.get(1)) else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        if holders.iter().any(|holder| holder.pid == pid) {
            continue;
        }
        holders.push(ProcessHandle {
            pid,
            name: (*name).to_string(),
        });
    }
    holders
}

fn terminate_process(handle: &ProcessHandle) -> Result<(), LockError> {
    let pid = Pid::from_u32(handle.pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    let Some(process) = system.process(pid) else {
        return Err(LockError::Gone { pid: handle.pid });
    };
    let sent = process.kill_with(Signal::Term).unwrap_or_else(|| process.kill());
    if !sent {
        return Err(LockError::Refused { pid: handle.pid });
    }

    let started = Instant::now();
    while started.elapsed() < EXIT_WAIT {
        let mut probe = System::new();
        probe.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        if probe.process(pid).is_none() {
            return Ok(());
        }
        thread::sleep(EXIT_POLL);
    }
    Err(LockError::StillRunning {
        pid: handle.pid,
        waited: EXIT_WAIT,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use smartvision_contracts::events::RecordingSink;
    use smartvision_contracts::Emitter;

    use super::{
        normalize_path, parse_lsof_output, HolderProbe, LockError, LockReleaser, ProcessHandle,
        UnsupportedProbe,
    };

    #[derive(Default)]
    struct FakeProbe {
        holders: Vec<ProcessHandle>,
        refuse: Vec<u32>,
        terminated: Arc<Mutex<Vec<u32>>>,
    }

    impl HolderProbe for FakeProbe {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn enumerate_holders(&self, _path: &Path) -> Result<Vec<ProcessHandle>, LockError> {
            Ok(self.holders.clone())
        }

        fn terminate(&self, handle: &ProcessHandle) -> Result<(), LockError> {
            if self.refuse.contains(&handle.pid) {
                return Err(LockError::Refused { pid: handle.pid });
            }
            if let Ok(mut terminated) = self.terminated.lock() {
                terminated.push(handle.pid);
            }
            Ok(())
        }
    }

    fn holder(pid: u32, name: &str) -> ProcessHandle {
        ProcessHandle {
            pid,
            name: name.to_string(),
        }
    }

    #[test]
    fn terminates_holders_in_order_and_skips_self() -> anyhow::Result<()> {
        let terminated = Arc::new(Mutex::new(Vec::new()));
        let probe = FakeProbe {
            holders: vec![
                holder(4001, "Preview"),
                holder(std::process::id(), "self"),
                holder(4002, "viewer"),
            ],
            refuse: Vec::new(),
            terminated: terminated.clone(),
        };
        let sink = Arc::new(RecordingSink::new());
        let releaser = LockReleaser::new(
            Box::new(probe),
            Duration::ZERO,
            Emitter::new(sink.clone(), "test"),
        );

        assert_eq!(releaser.release(Path::new("photo.jpg")), 2);
        assert_eq!(*terminated.lock().map_err(|_| anyhow::anyhow!("poisoned"))?, vec![4001, 4002]);
        assert_eq!(
            sink.kinds(),
            vec!["lock_holder_terminated", "lock_holder_terminated"]
        );
        Ok(())
    }

    #[test]
    fn termination_failures_are_logged_not_raised() {
        let probe = FakeProbe {
            holders: vec![holder(5001, "stubborn"), holder(5002, "ok")],
            refuse: vec![5001],
            ..FakeProbe::default()
        };
        let sink = Arc::new(RecordingSink::new());
        let releaser = LockReleaser::new(
            Box::new(probe),
            Duration::ZERO,
            Emitter::new(sink.clone(), "test"),
        );

        assert_eq!(releaser.release(Path::new("photo.jpg")), 1);
        assert_eq!(
            sink.kinds(),
            vec!["lock_release_failed", "lock_holder_terminated"]
        );
    }

    #[test]
    fn unsupported_platform_logs_an_error_and_skips() {
        let sink = Arc::new(RecordingSink::new());
        let releaser = LockReleaser::new(
            Box::new(UnsupportedProbe),
            Duration::ZERO,
            Emitter::new(sink.clone(), "test"),
        );
        assert_eq!(releaser.release(Path::new("photo.jpg")), 0);
        assert_eq!(sink.kinds(), vec!["lock_probe_unsupported"]);
    }

    #[test]
    fn lsof_output_skips_header_and_duplicate_pids() {
        let stdout = "COMMAND   PID  USER   FD   TYPE DEVICE SIZE/OFF NODE NAME\n\
Preview 812 ann  txt  REG  1,4  2048 123 /in/a.jpg\n\
Preview 812 ann  4r   REG  1,4  2048 123 /in/a.jpg\n\
QuickLook 977 ann 5r REG 1,4 2048 123 /in/a.jpg\n";
        assert_eq!(
            parse_lsof_output(stdout),
            vec![holder(812, "Preview"), holder(977, "QuickLook")]
        );
        assert!(parse_lsof_output("").is_empty());
    }

    #[test]
    fn normalized_paths_are_absolute() {
        assert!(normalize_path(Path::new("relative/photo.jpg")).is_absolute());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_fd_probe_finds_an_open_handle() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("held.jpg");
        std::fs::write(&path, b"x")?;
        let _held = std::fs::File::open(&path)?;

        let holders = super::ProcFdProbe.enumerate_holders(&normalize_path(&path))?;
        assert!(holders.iter().any(|found| found.pid == std::process::id()));
        Ok(())
    }
}
