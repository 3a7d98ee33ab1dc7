//! OS process helpers: process-group signalling, liveness checks and discovery of
//! transcoder processes running against the working root.
//!
//! Every transcoder is started as the leader of its own process group, so
//! termination targets the group id rather than a bare pid that the OS may have
//! handed to an unrelated process in the meantime.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forced,
}

/// A transcoder process found in the OS process table.
#[derive(Debug, Clone, Serialize)]
pub struct TranscoderProcess {
    pub pid: u32,
    pub age_secs: u64,
    pub command: String,
}

impl TranscoderProcess {
    pub fn age(&self) -> Duration {
        Duration::from_secs(self.age_secs)
    }
}

/// Put the child into a fresh process group whose id equals its pid.
pub fn isolate_process_group(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Signal the process group led by `pid`. `Ok(false)` means nothing was there.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: TermSignal) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let sig = match signal {
        TermSignal::Graceful => Signal::SIGTERM,
        TermSignal::Forced => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub fn signal_group(pid: u32, signal: TermSignal) -> std::io::Result<bool> {
    signal_pid(pid, signal)
}

/// Signal a single process; for strays that do not lead their own group.
#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: TermSignal) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match signal {
        TermSignal::Graceful => Signal::SIGTERM,
        TermSignal::Forced => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub fn signal_pid(pid: u32, _signal: TermSignal) -> std::io::Result<bool> {
    let sys = sysinfo::System::new_all();
    Ok(sys
        .process(sysinfo::Pid::from_u32(pid))
        .map(|p| p.kill())
        .unwrap_or(false))
}

/// Whether `pid` still names a live process.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    let sys = sysinfo::System::new_all();
    sys.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// An exited-but-unreaped child still answers signal 0; treat it as dead.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // state follows the parenthesised command name
            let after = stat.rsplit_once(')')?.1;
            after.split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Transcoder processes whose command line references `working_root`.
pub fn find_transcoders(binary: &Path, working_root: &Path) -> Vec<TranscoderProcess> {
    let binary_name = binary
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ffmpeg".into());
    let root = working_root.to_string_lossy().into_owned();

    let sys = sysinfo::System::new_all();
    let own_pid = std::process::id();

    sys.processes()
        .iter()
        .filter_map(|(pid, process)| {
            let name = Path::new(process.name()).to_string_lossy().into_owned();
            if !name.starts_with(&binary_name) || pid.as_u32() == own_pid {
                return None;
            }
            let args: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| Path::new(arg).to_string_lossy().into_owned())
                .collect();
            if !args.iter().any(|arg| arg.contains(&root)) {
                return None;
            }
            Some(TranscoderProcess {
                pid: pid.as_u32(),
                age_secs: process.run_time(),
                command: args.join(" "),
            })
        })
        .collect()
}
