//! PID 1 responsibilities: signal dispositions and orphan reaping.
//!
//! Uses `sigaction` (not `signal`) for reliable, non-resetting handlers.
//!
//! Orphans re-parented to init must be reaped, but a blanket
//! `waitpid(-1)` would also collect supervised children and steal their
//! exit status from the tasks waiting on them. The reaper therefore scans
//! `/proc` for zombies whose parent is us and reaps each one by pid,
//! skipping every pid registered in the [`ChildTable`].

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use supervisor::ChildTable;
use tracing::debug;

const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Install a `sigaction` disposition for the given signal with `SA_RESTART`.
fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) {
    // SAFETY: zeroed sigaction is valid; we fill sa_handler and sa_flags.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler;
    sa.sa_flags = libc::SA_RESTART;
    // SAFETY: sa is properly initialized, sig is a valid signal number.
    unsafe {
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// Ignore job-control and broken-pipe signals.
///
/// SIGCHLD stays at SIG_DFL: ignoring it would make the kernel auto-reap
/// children and break every `wait` on a supervised process.
pub fn setup_signal_handlers() {
    set_handler(libc::SIGTTIN, libc::SIG_IGN);
    set_handler(libc::SIGTTOU, libc::SIG_IGN);
    set_handler(libc::SIGPIPE, libc::SIG_IGN);
}

/// State and parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are read after the last `)`.
pub fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Zombie children of `parent` listed under `proc_root`.
pub fn zombie_children(proc_root: &Path, parent: u32) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            fs::read_to_string(proc_root.join(pid.to_string()).join("stat"))
                .ok()
                .and_then(|stat| parse_stat(&stat))
                .is_some_and(|(state, ppid)| state == 'Z' && ppid == parent)
        })
        .collect()
}

/// Reap every unsupervised zombie child once. Returns how many were reaped.
pub fn reap_orphans(children: &ChildTable) -> usize {
    let zombies = zombie_children(Path::new("/proc"), std::process::id());
    children.reap_unsupervised(zombies, |pid| {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                debug!(pid, ?status, "reaped orphan");
                true
            }
            Err(_) => false,
        }
    })
}

/// Reap orphans in the background for the life of the process.
pub fn spawn_reaper(children: ChildTable) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("reaper".into())
        .spawn(move || {
            loop {
                reap_orphans(&children);
                thread::sleep(REAP_INTERVAL);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_with_awkward_command_name() {
        let stat = "1234 (my (odd) proc) Z 1 1234 1234 0 -1 4194560 0 0";
        assert_eq!(parse_stat(stat), Some(('Z', 1)));
        assert_eq!(parse_stat("99 (sh) S 42 99 99"), Some(('S', 42)));
        assert_eq!(parse_stat("garbage"), None);
        assert_eq!(parse_stat("1 (x) R"), None);
    }

    #[test]
    fn finds_zombies_of_parent_only() {
        let dir = tempfile::tempdir().unwrap();
        let write = |pid: &str, stat: &str| {
            fs::create_dir_all(dir.path().join(pid)).unwrap();
            fs::write(dir.path().join(pid).join("stat"), stat).unwrap();
        };
        write("10", "10 (a) Z 1 10 10");
        write("11", "11 (b) S 1 11 11");
        write("12", "12 (c) Z 7 12 12");
        write("13", "13 (d d) Z 1 13 13");
        fs::create_dir_all(dir.path().join("self")).unwrap();

        let mut zombies = zombie_children(dir.path(), 1);
        zombies.sort_unstable();
        assert_eq!(zombies, vec![10, 13]);
    }

    #[test]
    fn unsupervised_zombie_is_reaped() {
        let table = ChildTable::new();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        for _ in 0..500 {
            let stat = fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
            if parse_stat(&stat).is_some_and(|(state, _)| state == 'Z') {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(reap_orphans(&table) >= 1);
        // Already collected, so the handle can no longer wait on it.
        assert!(child.wait().is_err());
    }
}
