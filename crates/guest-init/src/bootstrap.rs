//! Boot-time filesystem setup.
//!
//! The work is planned as a list of [`Step`]s and then applied. Every step
//! fails soft: a failure is logged and the next step runs, so a missing
//! controller or an odd kernel never stops the guest from booting.

use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use guest_common::Category;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, info, warn};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const PROC_CGROUPS: &str = "/proc/cgroups";
const STATE_MOUNT: &str = "/mnt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Mount {
        source: String,
        target: PathBuf,
        fstype: Option<String>,
        flags: MsFlags,
        data: Option<String>,
    },
    Mkdir {
        path: PathBuf,
        mode: u32,
    },
    Symlink {
        original: PathBuf,
        link: PathBuf,
    },
    Write {
        path: PathBuf,
        contents: String,
    },
    Unmount {
        target: PathBuf,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("mount {target}: {source}")]
    Mount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("unmount {target}: {source}")]
    Unmount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StepError {
    pub fn category(&self) -> Category {
        Category::Soft
    }
}

fn fs_mount(source: &str, target: &str, fstype: &str, flags: MsFlags, data: Option<&str>) -> Step {
    Step::Mount {
        source: source.to_string(),
        target: PathBuf::from(target),
        fstype: Some(fstype.to_string()),
        flags,
        data: data.map(str::to_string),
    }
}

fn bind(source: &str, target: &str) -> Step {
    Step::Mount {
        source: source.to_string(),
        target: PathBuf::from(target),
        fstype: None,
        flags: MsFlags::MS_BIND,
        data: None,
    }
}

fn mkdir(path: &str, mode: u32) -> Step {
    Step::Mkdir {
        path: PathBuf::from(path),
        mode,
    }
}

fn link(original: &str, link: &str) -> Step {
    Step::Symlink {
        original: PathBuf::from(original),
        link: PathBuf::from(link),
    }
}

/// Mount /proc. Runs first, on its own, so logging can read the uptime.
pub fn proc_step() -> Step {
    fs_mount(
        "proc",
        "/proc",
        "proc",
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME,
        None,
    )
}

/// Everything after /proc up to and including the cgroup root.
pub fn plan(state_device: Option<&Path>) -> Vec<Step> {
    let mut steps = Vec::new();

    if let Some(device) = state_device {
        steps.push(Step::Mount {
            source: device.to_string_lossy().into_owned(),
            target: PathBuf::from(STATE_MOUNT),
            fstype: Some("ext4".to_string()),
            flags: MsFlags::empty(),
            data: None,
        });
        steps.push(mkdir("/mnt/var", 0o755));
        steps.push(mkdir("/mnt/opt", 0o755));
        steps.push(bind("/mnt/var", "/var"));
        steps.push(bind("/mnt/opt", "/opt"));
        steps.push(Step::Unmount {
            target: PathBuf::from(STATE_MOUNT),
        });
    }

    steps.push(fs_mount(
        "tmpfs",
        "/run",
        "tmpfs",
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        Some("size=10%,mode=755"),
    ));
    steps.push(fs_mount(
        "tmpfs",
        "/tmp",
        "tmpfs",
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        Some("size=10%,mode=1777"),
    ));

    for dir in ["cache", "lib", "local", "lock", "log", "opt", "spool"] {
        steps.push(Step::Mkdir {
            path: Path::new("/var").join(dir),
            mode: 0o755,
        });
    }
    steps.push(mkdir("/var/empty", 0o555));
    steps.push(mkdir("/var/tmp", 0o1777));
    steps.push(link("/run", "/var/run"));

    steps.push(link("/proc/self/fd", "/dev/fd"));
    steps.push(link("/proc/self/fd/0", "/dev/stdin"));
    steps.push(link("/proc/self/fd/1", "/dev/stdout"));
    steps.push(link("/proc/self/fd/2", "/dev/stderr"));
    steps.push(link("/proc/kcore", "/dev/kcore"));

    steps.push(fs_mount(
        "sysfs",
        "/sys",
        "sysfs",
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    ));
    steps.push(fs_mount(
        "cgroup_root",
        CGROUP_ROOT,
        "tmpfs",
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("mode=755"),
    ));
    steps
}

/// Enabled controllers from `/proc/cgroups`:
/// `#subsys_name hierarchy num_cgroups enabled`.
pub fn parse_cgroups(table: &str) -> Vec<String> {
    table
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, _, _, enabled] if *enabled == "1" => Some((*name).to_string()),
                _ => None,
            }
        })
        .collect()
}

/// One mount per enabled controller, then memory hierarchy accounting.
pub fn cgroup_plan(controllers: &[String]) -> Vec<Step> {
    let mut steps = Vec::new();
    for name in controllers {
        let target = Path::new(CGROUP_ROOT).join(name);
        steps.push(Step::Mkdir {
            path: target.clone(),
            mode: 0o555,
        });
        steps.push(Step::Mount {
            source: "cgroup".to_string(),
            target,
            fstype: Some("cgroup".to_string()),
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            data: Some(name.clone()),
        });
    }
    if controllers.iter().any(|c| c == "memory") {
        steps.push(Step::Write {
            path: Path::new(CGROUP_ROOT).join("memory/memory.use_hierarchy"),
            contents: "1".to_string(),
        });
    }
    steps
}

pub fn apply_step(step: &Step) -> Result<(), StepError> {
    match step {
        Step::Mount {
            source,
            target,
            fstype,
            flags,
            data,
        } => {
            if let Err(e) = fs::create_dir_all(target) {
                debug!(mount_point = %target.display(), error = %e, "cannot create mount point");
            }
            mount(
                Some(source.as_str()),
                target.as_path(),
                fstype.as_deref(),
                *flags,
                data.as_deref(),
            )
            .map_err(|source| StepError::Mount {
                target: target.clone(),
                source,
            })
        }
        Step::Mkdir { path, mode } => {
            let io_err = |source| StepError::Io {
                path: path.clone(),
                source,
            };
            fs::create_dir_all(path).map_err(io_err)?;
            fs::set_permissions(path, fs::Permissions::from_mode(*mode)).map_err(io_err)
        }
        Step::Symlink { original, link } => match symlink(original, link) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => other.map_err(|source| StepError::Io {
                path: link.clone(),
                source,
            }),
        },
        Step::Write { path, contents } => {
            fs::write(path, contents).map_err(|source| StepError::Io {
                path: path.clone(),
                source,
            })
        }
        Step::Unmount { target } => {
            umount2(target.as_path(), MntFlags::empty()).map_err(|source| StepError::Unmount {
                target: target.clone(),
                source,
            })
        }
    }
}

/// Apply `steps` in order. Returns how many failed.
pub fn apply(steps: &[Step]) -> usize {
    let mut failed = 0;
    for step in steps {
        if let Err(e) = apply_step(step) {
            warn!(error = %e, category = %e.category(), "boot step failed, continuing");
            failed += 1;
        }
    }
    failed
}

/// The full boot sequence after /proc.
pub fn run(state_device: Option<&Path>) {
    let mut failed = apply(&plan(state_device));
    let controllers = match fs::read_to_string(PROC_CGROUPS) {
        Ok(table) => parse_cgroups(&table),
        Err(e) => {
            warn!(error = %e, "cannot read {PROC_CGROUPS}, skipping cgroup controllers");
            Vec::new()
        }
    };
    debug!(?controllers, "cgroup controllers");
    failed += apply(&cgroup_plan(&controllers));
    info!(failed, "filesystem setup done");
}
