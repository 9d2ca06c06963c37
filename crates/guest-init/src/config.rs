//! Command line and environment configuration.
//!
//! The kernel passes unrecognised `key=value` boot arguments to init as
//! environment variables and bare words as arguments, so parsing must never
//! stop PID 1 from booting: anything unparseable falls back to defaults.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use container_ctl::TaskIo;

#[derive(Debug, Clone, Parser)]
#[command(name = "guest-init", version, about = "PID 1 for cloud guests")]
pub struct InitArgs {
    /// Directory of plain service descriptors
    #[arg(long, env = "GUEST_INIT_SERVICE_DIR", default_value = "/etc/init")]
    pub service_dir: PathBuf,

    /// Directory of persistent container descriptors (*.json)
    #[arg(long, env = "GUEST_INIT_CONTAINER_DIR", default_value = "/etc/containers")]
    pub container_dir: PathBuf,

    /// Instance attributes endpoint to long-poll
    #[arg(long, env = "GUEST_INIT_METADATA_URL", default_value = metadata_watch::DEFAULT_METADATA_URL)]
    pub metadata_url: String,

    /// containerd API socket
    #[arg(long, env = "GUEST_INIT_CONTAINERD_SOCKET", default_value = container_ctl::DEFAULT_SOCKET)]
    pub containerd_socket: PathBuf,

    /// containerd namespace for every container init creates
    #[arg(long, env = "GUEST_INIT_NAMESPACE", default_value = container_ctl::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Where directive and persistent container output goes: console, none,
    /// or an absolute file path
    #[arg(long, env = "GUEST_INIT_CONTAINER_OUTPUT", default_value = "console")]
    pub container_output: TaskIo,

    /// Block device holding /var and /opt (ext4)
    #[arg(long, env = "GUEST_INIT_STATE_DEVICE")]
    pub state_device: Option<PathBuf>,

    /// Seconds to wait for the containerd socket to accept connections
    #[arg(long, env = "GUEST_INIT_CONTAINERD_WAIT", default_value_t = 30)]
    pub containerd_wait: u32,

    /// Skip mounts and filesystem setup (already done, or not PID 1)
    #[arg(long, env = "GUEST_INIT_SKIP_BOOTSTRAP")]
    pub skip_bootstrap: bool,

    /// Debug-level logging
    #[arg(long, short, env = "GUEST_INIT_VERBOSE")]
    pub verbose: bool,
}

impl InitArgs {
    /// Parse `args`, falling back to defaults (environment still applied)
    /// when they do not parse. The parse error is returned for logging once
    /// logging is up.
    pub fn load<I, T>(args: I) -> (Self, Option<clap::Error>)
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_from(args) {
            Ok(parsed) => (parsed, None),
            Err(e) => match Self::try_parse_from(["guest-init"]) {
                Ok(defaults) => (defaults, Some(e)),
                Err(_) => (Self::builtin(), Some(e)),
            },
        }
    }

    fn builtin() -> Self {
        InitArgs {
            service_dir: PathBuf::from("/etc/init"),
            container_dir: PathBuf::from("/etc/containers"),
            metadata_url: metadata_watch::DEFAULT_METADATA_URL.to_string(),
            containerd_socket: PathBuf::from(container_ctl::DEFAULT_SOCKET),
            namespace: container_ctl::DEFAULT_NAMESPACE.to_string(),
            container_output: TaskIo::Console,
            state_device: None,
            containerd_wait: 30,
            skip_bootstrap: false,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let (args, err) = InitArgs::load(["guest-init"]);
        assert!(err.is_none());
        assert_eq!(args.service_dir, PathBuf::from("/etc/init"));
        assert_eq!(args.namespace, "caaos");
        assert_eq!(args.containerd_socket, PathBuf::from("/run/containerd/containerd.sock"));
        assert!(args.state_device.is_none());
        assert_eq!(args.container_output, TaskIo::Console);
    }

    #[test]
    fn container_output_to_file() {
        let (args, err) = InitArgs::load([
            "guest-init",
            "--container-output",
            "/var/log/containers.log",
        ]);
        assert!(err.is_none());
        assert_eq!(
            args.container_output,
            TaskIo::File(PathBuf::from("/var/log/containers.log"))
        );

        let (args, err) = InitArgs::load(["guest-init", "--container-output", "relative.log"]);
        assert!(err.is_some());
        assert_eq!(args.container_output, TaskIo::Console);
    }

    #[test]
    fn flags_override_defaults() {
        let (args, err) = InitArgs::load([
            "guest-init",
            "--state-device",
            "/dev/sdb1",
            "--service-dir",
            "/srv/init",
            "--skip-bootstrap",
        ]);
        assert!(err.is_none());
        assert_eq!(args.state_device, Some(PathBuf::from("/dev/sdb1")));
        assert_eq!(args.service_dir, PathBuf::from("/srv/init"));
        assert!(args.skip_bootstrap);
    }

    #[test]
    fn kernel_words_fall_back_to_defaults() {
        let (args, err) = InitArgs::load(["guest-init", "quiet", "splash"]);
        assert!(err.is_some());
        assert_eq!(args.container_dir, PathBuf::from("/etc/containers"));
    }

    #[test]
    fn builtin_matches_parsed_defaults() {
        let builtin = InitArgs::builtin();
        let (parsed, _) = InitArgs::load(["guest-init"]);
        assert_eq!(builtin.metadata_url, parsed.metadata_url);
        assert_eq!(builtin.containerd_wait, parsed.containerd_wait);
        assert_eq!(builtin.container_output, parsed.container_output);
    }
}
