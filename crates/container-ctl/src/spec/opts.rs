use serde_json::{Value, json};

use super::{ALL_CAPABILITIES, Device, Mount, Spec, merge};
use crate::error::{ControlError, Result};
use crate::runtime::ImageConfig;

/// Host files shared read-only with host-network containers.
const HOST_NETWORK_FILES: &[&str] = &["/etc/hosts", "/etc/resolv.conf", "/etc/ssl/certs"];

/// One step of spec composition.
#[derive(Debug, Clone)]
pub enum SpecOpt {
    /// Seed process args, env, cwd and user from an image.
    ImageConfig(ImageConfig),
    /// Deep-merge a user-supplied JSON fragment.
    Fragment(Value),
    Mounts(Vec<Mount>),
    /// Share the host's network namespace and name resolution.
    HostNetwork,
    Privileged,
    AllDevicesAllowed,
    HostDevices(Vec<Device>),
}

impl SpecOpt {
    pub fn name(&self) -> &'static str {
        match self {
            SpecOpt::ImageConfig(_) => "image-config",
            SpecOpt::Fragment(_) => "fragment",
            SpecOpt::Mounts(_) => "mounts",
            SpecOpt::HostNetwork => "host-network",
            SpecOpt::Privileged => "privileged",
            SpecOpt::AllDevicesAllowed => "all-devices-allowed",
            SpecOpt::HostDevices(_) => "host-devices",
        }
    }

    pub fn apply(self, mut spec: Spec) -> Result<Spec> {
        match self {
            SpecOpt::ImageConfig(config) => with_image_config(&mut spec, &config)?,
            SpecOpt::Fragment(fragment) => merge(&mut spec.0, &fragment),
            SpecOpt::Mounts(mounts) => {
                let list = mount_list(&mut spec)?;
                for mount in mounts {
                    list.push(
                        serde_json::to_value(mount)
                            .map_err(|e| ControlError::Spec(e.to_string()))?,
                    );
                }
            }
            SpecOpt::HostNetwork => with_host_network(&mut spec)?,
            SpecOpt::Privileged => with_privileged(&mut spec)?,
            SpecOpt::AllDevicesAllowed => {
                let resources = object(&mut spec, &["linux", "resources"])?;
                resources.insert("devices".into(), json!([{"allow": true, "access": "rwm"}]));
            }
            SpecOpt::HostDevices(devices) => {
                let list = array(&mut spec, &["linux", "devices"])?;
                list.extend(devices.iter().map(Device::to_value));
                let rules = array(&mut spec, &["linux", "resources", "devices"])?;
                rules.extend(devices.iter().map(Device::allow_rule));
            }
        }
        Ok(spec)
    }
}

fn object<'a>(
    spec: &'a mut Spec,
    path: &[&str],
) -> Result<&'a mut serde_json::Map<String, Value>> {
    spec.object_mut(path)
        .ok_or_else(|| ControlError::Spec(format!("{} is not an object", path.join("."))))
}

fn array<'a>(spec: &'a mut Spec, path: &[&str]) -> Result<&'a mut Vec<Value>> {
    spec.array_mut(path)
        .ok_or_else(|| ControlError::Spec(format!("{} is not an array", path.join("."))))
}

fn mount_list(spec: &mut Spec) -> Result<&mut Vec<Value>> {
    array(spec, &["mounts"])
}

fn with_image_config(spec: &mut Spec, config: &ImageConfig) -> Result<()> {
    let process = object(spec, &["process"])?;

    if let Some(image_env) = &config.env {
        let mut env: Vec<String> = process
            .get("env")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        for entry in image_env {
            let key = env_key(entry);
            match env.iter_mut().find(|existing| env_key(existing) == key) {
                Some(existing) => *existing = entry.clone(),
                None => env.push(entry.clone()),
            }
        }
        process.insert("env".into(), json!(env));
    }

    let args: Vec<&String> = config
        .entrypoint
        .iter()
        .flatten()
        .chain(config.cmd.iter().flatten())
        .collect();
    if !args.is_empty() {
        process.insert("args".into(), json!(args));
    }

    if let Some(dir) = config.working_dir.as_deref().filter(|d| !d.is_empty()) {
        process.insert("cwd".into(), json!(dir));
    }

    if let Some(user) = config.user.as_deref().filter(|u| !u.is_empty()) {
        let (uid, gid) = parse_user(user)?;
        process.insert("user".into(), json!({"uid": uid, "gid": gid}));
    }
    Ok(())
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

/// Numeric `uid[:gid]`. Name lookup needs the image's passwd file, which is
/// not mounted at composition time.
fn parse_user(user: &str) -> Result<(u32, u32)> {
    let invalid = || ControlError::Spec(format!("unsupported image user {user:?}, expected uid[:gid]"));
    let (uid, gid) = match user.split_once(':') {
        Some((uid, gid)) => (uid, Some(gid)),
        None => (user, None),
    };
    let uid: u32 = uid.parse().map_err(|_| invalid())?;
    let gid = match gid {
        Some(gid) => gid.parse().map_err(|_| invalid())?,
        None => uid,
    };
    Ok((uid, gid))
}

fn with_host_network(spec: &mut Spec) -> Result<()> {
    let namespaces = array(spec, &["linux", "namespaces"])?;
    namespaces.retain(|ns| ns.get("type").and_then(Value::as_str) != Some("network"));

    let mounts = mount_list(spec)?;
    for path in HOST_NETWORK_FILES {
        mounts.push(json!({
            "destination": path,
            "type": "bind",
            "source": path,
            "options": ["rbind", "ro"],
        }));
    }
    Ok(())
}

fn with_privileged(spec: &mut Spec) -> Result<()> {
    let caps = object(spec, &["process", "capabilities"])?;
    for set in ["bounding", "effective", "permitted"] {
        caps.insert(set.into(), json!(ALL_CAPABILITIES));
    }

    spec.remove(&["linux", "maskedPaths"]);
    spec.remove(&["linux", "readonlyPaths"]);
    spec.remove(&["linux", "seccomp"]);
    spec.remove(&["process", "apparmorProfile"]);
    spec.remove(&["process", "selinuxLabel"]);

    for mount in mount_list(spec)?.iter_mut() {
        let kind = mount.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != "sysfs" && kind != "cgroup" && kind != "cgroup2" {
            continue;
        }
        if let Some(options) = mount.get_mut("options").and_then(Value::as_array_mut) {
            options.retain(|opt| opt.as_str() != Some("ro"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::DEFAULT_PATH_ENV;
    use crate::spec::devices::DeviceKind;
    use crate::spec::default_spec;
    use std::path::PathBuf;

    fn base() -> Spec {
        default_spec("guest", "c1")
    }

    #[test]
    fn image_config_sets_process() {
        let config = ImageConfig {
            user: Some("1000:100".into()),
            env: Some(vec!["PATH=/app/bin".into(), "MODE=prod".into()]),
            entrypoint: Some(vec!["/entry".into()]),
            cmd: Some(vec!["serve".into(), "--port=80".into()]),
            working_dir: Some("/app".into()),
        };
        let spec = SpecOpt::ImageConfig(config).apply(base()).unwrap();
        assert_eq!(spec.get("/process/env"), Some(&json!(["PATH=/app/bin", "MODE=prod"])));
        assert_eq!(spec.get("/process/args"), Some(&json!(["/entry", "serve", "--port=80"])));
        assert_eq!(spec.get("/process/cwd"), Some(&json!("/app")));
        assert_eq!(spec.get("/process/user"), Some(&json!({"uid": 1000, "gid": 100})));
    }

    #[test]
    fn image_config_keeps_defaults_when_empty() {
        let spec = SpecOpt::ImageConfig(ImageConfig::default()).apply(base()).unwrap();
        assert_eq!(spec.get("/process/env"), Some(&json!([DEFAULT_PATH_ENV])));
        assert_eq!(spec.get("/process/args"), Some(&json!([])));
        assert_eq!(spec.get("/process/cwd"), Some(&json!("/")));
    }

    #[test]
    fn named_user_is_rejected() {
        let config = ImageConfig {
            user: Some("nginx".into()),
            ..Default::default()
        };
        let err = SpecOpt::ImageConfig(config).apply(base()).unwrap_err();
        assert!(matches!(err, ControlError::Spec(_)));
        assert_eq!(parse_user("7").unwrap(), (7, 7));
    }

    #[test]
    fn mounts_are_appended() {
        let before = base().get("/mounts").and_then(Value::as_array).map(Vec::len).unwrap();
        let spec = SpecOpt::Mounts(vec![Mount {
            destination: "/data".into(),
            kind: "bind".into(),
            source: "/mnt/data".into(),
            options: vec!["rbind".into(), "rw".into()],
        }])
        .apply(base())
        .unwrap();
        let mounts = spec.get("/mounts").and_then(Value::as_array).unwrap();
        assert_eq!(mounts.len(), before + 1);
        assert_eq!(
            mounts.last(),
            Some(&json!({"destination": "/data", "type": "bind", "source": "/mnt/data", "options": ["rbind", "rw"]}))
        );
    }

    #[test]
    fn host_network_drops_namespace_and_binds_resolver_files() {
        let spec = SpecOpt::HostNetwork.apply(base()).unwrap();
        let namespaces = spec.get("/linux/namespaces").and_then(Value::as_array).unwrap();
        assert!(!namespaces.contains(&json!({"type": "network"})));
        assert_eq!(namespaces.len(), 4);
        let destinations: Vec<&str> = spec
            .get("/mounts")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(|m| m["destination"].as_str())
            .collect();
        for file in HOST_NETWORK_FILES {
            assert!(destinations.contains(file), "{file}");
        }
    }

    #[test]
    fn privileged_lifts_confinement() {
        let mut start = base();
        start.object_mut(&["linux"]).unwrap().insert("seccomp".into(), json!({"defaultAction": "SCMP_ACT_ERRNO"}));
        let spec = SpecOpt::Privileged.apply(start).unwrap();
        assert_eq!(spec.get("/process/capabilities/permitted"), Some(&json!(ALL_CAPABILITIES)));
        assert_eq!(spec.get("/linux/maskedPaths"), None);
        assert_eq!(spec.get("/linux/readonlyPaths"), None);
        assert_eq!(spec.get("/linux/seccomp"), None);
        let sysfs = spec
            .get("/mounts")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .find(|m| m["type"] == "sysfs")
            .unwrap();
        assert_eq!(sysfs["options"], json!(["nosuid", "noexec", "nodev"]));
    }

    #[test]
    fn all_devices_replaces_rules() {
        let spec = SpecOpt::AllDevicesAllowed.apply(base()).unwrap();
        assert_eq!(
            spec.get("/linux/resources/devices"),
            Some(&json!([{"allow": true, "access": "rwm"}]))
        );
    }

    #[test]
    fn host_devices_are_listed_and_allowed() {
        let device = Device {
            path: PathBuf::from("/dev/kvm"),
            kind: DeviceKind::Char,
            major: 10,
            minor: 232,
            file_mode: 0o660,
            uid: 0,
            gid: 108,
        };
        let spec = SpecOpt::HostDevices(vec![device]).apply(base()).unwrap();
        assert_eq!(spec.get("/linux/devices/0/path"), Some(&json!("/dev/kvm")));
        let rules = spec.get("/linux/resources/devices").and_then(Value::as_array).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1]["major"], 10);
    }

    #[test]
    fn fragment_merges() {
        let spec = SpecOpt::Fragment(json!({"process": {"terminal": true}}))
            .apply(base())
            .unwrap();
        assert_eq!(spec.get("/process/terminal"), Some(&json!(true)));
        assert_eq!(spec.get("/process/cwd"), Some(&json!("/")));
    }
}
