//! Plain service descriptors.
//!
//! One file per service, one `KEY=value` pair per line:
//!
//! ```text
//! NAME="web"
//! DESCRIPTION="Front-end server"
//! PATH="/bin/httpd"
//! ARGS="--port,8080"
//! DELAY="2s"
//! ```
//!
//! Values may be wrapped in double quotes. `ARGS` is a comma-separated list
//! with all whitespace removed. Unknown keys and lines without `=` are
//! ignored.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use guest_common::parse_duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{DescriptorError, Result, SupervisorError};

#[derive(Debug)]
pub struct ServiceDescriptor {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub delay: Option<Duration>,
    running: RwLock<bool>,
}

fn unquote(value: &str) -> &str {
    value.trim_matches('"')
}

fn parse_args(value: &str) -> Vec<String> {
    let compact: String = unquote(value).chars().filter(|c| !c.is_whitespace()).collect();
    compact
        .split(',')
        .filter(|arg| !arg.is_empty())
        .map(str::to_string)
        .collect()
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            path: path.into(),
            args,
            delay: None,
            running: RwLock::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Parse descriptor text. `fallback_name` (usually the file name) is
    /// used when the file has no NAME entry.
    pub fn parse(fallback_name: &str, text: &str) -> std::result::Result<Self, DescriptorError> {
        let mut name = None;
        let mut description = String::new();
        let mut path = None;
        let mut args = Vec::new();
        let mut delay = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "NAME" => name = Some(unquote(value).to_string()),
                "DESCRIPTION" => description = unquote(value).to_string(),
                "PATH" => path = Some(unquote(value).trim().to_string()),
                "ARGS" => args = parse_args(value),
                "DELAY" => {
                    let raw = unquote(value).trim();
                    let parsed =
                        parse_duration(raw).map_err(|source| DescriptorError::BadDelay {
                            value: raw.to_string(),
                            source,
                        })?;
                    delay = Some(parsed);
                }
                _ => {}
            }
        }

        let path = path
            .filter(|p| !p.is_empty())
            .ok_or(DescriptorError::MissingPath)?;
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| fallback_name.to_string());

        Ok(Self {
            name,
            description,
            path: PathBuf::from(path),
            args,
            delay,
            running: RwLock::new(false),
        })
    }

    pub fn from_file(path: &Path) -> std::result::Result<Self, DescriptorError> {
        let text = fs::read_to_string(path)?;
        let fallback = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&fallback, &text)
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub(crate) async fn set_running(&self, running: bool) {
        *self.running.write().await = running;
    }
}

/// Result of loading a descriptor directory.
#[derive(Debug, Default)]
pub struct Descriptors {
    /// Well-formed descriptors in file name order.
    pub services: Vec<ServiceDescriptor>,
    /// Files that were rejected, in file name order.
    pub skipped: Vec<SupervisorError>,
}

/// Load every regular file in `dir` as a descriptor.
///
/// An unreadable directory is an error; individual bad files are logged and
/// reported in [`Descriptors::skipped`].
pub fn load_descriptors(dir: &Path) -> Result<Descriptors> {
    let read_dir_err = |source| SupervisorError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_dir_err)? {
        let entry = entry.map_err(read_dir_err)?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            files.push(entry.path());
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut loaded = Descriptors::default();
    for path in files {
        match ServiceDescriptor::from_file(&path) {
            Ok(descriptor) => {
                info!(
                    service = %descriptor.name,
                    path = %descriptor.path.display(),
                    "loaded service descriptor"
                );
                loaded.services.push(descriptor);
            }
            Err(source) => {
                let err = SupervisorError::Descriptor { path, source };
                warn!(error = %err, "skipping service descriptor");
                loaded.skipped.push(err);
            }
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_descriptor() {
        let text = "NAME=\"web\"\nDESCRIPTION=\"Front end\"\nPATH=\"/bin/httpd\"\nARGS=\"--port,8080\"\nDELAY=\"2s\"\n";
        let d = ServiceDescriptor::parse("web.service", text).unwrap();
        assert_eq!(d.name, "web");
        assert_eq!(d.description, "Front end");
        assert_eq!(d.path, PathBuf::from("/bin/httpd"));
        assert_eq!(d.args, vec!["--port", "8080"]);
        assert_eq!(d.delay, Some(Duration::from_secs(2)));
    }

    #[test]
    fn args_whitespace_is_stripped() {
        let d = ServiceDescriptor::parse("x", "PATH=/bin/x\nARGS= -a , -b value ,c\n").unwrap();
        assert_eq!(d.args, vec!["-a", "-bvalue", "c"]);
    }

    #[test]
    fn empty_args_means_no_args() {
        let d = ServiceDescriptor::parse("x", "PATH=/bin/x\nARGS=\"\"\n").unwrap();
        assert!(d.args.is_empty());
        assert_eq!(d.delay, None);
    }

    #[test]
    fn unknown_keys_and_bare_lines_are_ignored() {
        let text = "# comment\nPATH=/bin/x\nRESTART=always\njunk line\n\n";
        let d = ServiceDescriptor::parse("fallback", text).unwrap();
        assert_eq!(d.name, "fallback");
        assert_eq!(d.path, PathBuf::from("/bin/x"));
    }

    #[test]
    fn value_may_contain_equals() {
        let d = ServiceDescriptor::parse("x", "PATH=/bin/x\nARGS=--opt=1,--b=2\n").unwrap();
        assert_eq!(d.args, vec!["--opt=1", "--b=2"]);
    }

    #[test]
    fn missing_path_is_malformed() {
        let err = ServiceDescriptor::parse("x", "NAME=\"x\"\n").unwrap_err();
        assert!(matches!(err, DescriptorError::MissingPath));
        let err = ServiceDescriptor::parse("x", "PATH=\"\"\n").unwrap_err();
        assert!(matches!(err, DescriptorError::MissingPath));
    }

    #[test]
    fn bad_delay_is_malformed() {
        let err = ServiceDescriptor::parse("x", "PATH=/bin/x\nDELAY=\"soon\"\n").unwrap_err();
        assert!(matches!(err, DescriptorError::BadDelay { .. }));
    }

    #[tokio::test]
    async fn running_flag_round_trips() {
        let d = ServiceDescriptor::parse("x", "PATH=/bin/x\n").unwrap();
        assert!(!d.is_running().await);
        d.set_running(true).await;
        assert!(d.is_running().await);
    }

    #[test]
    fn loads_well_formed_and_reports_malformed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("30-c"), "NAME=\"c\"\nPATH=/bin/c\n").unwrap();
        fs::write(dir.path().join("10-a"), "NAME=\"a\"\nPATH=/bin/a\n").unwrap();
        fs::write(dir.path().join("20-b"), "NAME=\"b\"\nPATH=/bin/b\n").unwrap();
        fs::write(dir.path().join("15-bad"), "NAME=\"bad\"\n").unwrap();
        fs::write(dir.path().join("25-delay"), "PATH=/bin/d\nDELAY=x\n").unwrap();
        fs::write(dir.path().join("40-binary"), [0xffu8, 0xfe, 0x00]).unwrap();
        fs::create_dir(dir.path().join("00-subdir")).unwrap();

        let loaded = load_descriptors(dir.path()).unwrap();
        let names: Vec<_> = loaded.services.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(loaded.skipped.len(), 3);
        assert!(
            loaded
                .skipped
                .iter()
                .all(|e| e.category() == guest_common::Category::Malformed)
        );
        match &loaded.skipped[0] {
            SupervisorError::Descriptor { path, .. } => assert!(path.ends_with("15-bad")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unreadable_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_descriptors(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, SupervisorError::ReadDir { .. }));
        assert!(err.category().is_fatal());
    }
}
