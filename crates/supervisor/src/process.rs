//! Services backed by a plain executable.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::children::ChildTable;
use crate::descriptor::ServiceDescriptor;
use crate::error::ServiceError;
use crate::service::Service;

/// The only environment services get.
pub const SERVICE_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin:/usr/local/bin:/usr/local/sbin:/opt/bin";

pub struct ProcessService {
    descriptor: Arc<ServiceDescriptor>,
    children: ChildTable,
}

impl ProcessService {
    pub fn new(descriptor: Arc<ServiceDescriptor>, children: ChildTable) -> Self {
        Self {
            descriptor,
            children,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.descriptor.path);
        command
            .args(&self.descriptor.args)
            .env_clear()
            .env("PATH", SERVICE_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Re-emit each line of `stream` as a log event tagged with the service.
async fn forward_output<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                info!(service = %service, stream, "{}", text.trim_end());
            }
            Err(e) => {
                debug!(service = %service, stream, error = %e, "output stream closed");
                break;
            }
        }
    }
}

#[async_trait]
impl Service for ProcessService {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn delay(&self) -> Option<Duration> {
        self.descriptor.delay
    }

    async fn run(&self) -> Result<Option<i32>, ServiceError> {
        let name = self.descriptor.name.clone();
        info!(
            service = %name,
            path = %self.descriptor.path.display(),
            args = ?self.descriptor.args,
            "starting service"
        );

        let mut child = self
            .children
            .spawn(&mut self.command())
            .map_err(|source| ServiceError::Spawn {
                name: name.clone(),
                source,
            })?;
        let pid = child.id();
        self.descriptor.set_running(true).await;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_output(name.clone(), "stdout", stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_output(name.clone(), "stderr", stderr)));
        }

        let status = child.wait().await;
        if let Some(pid) = pid {
            self.children.release(pid);
        }
        self.descriptor.set_running(false).await;
        for forwarder in forwarders {
            let _ = forwarder.await;
        }

        let status = status.map_err(|source| ServiceError::Wait { name, source })?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessService {
        let descriptor =
            ServiceDescriptor::new("test", "/bin/sh", vec!["-c".into(), script.into()]);
        ProcessService::new(Arc::new(descriptor), ChildTable::new())
    }

    #[tokio::test]
    async fn returns_exit_code() {
        assert_eq!(shell("exit 0").run().await.unwrap(), Some(0));
        assert_eq!(shell("echo out; echo err >&2; exit 3").run().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn clears_running_flag_and_child_table() {
        let svc = shell("exit 1");
        assert_eq!(svc.run().await.unwrap(), Some(1));
        assert!(!svc.descriptor().is_running().await);
        assert!(svc.children.is_empty());
    }

    #[tokio::test]
    async fn running_flag_is_set_while_alive() {
        let svc = Arc::new(shell("sleep 1"));
        let task = tokio::spawn({
            let svc = svc.clone();
            async move { svc.run().await }
        });
        let mut seen = false;
        for _ in 0..50 {
            if svc.descriptor().is_running().await {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
        assert_eq!(task.await.unwrap().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn environment_is_reset() {
        let script = format!("test \"$PATH\" = \"{SERVICE_PATH}\" && test -z \"$HOME\"");
        assert_eq!(shell(&script).run().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let descriptor = ServiceDescriptor::new("ghost", "/nonexistent/binary", Vec::new());
        let svc = ProcessService::new(Arc::new(descriptor), ChildTable::new());
        let err = svc.run().await.unwrap_err();
        assert!(matches!(err, ServiceError::Spawn { .. }));
        assert!(!svc.descriptor().is_running().await);
    }
}
