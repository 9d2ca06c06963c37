//! Restart loops.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::service::Service;

/// Pause after a run that failed before the service could exit (spawn or
/// runtime error). Exits themselves restart after the configured delay only.
pub const FAILURE_PAUSE: Duration = Duration::from_secs(1);

/// Run `service` forever: wait its delay, run it, log how it ended, repeat.
pub async fn supervise(service: Arc<dyn Service>) -> Infallible {
    let name = service.name().to_string();
    let mut runs: u64 = 0;
    loop {
        if let Some(delay) = service.delay() {
            tokio::time::sleep(delay).await;
        }
        runs += 1;
        match service.run().await {
            Ok(Some(code)) => info!(service = %name, code, runs, "service exited, restarting"),
            Ok(None) => warn!(service = %name, runs, "service killed by signal, restarting"),
            Err(e) => {
                error!(service = %name, runs, error = %e, "service failed to run");
                tokio::time::sleep(FAILURE_PAUSE).await;
            }
        }
    }
}

/// Owns one supervision task per service. Dropping it aborts them all.
#[derive(Default)]
pub struct Supervisor {
    tasks: JoinSet<Infallible>,
    names: Vec<String>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, service: Arc<dyn Service>) {
        info!(service = %service.name(), "supervising");
        self.names.push(service.name().to_string());
        self.tasks.spawn(supervise(service));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Wait until some supervision task ends. That only happens if one
    /// panicked or was aborted; returns `false` once no tasks remain.
    pub async fn join_next(&mut self) -> bool {
        match self.tasks.join_next().await {
            Some(Err(e)) => {
                error!(error = %e, "supervision task ended");
                true
            }
            Some(Ok(never)) => match never {},
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Exits immediately `exits` times, then stays up forever.
    struct Flaky {
        delay: Option<Duration>,
        exits: usize,
        starts: Mutex<Vec<Instant>>,
        spawn_failures: usize,
    }

    impl Flaky {
        fn new(delay: Option<Duration>, exits: usize) -> Arc<Self> {
            Arc::new(Self {
                delay,
                exits,
                starts: Mutex::new(Vec::new()),
                spawn_failures: 0,
            })
        }

        fn starts(&self) -> Vec<Instant> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Service for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn delay(&self) -> Option<Duration> {
            self.delay
        }

        async fn run(&self) -> Result<Option<i32>, ServiceError> {
            let run = {
                let mut starts = self.starts.lock().unwrap();
                starts.push(Instant::now());
                starts.len()
            };
            if run <= self.spawn_failures {
                return Err(ServiceError::Spawn {
                    name: "flaky".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            if run <= self.exits {
                return Ok(Some(1));
            }
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_exactly_once_per_exit() {
        let svc = Flaky::new(None, 5);
        let mut supervisor = Supervisor::new();
        supervisor.start(svc.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Five exits, five restarts: six starts in total.
        assert_eq!(svc.starts().len(), 6);
        assert_eq!(supervisor.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_gap_equals_delay() {
        let svc = Flaky::new(Some(Duration::from_secs(2)), usize::MAX);
        let began = Instant::now();
        let handle = tokio::spawn(supervise(svc.clone()));
        tokio::time::sleep(Duration::from_secs(7)).await;
        handle.abort();

        let starts = svc.starts();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[0] - began, Duration::from_secs(2));
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failures_pause_between_attempts() {
        let svc = Arc::new(Flaky {
            delay: None,
            exits: 3,
            starts: Mutex::new(Vec::new()),
            spawn_failures: 3,
        });
        let handle = tokio::spawn(supervise(svc.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.abort();

        let starts = svc.starts();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[1] - starts[0], FAILURE_PAUSE);
        assert_eq!(starts[2] - starts[1], FAILURE_PAUSE);
    }

    #[tokio::test(start_paused = true)]
    async fn services_fail_independently() {
        let a = Flaky::new(None, 2);
        let b = Flaky::new(Some(Duration::from_secs(10)), 0);
        let mut supervisor = Supervisor::new();
        supervisor.start(a.clone());
        supervisor.start(b.clone());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(a.starts().len(), 3);
        assert_eq!(b.starts().len(), 1);
        assert_eq!(supervisor.names(), ["flaky", "flaky"]);
    }
}
