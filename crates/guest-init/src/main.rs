//! Init process for cloud guests.
//!
//! Runs as PID 1. Signal handling and orphan reaping follow the patterns of
//! [tini](https://github.com/krallin/tini), but instead of forking a single
//! child, init supervises every service in the service directory and runs
//! containers on demand.
//!
//! Startup sequence:
//! 1. Mount /proc so boot-relative log timestamps work
//! 2. Mount the rest of the filesystem (state disk, tmpfs, sysfs, cgroups)
//! 3. Ignore SIGTTIN/SIGTTOU/SIGPIPE and start the orphan reaper
//! 4. Listen for the ACPI power button
//! 5. Supervise plain services, then connect to containerd and supervise
//!    persistent containers
//! 6. Follow container directives from the metadata server forever

mod bootstrap;
mod config;
mod control;
mod pid1;

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acpi_event::Dispatcher;
use config::InitArgs;
use container_ctl::{Containerd, ContainerService, Controller, load_persistent_specs};
use guest_common::{PowerControl, SystemPower};
use metadata_watch::{MetadataWatcher, WatchConfig};
use supervisor::{ChildTable, ProcessService, Supervisor, load_descriptors};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONNECT_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let (args, parse_error) = InitArgs::load(std::env::args_os());

    // Before logging: the log timer reads /proc/uptime.
    let proc_mounted = if args.skip_bootstrap {
        Ok(())
    } else {
        bootstrap::apply_step(&bootstrap::proc_step())
    };
    guest_common::log::init(args.verbose);
    info!(version = env!("CARGO_PKG_VERSION"), "guest-init starting");
    if let Some(e) = parse_error {
        warn!(error = %e, "ignoring unparseable arguments, using defaults");
    }
    if let Err(e) = proc_mounted {
        warn!(error = %e, category = %e.category(), "boot step failed, continuing");
    }

    if !args.skip_bootstrap {
        bootstrap::run(args.state_device.as_deref());
    }

    pid1::setup_signal_handlers();
    let children = ChildTable::new();
    if let Err(e) = pid1::spawn_reaper(children.clone()) {
        error!(error = %e, "cannot start orphan reaper");
        return ExitCode::FAILURE;
    }

    let power: Arc<dyn PowerControl> = Arc::new(SystemPower);
    spawn_acpi_listener(power.clone());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(serve(args, children, power))
}

fn spawn_acpi_listener(power: Arc<dyn PowerControl>) {
    let spawned = thread::Builder::new().name("acpi".into()).spawn(move || {
        let dispatcher = Dispatcher::with_power_button(power);
        let Err(e) = acpi_event::listen(&dispatcher);
        warn!(error = %e, category = %e.category(), "ACPI listener stopped");
    });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot start ACPI listener");
    }
}

async fn serve(args: InitArgs, children: ChildTable, power: Arc<dyn PowerControl>) -> ExitCode {
    let mut supervisor = Supervisor::new();

    let descriptors = match load_descriptors(&args.service_dir) {
        Ok(descriptors) => descriptors,
        Err(e) => {
            error!(error = %e, category = %e.category(), "cannot load services");
            return ExitCode::FAILURE;
        }
    };
    if !descriptors.skipped.is_empty() {
        warn!(count = descriptors.skipped.len(), "some service descriptors were skipped");
    }
    for descriptor in descriptors.services {
        supervisor.start(Arc::new(ProcessService::new(
            Arc::new(descriptor),
            children.clone(),
        )));
    }

    let containerd = match Containerd::connect_with_retry(
        &args.containerd_socket,
        &args.namespace,
        args.containerd_wait.max(1),
        CONNECT_INTERVAL,
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, category = %e.category(), "cannot reach containerd");
            return ExitCode::FAILURE;
        }
    };
    let controller = Arc::new(
        Controller::new(Arc::new(containerd), args.namespace.clone())
            .with_io(args.container_output.clone()),
    );

    match load_persistent_specs(&args.container_dir) {
        Ok(persistent) => {
            if !persistent.skipped.is_empty() {
                warn!(count = persistent.skipped.len(), "some persistent containers were skipped");
            }
            for spec in persistent.specs {
                supervisor.start(Arc::new(ContainerService::new(controller.clone(), spec)));
            }
        }
        Err(e) => warn!(error = %e, category = %e.category(), "cannot load persistent containers"),
    }
    info!(services = ?supervisor.names(), "supervising");

    let mut watcher = match MetadataWatcher::new(WatchConfig {
        url: args.metadata_url.clone(),
        ..Default::default()
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(error = %e, "cannot build metadata client");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    control::run(&mut watcher, &controller, power.as_ref(), &cancel).await;

    // Only reached if the directive loop is cancelled; keep services up.
    while supervisor.join_next().await {}
    ExitCode::SUCCESS
}
