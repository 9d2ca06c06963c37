//! Service supervision for guest init.
//!
//! Services come from descriptor files ([`load_descriptors`]) or from other
//! crates implementing [`Service`]. Each one gets its own task running
//! [`supervise`]: an endless start/wait/restart loop with no backoff.

mod children;
mod descriptor;
mod error;
mod process;
mod service;
mod supervise;

pub use children::ChildTable;
pub use descriptor::{Descriptors, ServiceDescriptor, load_descriptors};
pub use error::{DescriptorError, Result, ServiceError, SupervisorError};
pub use process::{ProcessService, SERVICE_PATH};
pub use service::Service;
pub use supervise::{FAILURE_PAUSE, Supervisor, supervise};
