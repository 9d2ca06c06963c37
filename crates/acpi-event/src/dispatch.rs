//! Prefix-routed event handlers.
//!
//! Routes are kept sorted by prefix length, longest first, so an event that
//! matches several prefixes always goes to the most specific one. Equal
//! lengths keep registration order. Exactly zero or one handler runs per
//! event.

use std::sync::Arc;

use guest_common::PowerControl;
use tracing::{error, info, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type Handler = Box<dyn Fn(&str) -> Result<(), HandlerError> + Send + Sync>;

/// Prefix of the event the kernel emits for the power button.
pub const POWER_BUTTON: &str = "button/power";

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled(String),
    Failed(String),
    Unmatched,
}

struct Route {
    prefix: String,
    handler: Handler,
}

#[derive(Default)]
pub struct Dispatcher {
    routes: Vec<Route>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default table: the power button powers the machine off.
    pub fn with_power_button(power: Arc<dyn PowerControl>) -> Self {
        Self::new().route(POWER_BUTTON, move |event| {
            warn!(event, "ACPI power button pressed, shutting down");
            power.power_off()?;
            Ok(())
        })
    }

    /// Register `handler` for events starting with `prefix`. Registering the
    /// same prefix again replaces the previous handler.
    pub fn route<F>(mut self, prefix: &str, handler: F) -> Self
    where
        F: Fn(&str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.routes.retain(|r| r.prefix != prefix);
        let at = self
            .routes
            .iter()
            .position(|r| r.prefix.len() < prefix.len())
            .unwrap_or(self.routes.len());
        self.routes.insert(
            at,
            Route {
                prefix: prefix.to_string(),
                handler: Box::new(handler),
            },
        );
        self
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.prefix.as_str())
    }

    pub fn dispatch(&self, event: &str) -> Outcome {
        let Some(route) = self.routes.iter().find(|r| event.starts_with(&r.prefix)) else {
            info!(event, "no handler for ACPI event");
            return Outcome::Unmatched;
        };
        match (route.handler)(event) {
            Ok(()) => Outcome::Handled(route.prefix.clone()),
            Err(e) => {
                error!(event, prefix = %route.prefix, error = %e, "ACPI handler failed");
                Outcome::Failed(route.prefix.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_common::PowerError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakePower {
        power_offs: AtomicUsize,
    }

    impl PowerControl for FakePower {
        fn sync(&self) {}

        fn power_off(&self) -> Result<(), PowerError> {
            self.power_offs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn power_button_powers_off() {
        let power = Arc::new(FakePower::default());
        let dispatcher = Dispatcher::with_power_button(power.clone());
        let outcome = dispatcher.dispatch("button/power PWRF 00000080 00000001");
        assert_eq!(outcome, Outcome::Handled(POWER_BUTTON.to_string()));
        assert_eq!(power.power_offs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmatched_event_is_dropped() {
        let power = Arc::new(FakePower::default());
        let dispatcher = Dispatcher::with_power_button(power.clone());
        assert_eq!(
            dispatcher.dispatch("ac_adapter ACPI0003:00 00000080 00000000"),
            Outcome::Unmatched
        );
        assert_eq!(power.power_offs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn longest_prefix_wins_regardless_of_registration_order() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (hits.clone(), hits.clone(), hits.clone());
        let dispatcher = Dispatcher::new()
            .route("button", move |_| {
                a.lock().unwrap().push("button");
                Ok(())
            })
            .route("button/power PWRF", move |_| {
                b.lock().unwrap().push("button/power PWRF");
                Ok(())
            })
            .route("button/power", move |_| {
                c.lock().unwrap().push("button/power");
                Ok(())
            });

        assert_eq!(
            dispatcher.prefixes().collect::<Vec<_>>(),
            vec!["button/power PWRF", "button/power", "button"]
        );

        dispatcher.dispatch("button/power PWRF 00000080 00000001");
        dispatcher.dispatch("button/power LNXPWRBN:00 00000080 00000001");
        dispatcher.dispatch("button/lid LID 00000080 00000001");
        assert_eq!(
            *hits.lock().unwrap(),
            vec!["button/power PWRF", "button/power", "button"]
        );
    }

    #[test]
    fn handler_error_is_reported() {
        let dispatcher = Dispatcher::new().route("video", |_| Err("boom".into()));
        assert_eq!(
            dispatcher.dispatch("video/brightnessup BRTUP 00000086 00000000"),
            Outcome::Failed("video".to_string())
        );
    }

    #[test]
    fn re_registering_replaces_handler() {
        let dispatcher = Dispatcher::new()
            .route("button", |_| Err("old".into()))
            .route("button", |_| Ok(()));
        assert_eq!(dispatcher.prefixes().count(), 1);
        assert_eq!(
            dispatcher.dispatch("button/sleep"),
            Outcome::Handled("button".to_string())
        );
    }
}
