//! Out-of-band messages
//!
//! Instruments push lines nobody asked for (barcode scans, status pulses).
//! Lines that arrive while no request is waiting are offered to every
//! registered pattern.

use regex::Regex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::RwLock;

use tracing::{trace, warn};

use super::{MatchGroups, ProtocolError};

type EventHandler = Box<dyn Fn(&MatchGroups) + Send + Sync>;

struct Registration {
    pattern: Regex,
    handler: EventHandler,
}

/// Pattern/handler pairs checked against unsolicited lines
#[derive(Default)]
pub struct EventRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl EventRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for lines matching `pattern`
    pub fn register<F>(&self, pattern: &str, handler: F) -> Result<(), ProtocolError>
    where
        F: Fn(&MatchGroups) + Send + Sync + 'static,
    {
        let pattern = Regex::new(pattern)?;
        self.registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Registration {
                pattern,
                handler: Box::new(handler),
            });
        Ok(())
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .map(|r| r.len())
            .unwrap_or_default()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler whose pattern matches `line`, in registration order.
    ///
    /// A panicking handler is logged and skipped. Returns how many handlers
    /// matched.
    pub fn dispatch(&self, line: &str) -> usize {
        let registrations = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        let mut fired = 0;
        for registration in registrations.iter() {
            let Some(captures) = registration.pattern.captures(line) else {
                continue;
            };
            fired += 1;
            let groups = MatchGroups::from_captures(&captures);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (registration.handler)(&groups)));
            if outcome.is_err() {
                warn!(
                    pattern = registration.pattern.as_str(),
                    line, "out-of-band handler panicked"
                );
            }
        }
        if fired == 0 {
            trace!(line, "discarding unsolicited line");
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_dispatch_counts_matches() {
        let registry = EventRegistry::new();
        registry.register("^A", |_| {}).expect("register");
        registry.register("B$", |_| {}).expect("register");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.dispatch("AB"), 2);
        assert_eq!(registry.dispatch("AX"), 1);
        assert_eq!(registry.dispatch("X"), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        registry
            .register("^SCAN", |_| panic!("handler bug"))
            .expect("register");
        let sink = seen.clone();
        registry
            .register(r"^SCAN (\w+)$", move |groups| {
                sink.lock()
                    .unwrap()
                    .push(groups.get(1).unwrap_or_default().to_string());
            })
            .expect("register");

        assert_eq!(registry.dispatch("SCAN 4711"), 2);
        assert_eq!(registry.dispatch("SCAN 0815"), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["4711", "0815"]);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let registry = EventRegistry::new();
        assert!(matches!(
            registry.register("[", |_| {}),
            Err(ProtocolError::InvalidPattern(_))
        ));
        assert!(registry.is_empty());
    }
}
