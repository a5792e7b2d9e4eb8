//! Event output.
//!
//! Subscribes to the manager's event bus and prints each event, either as a
//! human-readable line or as one JSON object per line.

use std::collections::HashMap;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use chandler_core::events::{EventReceiver, ValveEvent};

/// Output format for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Prints valve events.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    format: OutputFormat,
    aliases: HashMap<String, String>,
}

impl Reporter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            aliases: HashMap::new(),
        }
    }

    /// Show `alias` instead of `address` in text output.
    #[must_use]
    pub fn alias(mut self, address: impl Into<String>, alias: impl Into<String>) -> Self {
        self.aliases
            .insert(address.into().to_lowercase(), alias.into());
        self
    }

    fn label<'a>(&'a self, address: &'a str) -> &'a str {
        self.aliases
            .get(&address.to_lowercase())
            .map(String::as_str)
            .unwrap_or(address)
    }

    /// Render one event.
    pub fn format(&self, event: &ValveEvent) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(event).unwrap_or_else(|e| {
                warn!("Failed to serialize event: {}", e);
                String::new()
            }),
            OutputFormat::Text => self.format_text(event),
        }
    }

    fn format_text(&self, event: &ValveEvent) -> String {
        let label = self.label(event.address());
        match event {
            ValveEvent::DeviceInfo {
                serial_number,
                firmware,
                ..
            } => format!(
                "{label}: serial {} firmware {}",
                serial_number.as_deref().unwrap_or("unknown"),
                firmware.as_deref().unwrap_or("unknown")
            ),
            ValveEvent::Dashboard { snapshot, .. } => format!(
                "{label}: flow {:.2} gpm, peak {:.2}, {} gal until regen, {} gal today, battery {}%{}",
                snapshot.present_flow,
                snapshot.peak_flow,
                snapshot.water_remaining_until_regeneration,
                snapshot.water_usage,
                snapshot.battery_capacity,
                if snapshot.is_regenerating() {
                    ", regenerating"
                } else {
                    ""
                }
            ),
            ValveEvent::Authentication {
                state,
                authentication_state,
                ..
            } => format!("{label}: password {state:?}, {authentication_state:?}"),
            ValveEvent::LockoutChanged { locked_out, .. } => {
                if *locked_out {
                    format!("{label}: authentication locked out; check the passcode")
                } else {
                    format!("{label}: authentication lockout cleared")
                }
            }
            ValveEvent::PollCompleted { success, .. } => {
                format!("{label}: poll {}", if *success { "succeeded" } else { "failed" })
            }
            other => format!("{label}: {other:?}"),
        }
    }

    /// Print events until `cancel` fires or the bus closes.
    pub async fn run(self, mut events: EventReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let line = self.format(&event);
                        if !line.is_empty() {
                            println!("{line}");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event output lagged; {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chandler_types::{AuthenticationState, PasswordState};

    fn lockout(address: &str) -> ValveEvent {
        ValveEvent::LockoutChanged {
            address: address.to_string(),
            locked_out: true,
        }
    }

    #[test]
    fn test_text_uses_alias() {
        let reporter = Reporter::new(OutputFormat::Text).alias("AA:BB", "softener");
        assert_eq!(
            reporter.format(&lockout("aa:bb")),
            "softener: authentication locked out; check the passcode"
        );
        assert!(reporter.format(&lockout("CC:DD")).starts_with("CC:DD:"));
    }

    #[test]
    fn test_text_authentication() {
        let reporter = Reporter::default();
        let event = ValveEvent::Authentication {
            address: "AA".to_string(),
            state: PasswordState::Valid,
            authentication_state: AuthenticationState::Authenticated,
        };
        assert_eq!(reporter.format(&event), "AA: password Valid, Authenticated");
    }

    #[test]
    fn test_json_output() {
        let reporter = Reporter::new(OutputFormat::Json).alias("AA", "ignored");
        let json: serde_json::Value =
            serde_json::from_str(&reporter.format(&lockout("AA"))).unwrap();
        assert_eq!(json["type"], "lockout_changed");
        assert_eq!(json["address"], "AA");
        assert_eq!(json["locked_out"], true);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dispatcher = chandler_core::EventDispatcher::default();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Reporter::default().run(dispatcher.subscribe(), cancel.clone()));
        dispatcher.send(lockout("AA"));
        cancel.cancel();
        handle.await.unwrap();
    }
}
