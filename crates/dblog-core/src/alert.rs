//! Synchronous observer dispatch for matching log records.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::config::SinkConfig;
use crate::search::format_record;
use crate::{now_utc, DbLogError, LogRecord};

pub const ALERT_EVENT_NAME: &str = "dblog.alert";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertEvent {
    pub name: &'static str,
    pub alert_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
    pub logs: Vec<LogRecord>,
}

pub trait AlertListener: Send + Sync {
    /// # Errors
    /// Returns [`DbLogError::Notification`] when the listener cannot handle
    /// the event.
    fn on_alert(&self, event: &AlertEvent) -> Result<(), DbLogError>;
}

impl<F> AlertListener for F
where
    F: Fn(&AlertEvent) -> Result<(), DbLogError> + Send + Sync,
{
    fn on_alert(&self, event: &AlertEvent) -> Result<(), DbLogError> {
        self(event)
    }
}

/// Emits one warning event per matching record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl AlertListener for TracingListener {
    fn on_alert(&self, event: &AlertEvent) -> Result<(), DbLogError> {
        for log in &event.logs {
            tracing::warn!(
                alert_id = %event.alert_id,
                id = log.id,
                log_type = %log.log_type,
                count = log.count,
                message = %log.message,
                "log alert"
            );
        }
        Ok(())
    }
}

/// Prints matching records to stderr in display format.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrListener;

impl AlertListener for StderrListener {
    fn on_alert(&self, event: &AlertEvent) -> Result<(), DbLogError> {
        eprintln!(
            "[{}] {} matching log(s) for alert {}",
            event.name,
            event.logs.len(),
            event.alert_id
        );
        for log in &event.logs {
            eprintln!("{}", format_record(log));
        }
        Ok(())
    }
}

/// Named listeners that configuration can refer to.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: BTreeMap<String, Arc<dyn AlertListener>>,
}

impl ListenerRegistry {
    /// Registry preloaded with `tracing` and `stderr`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("tracing", Arc::new(TracingListener));
        registry.register("stderr", Arc::new(StderrListener));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, listener: Arc<dyn AlertListener>) {
        self.listeners.insert(name.into(), listener);
    }

    /// # Errors
    /// Returns [`DbLogError::Configuration`] for an unregistered name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AlertListener>, DbLogError> {
        self.listeners.get(name).cloned().ok_or_else(|| {
            DbLogError::Configuration(format!(
                "unknown monitorCallback {name:?}; registered: {}",
                self.names().join(", ")
            ))
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.listeners.keys().map(String::as_str).collect()
    }
}

impl Debug for ListenerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.names())
            .finish()
    }
}

/// Ordered list of listeners, fixed at sink initialization.
#[derive(Clone, Default)]
pub struct AlertNotifier {
    listeners: Vec<Arc<dyn AlertListener>>,
}

impl AlertNotifier {
    /// Registers the `monitorCallback` listener, if one is configured.
    ///
    /// # Errors
    /// Returns [`DbLogError::Configuration`] when the name is unknown.
    pub fn from_config(
        config: &SinkConfig,
        registry: &ListenerRegistry,
    ) -> Result<Self, DbLogError> {
        let mut notifier = Self::default();
        if let Some(name) = config.monitor_callback.as_deref() {
            notifier.register(registry.resolve(name)?);
        }
        Ok(notifier)
    }

    pub fn register(&mut self, listener: Arc<dyn AlertListener>) {
        self.listeners.push(listener);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Dispatches `logs` to every listener in registration order and returns
    /// how many accepted the event.
    ///
    /// A failing listener does not stop delivery to the ones after it.
    ///
    /// # Errors
    /// Returns [`DbLogError::Notification`] summarizing every listener
    /// failure once all listeners have run.
    pub fn notify(&self, logs: &[LogRecord]) -> Result<usize, DbLogError> {
        if self.listeners.is_empty() {
            return Ok(0);
        }

        let event = AlertEvent {
            name: ALERT_EVENT_NAME,
            alert_id: Ulid::new(),
            raised_at: now_utc(),
            logs: logs.to_vec(),
        };

        let mut delivered = 0_usize;
        let mut failures = Vec::new();
        for (index, listener) in self.listeners.iter().enumerate() {
            match listener.on_alert(&event) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::error!(
                        alert_id = %event.alert_id,
                        listener = index,
                        error = %err,
                        "alert listener failed"
                    );
                    failures.push(format!("listener {index}: {err}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(DbLogError::Notification(failures.join("; ")))
        }
    }
}

impl Debug for AlertNotifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertNotifier")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;
    use std::sync::Mutex;

    fn fixture_log(id: i64) -> LogRecord {
        let created = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        };
        LogRecord {
            id,
            log_type: "error".to_string(),
            message: "boom".to_string(),
            context: String::new(),
            count: 1,
            created,
            ip: String::new(),
            hostname: String::new(),
            uri: String::new(),
            refer: String::new(),
            user_agent: String::new(),
        }
    }

    fn recording_listener(
        calls: &Arc<Mutex<Vec<String>>>,
        label: &'static str,
    ) -> Arc<dyn AlertListener> {
        let calls = Arc::clone(calls);
        Arc::new(move |event: &AlertEvent| -> Result<(), DbLogError> {
            match calls.lock() {
                Ok(mut guard) => guard.push(format!("{label}:{}", event.logs.len())),
                Err(err) => panic!("poisoned call log: {err}"),
            }
            Ok(())
        })
    }

    #[test]
    fn notify_without_listeners_is_a_noop() {
        let notifier = AlertNotifier::default();
        assert!(notifier.is_empty());
        assert_eq!(notifier.notify(&[fixture_log(1)]), Ok(0));
    }

    #[test]
    fn notify_runs_listeners_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = AlertNotifier::default();
        notifier.register(recording_listener(&calls, "first"));
        notifier.register(recording_listener(&calls, "second"));

        assert_eq!(notifier.notify(&[fixture_log(1), fixture_log(2)]), Ok(2));
        let recorded = match calls.lock() {
            Ok(guard) => guard.clone(),
            Err(err) => panic!("poisoned call log: {err}"),
        };
        assert_eq!(recorded, vec!["first:2".to_string(), "second:2".to_string()]);
    }

    #[test]
    fn failing_listener_is_reported_after_later_listeners_run() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = AlertNotifier::default();
        notifier.register(Arc::new(|_: &AlertEvent| -> Result<(), DbLogError> {
            Err(DbLogError::Notification("pager offline".to_string()))
        }));
        notifier.register(recording_listener(&calls, "after"));

        let result = notifier.notify(&[fixture_log(1)]);
        match result {
            Err(DbLogError::Notification(message)) => assert!(message.contains("pager offline")),
            other => panic!("expected notification error, got {other:?}"),
        }
        let recorded = match calls.lock() {
            Ok(guard) => guard.clone(),
            Err(err) => panic!("poisoned call log: {err}"),
        };
        assert_eq!(recorded, vec!["after:1".to_string()]);
    }

    #[test]
    fn from_config_resolves_named_listener() {
        let registry = ListenerRegistry::with_builtins();
        let config = SinkConfig {
            monitor_callback: Some("tracing".to_string()),
            ..SinkConfig::default()
        };
        let notifier = match AlertNotifier::from_config(&config, &registry) {
            Ok(value) => value,
            Err(err) => panic!("expected notifier: {err}"),
        };
        assert_eq!(notifier.len(), 1);
        assert_eq!(notifier.notify(&[fixture_log(3)]), Ok(1));

        let unknown = SinkConfig {
            monitor_callback: Some("pagerduty".to_string()),
            ..SinkConfig::default()
        };
        assert!(matches!(
            AlertNotifier::from_config(&unknown, &registry),
            Err(DbLogError::Configuration(_))
        ));
    }
}
