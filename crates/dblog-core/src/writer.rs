use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SinkConfig;
use crate::store::RecordStore;
use crate::{render_text, DbLogError, LogRecord};

const REMOTE_ADDR: &str = "REMOTE_ADDR";
const HTTP_HOST: &str = "HTTP_HOST";
const REQUEST_URI: &str = "REQUEST_URI";
const HTTP_REFERER: &str = "HTTP_REFERER";
const HTTP_USER_AGENT: &str = "HTTP_USER_AGENT";

/// Request metadata handed to the writer by the HTTP layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestContext {
    /// Server environment and header pairs (`REMOTE_ADDR`, `HTTP_HOST`, ...).
    pub server: BTreeMap<String, String>,
    /// Request body.
    pub data: Option<Value>,
    pub query: Map<String, Value>,
    /// Authenticated user id from session state.
    pub user_id: Option<Value>,
}

impl RequestContext {
    /// Adds request-derived entries to a log context. Missing or empty
    /// pieces are left out.
    pub fn enrich(&self, context: &mut Map<String, Value>) {
        if !self.server.is_empty() {
            let headers = self
                .server
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect();
            context.insert("headers".to_string(), Value::Object(headers));
        }

        if let Some(data) = self.data.as_ref().filter(|value| !is_empty_value(value)) {
            context.insert("data".to_string(), data.clone());
        }

        if !self.query.is_empty() {
            context.insert("query".to_string(), Value::Object(self.query.clone()));
        }

        if let Some(user_id) = self.user_id.as_ref().filter(|value| !is_empty_value(value)) {
            context.insert("user_id".to_string(), user_id.clone());
        }
    }
}

/// Where a log line came from. Every field is empty when unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Origin {
    pub ip: String,
    pub hostname: String,
    pub uri: String,
    pub refer: String,
    pub user_agent: String,
}

impl Origin {
    /// Reads origin metadata from the request when there is one, otherwise
    /// from the process environment.
    #[must_use]
    pub fn capture(request: Option<&RequestContext>) -> Self {
        match request {
            Some(request) => Self::from_lookup(|key| request.server.get(key).cloned()),
            None => Self::from_lookup(|key| std::env::var(key).ok()),
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).unwrap_or_default();
        Self {
            ip: read(REMOTE_ADDR),
            hostname: read(HTTP_HOST),
            uri: read(REQUEST_URI),
            refer: read(HTTP_REFERER),
            user_agent: read(HTTP_USER_AGENT),
        }
    }
}

/// A record ready for insertion: rendered, trimmed and stamped with origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewLogRecord {
    #[serde(rename = "type")]
    pub log_type: String,
    pub message: String,
    pub context: String,
    pub origin: Origin,
}

impl NewLogRecord {
    /// Builds an insertable record from raw caller input.
    ///
    /// # Errors
    /// Returns [`DbLogError::Validation`] when the type is blank.
    pub fn new(
        log_type: &str,
        message: &Value,
        context: &Value,
        request: Option<&RequestContext>,
    ) -> Result<Self, DbLogError> {
        let record = Self {
            log_type: log_type.trim().to_string(),
            message: render_text(message),
            context: render_text(context),
            origin: Origin::capture(request),
        };
        record.validate()?;
        Ok(record)
    }

    /// # Errors
    /// Returns [`DbLogError::Validation`] when the type is blank.
    pub fn validate(&self) -> Result<(), DbLogError> {
        if self.log_type.trim().is_empty() {
            return Err(DbLogError::Validation(
                "type MUST be a non-empty string".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write path into a [`RecordStore`].
#[derive(Debug)]
pub struct LogWriter<S> {
    store: S,
    level_override: Option<String>,
}

impl<S: RecordStore> LogWriter<S> {
    pub fn new(store: S, config: &SinkConfig) -> Self {
        Self {
            store,
            level_override: config.level_override().map(str::to_string),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// The level that will be stored for a caller-supplied `level`.
    pub fn effective_level<'a>(&'a self, level: &'a str) -> &'a str {
        self.level_override.as_deref().unwrap_or(level)
    }

    /// Persists one log line. Never fails the caller: any error is traced
    /// and reported as `false`.
    pub fn write(
        &mut self,
        level: &str,
        message: impl Into<Value>,
        context: Map<String, Value>,
        request: Option<&RequestContext>,
    ) -> bool {
        match self.try_write(level, message, context, request) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(log_level = level, error = %err, "failed to persist log record");
                false
            }
        }
    }

    /// # Errors
    /// Returns [`DbLogError::Validation`] for a blank level and
    /// [`DbLogError::Persistence`] when the store rejects the row.
    pub fn try_write(
        &mut self,
        level: &str,
        message: impl Into<Value>,
        mut context: Map<String, Value>,
        request: Option<&RequestContext>,
    ) -> Result<LogRecord, DbLogError> {
        if let Some(request) = request {
            request.enrich(&mut context);
        }

        let record = NewLogRecord::new(
            self.effective_level(level),
            &message.into(),
            &Value::Object(context),
            request,
        )?;
        self.store.insert(&record)
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_request() -> RequestContext {
        let mut server = BTreeMap::new();
        server.insert(REMOTE_ADDR.to_string(), "10.0.0.7".to_string());
        server.insert(HTTP_HOST.to_string(), "logs.example.test".to_string());
        server.insert(REQUEST_URI.to_string(), "/orders?page=2".to_string());
        server.insert(HTTP_USER_AGENT.to_string(), "curl/8.0".to_string());

        let mut query = Map::new();
        query.insert("page".to_string(), json!("2"));

        RequestContext {
            server,
            data: Some(json!({})),
            query,
            user_id: Some(json!(42)),
        }
    }

    #[test]
    fn enrich_adds_present_pieces_only() {
        let mut context = Map::new();
        context.insert("scope".to_string(), json!("orders"));
        fixture_request().enrich(&mut context);

        assert_eq!(context["scope"], json!("orders"));
        assert_eq!(context["headers"]["REMOTE_ADDR"], json!("10.0.0.7"));
        assert_eq!(context["query"], json!({"page": "2"}));
        assert_eq!(context["user_id"], json!(42));
        assert!(!context.contains_key("data"));
    }

    #[test]
    fn enrich_with_empty_request_changes_nothing() {
        let mut context = Map::new();
        RequestContext::default().enrich(&mut context);
        assert!(context.is_empty());
    }

    #[test]
    fn origin_reads_request_server_map() {
        let origin = Origin::capture(Some(&fixture_request()));
        assert_eq!(origin.ip, "10.0.0.7");
        assert_eq!(origin.hostname, "logs.example.test");
        assert_eq!(origin.uri, "/orders?page=2");
        assert_eq!(origin.refer, "");
        assert_eq!(origin.user_agent, "curl/8.0");
    }

    #[test]
    fn new_record_renders_and_trims() {
        let record = must_ok(NewLogRecord::new(
            " warn ",
            &json!("  disk low  "),
            &json!({"disk": "/dev/sda1"}),
            None,
        ));
        assert_eq!(record.log_type, "warn");
        assert_eq!(record.message, "disk low");
        assert_eq!(record.context, render_text(&json!({"disk": "/dev/sda1"})));
    }

    #[test]
    fn new_record_rejects_blank_type() {
        let result = NewLogRecord::new("  ", &json!("boom"), &json!({}), None);
        assert!(matches!(result, Err(DbLogError::Validation(_))));
    }
}
