//! Structured JSON logging for the outbound transport.
//!
//! Correlation IDs, structured fields, and `tracing`-backed output,
//! scoped to what a transport can honestly log: outbound queries and
//! their resolution, system/config events, and errors. The teacher's
//! logging module additionally carries HTTP-request and security-event
//! categories that belong to the inbound/web surface this crate does
//! not contain; those are dropped rather than carried as dead exports.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, span, Level, Span};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Log levels for different types of events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Event categories for different types of operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EventCategory {
    /// Outbound query and response operations
    Dns,
    /// System and performance events
    System,
    /// Health checks and monitoring
    Health,
    /// Configuration and startup events
    Config,
    /// Error and exception events
    Error,
}

/// Structured log entry with rich metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique correlation ID for request tracking
    pub correlation_id: String,
    /// Event timestamp in RFC3339 format
    pub timestamp: String,
    /// Log level
    pub level: LogLevel,
    /// Event category
    pub category: EventCategory,
    /// Component that generated the log
    pub component: String,
    /// Human-readable message
    pub message: String,
    /// Structured data fields
    pub fields: HashMap<String, serde_json::Value>,
    /// Request/operation duration if applicable
    pub duration_ms: Option<u64>,
    /// Outbound query details if applicable
    pub dns_query: Option<DnsQueryLog>,
    /// Error details if applicable
    pub error_details: Option<ErrorLog>,
}

/// Outbound query logging details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsQueryLog {
    /// Query domain name
    pub domain: String,
    /// Query type (A, AAAA, MX, etc.)
    pub query_type: String,
    /// Transport used (udp, tcp, tls)
    pub protocol: String,
    /// Outcome (reply/timeout/closed/capsfail)
    pub response_code: String,
    /// Upstream server queried
    pub upstream_server: String,
    /// Attempt number within the EDNS/TCP fallback state machine
    pub retry: u32,
}

/// Error logging details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLog {
    /// Error type/category
    pub error_type: String,
    /// Error code if applicable
    pub error_code: Option<String>,
    /// Additional error context
    pub context: HashMap<String, serde_json::Value>,
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub level: LogLevel,
    /// Enable JSON formatting
    pub json_format: bool,
    /// Enable console output
    pub console_output: bool,
    /// Custom fields to add to all log entries
    pub global_fields: HashMap<String, String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: true,
            console_output: true,
            global_fields: HashMap::new(),
        }
    }
}

/// Correlation ID context for request tracking
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub id: String,
    pub created_at: SystemTime,
    pub component: String,
    pub operation: String,
    pub metadata: HashMap<String, String>,
}

impl CorrelationContext {
    /// Create a new correlation context
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: SystemTime::now(),
            component: component.to_string(),
            operation: operation.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Create a child context with the same correlation ID
    pub fn child(&self, component: &str, operation: &str) -> Self {
        let mut child = Self::new(component, operation);
        child.id = self.id.clone();
        child
    }

    /// Add metadata to the context
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Get elapsed time since context creation
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed().unwrap_or_default()
    }
}

/// Structured logger implementation
pub struct StructuredLogger {
    #[allow(dead_code)]
    config: LoggerConfig,
}

impl StructuredLogger {
    /// Initialize the structured logger with configuration
    pub fn init(config: LoggerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&format!("{:?}", config.level).to_lowercase()))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let init_result = if config.console_output && config.json_format {
            tracing_subscriber::fmt().json().with_env_filter(filter).try_init()
        } else if config.console_output {
            tracing_subscriber::fmt().pretty().with_env_filter(filter).try_init()
        } else {
            tracing_subscriber::fmt().with_env_filter(EnvFilter::new("off")).try_init()
        };

        if let Err(e) = init_result {
            if config.console_output {
                eprintln!("Warning: tracing subscriber already initialized: {}", e);
            }
        }

        Ok(Self { config })
    }

    /// Log an outbound query's resolution.
    pub fn log_dns_query(&self, ctx: &CorrelationContext, query_log: DnsQueryLog) {
        let entry = LogEntry {
            correlation_id: ctx.id.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .to_string(),
            level: LogLevel::Info,
            category: EventCategory::Dns,
            component: ctx.component.clone(),
            message: format!(
                "{} {} via {} -> {}",
                query_log.domain, query_log.query_type, query_log.protocol, query_log.response_code
            ),
            fields: ctx
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
            duration_ms: Some(ctx.elapsed().as_millis() as u64),
            dns_query: Some(query_log),
            error_details: None,
        };

        info!(
            correlation_id = %entry.correlation_id,
            category = ?entry.category,
            component = %entry.component,
            domain = %entry.dns_query.as_ref().unwrap().domain,
            query_type = %entry.dns_query.as_ref().unwrap().query_type,
            protocol = %entry.dns_query.as_ref().unwrap().protocol,
            response_code = %entry.dns_query.as_ref().unwrap().response_code,
            upstream_server = %entry.dns_query.as_ref().unwrap().upstream_server,
            retry = %entry.dns_query.as_ref().unwrap().retry,
            duration_ms = %entry.duration_ms.unwrap_or(0),
            "{}", entry.message
        );
    }

    /// Log an error event
    pub fn log_error(&self, ctx: &CorrelationContext, error_log: ErrorLog) {
        let entry = LogEntry {
            correlation_id: ctx.id.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .to_string(),
            level: LogLevel::Error,
            category: EventCategory::Error,
            component: ctx.component.clone(),
            message: format!(
                "Error: {} {}",
                error_log.error_type,
                error_log.error_code.as_deref().unwrap_or("")
            ),
            fields: ctx
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
            duration_ms: Some(ctx.elapsed().as_millis() as u64),
            dns_query: None,
            error_details: Some(error_log),
        };

        error!(
            correlation_id = %entry.correlation_id,
            category = ?entry.category,
            component = %entry.component,
            error_type = %entry.error_details.as_ref().unwrap().error_type,
            error_code = ?entry.error_details.as_ref().unwrap().error_code,
            "{}", entry.message
        );
    }

    /// Create a tracing span with correlation context
    pub fn create_span(&self, ctx: &CorrelationContext, name: &str) -> Span {
        span!(
            Level::INFO,
            "operation",
            correlation_id = %ctx.id,
            component = %ctx.component,
            operation = %ctx.operation,
            name = %name
        )
    }
}

/// Log an outbound query with correlation context
#[macro_export]
macro_rules! log_dns_query {
    ($logger:expr, $ctx:expr, $domain:expr, $query_type:expr, $protocol:expr, $response_code:expr, $upstream:expr, $retry:expr) => {{
        let query_log = $crate::dns::logging::DnsQueryLog {
            domain: $domain.to_string(),
            query_type: $query_type.to_string(),
            protocol: $protocol.to_string(),
            response_code: $response_code.to_string(),
            upstream_server: $upstream.to_string(),
            retry: $retry,
        };
        $logger.log_dns_query($ctx, query_log);
    }};
}

/// Create a correlation context for an operation
#[macro_export]
macro_rules! create_correlation_context {
    ($component:expr, $operation:expr) => {{
        $crate::dns::logging::CorrelationContext::new($component, $operation)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_context_creation() {
        let ctx = CorrelationContext::new("outnet", "resolve_query");
        assert_eq!(ctx.component, "outnet");
        assert_eq!(ctx.operation, "resolve_query");
        assert!(!ctx.id.is_empty());
        assert!(ctx.created_at <= SystemTime::now());
    }

    #[test]
    fn correlation_context_child_shares_id() {
        let parent = CorrelationContext::new("outnet", "resolve_query");
        let child = parent.child("tcp", "send");
        assert_eq!(parent.id, child.id);
        assert_eq!(child.component, "tcp");
        assert_eq!(child.operation, "send");
    }

    #[test]
    fn correlation_context_metadata() {
        let ctx = CorrelationContext::new("outnet", "resolve_query")
            .with_metadata("qname", "example.com")
            .with_metadata("transport", "udp");
        assert_eq!(ctx.metadata.get("qname"), Some(&"example.com".to_string()));
        assert_eq!(ctx.metadata.get("transport"), Some(&"udp".to_string()));
    }

    #[test]
    fn log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }

    #[test]
    fn logger_config_default() {
        let config = LoggerConfig::default();
        assert!(matches!(config.level, LogLevel::Info));
        assert!(config.json_format);
        assert!(config.console_output);
    }

    #[test]
    fn dns_query_log_creation() {
        let query_log = DnsQueryLog {
            domain: "example.com".to_string(),
            query_type: "A".to_string(),
            protocol: "udp".to_string(),
            response_code: "reply".to_string(),
            upstream_server: "192.0.2.1:53".to_string(),
            retry: 0,
        };
        assert_eq!(query_log.domain, "example.com");
        assert_eq!(query_log.query_type, "A");
        assert_eq!(query_log.protocol, "udp");
    }

    #[test]
    fn error_log_creation() {
        let mut context = HashMap::new();
        context.insert("function".to_string(), serde_json::Value::String("resolve_query".to_string()));

        let error_log = ErrorLog {
            error_type: "network_timeout".to_string(),
            error_code: Some("DNS_TIMEOUT".to_string()),
            context,
        };
        assert_eq!(error_log.error_type, "network_timeout");
        assert_eq!(error_log.error_code, Some("DNS_TIMEOUT".to_string()));
        assert!(!error_log.context.is_empty());
    }
}
