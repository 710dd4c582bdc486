use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

/// Context information for log messages
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "engine", "registry", "dispatcher")
    pub component: String,
    /// Station the component is working for
    pub station_id: Option<String>,
    /// Charger the messages concern
    pub charger_id: Option<String>,
    /// Additional context fields
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    /// Create a new log context
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            station_id: None,
            charger_id: None,
            extra_fields: BTreeMap::new(),
        }
    }

    /// Set station ID
    #[must_use]
    pub fn with_station_id(mut self, station_id: &str) -> Self {
        self.station_id = Some(station_id.to_string());
        self
    }

    /// Set charger ID
    #[must_use]
    pub fn with_charger_id(mut self, charger_id: &str) -> Self {
        self.charger_id = Some(charger_id.to_string());
        self
    }

    /// Add extra field
    #[must_use]
    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger with context
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
}

impl StructuredLogger {
    /// Create a new structured logger with context
    pub const fn new(context: LogContext) -> Self {
        Self { context }
    }

    /// Same context, scoped to one charger
    #[must_use]
    pub fn for_charger(&self, charger_id: &str) -> Self {
        Self::new(self.context.clone().with_charger_id(charger_id))
    }

    /// Same context, scoped to one session on a charger
    #[must_use]
    pub fn for_session(&self, charger_id: &str, session_id: &str) -> Self {
        Self::new(
            self.context
                .clone()
                .with_charger_id(charger_id)
                .with_field("session_id", session_id.to_string()),
        )
    }

    /// Log an info message with context
    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        info!(%fields, "{}", message);
    }
    /// Log a warning message with context
    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        warn!(%fields, "{}", message);
    }
    /// Log an error message with context
    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        error!(%fields, "{}", message);
    }
    /// Log a debug message with context
    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        debug!(%fields, "{}", message);
    }
    /// Log a trace message with context
    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    /// Format context fields for logging
    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(ref station_id) = self.context.station_id {
            fields.push(format!("station_id={station_id}"));
        }
        if let Some(ref charger_id) = self.context.charger_id {
            fields.push(format!("charger_id={charger_id}"));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{key}={value}"));
        }
        fields.join(",")
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}
/// Create a logger with full context
pub const fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}
