//! Error types for sift-access
//!
//! Every failure leaving the access layer is classified into an [`ErrorKind`]
//! with a stable code and a retry flag:
//! - Retryable: connection failures, acquire and operation timeouts
//! - Non-retryable: validation, security, rate limiting, open circuits
//! - Query failures: retryable only when the adapter marks them so
//!
//! The connector annotates errors with an [`ErrorContext`] (data source,
//! operation, attempt count) before handing them back to callers.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for sift-access operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error source carried by adapter-originated errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error kinds for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection could not be created or established (retryable)
    Connection,
    /// Configuration or input is malformed
    Validation,
    /// Security policy violation
    Security,
    /// Client quota exceeded
    RateLimit,
    /// Circuit breaker short-circuited the call
    CircuitOpen,
    /// No pooled connection became available in time (retryable)
    AcquireTimeout,
    /// An operation exceeded its deadline (retryable)
    OperationTimeout,
    /// Adapter query failed
    Query,
    /// The pool was destroyed while the call was pending
    PoolDestroyed,
    /// Bug or invariant violation inside the access layer
    Internal,
}

impl ErrorKind {
    /// Whether errors of this kind are retryable by default
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::AcquireTimeout | Self::OperationTimeout
        )
    }

    /// Stable machine-readable code
    pub const fn code(self) -> &'static str {
        match self {
            Self::Connection => "CONNECTION_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Security => "SECURITY_ERROR",
            Self::RateLimit => "RATE_LIMIT_EXCEEDED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::AcquireTimeout => "ACQUIRE_TIMEOUT",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::Query => "QUERY_ERROR",
            Self::PoolDestroyed => "POOL_DESTROYED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Validation => write!(f, "validation"),
            Self::Security => write!(f, "security"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::AcquireTimeout => write!(f, "acquire_timeout"),
            Self::OperationTimeout => write!(f, "operation_timeout"),
            Self::Query => write!(f, "query"),
            Self::PoolDestroyed => write!(f, "pool_destroyed"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Diagnostic metadata attached at the connector boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Data source id
    pub data_source: Option<String>,
    /// Adapter type tag
    pub source_type: Option<String>,
    /// Operation that failed (connect, query, ...)
    pub operation: Option<String>,
    /// Number of attempts made before giving up
    pub attempts: Option<u32>,
}

impl ErrorContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data source id
    pub fn with_data_source(mut self, id: impl Into<String>) -> Self {
        self.data_source = Some(id.into());
        self
    }

    /// Set the adapter type
    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }

    /// Set the operation name
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Set the attempt count
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Fill fields missing from `self` with the ones from `other`
    fn merge(mut self, other: ErrorContext) -> Self {
        self.data_source = self.data_source.or(other.data_source);
        self.source_type = self.source_type.or(other.source_type);
        self.operation = self.operation.or(other.operation);
        self.attempts = self.attempts.or(other.attempts);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(4);
        if let Some(ds) = &self.data_source {
            parts.push(format!("data_source={}", ds));
        }
        if let Some(t) = &self.source_type {
            parts.push(format!("type={}", t));
        }
        if let Some(op) = &self.operation {
            parts.push(format!("operation={}", op));
        }
        if let Some(n) = self.attempts {
            parts.push(format!("attempts={}", n));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Main error type for sift-access
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection creation or establishment failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Malformed configuration or input
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Security policy violation
    #[error("security violation: {message}")]
    Security { message: String },

    /// Client exceeded its request quota
    #[error("rate limit exceeded for '{client_id}' (retry after {}ms)", .retry_after.as_millis())]
    RateLimited {
        client_id: String,
        retry_after: Duration,
    },

    /// Circuit breaker rejected the call without invoking it
    #[error(
        "circuit '{service}' is open after {failure_count} failures (retry after {}ms)",
        .retry_after.as_millis()
    )]
    CircuitOpen {
        service: String,
        retry_after: Duration,
        failure_count: u32,
    },

    /// No pooled connection became available in time
    #[error("timed out after {}ms waiting for a pooled connection", .waited.as_millis())]
    AcquireTimeout { waited: Duration },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    OperationTimeout { operation: String, timeout: Duration },

    /// Adapter query failed
    #[error("query error: {message}")]
    Query {
        message: String,
        retryable: bool,
        #[source]
        source: Option<BoxError>,
    },

    /// Pool destroyed while the request was pending
    #[error("connection pool has been destroyed")]
    PoolDestroyed,

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Error annotated with connector-boundary context
    #[error("{source} [{context}]")]
    Contextual {
        #[source]
        source: Box<Error>,
        context: ErrorContext,
    },
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Security { .. } => ErrorKind::Security,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            Self::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            Self::Query { .. } => ErrorKind::Query,
            Self::PoolDestroyed => ErrorKind::PoolDestroyed,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Contextual { source, .. } => source.kind(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Query { retryable, .. } => *retryable,
            Self::Contextual { source, .. } => source.is_retryable(),
            other => other.kind().is_retryable(),
        }
    }

    /// Context attached at the connector boundary, if any
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Contextual { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The error without any context wrapper
    pub fn root(&self) -> &Error {
        match self {
            Self::Contextual { source, .. } => source.root(),
            other => other,
        }
    }

    /// Suggested wait before the caller tries again
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Attach context; fields already set by an inner layer win over the new ones
    pub fn with_context(self, context: ErrorContext) -> Self {
        match self {
            Self::Contextual {
                source,
                context: existing,
            } => Self::Contextual {
                source,
                context: existing.merge(context),
            },
            other => Self::Contextual {
                source: Box::new(other),
                context,
            },
        }
    }

    /// Record the number of attempts made
    pub fn with_attempts(self, attempts: u32) -> Self {
        self.with_context(ErrorContext::new().with_attempts(attempts))
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a security error
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    /// Create a non-retryable query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    /// Create a query error the pool may retry
    pub fn query_retryable(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            retryable: true,
            source: None,
        }
    }

    /// Create an operation timeout error
    pub fn operation_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::OperationTimeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::validation(format!("invalid configuration: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::validation(format!("cannot read configuration: {}", err))
    }
}
