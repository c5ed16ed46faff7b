//! Error types for the transport core

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, SqlTransportError>;

/// Errors that can occur in transport operations
#[derive(Error, Debug)]
pub enum SqlTransportError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid configuration, raised synchronously at construction
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Endpoint-level failure carrying the offending host URI for diagnostics
    #[error("Endpoint {uri} failed: {message}")]
    Endpoint {
        uri: String,
        message: String,
        #[source]
        source: Option<Box<SqlTransportError>>,
    },

    /// Notification channel name that does not follow the transport convention
    #[error("Invalid notification channel: {channel}")]
    InvalidChannel { channel: String },
}

impl SqlTransportError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an endpoint error without an inner cause
    pub fn endpoint<U: Into<String>, S: Into<String>>(uri: U, message: S) -> Self {
        Self::Endpoint {
            uri: uri.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an endpoint error chaining an inner cause
    pub fn endpoint_with_source<U: Into<String>, S: Into<String>>(
        uri: U,
        message: S,
        source: SqlTransportError,
    ) -> Self {
        Self::Endpoint {
            uri: uri.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid channel error
    pub fn invalid_channel<S: Into<String>>(channel: S) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
        }
    }
}

/// Default transient-error predicate for PostgreSQL.
///
/// Classifies serialization conflicts, deadlocks, lock-acquisition timeouts
/// and connection-level failures as retryable. Everything else (constraint
/// violations, syntax errors, configuration mistakes) propagates immediately.
pub fn is_transient_pg_error(error: &SqlTransportError) -> bool {
    match error {
        SqlTransportError::Database(db) => is_transient_db_error(db),
        SqlTransportError::Endpoint {
            source: Some(inner),
            ..
        } => is_transient_pg_error(inner),
        _ => false,
    }
}

fn is_transient_db_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => {
                let code = code.as_ref();
                // 40001 serialization_failure, 40P01 deadlock_detected,
                // 55P03 lock_not_available, 57P03 cannot_connect_now,
                // class 08 connection exceptions
                code == "40001"
                    || code == "40P01"
                    || code == "55P03"
                    || code == "57P03"
                    || code.starts_with("08")
            }
            None => false,
        },
        _ => false,
    }
}
