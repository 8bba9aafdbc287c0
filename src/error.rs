//! Contains the `Error` and `Result` types that `mongodb-core` uses.

use std::{fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::{bson::Document, options::ServerAddress};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTMASTER_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_READ_CODES: [i32; 11] = [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// No writes performed label. Added to the error of a retry attempt that never reached a server.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// The result type for all methods that can return an error in the `mongodb-core` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb-core` crate. The inner [`ErrorKind`] is wrapped in an
/// `Arc` to allow the errors to be cloned.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
    labels: Vec<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: Vec<String> = labels.map(|l| l.into_iter().collect()).unwrap_or_default();
        if let ErrorKind::Command(ref command_error) = kind {
            for label in &command_error.labels {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }
        Self {
            kind: Arc::new(kind),
            labels,
        }
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection pool for {} cleared because another operation failed with: {}",
                address, cause
            ),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Creates an authentication error, for use by [`Authenticator`](crate::options::Authenticator)
    /// implementations.
    pub fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    pub(crate) fn network_timeout() -> Self {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Whether this error is caused by a failure to send or receive on the network.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    /// Whether this error is a network timeout.
    pub fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() != std::io::ErrorKind::TimedOut)
    }

    /// Whether this error was returned by a pool that was cleared out from under an operation.
    pub fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    /// Whether this error was reported by the server in reply to a command.
    pub fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// Whether no suitable server could be found before the selection timeout.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code) || self.is_state_change_error(),
            None => self.is_state_change_error(),
        }
    }

    /// Whether a write operation should be retried if this error occurs.
    pub(crate) fn is_write_retryable(&self) -> bool {
        if self.contains_label(RETRYABLE_WRITE_ERROR) || self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels
            .iter()
            .any(|actual_label| actual_label.as_str() == label.as_ref())
    }

    /// Gets the code from this error for performing SDAM updates, if applicable.
    /// Write concern errors are reported through [`ErrorKind::Command`] as well, so their code
    /// is used here too.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
    }

    fn message(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.message.as_str()),
            _ => None,
        }
    }

    /// If this error corresponds to a "not primary" error.
    pub(crate) fn is_not_primary(&self) -> bool {
        match (self.sdam_code(), self.message()) {
            (Some(code), message) => is_not_primary(code, message.unwrap_or_default()),
            _ => false,
        }
    }

    /// If this error corresponds to a "node is recovering" error.
    pub(crate) fn is_recovering(&self) -> bool {
        match (self.sdam_code(), self.message()) {
            (Some(code), message) => is_recovering(code, message.unwrap_or_default()),
            _ => false,
        }
    }

    /// If this error corresponds to a "node is shutting down" error.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a state change error (not primary or recovering).
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_not_primary()
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl std::ops::Deref for Error {
    type Target = Arc<ErrorKind>;

    fn deref(&self) -> &Self::Target {
        &self.kind
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while the [`Client`](crate::Client) attempted to authenticate a
    /// connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(crate::bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(crate::bson::ser::Error),

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The connection pool for a server was cleared during operation execution due to
    /// a concurrent error, causing the operation to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The TLS configuration could not be built.
    #[error("An invalid TLS configuration was provided: {message}")]
    #[non_exhaustive]
    InvalidTlsConfig { message: String },

    /// The Client was not able to select a server for the operation.
    #[error("Server selection timeout: {message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The Client has been shut down and can no longer run operations.
    #[error("Client has been shut down")]
    Shutdown,

    /// The Client timed out while checking out a connection from connection pool.
    #[error("Timed out while checking out a connection from connection pool with address {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },
}

impl From<crate::bson::de::Error> for ErrorKind {
    fn from(err: crate::bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<crate::bson::ser::Error> for ErrorKind {
    fn from(err: crate::bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<crate::bson::raw::Error> for ErrorKind {
    fn from(err: crate::bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

fn is_not_primary(code: i32, message: &str) -> bool {
    if NOTMASTER_CODES.contains(&code) {
        return true;
    } else if is_recovering(code, message) {
        return false;
    }
    message.contains("not master")
}

fn is_recovering(code: i32, message: &str) -> bool {
    if RECOVERING_CODES.contains(&code) {
        return true;
    }
    message.contains("not master or secondary") || message.contains("node is recovering")
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// The error labels that the server returned.
    #[serde(rename = "errorLabels", default)]
    pub labels: Vec<String>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {} ({}): {}", self.code, self.code_name, self.message)
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(alias = "errmsg", default = "String::new")]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

impl WriteConcernError {
    /// Converts a write concern failure into a command error so that it goes through the same
    /// classification as any other server-reported failure.
    pub(crate) fn into_command_error(self, labels: Vec<String>) -> CommandError {
        CommandError {
            code: self.code,
            code_name: self.code_name,
            message: self.message,
            labels,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn command_error(code: i32, message: &str) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: message.to_string(),
            labels: vec![],
        })
        .into()
    }

    #[test]
    fn state_change_classification() {
        assert!(command_error(10107, "").is_not_primary());
        assert!(command_error(10058, "").is_not_primary());
        assert!(command_error(1, "not master").is_not_primary());
        assert!(!command_error(1, "not master or secondary").is_not_primary());
        assert!(command_error(1, "not master or secondary").is_recovering());
        assert!(command_error(11602, "").is_recovering());
        assert!(command_error(91, "").is_shutting_down());
        assert!(!command_error(189, "").is_shutting_down());
        assert!(!command_error(2, "bad value").is_state_change_error());
    }

    #[test]
    fn retryability() {
        let network: Error = ErrorKind::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(network.is_read_retryable());
        assert!(network.is_write_retryable());
        assert!(network.is_non_timeout_network_error());

        let timeout = Error::network_timeout();
        assert!(timeout.is_network_timeout());
        assert!(!timeout.is_non_timeout_network_error());

        assert!(command_error(262, "").is_write_retryable());
        assert!(!command_error(262, "").is_read_retryable());
        assert!(!command_error(2, "").is_read_retryable());
        assert!(!command_error(2, "").is_write_retryable());
    }

    #[test]
    fn command_labels_are_carried_by_error() {
        let error: Error = ErrorKind::Command(CommandError {
            code: 2,
            code_name: "BadValue".to_string(),
            message: String::new(),
            labels: vec![RETRYABLE_WRITE_ERROR.to_string()],
        })
        .into();
        assert!(error.is_write_retryable());
        assert_eq!(error.labels(), &[RETRYABLE_WRITE_ERROR.to_string()]);
    }
}
