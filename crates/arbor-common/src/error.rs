//! Unified error type for the arbor workspace.
//!
//! Every failure carries a kind from a closed taxonomy, an optional captured
//! `errno`, and a human-readable message. The kind is what clients see as a
//! status code; the message is what lands in the log.

use std::fmt;

use thiserror::Error;

/// Closed set of failure categories surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unclassified failure, usually a kernel call that went sideways.
    Unknown,
    /// Request method is not recognized.
    InvalidMethod,
    /// Container with this name already exists.
    ContainerAlreadyExists,
    /// Container was not found or was destroyed.
    ContainerDoesNotExist,
    /// Property name is not declared.
    InvalidProperty,
    /// Property value failed to parse or validate.
    InvalidValue,
    /// Operation is not legal in the container's current state.
    InvalidState,
    /// Kernel or configuration lacks the required facility.
    NotSupported,
    /// Admission control rejected the request.
    ResourceNotAvailable,
    /// Caller is not allowed to do this.
    Permission,
    /// Container is locked by a concurrent operation.
    Busy,
    /// Property has no value to report.
    NoValue,
    /// Command line cannot be executed.
    InvalidCommand,
    /// Label lookup found nothing.
    LabelNotFound,
    /// Label key or value is malformed.
    InvalidLabel,
    /// Non-fatal misconfiguration diagnostics.
    Taint,
}

impl ErrorKind {
    /// Stable lower-case name used in logs and wire responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::InvalidMethod => "InvalidMethod",
            Self::ContainerAlreadyExists => "ContainerAlreadyExists",
            Self::ContainerDoesNotExist => "ContainerDoesNotExist",
            Self::InvalidProperty => "InvalidProperty",
            Self::InvalidValue => "InvalidValue",
            Self::InvalidState => "InvalidState",
            Self::NotSupported => "NotSupported",
            Self::ResourceNotAvailable => "ResourceNotAvailable",
            Self::Permission => "Permission",
            Self::Busy => "Busy",
            Self::NoValue => "NoValue",
            Self::InvalidCommand => "InvalidCommand",
            Self::LabelNotFound => "LabelNotFound",
            Self::InvalidLabel => "InvalidLabel",
            Self::Taint => "Taint",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn render(kind: &ErrorKind, errno: &Option<i32>, message: &str) -> String {
    match errno {
        Some(no) => format!("{kind}: {message} (errno {no})"),
        None => format!("{kind}: {message}"),
    }
}

/// Workspace-wide error value.
#[derive(Debug, Clone, Error)]
#[error("{}", render(.kind, .errno, .message))]
pub struct ArborError {
    kind: ErrorKind,
    errno: Option<i32>,
    message: String,
}

impl ArborError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            message: message.into(),
        }
    }

    /// Creates an `Unknown` error capturing the current OS errno.
    ///
    /// Call this right after a failed kernel call, the way `errno` is meant
    /// to be read.
    #[must_use]
    pub fn system(context: impl Into<String>) -> Self {
        let os = std::io::Error::last_os_error();
        Self {
            kind: ErrorKind::Unknown,
            errno: os.raw_os_error(),
            message: format!("{}: {os}", context.into()),
        }
    }

    /// Wraps an I/O error, keeping its errno and naming the path involved.
    #[must_use]
    pub fn io(path: impl AsRef<std::path::Path>, source: &std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            errno: source.raw_os_error(),
            message: format!("{}: {source}", path.as_ref().display()),
        }
    }

    /// Attaches an errno to an already-classified error.
    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// The failure category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Captured OS errno, when one was available.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Shorthand constructors for the kinds that appear on nearly every page.
macro_rules! kind_ctor {
    ($fn_name:ident, $kind:ident) => {
        impl ArborError {
            #[doc = concat!("Creates an `", stringify!($kind), "` error.")]
            #[must_use]
            pub fn $fn_name(message: impl Into<String>) -> Self {
                Self::new(ErrorKind::$kind, message)
            }
        }
    };
}

kind_ctor!(invalid_value, InvalidValue);
kind_ctor!(invalid_state, InvalidState);
kind_ctor!(invalid_property, InvalidProperty);
kind_ctor!(not_supported, NotSupported);
kind_ctor!(no_resource, ResourceNotAvailable);
kind_ctor!(permission, Permission);
kind_ctor!(busy, Busy);
kind_ctor!(no_value, NoValue);
kind_ctor!(no_container, ContainerDoesNotExist);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = ArborError::invalid_value("bad cpu list");
        let msg = format!("{err}");
        assert!(msg.contains("InvalidValue"));
        assert!(msg.contains("bad cpu list"));
    }

    #[test]
    fn errno_is_kept_and_shown() {
        let err = ArborError::invalid_value("limit too low").with_errno(16);
        assert_eq!(err.errno(), Some(16));
        assert!(format!("{err}").contains("errno 16"));
    }

    #[test]
    fn io_error_captures_raw_errno() {
        let io = std::io::Error::from_raw_os_error(2);
        let err = ArborError::io("/sys/fs/cgroup/missing", &io);
        assert_eq!(err.errno(), Some(2));
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::ResourceNotAvailable.as_str(), "ResourceNotAvailable");
        assert_eq!(ErrorKind::Busy.as_str(), "Busy");
    }
}
