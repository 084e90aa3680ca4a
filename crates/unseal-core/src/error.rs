//! Unseal error types

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The main error type for unseal operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error while reading the image or a mounted tree
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image carries no recognizable partition table
    #[error("Unrecognized image format: {0}")]
    ImageFormat(String),

    /// A volume header could not be parsed
    #[error("Invalid volume header: {0}")]
    InvalidHeader(String),

    /// Checksum verification failed
    #[error("Checksum verification failed: {0}")]
    ChecksumVerification(String),

    /// The volume uses a scheme no handler understands
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// None of the candidate keys verified against the volume header
    #[error("No matching key for {scheme} volume ({tried} candidates tried)")]
    NoMatchingKey {
        /// Scheme of the volume that could not be unlocked
        scheme: String,
        /// Number of candidates that were verified
        tried: usize,
    },

    /// Mapping or mounting through an external collaborator failed
    #[error("Mount failed: {0}")]
    Mount(String),

    /// No operating-system marker found on a mounted filesystem
    #[error("Unknown operating system: {0}")]
    UnknownOs(String),

    /// A credential store could not be parsed or rewritten
    #[error("Corrupt credential store: {0}")]
    CorruptStore(String),

    /// A candidate key could not be loaded
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A cryptographic primitive rejected its input
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Generic error with custom message
    #[error("{0}")]
    Custom(String),
}

/// Result type alias for unseal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category carried in per-volume reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ImageFormat,
    UnsupportedScheme,
    NoMatchingKey,
    Mount,
    UnknownOs,
    CorruptStore,
    Io,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ImageFormat => "ImageFormatError",
            ErrorKind::UnsupportedScheme => "UnsupportedSchemeError",
            ErrorKind::NoMatchingKey => "NoMatchingKeyError",
            ErrorKind::Mount => "MountError",
            ErrorKind::UnknownOs => "UnknownOsError",
            ErrorKind::CorruptStore => "CorruptStoreError",
            ErrorKind::Io => "IoError",
            ErrorKind::Other => "Error",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Category of this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::ImageFormat(_) => ErrorKind::ImageFormat,
            Error::InvalidHeader(_) | Error::UnsupportedScheme(_) => ErrorKind::UnsupportedScheme,
            Error::NoMatchingKey { .. } => ErrorKind::NoMatchingKey,
            Error::Mount(_) => ErrorKind::Mount,
            Error::UnknownOs(_) => ErrorKind::UnknownOs,
            Error::CorruptStore(_) => ErrorKind::CorruptStore,
            Error::ChecksumVerification(_)
            | Error::InvalidKey(_)
            | Error::Crypto(_)
            | Error::InvalidOperation(_)
            | Error::Custom(_) => ErrorKind::Other,
        }
    }

    /// True for the only error that aborts a whole run
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::ImageFormat
    }

    /// Create a custom error from a string
    pub fn custom(msg: impl Into<String>) -> Self {
        Error::Custom(msg.into())
    }

    /// Create an image format error
    pub fn image_format(msg: impl Into<String>) -> Self {
        Error::ImageFormat(msg.into())
    }

    /// Create an invalid header error
    pub fn invalid_header(msg: impl Into<String>) -> Self {
        Error::InvalidHeader(msg.into())
    }

    /// Create an unsupported scheme error
    pub fn unsupported_scheme(msg: impl Into<String>) -> Self {
        Error::UnsupportedScheme(msg.into())
    }

    /// Create a no-matching-key error
    pub fn no_matching_key(scheme: impl Into<String>, tried: usize) -> Self {
        Error::NoMatchingKey {
            scheme: scheme.into(),
            tried,
        }
    }

    /// Create a mount error
    pub fn mount(msg: impl Into<String>) -> Self {
        Error::Mount(msg.into())
    }

    /// Create an unknown OS error
    pub fn unknown_os(msg: impl Into<String>) -> Self {
        Error::UnknownOs(msg.into())
    }

    /// Create a corrupt store error
    pub fn corrupt_store(msg: impl Into<String>) -> Self {
        Error::CorruptStore(msg.into())
    }

    /// Create an invalid key error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Error::InvalidKey(msg.into())
    }

    /// Create a crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Prefix the message with the volume it concerns, keeping the variant
    pub fn in_volume(self, index: usize) -> Self {
        let prefix = format!("volume {}: ", index);
        let tag = |msg: String| {
            if msg.starts_with(&prefix) {
                msg
            } else {
                format!("{}{}", prefix, msg)
            }
        };
        match self {
            Error::ImageFormat(m) => Error::ImageFormat(tag(m)),
            Error::InvalidHeader(m) => Error::InvalidHeader(tag(m)),
            Error::ChecksumVerification(m) => Error::ChecksumVerification(tag(m)),
            Error::UnsupportedScheme(m) => Error::UnsupportedScheme(tag(m)),
            Error::Mount(m) => Error::Mount(tag(m)),
            Error::UnknownOs(m) => Error::UnknownOs(tag(m)),
            Error::CorruptStore(m) => Error::CorruptStore(tag(m)),
            Error::InvalidKey(m) => Error::InvalidKey(tag(m)),
            Error::Crypto(m) => Error::Crypto(tag(m)),
            Error::InvalidOperation(m) => Error::InvalidOperation(tag(m)),
            Error::Custom(m) => Error::Custom(tag(m)),
            other @ (Error::Io(_) | Error::NoMatchingKey { .. }) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::image_format("x").kind(), ErrorKind::ImageFormat);
        assert_eq!(Error::invalid_header("x").kind(), ErrorKind::UnsupportedScheme);
        assert_eq!(Error::no_matching_key("LUKS", 3).kind(), ErrorKind::NoMatchingKey);
        assert_eq!(Error::corrupt_store("x").kind(), ErrorKind::CorruptStore);
        assert_eq!(Error::crypto("x").kind(), ErrorKind::Other);
    }

    #[test]
    fn test_only_image_format_is_fatal() {
        assert!(Error::image_format("no table").is_fatal());
        assert!(!Error::mount("busy").is_fatal());
        assert!(!Error::unknown_os("empty").is_fatal());
    }

    #[test]
    fn test_no_matching_key_message() {
        let err = Error::no_matching_key("BitLocker", 5);
        assert_eq!(
            err.to_string(),
            "No matching key for BitLocker volume (5 candidates tried)"
        );
        assert_eq!(ErrorKind::NoMatchingKey.to_string(), "NoMatchingKeyError");
    }

    #[test]
    fn test_in_volume_prefixes_once() {
        let err = Error::unknown_os("no marker").in_volume(3);
        assert_eq!(err.to_string(), "Unknown operating system: volume 3: no marker");
        let again = err.in_volume(3);
        assert!(matches!(again, Error::UnknownOs(ref m) if m == "volume 3: no marker"));
    }
}
