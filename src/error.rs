//! Main Crate Error

use crate::protocol::{DecodeError, EncodeError};

#[derive(thiserror::Error, Debug)]
/// Meshdht crate error enum.
pub enum Error {
    /// Caller supplied arguments that can never succeed (empty peerid, reserved key...).
    #[error("Invalid arguments: {0}")]
    InvalidArgs(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to decode package: {0}")]
    /// Inbound bytes were not a valid package.
    Decode(#[from] DecodeError),

    #[error("Failed to encode package: {0}")]
    /// A package section failed to bencode, or the package overflows its length fields.
    Encode(#[from] EncodeError),

    /// The actor thread is gone, either after [crate::Dht::stop] or a panic.
    #[error("The Dht was shutdown")]
    DhtWasShutdown,
}

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result taxonomy delivered to every waiter of a task or API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    Pending,
    /// No initial targets, or no path to the target.
    Failed,
    Timeout,
    Stopped,
    InvalidArgs,
    InvalidPackage,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl From<&Error> for ResultCode {
    fn from(error: &Error) -> Self {
        match error {
            Error::InvalidArgs(_) => ResultCode::InvalidArgs,
            Error::Decode(_) => ResultCode::InvalidPackage,
            Error::DhtWasShutdown => ResultCode::Stopped,
            Error::IO(_) | Error::Encode(_) => ResultCode::Failed,
        }
    }
}
