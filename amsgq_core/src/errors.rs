//! Error handling and status codes for the active message queues

use shared_memory::ShmemError;
use std::fmt;

/// Status reported by every queue operation.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    Again = 1,
    Invalid = 2,
    NotInitialised = 3,
    Corruption = 4,
    Transport = 5,
    Other = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::Again => "Resource temporarily unavailable, try again",
            ErrorCode::Invalid => "Invalid argument",
            ErrorCode::NotInitialised => "Active messages not initialised",
            ErrorCode::Corruption => "Inbox corruption detected",
            ErrorCode::Transport => "Transport failure",
            ErrorCode::Other => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for queue and transport operations.
#[derive(Debug)]
pub enum Error {
    /// Remote inbox full, being reaped, or the attempt lost a race.
    Again,
    Invalid(String),
    NotInitialised,
    Corruption(String),
    Transport(String),
    Shmem(ShmemError),
    Other(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        map_error(self)
    }

    #[inline]
    pub fn is_again(&self) -> bool {
        matches!(self, Error::Again)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Again => f.write_str(ErrorCode::Again.as_str()),
            Error::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotInitialised => f.write_str(ErrorCode::NotInitialised.as_str()),
            Error::Corruption(msg) => write!(f, "inbox corruption: {msg}"),
            Error::Transport(msg) => write!(f, "transport failure: {msg}"),
            Error::Shmem(e) => write!(f, "shared memory: {e}"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Shmem(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmemError> for Error {
    fn from(e: ShmemError) -> Self {
        Error::Shmem(e)
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_owned())
    }
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::Again => ErrorCode::Again,
        Error::Invalid(_) => ErrorCode::Invalid,
        Error::NotInitialised => ErrorCode::NotInitialised,
        Error::Corruption(_) => ErrorCode::Corruption,
        Error::Transport(_) | Error::Shmem(_) => ErrorCode::Transport,
        Error::Other(_) => ErrorCode::Other,
    }
}

/// Collapse a result into the status the public contract speaks in.
pub fn status_of<T>(res: &Result<T, Error>) -> ErrorCode {
    match res {
        Ok(_) => ErrorCode::Ok,
        Err(e) => map_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_kind() {
        assert_eq!(Error::Again.code(), ErrorCode::Again);
        assert_eq!(Error::Invalid("x".into()).code(), ErrorCode::Invalid);
        assert_eq!(Error::NotInitialised.code(), ErrorCode::NotInitialised);
        assert_eq!(Error::Corruption("x".into()).code(), ErrorCode::Corruption);
        assert_eq!(Error::Transport("x".into()).code(), ErrorCode::Transport);
        assert_eq!(Error::from("boom").code(), ErrorCode::Other);
        assert_eq!(
            Error::from(ShmemError::MappingIdExists).code(),
            ErrorCode::Transport
        );
    }

    #[test]
    fn status_of_result() {
        let ok: Result<(), Error> = Ok(());
        assert_eq!(status_of(&ok), ErrorCode::Ok);
        let again: Result<(), Error> = Err(Error::Again);
        assert_eq!(status_of(&again), ErrorCode::Again);
        assert!(again.unwrap_err().is_again());
    }

    #[test]
    fn display_mentions_detail() {
        let e = Error::Corruption("cursor 40 past tail 32".into());
        assert!(e.to_string().contains("cursor 40 past tail 32"));
        assert_eq!(ErrorCode::Again.to_string(), ErrorCode::Again.as_str());
    }
}
