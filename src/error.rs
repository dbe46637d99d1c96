use std::fmt;
use serde::{Deserialize, Serialize};

/// Custom error type for TryOn operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error
{   /// Image source could not be read or downloaded
    Io(String)
  , /// Image could not be decoded, resized or re-encoded
    Encode(String)
  , /// Missing or malformed input supplied by the caller
    InvalidInput(String)
  , /// HTTP transport error
    HttpError(String)
  , /// API returned an error response
    ApiError(String)
  , /// Failed to parse API response
    ParseError(String)
  , /// Invalid configuration
    InvalidConfiguration(String)
  , /// Timeout error
    Timeout
  , /// Actor or collaborator channel closed
    Disconnected(String)
  , /// Generic error
    Other(String)
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::Io(msg) => {
              write!(f, "IO error: {}", msg)
            }
          , Error::Encode(msg) => {
              write!(f, "Encode error: {}", msg)
            }
          , Error::InvalidInput(msg) => {
              write!(f, "Invalid input: {}", msg)
            }
          , Error::HttpError(msg) => {
              write!(f, "HTTP error: {}", msg)
            }
          , Error::ApiError(msg) => {
              write!(f, "API error: {}", msg)
            }
          , Error::ParseError(msg) => {
              write!(f, "Parse error: {}", msg)
            }
          , Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::Timeout => {
              write!(f, "Request timed out")
            }
          , Error::Disconnected(what) => {
              write!(f, "Disconnected: {}", what)
            }
          , Error::Other(msg) => {
              write!(f, "Error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<std::io::Error> for Error
{   fn from(e: std::io::Error) -> Self
    {   Error::Io(e.to_string())
    }
}

impl From<image::ImageError> for Error
{   fn from(e: image::ImageError) -> Self
    {   Error::Encode(e.to_string())
    }
}

// ===== Classified errors =====

pub const INSUFFICIENT_CREDIT_MESSAGE: &str
  = "You don't have enough credits for this generation. \
     Purchase more credits to continue.";
pub const CONTENT_REFUSAL_MESSAGE: &str
  = "We couldn't process these images. \
     Try a different photo or garment.";
pub const GENERIC_FAILURE_MESSAGE: &str
  = "Something went wrong while generating. Please try again.";

/// Failure categories surfaced to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind
{   InsufficientCredit
  , TransientBackend
  , ContentRefusal
  , InvalidInput
  , Unknown
}

impl ErrorKind
{   /// Only transient backend failures are retried, and only by the gateway
    pub fn is_retryable(self) -> bool
    {   matches!(self, ErrorKind::TransientBackend)
    }

    pub fn user_message(self) -> &'static str
    {   match self
        {   ErrorKind::InsufficientCredit => INSUFFICIENT_CREDIT_MESSAGE
          , ErrorKind::ContentRefusal => CONTENT_REFUSAL_MESSAGE
          , ErrorKind::TransientBackend
          | ErrorKind::InvalidInput
          | ErrorKind::Unknown => GENERIC_FAILURE_MESSAGE
        }
    }
}

/// A terminal failure as the user sees it, with the raw
/// diagnostic kept alongside for logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError
{   pub kind: ErrorKind
  , pub raw_message: String
  , pub user_message: String
}

impl ClassifiedError
{   pub fn new(kind: ErrorKind, raw_message: impl Into<String>) -> Self
    {   ClassifiedError
        {   kind
          , raw_message: raw_message.into()
          , user_message: kind.user_message().to_string()
        }
    }

    pub fn is_retryable(&self) -> bool
    {   self.kind.is_retryable()
    }
}

impl fmt::Display for ClassifiedError
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   write!(f, "{:?}: {}", self.kind, self.raw_message)
    }
}

impl From<Error> for ClassifiedError
{   fn from(e: Error) -> Self
    {   let kind = match &e
        {   Error::InvalidInput(_) | Error::Encode(_) => {
              ErrorKind::InvalidInput
            }
          , Error::Timeout => ErrorKind::TransientBackend
          , _ => ErrorKind::Unknown
        };
        ClassifiedError::new(kind, e.to_string())
    }
}
