//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors raised while talking to a remote MTA.
///
/// Reply-code classification (2xx/4xx/5xx) is not an error at this layer;
/// callers inspect [`super::Response`] codes themselves. These variants are
/// transport and protocol failures only.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("can't parse SMTP response: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
