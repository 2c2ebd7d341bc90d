//! SMTP client: connection handling, command issuing, response parsing.

mod error;
mod response;
mod smtp;
pub mod tls;

pub use error::{ClientError, Result};
pub use response::Response;
pub use smtp::SmtpClient;
