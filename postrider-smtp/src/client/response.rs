//! SMTP reply parsing.

use super::error::{ClientError, Result};

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text with lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Whether an EHLO reply advertises the given extension keyword.
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// Parse one reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// the buffer does not yet hold a complete reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Parse`] for malformed reply lines and
    /// [`ClientError::Utf8`] for non-UTF-8 input.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = std::str::from_utf8(buffer)?;

        let mut consumed = 0;
        let mut code = 0;
        let mut lines = Vec::new();
        let mut rest = text;

        loop {
            let Some(end) = rest.find('\n') else {
                return Ok(None);
            };
            let raw = rest[..end].trim_end_matches('\r');
            consumed += end + 1;
            rest = &rest[end + 1..];

            let (line_code, is_last, message) = Self::parse_line(raw)?;
            if lines.is_empty() {
                code = line_code;
            } else if line_code != code {
                return Err(ClientError::Parse(format!(
                    "status code changed mid-reply: {code} then {line_code}"
                )));
            }
            lines.push(message.to_string());

            if is_last {
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }
    }

    fn parse_line(line: &str) -> Result<(u16, bool, &str)> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return Err(ClientError::Parse(format!("reply line too short: {line:?}")));
        }
        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ClientError::Parse(format!("invalid status code in {line:?}")))?;

        match line.as_bytes().get(3) {
            None => Ok((code, true, "")),
            Some(b' ') => Ok((code, true, &line[4..])),
            Some(b'-') => Ok((code, false, &line[4..])),
            Some(_) => Err(ClientError::Parse(format!(
                "invalid separator after status code in {line:?}"
            ))),
        }
    }
}
