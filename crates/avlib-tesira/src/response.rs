//! Reply and feedback line classification.
//!
//! ```text
//! +OK
//! +OK "value":-6.000000
//! -ERR address not found: {"deviceId":0 "classCode":0 "instanceNum":0}
//! -CANNOT_DELIVER
//! ! "publishToken":"Level1-level-1" "value":-10.000000
//! Welcome to the Tesira Text Protocol Server...
//! ```

use avlib_core::error::Result;

use crate::value::Value;

/// Banner the server prints when a session opens.
pub const WELCOME_BANNER: &str = "Welcome to the Tesira Text Protocol Server";

/// Record key carrying the subscription token on publish lines.
pub const PUBLISH_TOKEN: &str = "publishToken";

/// One classified line from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `+OK`, with the record body if the reply carries one.
    Ok(Option<Value>),
    /// `-ERR ...`, `-CANNOT_DELIVER`, `-GENERAL_FAILURE`; text without the `-`.
    Error(String),
    /// Subscription feedback.
    Publish { token: String, record: Value },
    /// Anything else: banner, echo, blank prompt.
    Other(String),
}

impl Response {
    /// Parse one line (without its terminator).
    ///
    /// Fails with `MalformedValue` if the record body does not parse, or
    /// with `Protocol`/`TypeMismatch` if a publish line has no string token.
    pub fn parse(line: &str) -> Result<Response> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("+OK") {
            let rest = rest.trim_start();
            if rest.is_empty() {
                return Ok(Response::Ok(None));
            }
            return Ok(Response::Ok(Some(Value::parse_record_body(rest)?)));
        }
        if let Some(rest) = line.strip_prefix('-') {
            return Ok(Response::Error(rest.to_string()));
        }
        if let Some(rest) = line.strip_prefix('!') {
            let record = Value::parse_record_body(rest)?;
            let token = record.get(PUBLISH_TOKEN)?.as_str()?.to_string();
            return Ok(Response::Publish { token, record });
        }
        Ok(Response::Other(line.to_string()))
    }

    /// Whether this is the session welcome banner.
    pub fn is_banner(&self) -> bool {
        matches!(self, Response::Other(text) if text.starts_with(WELCOME_BANNER))
    }
}
