//! Command codes.
//!
//! A [`Code`] is one command line addressed to a DSP block:
//!
//! ```text
//! <instance tag> <verb> <attribute> <index>* <value>?
//! <instance tag> <service> <index>* <value>?
//! ```
//!
//! Codes are built by the caller, serialized once and handed to the command
//! queue; they are never mutated after submission.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use avlib_core::error::Error;

use crate::key::correlation_key;
use crate::value::{write_string, Value};

/// Attribute verbs understood by TTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Set,
    Increment,
    Decrement,
    Toggle,
    Subscribe,
    Unsubscribe,
    Trigger,
}

impl Verb {
    /// The keyword as it appears on the wire.
    pub fn keyword(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Set => "set",
            Verb::Increment => "increment",
            Verb::Decrement => "decrement",
            Verb::Toggle => "toggle",
            Verb::Subscribe => "subscribe",
            Verb::Unsubscribe => "unsubscribe",
            Verb::Trigger => "trigger",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "get" => Ok(Verb::Get),
            "set" => Ok(Verb::Set),
            "increment" => Ok(Verb::Increment),
            "decrement" => Ok(Verb::Decrement),
            "toggle" => Ok(Verb::Toggle),
            "subscribe" => Ok(Verb::Subscribe),
            "unsubscribe" => Ok(Verb::Unsubscribe),
            "trigger" => Ok(Verb::Trigger),
            other => Err(Error::InvalidParameter(format!("unknown verb `{other}`"))),
        }
    }
}

/// What a code asks the block to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// An attribute verb.
    Verb(Verb),
    /// A named service such as `recallPreset`, which takes no attribute.
    Service(String),
}

impl Operation {
    pub fn keyword(&self) -> &str {
        match self {
            Operation::Verb(verb) => verb.keyword(),
            Operation::Service(name) => name,
        }
    }
}

/// One protocol command.
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub instance_tag: String,
    pub operation: Operation,
    pub attribute: Option<String>,
    /// 1-based channel/row/column indices, in address order.
    pub indices: Vec<u32>,
    pub value: Option<Value>,
}

impl Code {
    /// A verb code with no attribute, indices or value yet.
    pub fn new(instance_tag: impl Into<String>, verb: Verb) -> Self {
        Self {
            instance_tag: instance_tag.into(),
            operation: Operation::Verb(verb),
            attribute: None,
            indices: Vec::new(),
            value: None,
        }
    }

    /// A service-level code such as `DEVICE recallPreset 1001`.
    pub fn service(instance_tag: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            instance_tag: instance_tag.into(),
            operation: Operation::Service(service.into()),
            attribute: None,
            indices: Vec::new(),
            value: None,
        }
    }

    /// Full attribute code in one call.
    pub fn attribute_code(
        instance_tag: impl Into<String>,
        verb: Verb,
        attribute: impl Into<String>,
        value: Option<Value>,
        indices: &[u32],
    ) -> Self {
        Self {
            instance_tag: instance_tag.into(),
            operation: Operation::Verb(verb),
            attribute: Some(attribute.into()),
            indices: indices.to_vec(),
            value,
        }
    }

    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn index(mut self, index: u32) -> Self {
        self.indices.push(index);
        self
    }

    pub fn indices(mut self, indices: &[u32]) -> Self {
        self.indices.extend_from_slice(indices);
        self
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// The verb, or `None` for service codes.
    pub fn verb(&self) -> Option<Verb> {
        match self.operation {
            Operation::Verb(verb) => Some(verb),
            Operation::Service(_) => None,
        }
    }

    /// Correlation key of the addressed attribute.
    ///
    /// Independent of verb and value, so a Get and the Subscribe for the same
    /// attribute share one key.
    pub fn key(&self) -> String {
        correlation_key(&self.instance_tag, self.attribute.as_deref(), &self.indices)
    }

    /// Wire form, terminated by `\n`.
    pub fn serialize(&self) -> String {
        let mut out = self.to_string();
        out.push('\n');
        out
    }
}

impl fmt::Display for Code {
    /// Wire form without the line terminator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_string(f, &self.instance_tag)?;
        f.write_char(' ')?;
        f.write_str(self.operation.keyword())?;
        if let Some(attribute) = &self.attribute {
            write!(f, " {attribute}")?;
        }
        for index in &self.indices {
            write!(f, " {index}")?;
        }
        if let Some(value) = &self.value {
            write!(f, " {value}")?;
        }
        Ok(())
    }
}
