//! Static descriptions of DSP blocks.
//!
//! Each block type is a [`NodeSpec`]: the attributes it tracks, which of
//! them are pushed by subscription, and the spec of its lazily created
//! children (channels). [`crate::node::AttributeNode`] interprets the table.

use avlib_core::error::Result;

use crate::value::Value;

/// Expected shape of an attribute's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Integer,
    /// Integer or float, cached as a float.
    Number,
    Text,
    /// Cached as received.
    Any,
}

impl ValueKind {
    /// Normalize `value` to this kind.
    ///
    /// Fails with `TypeMismatch` if the device sent another shape.
    pub fn convert(self, value: &Value) -> Result<Value> {
        Ok(match self {
            ValueKind::Bool => Value::from(value.as_bool()?),
            ValueKind::Integer => Value::from(value.as_i64()?),
            ValueKind::Number => Value::from(value.as_f64()?),
            ValueKind::Text => Value::from(value.as_str()?),
            ValueKind::Any => value.clone(),
        })
    }
}

/// One tracked attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: &'static str,
    pub kind: ValueKind,
    /// Kept current by subscription rather than a one-off Get.
    pub subscribe: bool,
}

impl AttributeDescriptor {
    /// Fetched once per initialization.
    pub const fn polled(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            subscribe: false,
        }
    }

    /// Fetched once per initialization and then subscribed.
    pub const fn subscribed(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            subscribe: true,
        }
    }
}

/// Static description of a block or channel type.
#[derive(Debug)]
pub struct NodeSpec {
    pub name: &'static str,
    pub attributes: &'static [AttributeDescriptor],
    /// Spec of indexed children, if the block has any.
    pub children: Option<&'static NodeSpec>,
    /// Integer attribute whose value is the number of children.
    pub count_attribute: Option<&'static str>,
}

impl NodeSpec {
    pub fn descriptor(&self, name: &str) -> Option<&'static AttributeDescriptor> {
        self.attributes.iter().find(|d| d.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avlib_core::error::Error;

    static CHANNEL: NodeSpec = NodeSpec {
        name: "channel",
        attributes: &[
            AttributeDescriptor::subscribed("level", ValueKind::Number),
            AttributeDescriptor::polled("label", ValueKind::Text),
        ],
        children: None,
        count_attribute: None,
    };

    #[test]
    fn descriptor_lookup() {
        let level = CHANNEL.descriptor("level").unwrap();
        assert!(level.subscribe);
        assert_eq!(level.kind, ValueKind::Number);
        assert!(!CHANNEL.descriptor("label").unwrap().subscribe);
        assert!(CHANNEL.descriptor("mute").is_none());
    }

    #[test]
    fn number_accepts_integers() {
        let v = ValueKind::Number.convert(&Value::from(-6)).unwrap();
        assert!(matches!(v, Value::Scalar(crate::value::Scalar::Float(x)) if x == -6.0));
    }

    #[test]
    fn convert_rejects_wrong_shape() {
        assert!(matches!(
            ValueKind::Bool.convert(&Value::from("true")),
            Err(Error::TypeMismatch {
                expected: "boolean",
                found: "string"
            })
        ));
        assert!(ValueKind::Integer.convert(&Value::from(2.5)).is_err());
        assert_eq!(
            ValueKind::Any.convert(&Value::list([])).unwrap(),
            Value::list([])
        );
    }
}
