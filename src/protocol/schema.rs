//! Closed message schema loaded from an XML description at startup.
//!
//! Every decoded message is verified against this schema before a handler
//! ever sees it: unknown fields, wrong field types, or missing required
//! fields all fail with [`WiredError::InvalidMessage`]. The schema is data,
//! not generated code, per spec.md §9's "messages are a `(name,
//! field-map)` value" design note — handlers never depend on a
//! per-message generated struct.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{WiredError, WiredResult};
use crate::protocol::message::{Field, Message};

/// The semantic type a field's value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Enum,
    Int32,
    Int64,
    Uint32,
    Uint64,
    String,
    Date,
    Uuid,
    Data,
    List,
    Oob,
}

impl FieldType {
    fn matches(self, field: &Field) -> bool {
        matches!(
            (self, field),
            (FieldType::Bool, Field::Bool(_))
                | (FieldType::Enum, Field::Enum(_))
                | (FieldType::Int32, Field::Int32(_))
                | (FieldType::Int64, Field::Int64(_))
                | (FieldType::Uint32, Field::Uint32(_))
                | (FieldType::Uint64, Field::Uint64(_))
                | (FieldType::String, Field::String(_))
                | (FieldType::Date, Field::Date(_))
                | (FieldType::Uuid, Field::Uuid(_))
                | (FieldType::Data, Field::Data(_))
                | (FieldType::List, Field::List(_))
                | (FieldType::Oob, Field::Oob(_))
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
struct XmlField {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    ty: FieldType,
    #[serde(rename = "@required", default)]
    required: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct XmlMessage {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "field", default)]
    fields: Vec<XmlField>,
}

#[derive(Debug, Clone, Deserialize)]
struct XmlSchema {
    #[serde(rename = "message", default)]
    messages: Vec<XmlMessage>,
}

#[derive(Debug, Clone)]
struct FieldSpec {
    ty: FieldType,
    required: bool,
}

#[derive(Debug, Clone)]
struct MessageSpec {
    fields: HashMap<String, FieldSpec>,
}

/// A loaded, ready-to-verify copy of the protocol schema.
#[derive(Debug, Clone, Default)]
pub struct MessageSchema {
    messages: HashMap<String, MessageSpec>,
}

impl MessageSchema {
    /// Loads and parses the schema XML file.
    pub fn load(path: &Path) -> WiredResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| WiredError::io(e, path))?;
        Self::parse(&text)
    }

    pub fn parse(xml: &str) -> WiredResult<Self> {
        let parsed: XmlSchema = quick_xml::de::from_str(xml)
            .map_err(|e| WiredError::Protocol(format!("invalid schema XML: {}", e)))?;

        let mut messages = HashMap::new();
        for m in parsed.messages {
            let mut fields = HashMap::new();
            for f in m.fields {
                fields.insert(
                    f.name,
                    FieldSpec {
                        ty: f.ty,
                        required: f.required,
                    },
                );
            }
            messages.insert(m.name, MessageSpec { fields });
        }
        Ok(Self { messages })
    }

    /// Verifies `message` against the schema: the message name must be
    /// known, every present field must be declared with a matching type,
    /// and every required field must be present.
    pub fn verify(&self, message: &Message) -> WiredResult<()> {
        let spec = self.messages.get(message.name()).ok_or_else(|| {
            WiredError::InvalidMessage {
                name: message.name().to_string(),
                reason: "unrecognized message name".to_string(),
            }
        })?;

        for (field_name, value) in message.fields() {
            if field_name == "wired.transaction" {
                // The transaction id is a universal optional field, not
                // declared per-message.
                continue;
            }
            let field_spec = spec.fields.get(field_name).ok_or_else(|| {
                WiredError::InvalidMessage {
                    name: message.name().to_string(),
                    reason: format!("unknown field {:?}", field_name),
                }
            })?;
            if !field_spec.ty.matches(value) {
                return Err(WiredError::InvalidMessage {
                    name: message.name().to_string(),
                    reason: format!("field {:?} has the wrong type", field_name),
                });
            }
        }

        for (field_name, field_spec) in &spec.fields {
            if field_spec.required && message.get(field_name).is_none() {
                return Err(WiredError::InvalidMessage {
                    name: message.name().to_string(),
                    reason: format!("missing required field {:?}", field_name),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    <schema>
        <message name="wired.send_login">
            <field name="wired.user.login" type="string" required="true"/>
            <field name="wired.user.password" type="string" required="true"/>
        </message>
        <message name="wired.ping"/>
    </schema>
    "#;

    #[test]
    fn verify_accepts_well_formed_message() {
        let schema = MessageSchema::parse(SAMPLE).unwrap();
        let mut msg = Message::new("wired.send_login");
        msg.set("wired.user.login", Field::String("admin".into()));
        msg.set("wired.user.password", Field::String("hash".into()));
        assert!(schema.verify(&msg).is_ok());
    }

    #[test]
    fn verify_rejects_missing_required_field() {
        let schema = MessageSchema::parse(SAMPLE).unwrap();
        let mut msg = Message::new("wired.send_login");
        msg.set("wired.user.login", Field::String("admin".into()));
        assert!(schema.verify(&msg).is_err());
    }

    #[test]
    fn verify_rejects_unknown_field() {
        let schema = MessageSchema::parse(SAMPLE).unwrap();
        let mut msg = Message::new("wired.ping");
        msg.set("bogus", Field::Bool(true));
        assert!(schema.verify(&msg).is_err());
    }

    #[test]
    fn verify_rejects_wrong_type() {
        let schema = MessageSchema::parse(SAMPLE).unwrap();
        let mut msg = Message::new("wired.send_login");
        msg.set("wired.user.login", Field::Bool(true));
        msg.set("wired.user.password", Field::String("hash".into()));
        assert!(schema.verify(&msg).is_err());
    }

    #[test]
    fn verify_rejects_unrecognized_message_name() {
        let schema = MessageSchema::parse(SAMPLE).unwrap();
        let msg = Message::new("wired.not_a_real_message");
        assert!(schema.verify(&msg).is_err());
    }
}
