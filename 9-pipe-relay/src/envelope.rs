//! The three-field message record relayed between HTTP and the transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Destination that keeps a message off the transport mesh.
///
/// This is the only control channel in the data model: a server session
/// never fans out an envelope addressed to `NORELAY`, which is how
/// acknowledgements stay local instead of looping back to every peer.
pub const NORELAY: &str = "NORELAY";

/// Keys every envelope document must carry, in validation order.
pub const REQUIRED_FIELDS: [&str; 3] = ["source", "destination", "content"];

const ACK_SOURCE: &str = "PIPECLIENT";
const ACK_CONTENT: &str = "Acknowledged";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    source: String,
    destination: String,
    content: String,
}

impl Envelope {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            content: content.into(),
        }
    }

    /// The fixed reply a client sends after every non-empty batch.
    pub fn acknowledgement() -> Self {
        Self::new(ACK_SOURCE, NORELAY, ACK_CONTENT)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_norelay(&self) -> bool {
        self.destination == NORELAY
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::MalformedPayload)
    }

    /// Decodes an envelope, rejecting documents that lack a required key
    /// instead of defaulting it.
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(raw).map_err(EnvelopeError::MalformedPayload)?;
        let Value::Object(object) = value else {
            return Err(EnvelopeError::MalformedPayload(not_an_object()));
        };

        for field in REQUIRED_FIELDS {
            if matches!(object.get(field), None | Some(Value::Null)) {
                return Err(EnvelopeError::MissingField(field));
            }
        }

        serde_json::from_value(Value::Object(object)).map_err(EnvelopeError::MalformedPayload)
    }

    /// Returns the first required key absent from `object`, if any.
    ///
    /// Presence only: a key mapped to `null` counts as present here.
    pub fn missing_field(object: &Map<String, Value>) -> Option<&'static str> {
        REQUIRED_FIELDS
            .into_iter()
            .find(|field| !object.contains_key(*field))
    }
}

fn not_an_object() -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::custom("expected a JSON object")
}
