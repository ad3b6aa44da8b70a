//! Uniform result envelope handed to callers of the reconciler

use serde::Serialize;
use serde_json::Value;

use crate::error::DomainError;

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok<T: Serialize>(message: impl Into<String>, data: &T) -> Self {
        // Serializing our own plain structs cannot fail; fall back to no payload
        let data = serde_json::to_value(data).ok();
        Self {
            success: true,
            message: Some(message.into()),
            data,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, err: &DomainError) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
            error: Some(err.to_string()),
        }
    }
}
