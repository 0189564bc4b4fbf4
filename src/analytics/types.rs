/**
 * ============================================================================
 * ANALYTICS TYPES MODULE
 * ============================================================================
 *
 * PURPOSE: Define the data structures shared across the analytics system
 *
 * TYPES DEFINED:
 * - ParamValue: Event parameter value (string, integer, float, or clear marker)
 * - ProtocolVariant: gtag vs Firebase identity conventions
 * - Violation / ViolationSubject: A single validation rule breach
 * - AnalyticsError: Errors surfaced through the public API
 *
 * ============================================================================
 */

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Parameter Values
// =============================================================================

/**
 * Value of an event or default parameter
 *
 * `Clear` is only meaningful when setting default parameters: it removes the
 * key from the stored defaults. It is never written to the wire.
 * Untagged serde representation: strings as JSON strings, numbers unquoted,
 * `Clear` as null.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Float(f64),
    Clear,
}

impl ParamValue {
    pub fn is_clear(&self) -> bool {
        matches!(self, ParamValue::Clear)
    }

    /// False for NaN and infinite floats, which have no JSON form.
    pub fn is_finite(&self) -> bool {
        match self {
            ParamValue::Float(value) => value.is_finite(),
            _ => true,
        }
    }

    /// String values only; numbers are exempt from value-length rules.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    /**
     * Encode for a string-only settings store
     * The JSON text keeps the int/float/string distinction across restarts
     */
    pub fn to_stored(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to encode parameter value: {}", e))
    }

    /**
     * Decode a value written by `to_stored`
     */
    pub fn from_stored(stored: &str) -> Result<Self, String> {
        serde_json::from_str(stored)
            .map_err(|e| format!("Failed to decode stored parameter value '{}': {}", stored, e))
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

// =============================================================================
// Protocol Variant
// =============================================================================

/**
 * Wire-format variant
 * Both share the event schema and differ only in how the device is identified
 * and which app identifier goes into the query string
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    #[default]
    Gtag,
    Firebase,
}

impl ProtocolVariant {
    /// JSON field carrying the device id
    pub fn identity_field(&self) -> &'static str {
        match self {
            ProtocolVariant::Gtag => "client_id",
            ProtocolVariant::Firebase => "app_instance_id",
        }
    }

    /// Query parameter carrying the app identifier
    pub fn app_id_query_key(&self) -> &'static str {
        match self {
            ProtocolVariant::Gtag => "measurement_id",
            ProtocolVariant::Firebase => "firebase_app_id",
        }
    }
}

impl FromStr for ProtocolVariant {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gtag" => Ok(ProtocolVariant::Gtag),
            "firebase" => Ok(ProtocolVariant::Firebase),
            other => Err(format!("Unknown protocol variant '{}' (expected gtag or firebase)", other)),
        }
    }
}

// =============================================================================
// Validation Violations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationSubject {
    EventName,
    EventParameter,
    UserProperty,
    UserId,
    DeviceId,
}

impl std::fmt::Display for ViolationSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ViolationSubject::EventName => "event name",
            ViolationSubject::EventParameter => "event parameter",
            ViolationSubject::UserProperty => "user property",
            ViolationSubject::UserId => "user id",
            ViolationSubject::DeviceId => "device id",
        };
        write!(f, "{}", label)
    }
}

/**
 * A single rule breach found by the validator
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub subject: ViolationSubject,
    pub message: String,
}

impl Violation {
    pub fn new(subject: ViolationSubject, message: impl Into<String>) -> Self {
        Self {
            subject,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid {}: {}", self.subject, self.message)
    }
}

// =============================================================================
// Error Types
// =============================================================================

/**
 * Errors surfaced by the public API
 *
 * Transport failures are deliberately absent: delivery is fire-and-forget
 * and failures are only logged.
 */
#[derive(Debug, Clone)]
pub enum AnalyticsError {
    /// Invalid configuration or a validation pattern that failed to compile
    Configuration { message: String },

    /// Rule breaches, only raised when diagnostics and escalation are both on
    Validation { violations: Vec<Violation> },

    /// Settings store write failed; in-memory state was left unchanged
    Storage { message: String },

    /// Payload could not be encoded
    Serialization { message: String },
}

impl std::fmt::Display for AnalyticsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalyticsError::Configuration { message } => {
                write!(f, "Configuration error: {}", message)
            }
            AnalyticsError::Validation { violations } => {
                let messages: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                write!(f, "Validation failed: {}", messages.join("; "))
            }
            AnalyticsError::Storage { message } => {
                write!(f, "Storage error: {}", message)
            }
            AnalyticsError::Serialization { message } => {
                write!(f, "Serialization error: {}", message)
            }
        }
    }
}

impl std::error::Error for AnalyticsError {}
