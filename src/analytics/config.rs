/**
 * ============================================================================
 * MEASUREMENT CONFIGURATION MODULE
 * ============================================================================
 *
 * PURPOSE: Configuration schema, validation, persistence, and endpoint URL
 *
 * SOURCES:
 * - Constructed directly by the host application
 * - JSON file (load_config / save_config)
 * - Environment variables, with .env support (from_env)
 *
 * ENDPOINTS:
 * - Production: https://www.google-analytics.com/mp/collect
 * - Validation: https://www.google-analytics.com/debug/mp/collect
 *
 * ============================================================================
 */

use crate::analytics::types::ProtocolVariant;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const PRODUCTION_ENDPOINT: &str = "https://www.google-analytics.com/mp/collect";
pub const VALIDATION_ENDPOINT: &str = "https://www.google-analytics.com/debug/mp/collect";

/**
 * Complete client configuration
 * Everything except the persisted user state lives here
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeasurementConfig {
    // Which identity field and app id query key to use
    pub protocol_variant: ProtocolVariant,

    // API secret created in the analytics admin console
    pub api_secret: String,

    // Web stream measurement id (gtag variant)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement_id: Option<String>,

    // Firebase app id (Firebase variant)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firebase_app_id: Option<String>,

    // Run validation rules and log verbosely
    pub diagnostics_enabled: bool,

    // Turn violations into errors (requires diagnostics_enabled)
    pub escalate_validation_errors: bool,

    // Send to the debug endpoint, which validates but does not record
    pub use_validation_endpoint: bool,

    // Timeout for the bundled reqwest transport
    pub request_timeout_seconds: u64,
}

impl Default for MeasurementConfig {
    /**
     * Production defaults: gtag variant, diagnostics off
     * api_secret and the app id must still be filled in
     */
    fn default() -> Self {
        Self {
            protocol_variant: ProtocolVariant::Gtag,
            api_secret: String::new(),
            measurement_id: None,
            firebase_app_id: None,
            diagnostics_enabled: false,
            escalate_validation_errors: false,
            use_validation_endpoint: false,
            request_timeout_seconds: 10,
        }
    }
}

impl MeasurementConfig {
    pub fn gtag(api_secret: impl Into<String>, measurement_id: impl Into<String>) -> Self {
        Self {
            protocol_variant: ProtocolVariant::Gtag,
            api_secret: api_secret.into(),
            measurement_id: Some(measurement_id.into()),
            ..Self::default()
        }
    }

    pub fn firebase(api_secret: impl Into<String>, firebase_app_id: impl Into<String>) -> Self {
        Self {
            protocol_variant: ProtocolVariant::Firebase,
            api_secret: api_secret.into(),
            firebase_app_id: Some(firebase_app_id.into()),
            ..Self::default()
        }
    }

    /**
     * Identifier sent in the query string for the configured variant
     */
    pub fn app_id(&self) -> Option<&str> {
        match self.protocol_variant {
            ProtocolVariant::Gtag => self.measurement_id.as_deref(),
            ProtocolVariant::Firebase => self.firebase_app_id.as_deref(),
        }
    }

    /**
     * Escalation only has an effect when diagnostics is on
     */
    pub fn escalation_active(&self) -> bool {
        self.diagnostics_enabled && self.escalate_validation_errors
    }

    /**
     * Validate configuration values
     * Returns Ok(()) if valid, Err(String) with validation message if invalid
     */
    pub fn validate(&self) -> Result<(), String> {
        if self.api_secret.trim().is_empty() {
            return Err("api_secret is required".to_string());
        }

        match self.protocol_variant {
            ProtocolVariant::Gtag => {
                if self.measurement_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
                    return Err("measurement_id is required for the gtag variant".to_string());
                }
            }
            ProtocolVariant::Firebase => {
                if self.firebase_app_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
                    return Err("firebase_app_id is required for the firebase variant".to_string());
                }
            }
        }

        if self.request_timeout_seconds < 1 || self.request_timeout_seconds > 300 {
            return Err("request_timeout_seconds must be between 1 and 300".to_string());
        }

        if self.escalate_validation_errors && !self.diagnostics_enabled {
            log::warn!("[MP] escalate_validation_errors has no effect while diagnostics is disabled");
        }

        Ok(())
    }

    /**
     * Build the collection URL
     * base?api_secret=<secret>&measurement_id=<id> (gtag)
     * base?api_secret=<secret>&firebase_app_id=<id> (Firebase)
     */
    pub fn endpoint_url(&self) -> Result<String, String> {
        let base = if self.use_validation_endpoint {
            VALIDATION_ENDPOINT
        } else {
            PRODUCTION_ENDPOINT
        };

        let app_id = self
            .app_id()
            .ok_or_else(|| format!("{} is not configured", self.protocol_variant.app_id_query_key()))?;

        let url = reqwest::Url::parse_with_params(
            base,
            &[
                ("api_secret", self.api_secret.as_str()),
                (self.protocol_variant.app_id_query_key(), app_id),
            ],
        )
        .map_err(|e| format!("Failed to build endpoint URL: {}", e))?;

        Ok(url.to_string())
    }

    /**
     * Load configuration from environment variables
     * A .env file in the working directory is read first if present
     */
    pub fn from_env() -> Result<Self, String> {
        if let Ok(path) = dotenvy::dotenv() {
            log::info!("[MP] Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * Build configuration from a key lookup
     * Unset keys keep their default; the result is validated
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(variant) = lookup("MP_PROTOCOL_VARIANT") {
            config.protocol_variant = variant.parse()?;
        }
        if let Some(secret) = lookup("MP_API_SECRET") {
            config.api_secret = secret;
        }
        config.measurement_id = lookup("MP_MEASUREMENT_ID").or(config.measurement_id);
        config.firebase_app_id = lookup("MP_FIREBASE_APP_ID").or(config.firebase_app_id);

        if let Some(value) = lookup("MP_DIAGNOSTICS") {
            config.diagnostics_enabled = parse_flag("MP_DIAGNOSTICS", &value)?;
        }
        if let Some(value) = lookup("MP_ESCALATE_VALIDATION_ERRORS") {
            config.escalate_validation_errors = parse_flag("MP_ESCALATE_VALIDATION_ERRORS", &value)?;
        }
        if let Some(value) = lookup("MP_USE_VALIDATION_ENDPOINT") {
            config.use_validation_endpoint = parse_flag("MP_USE_VALIDATION_ENDPOINT", &value)?;
        }
        if let Some(value) = lookup("MP_REQUEST_TIMEOUT_SECONDS") {
            config.request_timeout_seconds = value
                .trim()
                .parse()
                .map_err(|e| format!("MP_REQUEST_TIMEOUT_SECONDS must be a number: {}", e))?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(format!("{} must be a boolean, got '{}'", key, other)),
    }
}

/**
 * Load configuration from disk
 * A file that exists must hold a valid configuration. A missing file yields
 * the unvalidated defaults, which carry no credentials: the caller fills in
 * api_secret and the app id before building a client.
 */
pub fn load_config(path: &Path) -> Result<MeasurementConfig, String> {
    if !path.exists() {
        log::info!("[MP] Measurement config not found at {}, using defaults", path.display());
        return Ok(MeasurementConfig::default());
    }

    let json_str = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    let config: MeasurementConfig = serde_json::from_str(&json_str)
        .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

    config.validate()?;

    log::info!("[MP] Loaded measurement config from {}", path.display());
    Ok(config)
}

/**
 * Save configuration to disk atomically
 * Uses temporary file + rename to prevent corruption
 */
pub fn save_config(path: &Path, config: &MeasurementConfig) -> Result<(), String> {
    config.validate()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let json_str = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json_str)
        .map_err(|e| format!("Failed to write temporary config file: {}", e))?;

    fs::rename(&temp_path, path)
        .map_err(|e| format!("Failed to save config file: {}", e))?;

    log::info!("[MP] Saved measurement config to {}", path.display());
    Ok(())
}
