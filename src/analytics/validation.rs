/**
 * ============================================================================
 * VALIDATION ENGINE MODULE
 * ============================================================================
 *
 * PURPOSE: Check names, values, and counts against the collection limits
 *
 * RULES (names are case-sensitive):
 * | Subject         | Max name | Max value          | Max count       |
 * |-----------------|----------|--------------------|-----------------|
 * | Event name      | 40       | -                  | -               |
 * | Event parameter | 40       | 100 (strings only) | 25 per event    |
 * | User property   | 24       | 36                 | 25 total        |
 * | User ID         | -        | 256                | -               |
 *
 * Every name must start with a letter, continue with letters, digits, or
 * underscores, and must not start with a reserved prefix (ga_, google_,
 * firebase_).
 *
 * POLICY:
 * - Validation only runs when diagnostics is enabled
 * - Violations are logged; with escalation they become an error
 * - With diagnostics off, invalid data is sent as-is
 *
 * ============================================================================
 */

use crate::analytics::config::MeasurementConfig;
use crate::analytics::types::{AnalyticsError, ParamValue, Violation, ViolationSubject};
use regex::Regex;
use std::collections::BTreeMap;

pub const EVENT_NAME_MAX_LENGTH: usize = 40;
pub const PARAMETER_NAME_MAX_LENGTH: usize = 40;
pub const PARAMETER_VALUE_MAX_LENGTH: usize = 100;
pub const MAX_PARAMETERS_PER_EVENT: usize = 25;
pub const USER_PROPERTY_NAME_MAX_LENGTH: usize = 24;
pub const USER_PROPERTY_VALUE_MAX_LENGTH: usize = 36;
pub const MAX_USER_PROPERTIES: usize = 25;
pub const USER_ID_MAX_LENGTH: usize = 256;

pub const RESERVED_PREFIXES: [&str; 3] = ["ga_", "google_", "firebase_"];

/**
 * Anchored name pattern accepting at most `max_length` characters
 * The reserved-prefix rule is checked separately (no lookahead in `regex`)
 */
pub fn name_pattern(max_length: usize) -> String {
    format!("^[A-Za-z][A-Za-z0-9_]{{0,{}}}$", max_length.saturating_sub(1))
}

pub fn has_reserved_prefix(name: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn compile(max_length: usize) -> Result<Regex, AnalyticsError> {
    let pattern = name_pattern(max_length);
    Regex::new(&pattern).map_err(|e| AnalyticsError::Configuration {
        message: format!("Invalid validation pattern '{}': {}", pattern, e),
    })
}

/**
 * Compiled name rules
 * Built once per client; construction fails only if a pattern is malformed
 */
#[derive(Debug, Clone)]
pub struct Validator {
    event_name: Regex,
    parameter_name: Regex,
    user_property_name: Regex,
}

impl Validator {
    pub fn new() -> Result<Self, AnalyticsError> {
        Ok(Self {
            event_name: compile(EVENT_NAME_MAX_LENGTH)?,
            parameter_name: compile(PARAMETER_NAME_MAX_LENGTH)?,
            user_property_name: compile(USER_PROPERTY_NAME_MAX_LENGTH)?,
        })
    }

    pub fn is_valid_event_name(&self, name: &str) -> bool {
        self.event_name.is_match(name) && !has_reserved_prefix(name)
    }

    pub fn is_valid_parameter_name(&self, name: &str) -> bool {
        self.parameter_name.is_match(name) && !has_reserved_prefix(name)
    }

    pub fn is_valid_user_property_name(&self, name: &str) -> bool {
        self.user_property_name.is_match(name) && !has_reserved_prefix(name)
    }

    /**
     * Validate an event after default parameters have been merged in
     */
    pub fn validate_event(&self, name: &str, params: &BTreeMap<String, ParamValue>) -> Vec<Violation> {
        let mut violations = Vec::new();

        if !self.is_valid_event_name(name) {
            violations.push(Violation::new(
                ViolationSubject::EventName,
                format!(
                    "'{}' must start with a letter, contain only letters, digits, or underscores, \
                     be at most {} characters, and not use a reserved prefix",
                    name, EVENT_NAME_MAX_LENGTH
                ),
            ));
        }

        if params.len() > MAX_PARAMETERS_PER_EVENT {
            violations.push(Violation::new(
                ViolationSubject::EventParameter,
                format!(
                    "event '{}' has {} parameters, the limit is {}",
                    name,
                    params.len(),
                    MAX_PARAMETERS_PER_EVENT
                ),
            ));
        }

        for (key, value) in params {
            if !self.is_valid_parameter_name(key) {
                violations.push(Violation::new(
                    ViolationSubject::EventParameter,
                    format!("name '{}' is not allowed (max {} characters)", key, PARAMETER_NAME_MAX_LENGTH),
                ));
            }
            if let Some(text) = value.as_str() {
                let length = text.chars().count();
                if length > PARAMETER_VALUE_MAX_LENGTH {
                    violations.push(Violation::new(
                        ViolationSubject::EventParameter,
                        format!(
                            "value of '{}' is {} characters, the limit is {}",
                            key, length, PARAMETER_VALUE_MAX_LENGTH
                        ),
                    ));
                }
            }
        }

        violations
    }

    /**
     * Validate a user property name and value (None means removal)
     */
    pub fn validate_user_property(&self, name: &str, value: Option<&str>) -> Vec<Violation> {
        let mut violations = Vec::new();

        if !self.is_valid_user_property_name(name) {
            violations.push(Violation::new(
                ViolationSubject::UserProperty,
                format!("name '{}' is not allowed (max {} characters)", name, USER_PROPERTY_NAME_MAX_LENGTH),
            ));
        }

        if let Some(text) = value {
            let length = text.chars().count();
            if length > USER_PROPERTY_VALUE_MAX_LENGTH {
                violations.push(Violation::new(
                    ViolationSubject::UserProperty,
                    format!(
                        "value of '{}' is {} characters, the limit is {}",
                        name, length, USER_PROPERTY_VALUE_MAX_LENGTH
                    ),
                ));
            }
        }

        violations
    }

    /**
     * Check the number of stored user properties once a write has applied
     * Reaching the limit is fine, only going over it is reported
     */
    pub fn validate_user_property_count(&self, count_after: usize) -> Vec<Violation> {
        if count_after > MAX_USER_PROPERTIES {
            vec![Violation::new(
                ViolationSubject::UserProperty,
                format!("{} properties set, the limit is {}", count_after, MAX_USER_PROPERTIES),
            )]
        } else {
            Vec::new()
        }
    }

    pub fn validate_user_id(&self, user_id: &str) -> Vec<Violation> {
        let length = user_id.chars().count();
        if length > USER_ID_MAX_LENGTH {
            vec![Violation::new(
                ViolationSubject::UserId,
                format!("{} characters, the limit is {}", length, USER_ID_MAX_LENGTH),
            )]
        } else {
            Vec::new()
        }
    }
}

// =============================================================================
// Diagnostics Policy
// =============================================================================

/**
 * Decides what happens to violations
 * Off: rules are not evaluated at all
 * On: violations are logged
 * On + escalate: violations are logged and returned as an error
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    pub enabled: bool,
    pub escalate: bool,
}

impl Diagnostics {
    pub fn from_config(config: &MeasurementConfig) -> Self {
        Self {
            enabled: config.diagnostics_enabled,
            escalate: config.escalation_active(),
        }
    }

    pub fn handle_violations(&self, violations: Vec<Violation>) -> Result<(), AnalyticsError> {
        if !self.enabled || violations.is_empty() {
            return Ok(());
        }

        for violation in &violations {
            log::warn!("[MP-VALIDATION] {}", violation);
        }

        if self.escalate {
            return Err(AnalyticsError::Validation { violations });
        }
        Ok(())
    }
}
