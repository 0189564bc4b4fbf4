/**
 * ============================================================================
 * PAYLOAD SERIALIZER MODULE
 * ============================================================================
 *
 * PURPOSE: Map client state plus one event to the collection JSON body
 *
 * PAYLOAD SHAPE:
 * {
 *   "client_id": "<device id>",          (gtag only)
 *   "app_instance_id": "<device id>",    (Firebase only)
 *   "user_id": "<user id>",              (only when logged in)
 *   "user_properties": { "<name>": { "value": "<value>" } },  (only if any)
 *   "non_personalized_ads": true,        (only when true)
 *   "events": [ { "name": "<name>", "params": { ... } } ]
 * }
 *
 * Optional fields are omitted, never written as null or false. Exactly one
 * event is carried per payload.
 *
 * ============================================================================
 */

use crate::analytics::state::StateSnapshot;
use crate::analytics::types::{AnalyticsError, ParamValue, ProtocolVariant};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPropertyValue {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventPayload {
    pub name: String,
    pub params: BTreeMap<String, ParamValue>,
}

/**
 * Request body for one logged event
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_instance_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub user_properties: BTreeMap<String, UserPropertyValue>,

    #[serde(skip_serializing_if = "is_false")]
    pub non_personalized_ads: bool,

    pub events: Vec<EventPayload>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/**
 * Combine default and event parameters
 * Event values win over defaults with the same name. Clear markers and
 * non-finite floats never survive the merge.
 */
pub fn merge_parameters(
    defaults: &BTreeMap<String, ParamValue>,
    event_params: Option<&BTreeMap<String, ParamValue>>,
) -> BTreeMap<String, ParamValue> {
    let mut merged: BTreeMap<String, ParamValue> = defaults
        .iter()
        .filter(|(key, value)| !value.is_clear() && keep_finite(key, value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if let Some(params) = event_params {
        for (key, value) in params {
            if value.is_clear() {
                log::debug!("[MP] Dropping clear marker for event parameter '{}'", key);
                continue;
            }
            if !keep_finite(key, value) {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}

fn keep_finite(key: &str, value: &ParamValue) -> bool {
    if value.is_finite() {
        return true;
    }
    log::warn!("[MP-VALIDATION] Dropping parameter '{}': {:?} has no JSON form", key, value);
    false
}

/**
 * Build the payload for one event
 * `params` is expected to be already merged
 */
pub fn build_payload(
    variant: ProtocolVariant,
    state: &StateSnapshot,
    event_name: &str,
    params: BTreeMap<String, ParamValue>,
) -> Payload {
    let (client_id, app_instance_id) = match variant {
        ProtocolVariant::Gtag => (Some(state.device_id.clone()), None),
        ProtocolVariant::Firebase => (None, Some(state.device_id.clone())),
    };

    let user_id = if state.user_logged_in {
        state.user_id.clone()
    } else {
        None
    };

    let user_properties = state
        .user_properties
        .iter()
        .map(|(name, value)| (name.clone(), UserPropertyValue { value: value.clone() }))
        .collect();

    let params = params.into_iter().filter(|(_, value)| !value.is_clear()).collect();

    Payload {
        client_id,
        app_instance_id,
        user_id,
        user_properties,
        non_personalized_ads: state.non_personalized_ads,
        events: vec![EventPayload {
            name: event_name.to_string(),
            params,
        }],
    }
}

pub fn to_json(payload: &Payload) -> Result<String, AnalyticsError> {
    serde_json::to_string(payload).map_err(|e| AnalyticsError::Serialization {
        message: format!("Failed to serialize payload: {}", e),
    })
}

/**
 * Pretty-print a JSON body for debug logging
 * Returns an empty string (and logs) if the input is not valid JSON
 */
pub fn pretty_print(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|e| {
            log::error!("[MP] Failed to pretty-print payload: {}", e);
            String::new()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            analytics_collection_enabled: true,
            non_personalized_ads: false,
            device_id: "device-123".to_string(),
            user_id: Some("user-9".to_string()),
            user_logged_in: false,
            user_properties: BTreeMap::new(),
            default_parameters: BTreeMap::new(),
        }
    }

    fn params(entries: &[(&str, ParamValue)]) -> BTreeMap<String, ParamValue> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn render(variant: ProtocolVariant, state: &StateSnapshot, p: BTreeMap<String, ParamValue>) -> Value {
        let payload = build_payload(variant, state, "purchase", p);
        serde_json::from_str(&to_json(&payload).unwrap()).unwrap()
    }

    #[test]
    fn test_merge_precedence() {
        let defaults = params(&[("a", ParamValue::Int(1)), ("b", ParamValue::Int(2))]);
        let event = params(&[("b", ParamValue::Int(3)), ("c", ParamValue::Int(4))]);

        let merged = merge_parameters(&defaults, Some(&event));
        assert_eq!(
            merged,
            params(&[("a", ParamValue::Int(1)), ("b", ParamValue::Int(3)), ("c", ParamValue::Int(4))])
        );

        assert_eq!(merge_parameters(&defaults, None), defaults);
    }

    #[test]
    fn test_merge_drops_clear_markers() {
        let defaults = params(&[("a", ParamValue::Int(1))]);
        let event = params(&[("a", ParamValue::Clear), ("b", ParamValue::Clear)]);

        // A clear marker in event params does not remove the default
        let merged = merge_parameters(&defaults, Some(&event));
        assert_eq!(merged, defaults);
    }

    #[test]
    fn test_non_finite_floats_never_reach_the_wire() {
        let defaults = params(&[("ratio", ParamValue::Float(f64::INFINITY)), ("a", ParamValue::Int(1))]);
        let event = params(&[("value", ParamValue::Float(f64::NAN)), ("b", ParamValue::Float(0.5))]);

        let merged = merge_parameters(&defaults, Some(&event));
        assert_eq!(merged, params(&[("a", ParamValue::Int(1)), ("b", ParamValue::Float(0.5))]));

        let body = render(ProtocolVariant::Gtag, &snapshot(), merged);
        assert_eq!(body["events"][0]["params"], json!({"a": 1, "b": 0.5}));
    }

    #[test]
    fn test_gtag_payload_shape() {
        let body = render(
            ProtocolVariant::Gtag,
            &snapshot(),
            params(&[("currency", ParamValue::from("EUR")), ("value", ParamValue::Float(9.5))]),
        );

        assert_eq!(
            body,
            json!({
                "client_id": "device-123",
                "events": [{"name": "purchase", "params": {"currency": "EUR", "value": 9.5}}]
            })
        );
    }

    #[test]
    fn test_firebase_payload_uses_app_instance_id() {
        let body = render(ProtocolVariant::Firebase, &snapshot(), BTreeMap::new());
        assert_eq!(body["app_instance_id"], "device-123");
        assert!(body.get("client_id").is_none());
        assert_eq!(body["events"][0]["params"], json!({}));
    }

    #[test]
    fn test_user_id_only_when_logged_in() {
        let mut state = snapshot();
        let body = render(ProtocolVariant::Gtag, &state, BTreeMap::new());
        assert!(body.get("user_id").is_none());

        state.user_logged_in = true;
        let body = render(ProtocolVariant::Gtag, &state, BTreeMap::new());
        assert_eq!(body["user_id"], "user-9");

        state.user_id = None;
        let body = render(ProtocolVariant::Gtag, &state, BTreeMap::new());
        assert!(body.get("user_id").is_none());
    }

    #[test]
    fn test_non_personalized_ads_flag() {
        let mut state = snapshot();
        let body = render(ProtocolVariant::Gtag, &state, BTreeMap::new());
        assert!(body.get("non_personalized_ads").is_none());

        state.non_personalized_ads = true;
        let body = render(ProtocolVariant::Gtag, &state, BTreeMap::new());
        assert_eq!(body["non_personalized_ads"], true);
    }

    #[test]
    fn test_user_properties_wrapped_in_value() {
        let mut state = snapshot();
        state.user_properties.insert("tier".to_string(), "gold".to_string());

        let body = render(ProtocolVariant::Gtag, &state, BTreeMap::new());
        assert_eq!(body["user_properties"], json!({"tier": {"value": "gold"}}));
    }

    #[test]
    fn test_numbers_are_unquoted() {
        let json = to_json(&build_payload(
            ProtocolVariant::Gtag,
            &snapshot(),
            "level_up",
            params(&[("level", ParamValue::Int(7)), ("name", ParamValue::from("7"))]),
        ))
        .unwrap();

        assert!(json.contains(r#""level":7"#));
        assert!(json.contains(r#""name":"7""#));
        assert!(json.starts_with(r#"{"client_id":"device-123","events":"#));
    }

    #[test]
    fn test_pretty_print() {
        let pretty = pretty_print(r#"{"events":[]}"#);
        assert!(pretty.contains('\n'));
        assert_eq!(pretty_print("{broken"), "");
    }
}
