/**
 * ============================================================================
 * MEASUREMENT CLIENT MODULE
 * ============================================================================
 *
 * PURPOSE: Public entry point tying state, validation, serialization, and
 * delivery together
 *
 * EVENT PIPELINE (log_event):
 * 1. Merge: default parameters + event parameters (event wins)
 * 2. Validate: only with diagnostics on; escalation aborts here
 * 3. Serialize: one-event JSON payload for the configured variant
 * 4. Dispatch: spawned send, skipped entirely when collection is disabled
 *
 * Steps 1-3 run on the caller's thread against one state snapshot. The send
 * runs afterwards outside every lock, and its outcome is only logged. It is
 * spawned on the caller's Tokio runtime when there is one, otherwise on a
 * background runtime owned by the library, so plain threads can log too.
 *
 * LIFECYCLE:
 * - Built once by the host application and shared by reference
 * - All setters write through to the settings store before returning
 *
 * ============================================================================
 */

use crate::analytics::config::MeasurementConfig;
use crate::analytics::payload::{build_payload, merge_parameters, pretty_print, to_json};
use crate::analytics::state::ClientState;
use crate::analytics::storage::{JsonFileSettingsStore, SettingsStore};
use crate::analytics::transport::{log_outcome, ReqwestTransport, Transport};
use crate::analytics::types::{AnalyticsError, ParamValue};
use crate::analytics::validation::{Diagnostics, Validator};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

/// Handle of a spawned send; awaiting it is optional.
pub type DispatchHandle = tokio::task::JoinHandle<()>;

/// Runtime for sends issued outside any Tokio context. Started on first use.
static BACKGROUND_RUNTIME: Lazy<Result<Runtime, String>> = Lazy::new(|| {
    log::info!("[MP] Starting background dispatch runtime");
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("mp-dispatch")
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start background dispatch runtime: {}", e))
});

/**
 * Runtime to spawn a send on
 * The caller's runtime when there is one, the background runtime otherwise
 */
fn dispatch_runtime() -> Result<Handle, String> {
    if let Ok(handle) = Handle::try_current() {
        return Ok(handle);
    }
    match &*BACKGROUND_RUNTIME {
        Ok(runtime) => Ok(runtime.handle().clone()),
        Err(message) => Err(message.clone()),
    }
}

pub struct MeasurementClient {
    config: MeasurementConfig,
    endpoint_url: String,
    diagnostics: Diagnostics,
    validator: Validator,
    state: ClientState,
    transport: Arc<dyn Transport>,
}

impl MeasurementClient {
    /**
     * Create a client over injected storage and transport
     * Invalid configuration is fatal
     */
    pub fn new(
        config: MeasurementConfig,
        store: Arc<dyn SettingsStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, AnalyticsError> {
        config
            .validate()
            .map_err(|message| AnalyticsError::Configuration { message })?;
        let endpoint_url = config
            .endpoint_url()
            .map_err(|message| AnalyticsError::Configuration { message })?;
        let validator = Validator::new()?;
        let state = ClientState::load(store)?;

        log::info!(
            "[MP] Measurement client ready (variant={:?}, diagnostics={}, validation_endpoint={})",
            config.protocol_variant,
            config.diagnostics_enabled,
            config.use_validation_endpoint
        );

        Ok(Self {
            diagnostics: Diagnostics::from_config(&config),
            config,
            endpoint_url,
            validator,
            state,
            transport,
        })
    }

    /**
     * Create a client with the bundled JSON file store and reqwest transport
     * Settings live under the platform data directory for `app_name`
     */
    pub fn with_defaults(config: MeasurementConfig, app_name: &str) -> Result<Self, AnalyticsError> {
        let storage_error = |message: String| AnalyticsError::Storage { message };
        let path = JsonFileSettingsStore::default_path(app_name).map_err(storage_error)?;
        let store = JsonFileSettingsStore::open(path).map_err(storage_error)?;
        let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_seconds));
        Self::new(config, Arc::new(store), Arc::new(transport))
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    // =========================================================================
    // Setters
    // =========================================================================

    pub fn set_analytics_collection_enabled(&self, enabled: bool) -> Result<(), AnalyticsError> {
        self.state.set_analytics_collection_enabled(enabled)?;
        log::info!("[MP] Analytics collection {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn set_device_id(&self, device_id: &str) -> Result<(), AnalyticsError> {
        self.state.set_device_id(device_id)?;
        Ok(())
    }

    pub fn set_non_personalized_ads(&self, enabled: bool) -> Result<(), AnalyticsError> {
        self.state.set_non_personalized_ads(enabled)?;
        Ok(())
    }

    pub fn set_user_logged_in(&self, logged_in: bool) -> Result<(), AnalyticsError> {
        self.state.set_user_logged_in(logged_in)?;
        Ok(())
    }

    pub fn set_user_id(&self, user_id: Option<&str>) -> Result<(), AnalyticsError> {
        if self.diagnostics.enabled {
            if let Some(id) = user_id {
                self.diagnostics.handle_violations(self.validator.validate_user_id(id))?;
            }
        }
        self.state.set_user_id(user_id)?;
        Ok(())
    }

    /**
     * Set a user property, or remove it with None
     * Name and value are checked before the write; the count limit is
     * checked against the stored count after the write
     */
    pub fn set_user_property(&self, name: &str, value: Option<&str>) -> Result<(), AnalyticsError> {
        if self.diagnostics.enabled {
            self.diagnostics
                .handle_violations(self.validator.validate_user_property(name, value))?;
        }

        let snapshot = self.state.set_user_property(name, value)?;

        if self.diagnostics.enabled {
            self.diagnostics.handle_violations(
                self.validator.validate_user_property_count(snapshot.user_properties.len()),
            )?;
        }
        Ok(())
    }

    /**
     * Merge into the default event parameters
     * None clears them all; a ParamValue::Clear entry removes one key
     */
    pub fn set_default_event_parameters(
        &self,
        parameters: Option<&BTreeMap<String, ParamValue>>,
    ) -> Result<(), AnalyticsError> {
        self.state.set_default_event_parameters(parameters)?;
        Ok(())
    }

    pub fn reset_analytics_data(&self) -> Result<(), AnalyticsError> {
        self.state.reset_analytics_data()?;
        log::info!("[MP] Analytics data reset");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn app_instance_id(&self) -> String {
        self.state.snapshot().device_id.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.snapshot().user_id.clone()
    }

    pub fn is_user_logged_in(&self) -> bool {
        self.state.snapshot().user_logged_in
    }

    pub fn analytics_collection_enabled(&self) -> bool {
        self.state.snapshot().analytics_collection_enabled
    }

    pub fn non_personalized_ads(&self) -> bool {
        self.state.snapshot().non_personalized_ads
    }

    pub fn user_properties(&self) -> BTreeMap<String, String> {
        self.state.snapshot().user_properties.clone()
    }

    pub fn default_event_parameters(&self) -> BTreeMap<String, ParamValue> {
        self.state.snapshot().default_parameters.clone()
    }

    // =========================================================================
    // Event Logging
    // =========================================================================

    /**
     * Log one event
     *
     * Callable from any thread or task. Returns Ok(None) when nothing was
     * sent (collection disabled, or no runtime could be started). Returns the
     * send task handle otherwise.
     * Only escalated validation errors are returned as Err; delivery
     * failures are logged and never surface here.
     */
    pub fn log_event(
        &self,
        name: &str,
        params: Option<&BTreeMap<String, ParamValue>>,
    ) -> Result<Option<DispatchHandle>, AnalyticsError> {
        let snapshot = self.state.snapshot();
        let merged = merge_parameters(&snapshot.default_parameters, params);

        if self.diagnostics.enabled {
            self.diagnostics
                .handle_violations(self.validator.validate_event(name, &merged))?;
        }

        if !snapshot.analytics_collection_enabled {
            log::debug!("[MP] Collection disabled, not sending '{}'", name);
            return Ok(None);
        }

        let payload = build_payload(self.config.protocol_variant, &snapshot, name, merged);
        let body = to_json(&payload)?;

        if self.diagnostics.enabled {
            log::debug!("[MP] Payload for '{}':\n{}", name, pretty_print(&body));
        }

        let runtime = match dispatch_runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("[MP] Event '{}' dropped: {}", name, e);
                return Ok(None);
            }
        };

        let transport = Arc::clone(&self.transport);
        let url = self.endpoint_url.clone();
        let validation_endpoint = self.config.use_validation_endpoint;

        Ok(Some(runtime.spawn(async move {
            let result = transport.post(&url, body).await;
            log_outcome(&result, validation_endpoint);
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::storage::MemorySettingsStore;
    use crate::analytics::transport::TransportResponse;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Records every request and answers with a fixed outcome
    struct RecordingTransport {
        requests: Mutex<Vec<(String, String)>>,
        outcome: Result<TransportResponse, String>,
    }

    impl RecordingTransport {
        fn answering(status: u16) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                outcome: Ok(TransportResponse { status, body: String::new() }),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                outcome: Err("connection refused".to_string()),
            })
        }

        fn requests(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }

        fn last_body(&self) -> Value {
            let (_, body) = self.requests().pop().expect("no request recorded");
            serde_json::from_str(&body).unwrap()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn post(&self, url: &str, json_body: String) -> Result<TransportResponse, String> {
            self.requests.lock().unwrap().push((url.to_string(), json_body));
            self.outcome.clone()
        }
    }

    fn client_with(
        config: MeasurementConfig,
        store: &MemorySettingsStore,
        transport: &Arc<RecordingTransport>,
    ) -> MeasurementClient {
        MeasurementClient::new(config, Arc::new(store.clone()), transport.clone()).unwrap()
    }

    fn gtag() -> MeasurementConfig {
        MeasurementConfig::gtag("secret", "G-TEST")
    }

    fn escalating() -> MeasurementConfig {
        let mut config = gtag();
        config.diagnostics_enabled = true;
        config.escalate_validation_errors = true;
        config
    }

    fn params(entries: &[(&str, ParamValue)]) -> BTreeMap<String, ParamValue> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    async fn send(client: &MeasurementClient, name: &str, p: Option<&BTreeMap<String, ParamValue>>) {
        let handle = client.log_event(name, p).unwrap().expect("event should be dispatched");
        handle.await.unwrap();
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let transport = RecordingTransport::answering(204);
        let result = MeasurementClient::new(
            MeasurementConfig::default(),
            Arc::new(MemorySettingsStore::new()),
            transport,
        );
        assert!(matches!(result, Err(AnalyticsError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_log_event_sends_gtag_payload() {
        let store = MemorySettingsStore::new();
        let transport = RecordingTransport::answering(204);
        let client = client_with(gtag(), &store, &transport);

        client
            .set_default_event_parameters(Some(&params(&[("a", ParamValue::Int(1)), ("b", ParamValue::Int(2))])))
            .unwrap();
        send(&client, "purchase", Some(&params(&[("b", ParamValue::Int(3)), ("c", ParamValue::Int(4))]))).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].0,
            "https://www.google-analytics.com/mp/collect?api_secret=secret&measurement_id=G-TEST"
        );

        let body = transport.last_body();
        assert_eq!(body["client_id"], Value::String(client.app_instance_id()));
        assert!(body.get("app_instance_id").is_none());
        assert_eq!(body["non_personalized_ads"], true);
        assert_eq!(body["events"][0]["name"], "purchase");
        assert_eq!(body["events"][0]["params"], serde_json::json!({"a": 1, "b": 3, "c": 4}));
    }

    #[tokio::test]
    async fn test_firebase_variant_uses_app_instance_id() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(
            MeasurementConfig::firebase("secret", "app-1"),
            &MemorySettingsStore::new(),
            &transport,
        );

        send(&client, "screen_view", None).await;

        let (url, _) = transport.requests().pop().unwrap();
        assert!(url.ends_with("&firebase_app_id=app-1"));
        let body = transport.last_body();
        assert_eq!(body["app_instance_id"], Value::String(client.app_instance_id()));
        assert!(body.get("client_id").is_none());
    }

    #[tokio::test]
    async fn test_escalated_violation_blocks_dispatch() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(escalating(), &MemorySettingsStore::new(), &transport);

        let result = client.log_event("1bad", None);
        assert!(matches!(result, Err(AnalyticsError::Validation { .. })));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_event_sent_when_diagnostics_off() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(gtag(), &MemorySettingsStore::new(), &transport);

        send(&client, "1bad", None).await;
        assert_eq!(transport.last_body()["events"][0]["name"], "1bad");
    }

    #[tokio::test]
    async fn test_violations_only_logged_without_escalation() {
        let mut config = gtag();
        config.diagnostics_enabled = true;
        let transport = RecordingTransport::answering(204);
        let client = client_with(config, &MemorySettingsStore::new(), &transport);

        send(&client, "ga_reserved", None).await;
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_collection_disabled_skips_dispatch() {
        let store = MemorySettingsStore::new();
        let transport = RecordingTransport::answering(204);
        let client = client_with(gtag(), &store, &transport);

        client.set_analytics_collection_enabled(false).unwrap();
        assert!(client.log_event("purchase", None).unwrap().is_none());
        assert!(transport.requests().is_empty());

        // Still disabled after a restart
        let restarted = client_with(gtag(), &store, &transport);
        assert!(!restarted.analytics_collection_enabled());
        assert!(restarted.log_event("purchase", None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_id_only_sent_when_logged_in() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(gtag(), &MemorySettingsStore::new(), &transport);
        client.set_user_id(Some("user-42")).unwrap();
        client.set_non_personalized_ads(false).unwrap();

        send(&client, "login_check", None).await;
        let body = transport.last_body();
        assert!(body.get("user_id").is_none());
        assert!(body.get("non_personalized_ads").is_none());

        client.set_user_logged_in(true).unwrap();
        send(&client, "login_check", None).await;
        assert_eq!(transport.last_body()["user_id"], "user-42");
    }

    #[tokio::test]
    async fn test_user_properties_in_payload() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(gtag(), &MemorySettingsStore::new(), &transport);
        client.set_user_property("tier", Some("gold")).unwrap();

        send(&client, "purchase", None).await;
        assert_eq!(transport.last_body()["user_properties"], serde_json::json!({"tier": {"value": "gold"}}));
    }

    #[tokio::test]
    async fn test_server_error_is_logged_not_returned() {
        let transport = RecordingTransport::answering(503);
        let client = client_with(gtag(), &MemorySettingsStore::new(), &transport);

        send(&client, "purchase", None).await;
        // No retry
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_network_error_is_logged_not_returned() {
        let transport = RecordingTransport::failing();
        let client = client_with(gtag(), &MemorySettingsStore::new(), &transport);

        send(&client, "purchase", None).await;
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_log_event_from_plain_thread_is_dispatched() {
        let transport = RecordingTransport::answering(204);
        let client = Arc::new(client_with(gtag(), &MemorySettingsStore::new(), &transport));

        let handle = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.log_event("purchase", None).unwrap())
                .join()
                .unwrap()
                .expect("event should be dispatched without a caller runtime")
        };

        let waiter = tokio::runtime::Builder::new_current_thread().build().unwrap();
        waiter.block_on(handle).unwrap();

        assert_eq!(transport.requests().len(), 1);
        assert_eq!(transport.last_body()["events"][0]["name"], "purchase");
    }

    #[test]
    fn test_reset_then_restart() {
        let store = MemorySettingsStore::new();
        let transport = RecordingTransport::answering(204);
        let client = client_with(gtag(), &store, &transport);

        client.set_user_id(Some("user-42")).unwrap();
        client.set_user_logged_in(true).unwrap();
        client.set_user_property("tier", Some("gold")).unwrap();
        client
            .set_default_event_parameters(Some(&params(&[("a", ParamValue::Int(1))])))
            .unwrap();
        let old_device = client.app_instance_id();

        client.reset_analytics_data().unwrap();
        assert_ne!(client.app_instance_id(), old_device);
        assert!(client.user_id().is_none());
        assert!(client.user_properties().is_empty());
        assert!(client.default_event_parameters().is_empty());
        assert!(!client.is_user_logged_in());

        let restarted = client_with(gtag(), &store, &transport);
        assert_eq!(restarted.app_instance_id(), client.app_instance_id());
        assert!(!restarted.is_user_logged_in());
    }

    #[test]
    fn test_login_not_restored_after_restart() {
        let store = MemorySettingsStore::new();
        let transport = RecordingTransport::answering(204);
        let client = client_with(gtag(), &store, &transport);
        client.set_user_id(Some("user-42")).unwrap();
        client.set_user_logged_in(true).unwrap();

        let restarted = client_with(gtag(), &store, &transport);
        assert_eq!(restarted.user_id().as_deref(), Some("user-42"));
        assert!(!restarted.is_user_logged_in());
    }

    #[test]
    fn test_invalid_user_property_rejected_before_write() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(escalating(), &MemorySettingsStore::new(), &transport);

        let result = client.set_user_property("firebase_tier", Some("gold"));
        assert!(matches!(result, Err(AnalyticsError::Validation { .. })));
        assert!(client.user_properties().is_empty());
    }

    #[test]
    fn test_user_property_count_checked_after_write() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(escalating(), &MemorySettingsStore::new(), &transport);

        for i in 0..25 {
            client.set_user_property(&format!("prop_{}", i), Some("v")).unwrap();
        }
        // Overwriting at the limit does not grow the count
        client.set_user_property("prop_0", Some("w")).unwrap();

        let result = client.set_user_property("prop_25", Some("v"));
        assert!(matches!(result, Err(AnalyticsError::Validation { .. })));
        assert_eq!(client.user_properties().len(), 26);
    }

    #[test]
    fn test_long_user_id_rejected_when_escalating() {
        let transport = RecordingTransport::answering(204);
        let client = client_with(escalating(), &MemorySettingsStore::new(), &transport);

        let result = client.set_user_id(Some(&"u".repeat(257)));
        assert!(matches!(result, Err(AnalyticsError::Validation { .. })));
        assert!(client.user_id().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_mutations_and_logging() {
        let transport = RecordingTransport::answering(204);
        let client = Arc::new(client_with(gtag(), &MemorySettingsStore::new(), &transport));

        let writer = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let defaults = params(&[("x", ParamValue::Int(i)), ("y", ParamValue::Int(i))]);
                    client.set_default_event_parameters(Some(&defaults)).unwrap();
                }
            })
        };

        let mut handles = Vec::new();
        for _ in 0..50 {
            if let Some(handle) = client.log_event("tick", None).unwrap() {
                handles.push(handle);
            }
        }
        writer.join().unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        for (_, body) in transport.requests() {
            let body: Value = serde_json::from_str(&body).unwrap();
            let params = &body["events"][0]["params"];
            assert_eq!(params.get("x"), params.get("y"));
        }
    }
}
