/**
 * ============================================================================
 * MEASUREMENT PROTOCOL CLIENT LIBRARY
 * ============================================================================
 *
 * PURPOSE: Accumulate analytics events and user state on the client, check
 * them against the GA4 collection rules, and ship them to the Measurement
 * Protocol endpoint in either the gtag or the Firebase wire shape.
 *
 * The host application builds one MeasurementClient at startup and passes it
 * by reference to every call site. Persistence and HTTP are injected through
 * the SettingsStore and Transport traits; defaults backed by a JSON file and
 * reqwest are provided.
 *
 * AUTHOR: Measurement Protocol Client Team
 * CREATED: 2026-10-16
 * ============================================================================
 */

pub mod analytics;

pub use analytics::client::{DispatchHandle, MeasurementClient};
pub use analytics::config::MeasurementConfig;
pub use analytics::storage::{JsonFileSettingsStore, MemorySettingsStore, SettingsStore};
pub use analytics::transport::{ReqwestTransport, Transport, TransportResponse};
pub use analytics::types::{AnalyticsError, ParamValue, ProtocolVariant, Violation, ViolationSubject};
