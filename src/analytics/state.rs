/**
 * ============================================================================
 * CLIENT STATE MODULE
 * ============================================================================
 *
 * PURPOSE: Hold identity, configuration flags, user properties, and default
 * parameters, with write-through persistence
 *
 * CONCURRENCY:
 * - The current state is an immutable snapshot behind a read-write lock
 * - Mutations take the write lock, build the next snapshot, write it through
 *   to the settings store, and only then swap it in
 * - Readers clone the snapshot Arc under the read lock, so they run in
 *   parallel with each other, wait for an in-flight mutation, and always see
 *   a whole pre- or post-mutation state
 * - No network I/O happens while a lock is held
 *
 * PERSISTENCE:
 * - Everything except the login flag is persisted
 * - Empty maps are removed from the store rather than stored empty
 * - If a store write fails the in-memory state is left unchanged
 * - A multi-key reset that fails part way rewrites the prior values
 *
 * ============================================================================
 */

use crate::analytics::storage::SettingsStore;
use crate::analytics::types::{AnalyticsError, ParamValue, Violation, ViolationSubject};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

pub const KEY_COLLECTION_ENABLED: &str = "mp_analytics_collection_enabled";
pub const KEY_NON_PERSONALIZED_ADS: &str = "mp_non_personalized_ads";
pub const KEY_DEVICE_ID: &str = "mp_device_id";
pub const KEY_USER_ID: &str = "mp_user_id";
pub const KEY_DEFAULT_PARAMETERS: &str = "mp_default_parameters";
pub const KEY_USER_PROPERTIES: &str = "mp_user_properties";

/**
 * Immutable view of the client state at one point in time
 */
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub analytics_collection_enabled: bool,
    pub non_personalized_ads: bool,
    pub device_id: String,
    pub user_id: Option<String>,
    // Process-lifetime only
    pub user_logged_in: bool,
    pub user_properties: BTreeMap<String, String>,
    pub default_parameters: BTreeMap<String, ParamValue>,
}

pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

fn parse_bool(store: &dyn SettingsStore, key: &str, default: bool) -> bool {
    match store.get_string(key).as_deref() {
        Some("true") => true,
        Some("false") => false,
        Some(other) => {
            log::warn!("[MP-STATE] Ignoring unreadable value '{}' for {}", other, key);
            default
        }
        None => default,
    }
}

fn bool_text(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn load_default_parameters(store: &dyn SettingsStore) -> BTreeMap<String, ParamValue> {
    let Some(stored) = store.get_string_map(KEY_DEFAULT_PARAMETERS) else {
        return BTreeMap::new();
    };

    stored
        .into_iter()
        .filter_map(|(key, raw)| match ParamValue::from_stored(&raw) {
            Ok(value) if !value.is_clear() => Some((key, value)),
            Ok(_) => None,
            Err(e) => {
                log::warn!("[MP-STATE] Dropping default parameter '{}': {}", key, e);
                None
            }
        })
        .collect()
}

/**
 * Persist a string map, removing the key when the map is empty
 */
fn persist_map(store: &dyn SettingsStore, key: &str, map: &BTreeMap<String, String>) -> Result<(), String> {
    if map.is_empty() {
        store.remove(key)
    } else {
        store.set_map(key, map)
    }
}

fn persist_default_parameters(
    store: &dyn SettingsStore,
    parameters: &BTreeMap<String, ParamValue>,
) -> Result<(), String> {
    let encoded = parameters
        .iter()
        .map(|(key, value)| -> Result<(String, String), String> { Ok((key.clone(), value.to_stored()?)) })
        .collect::<Result<BTreeMap<String, String>, String>>()?;
    persist_map(store, KEY_DEFAULT_PARAMETERS, &encoded)
}

/**
 * Rewrite every reset-affected key from a snapshot
 * Best effort: a failure here is logged, the original error is what counts
 */
fn restore_persisted(store: &dyn SettingsStore, snapshot: &StateSnapshot) {
    let restored = store
        .set_string(KEY_DEVICE_ID, &snapshot.device_id)
        .and_then(|_| match &snapshot.user_id {
            Some(id) => store.set_string(KEY_USER_ID, id),
            None => store.remove(KEY_USER_ID),
        })
        .and_then(|_| persist_map(store, KEY_USER_PROPERTIES, &snapshot.user_properties))
        .and_then(|_| persist_default_parameters(store, &snapshot.default_parameters));

    if let Err(e) = restored {
        log::error!("[MP-STATE] Failed to restore settings after an aborted reset: {}", e);
    }
}

/**
 * Shared, concurrency-guarded client state
 */
pub struct ClientState {
    store: Arc<dyn SettingsStore>,
    current: RwLock<Arc<StateSnapshot>>,
}

impl ClientState {
    /**
     * Build state from the settings store
     * A device id is generated and persisted on first use
     */
    pub fn load(store: Arc<dyn SettingsStore>) -> Result<Self, AnalyticsError> {
        let device_id = match store.get_string(KEY_DEVICE_ID) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = generate_device_id();
                store.set_string(KEY_DEVICE_ID, &id).map_err(|message| AnalyticsError::Storage {
                    message: format!("Failed to persist new device id: {}", message),
                })?;
                log::info!("[MP-STATE] Generated new device id");
                id
            }
        };

        let snapshot = StateSnapshot {
            analytics_collection_enabled: parse_bool(store.as_ref(), KEY_COLLECTION_ENABLED, true),
            non_personalized_ads: parse_bool(store.as_ref(), KEY_NON_PERSONALIZED_ADS, true),
            device_id,
            user_id: store.get_string(KEY_USER_ID),
            user_logged_in: false,
            user_properties: store.get_string_map(KEY_USER_PROPERTIES).unwrap_or_default(),
            default_parameters: load_default_parameters(store.as_ref()),
        };

        log::debug!(
            "[MP-STATE] Loaded state: collection_enabled={}, user_properties={}, default_parameters={}",
            snapshot.analytics_collection_enabled,
            snapshot.user_properties.len(),
            snapshot.default_parameters.len()
        );

        Ok(Self {
            store,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /**
     * Current snapshot
     * Waits for an in-flight mutation, never blocks other readers
     */
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    /**
     * Run one mutation as an atomic unit
     * The next snapshot is committed only if `apply` (including its store
     * writes) succeeds
     */
    fn mutate<F>(&self, operation: &str, apply: F) -> Result<Arc<StateSnapshot>, AnalyticsError>
    where
        F: FnOnce(&mut StateSnapshot, &dyn SettingsStore) -> Result<(), String>,
    {
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();

        apply(&mut next, self.store.as_ref()).map_err(|message| {
            log::error!("[MP-STATE] {} failed, state unchanged: {}", operation, message);
            AnalyticsError::Storage {
                message: format!("{}: {}", operation, message),
            }
        })?;

        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        log::debug!("[MP-STATE] {} committed", operation);
        Ok(next)
    }

    pub fn set_analytics_collection_enabled(&self, enabled: bool) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        self.mutate("set_analytics_collection_enabled", |state, store| {
            store.set_string(KEY_COLLECTION_ENABLED, bool_text(enabled))?;
            state.analytics_collection_enabled = enabled;
            Ok(())
        })
    }

    pub fn set_non_personalized_ads(&self, enabled: bool) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        self.mutate("set_non_personalized_ads", |state, store| {
            store.set_string(KEY_NON_PERSONALIZED_ADS, bool_text(enabled))?;
            state.non_personalized_ads = enabled;
            Ok(())
        })
    }

    /**
     * Replace the device id
     * An empty id would be regenerated on the next load, so it is refused
     */
    pub fn set_device_id(&self, device_id: &str) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        if device_id.trim().is_empty() {
            return Err(AnalyticsError::Validation {
                violations: vec![Violation::new(ViolationSubject::DeviceId, "must not be empty")],
            });
        }
        self.mutate("set_device_id", |state, store| {
            store.set_string(KEY_DEVICE_ID, device_id)?;
            state.device_id = device_id.to_string();
            Ok(())
        })
    }

    /// Login state is never persisted.
    pub fn set_user_logged_in(&self, logged_in: bool) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        self.mutate("set_user_logged_in", |state, _| {
            state.user_logged_in = logged_in;
            Ok(())
        })
    }

    pub fn set_user_id(&self, user_id: Option<&str>) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        self.mutate("set_user_id", |state, store| {
            match user_id {
                Some(id) => store.set_string(KEY_USER_ID, id)?,
                None => store.remove(KEY_USER_ID)?,
            }
            state.user_id = user_id.map(str::to_string);
            Ok(())
        })
    }

    /**
     * Set or remove (None) a single user property
     */
    pub fn set_user_property(&self, name: &str, value: Option<&str>) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        self.mutate("set_user_property", |state, store| {
            let mut properties = state.user_properties.clone();
            match value {
                Some(value) => {
                    properties.insert(name.to_string(), value.to_string());
                }
                None => {
                    properties.remove(name);
                }
            }
            persist_map(store, KEY_USER_PROPERTIES, &properties)?;
            state.user_properties = properties;
            Ok(())
        })
    }

    /**
     * Update default event parameters
     * None clears every default. Otherwise entries are merged into the
     * existing defaults, and a Clear value removes that key. Non-finite
     * floats are skipped.
     */
    pub fn set_default_event_parameters(
        &self,
        parameters: Option<&BTreeMap<String, ParamValue>>,
    ) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        self.mutate("set_default_event_parameters", |state, store| {
            let mut defaults = match parameters {
                Some(_) => state.default_parameters.clone(),
                None => BTreeMap::new(),
            };

            for (key, value) in parameters.into_iter().flatten() {
                if value.is_clear() {
                    defaults.remove(key);
                } else if !value.is_finite() {
                    log::warn!("[MP-VALIDATION] Ignoring default parameter '{}': {:?} has no JSON form", key, value);
                } else {
                    defaults.insert(key.clone(), value.clone());
                }
            }

            persist_default_parameters(store, &defaults)?;
            state.default_parameters = defaults;
            Ok(())
        })
    }

    /**
     * Full reset: new device id, no user id, no user properties, no default
     * parameters, logged out. Collection and ads flags are kept.
     * The new device id is written last; on any failure the prior values
     * are written back.
     */
    pub fn reset_analytics_data(&self) -> Result<Arc<StateSnapshot>, AnalyticsError> {
        self.mutate("reset_analytics_data", |state, store| {
            let device_id = generate_device_id();
            let written = store
                .remove(KEY_USER_ID)
                .and_then(|_| store.remove(KEY_USER_PROPERTIES))
                .and_then(|_| store.remove(KEY_DEFAULT_PARAMETERS))
                .and_then(|_| store.set_string(KEY_DEVICE_ID, &device_id));
            if let Err(message) = written {
                restore_persisted(store, state);
                return Err(message);
            }

            state.device_id = device_id;
            state.user_id = None;
            state.user_logged_in = false;
            state.user_properties.clear();
            state.default_parameters.clear();
            Ok(())
        })
    }
}
