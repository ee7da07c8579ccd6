use crate::error::{PluginError, PluginResult};
use crate::guard::guarded;
use crate::host::{
    Dtu, EmergentView, HostLogger, HostState, LogLevel, MacroActor, MacroCallContext, MacroHost,
};
use crate::rate_limit::RateLimiter;
use crate::validator::NamespacePolicy;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Host collaborators shared by every plugin context.
#[derive(Clone)]
pub struct ContextServices {
    pub state: Arc<dyn HostState>,
    pub macros: Arc<dyn MacroHost>,
    pub logger: Option<Arc<dyn HostLogger>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub namespaces: Arc<NamespacePolicy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitView {
    Unlimited,
    Limited { remaining: u32, window_ms: u64 },
}

/// Scratch key/value space owned by one plugin instance. Never persisted.
#[derive(Debug, Default)]
pub struct PluginStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl PluginStore {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries().insert(key.into(), value);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

static NEXT_ACTIVATION_ID: AtomicU64 = AtomicU64::new(1);

/// The capability object handed to plugin code.
///
/// Built once per activation and reused for every hook, tick and macro call
/// of that plugin instance.
pub struct PluginContext {
    plugin_id: String,
    activation_id: u64,
    agent_generated: bool,
    services: ContextServices,
    store: PluginStore,
}

impl PluginContext {
    pub fn new(plugin_id: &str, agent_generated: bool, services: ContextServices) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            activation_id: NEXT_ACTIVATION_ID.fetch_add(1, Ordering::Relaxed),
            agent_generated,
            services,
            store: PluginStore::default(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Unique per context, so per activation of a plugin id.
    pub fn activation_id(&self) -> u64 {
        self.activation_id
    }

    pub fn is_agent_generated(&self) -> bool {
        self.agent_generated
    }

    pub fn get_dtu(&self, id: &str) -> Option<Arc<Dtu>> {
        self.services.state.dtu(id)
    }

    pub fn get_dtu_count(&self) -> usize {
        self.services.state.dtu_count()
    }

    pub fn get_emergent(&self, id: &str) -> Option<EmergentView> {
        self.services.state.emergent(id)
    }

    pub fn call_macro(&self, domain: &str, name: &str, input: Value) -> PluginResult<Value> {
        if self.agent_generated {
            if self.services.namespaces.is_reserved(domain) {
                return Err(PluginError::ReservedNamespace {
                    domain: domain.to_string(),
                });
            }
            if !self.services.rate_limiter.check(&self.plugin_id) {
                debug!(plugin_id = %self.plugin_id, domain, name, "plugin macro call rate limited");
                return Err(PluginError::RateLimitExceeded);
            }
        }

        let ctx = MacroCallContext {
            actor: MacroActor::for_plugin(&self.plugin_id),
        };
        let macros = self.services.macros.clone();
        guarded(|| macros.run_macro(domain, name, input, &ctx)).map_err(PluginError::MacroFailed)
    }

    pub fn log(&self, level: LogLevel, message: &str, data: Value) {
        if let Some(logger) = &self.services.logger {
            logger.log(&format!("plugin:{}", self.plugin_id), level, message, &data);
        }
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    pub fn get_rate_limit(&self) -> RateLimitView {
        if !self.agent_generated {
            return RateLimitView::Unlimited;
        }
        let status = self.services.rate_limiter.status(&self.plugin_id);
        RateLimitView::Limited {
            remaining: status.remaining,
            window_ms: status.window_ms,
        }
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("activation_id", &self.activation_id)
            .field("agent_generated", &self.agent_generated)
            .field("store_entries", &self.store.len())
            .finish()
    }
}
