use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub type HostMacroFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dtu {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergentView {
    pub id: String,
    pub role: String,
    pub active: bool,
}

/// Read access to the host's knowledge store.
///
/// Implementations hand out shared snapshots and the `{id, role, active}`
/// projection of an emergent, never the live entity.
pub trait HostState: Send + Sync {
    fn dtu(&self, id: &str) -> Option<Arc<Dtu>>;
    fn dtu_count(&self) -> usize;
    fn emergent(&self, id: &str) -> Option<EmergentView>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroActor {
    pub user_id: String,
    pub role: String,
    pub scopes: Vec<String>,
}

impl MacroActor {
    pub fn for_plugin(plugin_id: &str) -> Self {
        Self {
            user_id: format!("plugin:{plugin_id}"),
            role: "plugin".to_string(),
            scopes: vec!["read".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroCallContext {
    pub actor: MacroActor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroMetadata {
    pub plugin_id: String,
    pub description: Option<String>,
    pub agent_generated: bool,
}

/// The host's macro registry and execution entry point.
pub trait MacroHost: Send + Sync {
    fn register(
        &self,
        domain: &str,
        action: &str,
        handler: HostMacroFn,
        metadata: MacroMetadata,
    ) -> Result<(), String>;

    fn unregister(&self, _domain: &str, _action: &str) {}

    fn run_macro(
        &self,
        domain: &str,
        name: &str,
        input: Value,
        ctx: &MacroCallContext,
    ) -> Result<Value, String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait HostLogger: Send + Sync {
    fn log(&self, namespace: &str, level: LogLevel, message: &str, data: &Value);
}

/// Re-emits plugin log records as `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl HostLogger for TracingLogger {
    fn log(&self, namespace: &str, level: LogLevel, message: &str, data: &Value) {
        match level {
            LogLevel::Debug => tracing::debug!(namespace, %data, "{message}"),
            LogLevel::Info => tracing::info!(namespace, %data, "{message}"),
            LogLevel::Warn => tracing::warn!(namespace, %data, "{message}"),
            LogLevel::Error => tracing::error!(namespace, %data, "{message}"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryHostState {
    dtus: Mutex<BTreeMap<String, Arc<Dtu>>>,
    emergents: Mutex<BTreeMap<String, EmergentView>>,
}

impl MemoryHostState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_dtu(&self, dtu: Dtu) {
        lock(&self.dtus).insert(dtu.id.clone(), Arc::new(dtu));
    }

    pub fn remove_dtu(&self, id: &str) -> Option<Arc<Dtu>> {
        lock(&self.dtus).remove(id)
    }

    pub fn upsert_emergent(&self, emergent: EmergentView) {
        lock(&self.emergents).insert(emergent.id.clone(), emergent);
    }
}

impl HostState for MemoryHostState {
    fn dtu(&self, id: &str) -> Option<Arc<Dtu>> {
        lock(&self.dtus).get(id).cloned()
    }

    fn dtu_count(&self) -> usize {
        lock(&self.dtus).len()
    }

    fn emergent(&self, id: &str) -> Option<EmergentView> {
        lock(&self.emergents).get(id).cloned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedMacroCall {
    pub domain: String,
    pub name: String,
    pub input: Value,
    pub actor: MacroActor,
}

/// In-process macro table keyed by `(domain, action)`.
#[derive(Default)]
pub struct MemoryMacroHost {
    handlers: Mutex<HashMap<(String, String), (HostMacroFn, MacroMetadata)>>,
    rejected_domains: Mutex<Vec<String>>,
    calls: Mutex<Vec<RecordedMacroCall>>,
}

impl MemoryMacroHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `register` fail for every action in `domain`.
    pub fn reject_domain(&self, domain: impl Into<String>) {
        lock(&self.rejected_domains).push(domain.into());
    }

    pub fn is_registered(&self, domain: &str, action: &str) -> bool {
        lock(&self.handlers).contains_key(&(domain.to_string(), action.to_string()))
    }

    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys = lock(&self.handlers)
            .keys()
            .map(|(domain, action)| format!("{domain}.{action}"))
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn metadata(&self, domain: &str, action: &str) -> Option<MacroMetadata> {
        lock(&self.handlers)
            .get(&(domain.to_string(), action.to_string()))
            .map(|(_, metadata)| metadata.clone())
    }

    pub fn calls(&self) -> Vec<RecordedMacroCall> {
        lock(&self.calls).clone()
    }

    pub fn invoke(&self, domain: &str, action: &str, input: Value) -> Result<Value, String> {
        let handler = lock(&self.handlers)
            .get(&(domain.to_string(), action.to_string()))
            .map(|(handler, _)| handler.clone())
            .ok_or_else(|| format!("unknown macro: {domain}.{action}"))?;
        handler(input)
    }
}

impl MacroHost for MemoryMacroHost {
    fn register(
        &self,
        domain: &str,
        action: &str,
        handler: HostMacroFn,
        metadata: MacroMetadata,
    ) -> Result<(), String> {
        if lock(&self.rejected_domains).iter().any(|d| d == domain) {
            return Err(format!("domain {domain} does not accept registrations"));
        }
        lock(&self.handlers).insert((domain.to_string(), action.to_string()), (handler, metadata));
        Ok(())
    }

    fn unregister(&self, domain: &str, action: &str) {
        lock(&self.handlers).remove(&(domain.to_string(), action.to_string()));
    }

    fn run_macro(
        &self,
        domain: &str,
        name: &str,
        input: Value,
        ctx: &MacroCallContext,
    ) -> Result<Value, String> {
        lock(&self.calls).push(RecordedMacroCall {
            domain: domain.to_string(),
            name: name.to_string(),
            input: input.clone(),
            actor: ctx.actor.clone(),
        });
        self.invoke(domain, name, input)
    }
}
