use crate::context::PluginContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type InitFn = Arc<dyn Fn(&PluginContext) -> Result<InitResult, String> + Send + Sync>;
/// Receives the context of the activation being torn down.
pub type DestroyFn = Arc<dyn Fn(&PluginContext) -> Result<(), String> + Send + Sync>;
pub type MacroFn = Arc<dyn Fn(&PluginContext, Value) -> Result<Value, String> + Send + Sync>;
pub type HookFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;
pub type TickFn = Arc<dyn Fn(&PluginContext) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginIntent {
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub intent: Option<PluginIntent>,
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitResult {
    pub ok: bool,
    pub reason: Option<String>,
}

impl InitResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn not_ok(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// A loadable unit: manifest plus the callables the runtime drives.
///
/// Macro keys are `"<domain>.<action>"`; hook keys are hook names such as
/// `dtu:afterCreate`. Keys the runtime does not accept are skipped at
/// activation, not rejected.
#[derive(Clone)]
pub struct PluginModule {
    pub manifest: PluginManifest,
    pub init: InitFn,
    pub destroy: Option<DestroyFn>,
    pub macros: BTreeMap<String, MacroFn>,
    pub hooks: BTreeMap<String, HookFn>,
    pub tick: Option<TickFn>,
}

impl PluginModule {
    pub fn new(
        manifest: PluginManifest,
        init: impl Fn(&PluginContext) -> Result<InitResult, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            manifest,
            init: Arc::new(init),
            destroy: None,
            macros: BTreeMap::new(),
            hooks: BTreeMap::new(),
            tick: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn with_destroy(
        mut self,
        destroy: impl Fn(&PluginContext) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.destroy = Some(Arc::new(destroy));
        self
    }

    pub fn with_macro(
        mut self,
        key: impl Into<String>,
        handler: impl Fn(&PluginContext, Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.macros.insert(key.into(), Arc::new(handler));
        self
    }

    pub fn with_hook(
        mut self,
        hook: impl Into<String>,
        handler: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.insert(hook.into(), Arc::new(handler));
        self
    }

    pub fn with_tick(
        mut self,
        tick: impl Fn(&PluginContext) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.tick = Some(Arc::new(tick));
        self
    }
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("manifest", &self.manifest)
            .field("destroy", &self.destroy.is_some())
            .field("macros", &self.macros.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("tick", &self.tick.is_some())
            .finish()
    }
}

/// Splits `"domain.action"` on the first dot. Both halves must be non-empty.
pub fn split_macro_key(key: &str) -> Option<(&str, &str)> {
    let (domain, action) = key.split_once('.')?;
    if domain.trim().is_empty() || action.trim().is_empty() {
        return None;
    }
    Some((domain, action))
}

#[derive(Clone, Debug, Default)]
pub struct ActivationCancellation {
    cancelled: Arc<AtomicBool>,
}

impl ActivationCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
