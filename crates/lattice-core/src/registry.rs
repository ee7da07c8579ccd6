use crate::clock::{format_epoch_ms, Clock};
use crate::compiler::{AgentProposal, CompiledPlugin, RuntimeCompiler};
use crate::context::{ContextServices, PluginContext};
use crate::error::{PluginError, PluginResult};
use crate::governance::{GovernanceProposal, GovernanceQueue};
use crate::guard::{guarded, guarded_timed};
use crate::hooks::{DispatchError, DispatchOutcome, HookName, HookTable};
use crate::host::{HostLogger, HostMacroFn, HostState, MacroHost, MacroMetadata};
use crate::metrics::{MetricsSnapshot, PluginMetrics};
use crate::plugin::{split_macro_key, ActivationCancellation, PluginIntent, PluginModule};
use crate::rate_limit::RateLimiter;
use crate::settings::RuntimeSettings;
use crate::validator::{GateValidator, LoadedPluginView, PluginValidator, ValidationRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host collaborators the registry is constructed with.
#[derive(Clone)]
pub struct HostServices {
    pub state: Arc<dyn HostState>,
    pub macros: Arc<dyn MacroHost>,
    pub logger: Option<Arc<dyn HostLogger>>,
}

#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    pub agent_generated: bool,
    pub source_code: Option<String>,
    pub cancellation: ActivationCancellation,
}

impl RegisterOptions {
    pub fn agent(source_code: impl Into<String>) -> Self {
        Self {
            agent_generated: true,
            source_code: Some(source_code.into()),
            ..Self::default()
        }
    }

    pub fn with_cancellation(mut self, cancellation: ActivationCancellation) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// One active plugin. Exists only while the plugin can receive calls.
pub struct PluginRecord {
    pub module: PluginModule,
    pub agent_generated: bool,
    pub registered_macros: Vec<String>,
    pub registered_hooks: Vec<HookName>,
    pub loaded_at_ms: u64,
    pub context: Arc<PluginContext>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub intent: Option<PluginIntent>,
    pub agent_generated: bool,
    pub macros: Vec<String>,
    pub hooks: Vec<String>,
    pub has_tick: bool,
    pub loaded_at_ms: u64,
    pub loaded_at: String,
}

impl PluginRecord {
    fn summary(&self) -> PluginSummary {
        let manifest = &self.module.manifest;
        PluginSummary {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            license: manifest.license.clone(),
            intent: manifest.intent.clone(),
            agent_generated: self.agent_generated,
            macros: self.registered_macros.clone(),
            hooks: self
                .registered_hooks
                .iter()
                .map(|hook| hook.as_str().to_string())
                .collect(),
            has_tick: self.module.tick.is_some(),
            loaded_at_ms: self.loaded_at_ms,
            loaded_at: format_epoch_ms(self.loaded_at_ms),
        }
    }
}

/// Owns every loaded plugin, the hook subscriber lists, the governance queue
/// and the lifecycle metrics.
pub struct PluginRegistry {
    settings: RuntimeSettings,
    services: ContextServices,
    validator: Box<dyn PluginValidator>,
    compiler: RuntimeCompiler,
    plugins: BTreeMap<String, PluginRecord>,
    hooks: HookTable,
    pending: GovernanceQueue,
    metrics: Arc<PluginMetrics>,
    clock: Arc<dyn Clock>,
}

impl PluginRegistry {
    pub fn new(settings: RuntimeSettings, host: HostServices, clock: Arc<dyn Clock>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(settings.rate_limit_config(), clock.clone()));
        let services = ContextServices {
            state: host.state,
            macros: host.macros,
            logger: host.logger,
            rate_limiter: rate_limiter.clone(),
            namespaces: Arc::new(settings.namespace_policy()),
        };
        Self {
            validator: Box::new(GateValidator::new(settings.gate_policy())),
            compiler: RuntimeCompiler::new(&settings, rate_limiter, clock.clone()),
            metrics: Arc::new(PluginMetrics::new(settings.normalized_error_ring_capacity())),
            plugins: BTreeMap::new(),
            hooks: HookTable::new(),
            pending: GovernanceQueue::new(),
            services,
            settings,
            clock,
        }
    }

    pub fn with_validator(mut self, validator: impl PluginValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.services.rate_limiter
    }

    pub fn compiler(&self) -> &RuntimeCompiler {
        &self.compiler
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
    }

    pub fn record(&self, plugin_id: &str) -> Option<&PluginRecord> {
        self.plugins.get(plugin_id)
    }

    /// Validates and activates `module`. An id that is already loaded is
    /// replaced: the old record is unloaded once the new `init` succeeds.
    /// Replacing an agent plugin keeps it agent-generated.
    pub fn register_plugin(
        &mut self,
        module: PluginModule,
        mut options: RegisterOptions,
    ) -> PluginResult<PluginSummary> {
        let current = self.plugins.get(module.id());
        let replacing = current.is_some();
        if let Some(current) = current {
            options.agent_generated |= current.agent_generated;
        }
        self.activate(module, options, replacing)
    }

    pub fn unload_plugin(&mut self, plugin_id: &str) -> PluginResult<()> {
        let Some(record) = self.plugins.remove(plugin_id) else {
            return Err(PluginError::PluginNotLoaded {
                id: plugin_id.to_string(),
            });
        };
        self.teardown(record);
        Ok(())
    }

    /// Swaps in a new module for a loaded id. The old plugin keeps running if
    /// the new module fails validation or initialization.
    pub fn hot_reload(
        &mut self,
        module: PluginModule,
        mut options: RegisterOptions,
    ) -> PluginResult<PluginSummary> {
        let Some(current) = self.plugins.get(module.id()) else {
            return Err(PluginError::PluginNotLoaded {
                id: module.id().to_string(),
            });
        };
        options.agent_generated |= current.agent_generated;
        info!(plugin_id = %module.id(), "hot reloading plugin");
        self.activate(module, options, true)
    }

    /// Compiles an agent proposal against the live agent plugin count and
    /// parks the result for governance.
    pub fn compile_agent_plugin(
        &mut self,
        proposal: AgentProposal,
    ) -> PluginResult<GovernanceProposal> {
        let loaded = self.loaded_views(None);
        let compiled = self.compiler.compile(
            proposal,
            self.agent_plugin_count(),
            self.validator.as_ref(),
            &loaded,
        )?;
        self.submit_for_governance(compiled)
    }

    pub fn submit_for_governance(
        &mut self,
        compiled: CompiledPlugin,
    ) -> PluginResult<GovernanceProposal> {
        let proposal = self.pending.submit(compiled, self.clock.now_ms())?;
        info!(
            plugin_id = %proposal.plugin_id,
            emergent_id = %proposal.emergent_id,
            "agent plugin awaiting governance"
        );
        Ok(proposal)
    }

    /// Activates a governance-approved module. The pending entry is consumed
    /// only when activation succeeds.
    pub fn activate_approved_plugin(
        &mut self,
        plugin_id: &str,
        cancellation: ActivationCancellation,
    ) -> PluginResult<PluginSummary> {
        let Some(entry) = self.pending.get(plugin_id) else {
            return Err(PluginError::NoPendingPlugin {
                id: plugin_id.to_string(),
            });
        };
        let module = entry.module.clone();
        let options = RegisterOptions::agent(entry.source.clone()).with_cancellation(cancellation);

        let summary = self.activate(module, options, false)?;
        self.pending.take(plugin_id)?;
        Ok(summary)
    }

    pub fn reject_pending_plugin(&mut self, plugin_id: &str) -> PluginResult<GovernanceProposal> {
        let entry = self.pending.take(plugin_id)?;
        info!(plugin_id, "agent plugin rejected by governance");
        Ok(entry.proposal)
    }

    pub fn fire_hook(&self, hook: HookName, payload: &Value) -> DispatchOutcome {
        let outcome = self
            .hooks
            .fire(hook, payload, self.settings.slow_call_warn_ms);
        self.metrics.record_hook_calls(outcome.called);
        outcome
    }

    /// One heartbeat pass over every plugin that declared a tick.
    pub fn tick_plugins(&self) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for (plugin_id, record) in &self.plugins {
            let Some(tick) = record.module.tick.clone() else {
                continue;
            };
            let call = guarded_timed(|| tick(record.context.as_ref()));
            if call.elapsed_ms > self.settings.slow_call_warn_ms as u128 {
                warn!(plugin_id = %plugin_id, elapsed_ms = call.elapsed_ms as u64, "slow tick handler");
            }
            match call.result {
                Ok(()) => {
                    outcome.called += 1;
                    self.metrics.record_tick_call();
                }
                Err(error) => {
                    debug!(plugin_id = %plugin_id, %error, "tick handler failed");
                    outcome.errors.push(DispatchError {
                        plugin_id: plugin_id.clone(),
                        error,
                    });
                }
            }
        }
        outcome
    }

    pub fn list_plugins(&self) -> Vec<PluginSummary> {
        self.plugins.values().map(PluginRecord::summary).collect()
    }

    pub fn get_plugin(&self, plugin_id: &str) -> Option<PluginSummary> {
        self.plugins.get(plugin_id).map(PluginRecord::summary)
    }

    pub fn get_plugin_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.plugins.len(),
            self.settings.normalized_error_ring_surface(),
        )
    }

    pub fn get_pending_governance(&self) -> Vec<GovernanceProposal> {
        self.pending.proposals()
    }

    pub fn subscriber_ids(&self, hook: HookName) -> Vec<&str> {
        self.hooks.subscriber_ids(hook)
    }

    fn agent_plugin_count(&self) -> usize {
        let active = self
            .plugins
            .values()
            .filter(|record| record.agent_generated)
            .count();
        active + self.pending.len()
    }

    fn loaded_views(&self, excluding: Option<&str>) -> Vec<LoadedPluginView> {
        self.plugins
            .values()
            .filter(|record| Some(record.module.id()) != excluding)
            .map(|record| LoadedPluginView {
                id: record.module.id().to_string(),
                macros: record.registered_macros.clone(),
            })
            .collect()
    }

    fn activate(
        &mut self,
        module: PluginModule,
        options: RegisterOptions,
        replacing: bool,
    ) -> PluginResult<PluginSummary> {
        let plugin_id = module.id().to_string();
        let agent_generated = options.agent_generated;

        let loaded = self.loaded_views(replacing.then_some(plugin_id.as_str()));
        let report = self.validator.validate(
            &module,
            ValidationRequest {
                loaded: &loaded,
                is_agent_generated: agent_generated,
                source_code: options.source_code.as_deref(),
            },
        );
        if !report.valid {
            warn!(plugin_id = %plugin_id, errors = ?report.errors, "plugin failed validation");
            return Err(self.fail(&plugin_id, PluginError::ValidationFailed { report }));
        }

        if options.cancellation.is_cancelled() {
            return Err(self.fail(&plugin_id, PluginError::ActivationCancelled));
        }

        let context = Arc::new(PluginContext::new(
            &plugin_id,
            agent_generated,
            self.services.clone(),
        ));
        if let Err(err) = self.run_init(&module, &context, &options.cancellation) {
            return Err(self.fail(&plugin_id, err));
        }

        if replacing {
            if let Some(previous) = self.plugins.remove(&plugin_id) {
                self.teardown(previous);
            }
        }

        let registered_macros = self.register_macros(&module, &context, agent_generated);
        let registered_hooks = self.register_hooks(&module, agent_generated);

        let record = PluginRecord {
            module,
            agent_generated,
            registered_macros,
            registered_hooks,
            loaded_at_ms: self.clock.now_ms(),
            context,
        };
        let summary = record.summary();
        self.plugins.insert(plugin_id.clone(), record);
        self.metrics.record_loaded(agent_generated);
        info!(
            plugin_id = %plugin_id,
            agent_generated,
            macros = summary.macros.len(),
            hooks = summary.hooks.len(),
            "plugin activated"
        );
        Ok(summary)
    }

    fn run_init(
        &self,
        module: &PluginModule,
        context: &PluginContext,
        cancellation: &ActivationCancellation,
    ) -> PluginResult<()> {
        let init = module.init.clone();
        let call = guarded_timed(|| init(context));
        let limit_ms = self.settings.normalized_init_timeout_ms();

        let outcome = match call.result {
            Err(message) => return Err(PluginError::InitThrew(message)),
            Ok(result) if !result.ok => {
                return Err(PluginError::InitReturnedNotOk {
                    reason: result.reason,
                })
            }
            Ok(_) if call.elapsed_ms > limit_ms as u128 => Err(PluginError::InitTimedOut {
                elapsed_ms: call.elapsed_ms,
                limit_ms,
            }),
            Ok(_) if cancellation.is_cancelled() => Err(PluginError::ActivationCancelled),
            Ok(_) => Ok(()),
        };

        if outcome.is_err() {
            release(module, context);
        }
        outcome
    }

    fn register_macros(
        &self,
        module: &PluginModule,
        context: &Arc<PluginContext>,
        agent_generated: bool,
    ) -> Vec<String> {
        let mut registered = Vec::new();
        for (key, handler) in &module.macros {
            let Some((domain, action)) = split_macro_key(key) else {
                debug!(plugin_id = %module.id(), key = %key, "skipping malformed macro key");
                continue;
            };

            let ctx = context.clone();
            let metrics = self.metrics.clone();
            let handler = handler.clone();
            let wrapped: HostMacroFn = Arc::new(move |input: Value| {
                metrics.record_macro_call();
                guarded(|| handler(ctx.as_ref(), input))
            });
            let metadata = MacroMetadata {
                plugin_id: module.id().to_string(),
                description: module.manifest.description.clone(),
                agent_generated,
            };

            let macros = self.services.macros.clone();
            match guarded(|| macros.register(domain, action, wrapped, metadata)) {
                Ok(()) => registered.push(key.clone()),
                Err(detail) => {
                    let err = PluginError::MacroRegisterFailed {
                        name: key.clone(),
                        detail: detail.clone(),
                    };
                    warn!(plugin_id = %module.id(), error = %err, %detail, "macro registration failed");
                }
            }
        }
        registered
    }

    fn register_hooks(&mut self, module: &PluginModule, agent_generated: bool) -> Vec<HookName> {
        let mut registered = Vec::new();
        for (name, handler) in &module.hooks {
            let Some(hook) = HookName::parse(name) else {
                debug!(plugin_id = %module.id(), hook = %name, "skipping unknown hook");
                continue;
            };
            if agent_generated && hook.is_before() {
                debug!(plugin_id = %module.id(), hook = %name, "agent plugins cannot subscribe to before hooks");
                continue;
            }
            self.hooks.subscribe(hook, module.id(), handler.clone());
            registered.push(hook);
        }
        registered
    }

    fn teardown(&mut self, record: PluginRecord) {
        let plugin_id = record.module.id().to_string();
        if let Some(destroy) = record.module.destroy.clone() {
            if let Err(message) = guarded(|| destroy(record.context.as_ref())) {
                let err = PluginError::DestroyFailed(message);
                warn!(plugin_id = %plugin_id, error = %err, "plugin destroy failed");
            }
        }

        let removed_hooks = self.hooks.remove_plugin(&plugin_id);
        for key in &record.registered_macros {
            if let Some((domain, action)) = split_macro_key(key) {
                let macros = self.services.macros.clone();
                let unregistered = guarded(|| {
                    macros.unregister(domain, action);
                    Ok(())
                });
                if let Err(error) = unregistered {
                    warn!(plugin_id = %plugin_id, key = %key, %error, "macro unregister failed");
                }
            }
        }
        record.context.store().clear();
        self.metrics.record_unloaded();
        info!(plugin_id = %plugin_id, removed_hooks, "plugin unloaded");
    }

    fn fail(&self, plugin_id: &str, err: PluginError) -> PluginError {
        self.metrics
            .record_failed(plugin_id, &err.to_string(), self.clock.now_ms());
        warn!(plugin_id, error = %err, tag = err.as_tag(), "plugin activation failed");
        err
    }
}

fn release(module: &PluginModule, context: &PluginContext) {
    if let Some(destroy) = module.destroy.clone() {
        if let Err(message) = guarded(|| destroy(context)) {
            warn!(plugin_id = %module.id(), error = %message, "destroy after failed init failed");
        }
    }
}
