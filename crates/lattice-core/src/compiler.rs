use crate::clock::Clock;
use crate::context::PluginContext;
use crate::error::{PluginError, PluginResult};
use crate::hooks::HookName;
use crate::host::LogLevel;
use crate::plugin::{
    HookFn, InitResult, MacroFn, PluginIntent, PluginManifest, PluginModule, TickFn,
};
use crate::rate_limit::RateLimiter;
use crate::settings::RuntimeSettings;
use crate::validator::{LoadedPluginView, PluginValidator, ValidationReport, ValidationRequest};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

const SAFE_NAME_MAX_CHARS: usize = 40;
const COMPILED_VERSION: &str = "0.1.0";

/// A handler offered by an agent. Only callables are accepted; textual
/// source is carried for the pattern scan and never executed.
#[derive(Clone)]
pub enum ProposedHandler<F> {
    Function { source: String, handler: F },
    Source(String),
}

impl<F> ProposedHandler<F> {
    pub fn function(source: impl Into<String>, handler: F) -> Self {
        Self::Function {
            source: source.into(),
            handler,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProposalIntent {
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub purpose: Option<String>,
}

#[derive(Clone, Default)]
pub struct AgentProposal {
    pub emergent_id: String,
    pub name: String,
    pub description: Option<String>,
    pub purpose: Option<String>,
    pub macros: BTreeMap<String, ProposedHandler<MacroFn>>,
    pub hooks: BTreeMap<String, ProposedHandler<HookFn>>,
    pub intent: ProposalIntent,
    pub tick: Option<ProposedHandler<TickFn>>,
}

impl AgentProposal {
    pub fn new(emergent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            emergent_id: emergent_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_macro(
        mut self,
        action: impl Into<String>,
        source: impl Into<String>,
        handler: impl Fn(&PluginContext, Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.macros.insert(
            action.into(),
            ProposedHandler::function(source, Arc::new(handler) as MacroFn),
        );
        self
    }

    pub fn with_hook(
        mut self,
        hook: impl Into<String>,
        source: impl Into<String>,
        handler: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.insert(
            hook.into(),
            ProposedHandler::function(source, Arc::new(handler) as HookFn),
        );
        self
    }
}

/// The restricted module produced from a proposal, held for governance.
#[derive(Clone, Debug)]
pub struct CompiledPlugin {
    pub module: PluginModule,
    pub emergent_id: String,
    pub source: String,
    pub validation: ValidationReport,
    pub proposed_at_ms: u64,
    pub rejected_handlers: Vec<String>,
    pub dropped_hooks: Vec<String>,
    pub requires_governance: bool,
}

pub struct RuntimeCompiler {
    agent_namespace: String,
    max_agent_plugins: usize,
    max_source_chars: usize,
    agent_hooks: BTreeSet<String>,
    license: String,
    rate_limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl RuntimeCompiler {
    pub fn new(
        settings: &RuntimeSettings,
        rate_limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agent_namespace: settings.agent_namespace.trim().to_string(),
            max_agent_plugins: settings.max_agent_plugins,
            max_source_chars: settings.max_source_chars,
            agent_hooks: settings.agent_hooks(),
            license: settings.agent_license.clone(),
            rate_limiter,
            clock,
        }
    }

    pub fn compile(
        &self,
        proposal: AgentProposal,
        agent_plugin_count: usize,
        validator: &dyn PluginValidator,
        loaded: &[LoadedPluginView],
    ) -> PluginResult<CompiledPlugin> {
        let emergent_id = proposal.emergent_id.trim().to_string();
        let name = proposal.name.trim().to_string();
        if emergent_id.is_empty() || name.is_empty() {
            return Err(PluginError::ProposalIdentityRequired);
        }
        if agent_plugin_count >= self.max_agent_plugins {
            return Err(PluginError::MaxAgentPluginsReached {
                limit: self.max_agent_plugins,
            });
        }

        let safe = safe_name(&name);
        if safe.is_empty() {
            return Err(PluginError::ProposalIdentityRequired);
        }
        let plugin_id = format!("{}.{safe}", self.agent_namespace);
        let author = format!("emergent:{emergent_id}");
        let proposed_at_ms = self.clock.now_ms();

        let purpose = [
            &proposal.intent.purpose,
            &proposal.purpose,
            &proposal.description,
        ]
        .into_iter()
        .flatten()
        .find(|purpose| !purpose.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| "No purpose stated".to_string());
        let intent = PluginIntent {
            reads: proposal.intent.reads.clone(),
            writes: proposal.intent.writes.clone(),
            purpose: purpose.clone(),
        };

        let mut source = String::new();
        let _ = writeln!(source, "// plugin: {name}");
        let _ = writeln!(source, "// author: {author}");
        let _ = writeln!(source, "// purpose: {purpose}");

        let mut rejected_handlers = Vec::new();
        let mut macros: BTreeMap<String, MacroFn> = BTreeMap::new();
        for (action, proposed) in proposal.macros {
            match proposed {
                ProposedHandler::Function {
                    source: text,
                    handler,
                } => {
                    let key = format!("{plugin_id}.{action}");
                    let _ = writeln!(source, "// macro {key}\n{text}");
                    macros.insert(key, self.rate_limited_macro(&plugin_id, handler));
                }
                ProposedHandler::Source(_) => {
                    warn!(plugin_id = %plugin_id, action = %action, "rejected source-valued macro handler");
                    rejected_handlers.push(format!("macro:{action}"));
                }
            }
        }

        let mut dropped_hooks = Vec::new();
        let mut hooks: BTreeMap<String, HookFn> = BTreeMap::new();
        for (hook_name, proposed) in proposal.hooks {
            if !self.hook_allowed(&hook_name) {
                dropped_hooks.push(hook_name);
                continue;
            }
            match proposed {
                ProposedHandler::Function {
                    source: text,
                    handler,
                } => {
                    let _ = writeln!(source, "// hook {hook_name}\n{text}");
                    hooks.insert(hook_name, handler);
                }
                ProposedHandler::Source(_) => {
                    warn!(plugin_id = %plugin_id, hook = %hook_name, "rejected source-valued hook handler");
                    rejected_handlers.push(format!("hook:{hook_name}"));
                }
            }
        }

        let tick = match proposal.tick {
            Some(ProposedHandler::Function {
                source: text,
                handler,
            }) => {
                let _ = writeln!(source, "// tick\n{text}");
                Some(self.rate_limited_tick(&plugin_id, handler))
            }
            Some(ProposedHandler::Source(_)) => {
                rejected_handlers.push("tick".to_string());
                None
            }
            None => None,
        };

        let source_len = source.chars().count();
        if source_len > self.max_source_chars {
            return Err(PluginError::SourceTooLarge {
                len: source_len,
                limit: self.max_source_chars,
            });
        }

        let manifest = PluginManifest {
            id: plugin_id.clone(),
            name: name.clone(),
            version: COMPILED_VERSION.to_string(),
            description: proposal.description.clone(),
            author: Some(author),
            license: Some(self.license.clone()),
            intent: Some(intent),
        };

        let init_emergent = emergent_id.clone();
        let limiter = self.rate_limiter.clone();
        let destroy_id = plugin_id.clone();
        let mut module = PluginModule::new(manifest, move |ctx| {
            ctx.log(
                LogLevel::Info,
                "emergent plugin activated",
                json!({ "emergentId": init_emergent }),
            );
            Ok(InitResult::ok())
        })
        .with_destroy(move |_| {
            limiter.reset(&destroy_id);
            Ok(())
        });
        module.macros = macros;
        module.hooks = hooks;
        module.tick = tick;

        let validation = validator.validate(
            &module,
            ValidationRequest {
                loaded,
                is_agent_generated: true,
                source_code: Some(&source),
            },
        );
        if !validation.valid {
            warn!(plugin_id = %plugin_id, errors = ?validation.errors, "agent plugin failed validation");
            return Err(PluginError::ValidationFailed { report: validation });
        }

        info!(
            plugin_id = %plugin_id,
            emergent_id = %emergent_id,
            macros = module.macros.len(),
            hooks = module.hooks.len(),
            "compiled agent plugin"
        );

        Ok(CompiledPlugin {
            module,
            emergent_id,
            source,
            validation,
            proposed_at_ms,
            rejected_handlers,
            dropped_hooks,
            requires_governance: true,
        })
    }

    fn hook_allowed(&self, hook_name: &str) -> bool {
        let Some(hook) = HookName::parse(hook_name) else {
            return false;
        };
        !hook.is_before() && self.agent_hooks.contains(hook.as_str())
    }

    fn rate_limited_macro(&self, plugin_id: &str, handler: MacroFn) -> MacroFn {
        let limiter = self.rate_limiter.clone();
        let plugin_id = plugin_id.to_string();
        Arc::new(move |ctx: &PluginContext, input: Value| {
            if !limiter.check(&plugin_id) {
                return Err(PluginError::RateLimitExceeded.to_string());
            }
            handler(ctx, input)
        })
    }

    fn rate_limited_tick(&self, plugin_id: &str, tick: TickFn) -> TickFn {
        let limiter = self.rate_limiter.clone();
        let plugin_id = plugin_id.to_string();
        Arc::new(move |ctx: &PluginContext| {
            if !limiter.check(&plugin_id) {
                return Err(PluginError::RateLimitExceeded.to_string());
            }
            tick(ctx)
        })
    }
}

/// Lowercases, maps anything outside `[a-z0-9_-]` to `-`, collapses runs of
/// `-`, trims them from both ends and caps the result at 40 chars.
pub fn safe_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('-');
    trimmed.chars().take(SAFE_NAME_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::tests::fixture;
    use crate::rate_limit::RateLimitConfig;
    use crate::validator::{GateValidator, GATE_SOURCE_SCAN};

    struct Harness {
        compiler: RuntimeCompiler,
        validator: GateValidator,
        limiter: Arc<RateLimiter>,
    }

    fn harness() -> Harness {
        let settings = RuntimeSettings::default();
        let clock = ManualClock::new(42_000);
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(clock.clone()),
        ));
        Harness {
            compiler: RuntimeCompiler::new(&settings, limiter.clone(), Arc::new(clock)),
            validator: GateValidator::new(settings.gate_policy()),
            limiter,
        }
    }

    fn compile(h: &Harness, proposal: AgentProposal, count: usize) -> PluginResult<CompiledPlugin> {
        h.compiler.compile(proposal, count, &h.validator, &[])
    }

    #[test]
    fn safe_name_normalizes_agent_names() {
        assert_eq!(safe_name("Gap Finder!!"), "gap-finder");
        assert_eq!(safe_name("  --Multi   Space__Name--"), "multi-space__name");
        assert_eq!(safe_name("!!!"), "");
        assert_eq!(safe_name(&"a".repeat(60)).len(), 40);
        assert_eq!(safe_name("Été"), "t");
    }

    #[test]
    fn compiles_namespaced_ids_and_macro_keys() {
        let h = harness();
        let proposal = AgentProposal::new("a1", "Gap Finder!!").with_macro(
            "scan",
            "fn scan(input) { input }",
            |_, input| Ok(input),
        );

        let compiled = compile(&h, proposal, 0).expect("compile");
        assert_eq!(compiled.module.id(), "emergent-gen.gap-finder");
        assert_eq!(
            compiled.module.macros.keys().collect::<Vec<_>>(),
            vec!["emergent-gen.gap-finder.scan"]
        );
        assert!(compiled.requires_governance);
        assert_eq!(compiled.proposed_at_ms, 42_000);

        let manifest = &compiled.module.manifest;
        assert_eq!(manifest.author.as_deref(), Some("emergent:a1"));
        assert_eq!(manifest.license.as_deref(), Some("emergent-gen-restricted"));
        assert_eq!(
            manifest.intent.as_ref().map(|i| i.purpose.as_str()),
            Some("No purpose stated")
        );
        assert!(compiled.source.contains("// plugin: Gap Finder!!"));
        assert!(compiled.source.contains("fn scan(input) { input }"));
    }

    #[test]
    fn rejects_missing_identity_and_full_capacity() {
        let h = harness();
        assert!(matches!(
            compile(&h, AgentProposal::new("", "Name"), 0),
            Err(PluginError::ProposalIdentityRequired)
        ));
        assert!(matches!(
            compile(&h, AgentProposal::new("a1", "  "), 0),
            Err(PluginError::ProposalIdentityRequired)
        ));

        let err = compile(&h, AgentProposal::new("a1", "Gap Finder"), 10).expect_err("cap");
        assert_eq!(err.to_string(), "max_emergent_plugins_reached: limit is 10");
        assert_eq!(h.limiter.tracked_count(), 0);
    }

    #[test]
    fn purpose_falls_back_to_proposal_then_description() {
        let h = harness();
        let mut proposal = AgentProposal::new("a1", "Writer");
        proposal.description = Some("Describes things".to_string());
        let compiled = compile(&h, proposal.clone(), 0).expect("compile");
        assert_eq!(
            compiled.module.manifest.intent.map(|i| i.purpose),
            Some("Describes things".to_string())
        );

        proposal.purpose = Some("Find gaps".to_string());
        let compiled = compile(&h, proposal, 0).expect("compile");
        assert_eq!(
            compiled.module.manifest.intent.map(|i| i.purpose),
            Some("Find gaps".to_string())
        );
    }

    #[test]
    fn blank_purposes_fall_through_to_the_next_source() {
        let h = harness();
        let mut proposal = AgentProposal::new("a1", "Writer");
        proposal.intent.purpose = Some(String::new());
        proposal.purpose = Some("   ".to_string());
        proposal.description = Some("Describes gaps".to_string());
        let compiled = compile(&h, proposal, 0).expect("compile");
        assert_eq!(
            compiled.module.manifest.intent.map(|i| i.purpose),
            Some("Describes gaps".to_string())
        );
        assert!(compiled.source.contains("// purpose: Describes gaps"));
    }

    #[test]
    fn source_handlers_are_rejected_and_disallowed_hooks_dropped() {
        let h = harness();
        let mut proposal = AgentProposal::new("a1", "Hooky")
            .with_hook("dtu:afterCreate", "on_create()", |_| Ok(()))
            .with_hook("dtu:beforeCreate", "veto()", |_| Ok(()))
            .with_hook("macro:afterExecute", "watch()", |_| Ok(()))
            .with_hook("dtu:unknown", "x()", |_| Ok(()));
        proposal.macros.insert(
            "raw".to_string(),
            ProposedHandler::Source("fn raw() {}".to_string()),
        );
        proposal.hooks.insert(
            "dtu:afterDelete".to_string(),
            ProposedHandler::Source("fn gone() {}".to_string()),
        );

        let compiled = compile(&h, proposal, 0).expect("compile");
        assert_eq!(
            compiled.module.hooks.keys().collect::<Vec<_>>(),
            vec!["dtu:afterCreate"]
        );
        assert!(compiled.module.macros.is_empty());
        assert_eq!(
            compiled.rejected_handlers,
            vec!["macro:raw".to_string(), "hook:dtu:afterDelete".to_string()]
        );
        assert_eq!(compiled.dropped_hooks.len(), 3);
        assert!(!compiled.source.contains("veto()"));
    }

    #[test]
    fn oversized_source_is_rejected() {
        let h = harness();
        let proposal = AgentProposal::new("a1", "Big").with_macro(
            "huge",
            "x".repeat(10_001),
            |_, input| Ok(input),
        );
        assert!(matches!(
            compile(&h, proposal, 0),
            Err(PluginError::SourceTooLarge { limit: 10_000, .. })
        ));
    }

    #[test]
    fn validator_failure_is_propagated() {
        let h = harness();
        let proposal = AgentProposal::new("a1", "Escaper").with_macro(
            "run",
            "std::process::Command::new(\"sh\")",
            |_, input| Ok(input),
        );
        let err = compile(&h, proposal, 0).expect_err("validation");
        match err {
            PluginError::ValidationFailed { report } => {
                assert_eq!(report.gate(GATE_SOURCE_SCAN).map(|g| g.passed), Some(false));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn compiled_macros_and_tick_fail_closed_on_rate_limit() {
        let h = harness();
        let mut proposal = AgentProposal::new("a1", "Busy").with_macro(
            "ping",
            "fn ping() {}",
            |_, _| Ok(Value::from("pong")),
        );
        proposal.tick = Some(ProposedHandler::function(
            "fn tick() {}",
            Arc::new(|_: &PluginContext| Ok::<(), String>(())) as TickFn,
        ));
        let compiled = compile(&h, proposal, 0).expect("compile");

        let fx = fixture();
        let mut services = fx.services.clone();
        services.rate_limiter = h.limiter.clone();
        let ctx = PluginContext::new(compiled.module.id(), true, services);

        let ping = compiled
            .module
            .macros
            .get("emergent-gen.busy.ping")
            .cloned()
            .expect("ping macro");
        let tick = compiled.module.tick.clone().expect("tick");

        for _ in 0..49 {
            assert_eq!(ping(&ctx, Value::Null), Ok(Value::from("pong")));
        }
        assert!(tick(&ctx).is_ok());
        assert_eq!(ping(&ctx, Value::Null), Err("rate_limit_exceeded".to_string()));
        assert_eq!(tick(&ctx), Err("rate_limit_exceeded".to_string()));

        let destroy = compiled.module.destroy.clone().expect("destroy");
        destroy(&ctx).expect("destroy");
        assert_eq!(h.limiter.tracked_count(), 0);
    }
}
