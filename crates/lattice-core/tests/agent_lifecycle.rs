use lattice_core::settings::{load_effective_settings, project_settings_path, settings_path};
use lattice_core::{
    ActivationCancellation, AgentProposal, Dtu, HookName, HostServices, ManualClock,
    MemoryHostState, MemoryMacroHost, PluginRegistry, RuntimeSettings, TracingLogger,
};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PLUGIN_ID: &str = "emergent-gen.gap-finder";

struct Host {
    registry: PluginRegistry,
    macros: Arc<MemoryMacroHost>,
    clock: ManualClock,
}

fn write_json(path: &Path, value: Value) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create settings dir");
    }
    fs::write(path, value.to_string()).expect("write settings");
}

fn host(settings: RuntimeSettings) -> Host {
    let state = Arc::new(MemoryHostState::new());
    state.upsert_dtu(Dtu {
        id: "d1".to_string(),
        title: "First".to_string(),
        ..Dtu::default()
    });
    let macros = Arc::new(MemoryMacroHost::new());
    let clock = ManualClock::new(1_700_000_000_000);
    let registry = PluginRegistry::new(
        settings,
        HostServices {
            state,
            macros: macros.clone(),
            logger: Some(Arc::new(TracingLogger)),
        },
        Arc::new(clock.clone()),
    );
    Host {
        registry,
        macros,
        clock,
    }
}

fn gap_finder(created: Arc<AtomicUsize>) -> AgentProposal {
    AgentProposal::new("agent-7", "Gap Finder!!")
        .with_macro("count", "fn count(ctx) { ctx.dtu_count() }", |ctx, _| {
            Ok(json!(ctx.get_dtu_count()))
        })
        .with_macro(
            "bill",
            "fn bill(ctx, input) { ctx.call(\"billing.charge\", input) }",
            |ctx, input| {
                ctx.call_macro("billing", "charge", input)
                    .map_err(|err| err.to_string())
            },
        )
        .with_hook("dtu:afterCreate", "fn on_create(payload) {}", move |_| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .with_hook("dtu:beforeUpdate", "fn veto(payload) {}", |_| {
            Err("veto".to_string())
        })
}

#[test]
fn layered_settings_drive_the_agent_plugin_lifecycle() {
    let config_dir = tempfile::tempdir().expect("config dir");
    let project = tempfile::tempdir().expect("project dir");
    write_json(
        &settings_path(config_dir.path()),
        json!({"rate_budget": 5, "max_agent_plugins": 3}),
    );
    write_json(
        &project_settings_path(project.path()),
        json!({"rate_budget": 3, "max_agent_plugins": 1, "reserved_namespaces": ["billing"]}),
    );

    let settings =
        load_effective_settings(config_dir.path(), Some(project.path())).expect("settings");
    assert_eq!(settings.rate_budget, 3);
    assert_eq!(settings.max_agent_plugins, 1);
    assert!(settings.reserved_namespaces.iter().any(|ns| ns == "billing"));
    assert!(settings.reserved_namespaces.iter().any(|ns| ns == "system"));

    let Host {
        mut registry,
        macros,
        clock,
    } = host(settings);
    let created = Arc::new(AtomicUsize::new(0));

    let proposal = registry
        .compile_agent_plugin(gap_finder(created.clone()))
        .expect("compile proposal");
    assert_eq!(proposal.plugin_id, PLUGIN_ID);
    assert_eq!(proposal.emergent_id, "agent-7");
    assert_eq!(proposal.macro_count, 2);
    assert_eq!(proposal.hook_count, 1);
    assert_eq!(proposal.dropped_hooks, vec!["dtu:beforeUpdate".to_string()]);
    assert_eq!(proposal.submitted_at, "2023-11-14T22:13:20.000Z");
    assert!(registry.list_plugins().is_empty());
    assert!(!macros.is_registered("emergent-gen", "gap-finder.count"));

    // Pending proposals count toward the agent cap.
    let capped = registry
        .compile_agent_plugin(AgentProposal::new("agent-8", "Other"))
        .expect_err("cap reached");
    assert_eq!(capped.to_string(), "max_emergent_plugins_reached: limit is 1");

    let summary = registry
        .activate_approved_plugin(PLUGIN_ID, ActivationCancellation::new())
        .expect("approve");
    assert!(summary.agent_generated);
    assert_eq!(summary.author.as_deref(), Some("emergent:agent-7"));
    assert_eq!(summary.hooks, vec!["dtu:afterCreate".to_string()]);
    assert!(registry.get_pending_governance().is_empty());
    assert!(macros.is_registered("emergent-gen", "gap-finder.count"));
    assert!(macros.is_registered("emergent-gen", "gap-finder.bill"));

    for _ in 0..3 {
        assert_eq!(
            macros.invoke("emergent-gen", "gap-finder.count", Value::Null),
            Ok(json!(1))
        );
    }
    assert_eq!(
        macros.invoke("emergent-gen", "gap-finder.count", Value::Null),
        Err("rate_limit_exceeded".to_string())
    );

    clock.advance(60_000);
    assert_eq!(
        macros.invoke("emergent-gen", "gap-finder.bill", json!({"cents": 5})),
        Err("emergent_gen_cannot_call: billing.*".to_string())
    );

    let outcome = registry.fire_hook(HookName::DtuAfterCreate, &json!({"id": "d2"}));
    assert_eq!(outcome.called, 1);
    assert!(outcome.errors.is_empty());
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let vetoed = registry.fire_hook(HookName::DtuBeforeUpdate, &json!({"id": "d1"}));
    assert_eq!(vetoed.called, 0);
    assert!(vetoed.errors.is_empty());

    let metrics = registry.get_plugin_metrics();
    assert_eq!(metrics.active, 1);
    assert_eq!(metrics.total_agent_generated, 1);
    assert_eq!(metrics.macro_calls, 5);
    assert_eq!(metrics.hook_calls, 1);

    registry.unload_plugin(PLUGIN_ID).expect("unload");
    assert!(!macros.is_registered("emergent-gen", "gap-finder.count"));
    assert_eq!(registry.rate_limiter().tracked_count(), 0);
    assert!(registry.subscriber_ids(HookName::DtuAfterCreate).is_empty());

    let metrics = registry.get_plugin_metrics();
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.total_unloaded, 1);
}

#[test]
fn rejected_proposals_never_touch_the_host() {
    let Host {
        mut registry,
        macros,
        ..
    } = host(RuntimeSettings::default());

    let unsafe_proposal = AgentProposal::new("agent-9", "Shell Out").with_macro(
        "run",
        "fn run() { unsafe { launch() } }",
        |_, input| Ok(input),
    );
    let err = registry
        .compile_agent_plugin(unsafe_proposal)
        .expect_err("prohibited construct");
    assert_eq!(err.as_tag(), "validation_failed");
    assert!(err
        .validation_errors()
        .iter()
        .any(|line| line == "source_scan: prohibited construct: unsafe"));
    assert!(registry.get_pending_governance().is_empty());

    registry
        .compile_agent_plugin(gap_finder(Arc::new(AtomicUsize::new(0))))
        .expect("compile");
    let rejected = registry
        .reject_pending_plugin(PLUGIN_ID)
        .expect("reject pending");
    assert_eq!(rejected.plugin_id, PLUGIN_ID);

    let err = registry
        .activate_approved_plugin(PLUGIN_ID, ActivationCancellation::new())
        .expect_err("nothing pending");
    assert_eq!(err.to_string(), "no_pending_plugin_with_id");
    assert!(macros.registered_keys().is_empty());
    assert!(registry.list_plugins().is_empty());

    let metrics = registry.get_plugin_metrics();
    assert_eq!(metrics.total_loaded, 0);
    assert_eq!(metrics.active, 0);
}
