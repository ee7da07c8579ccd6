use crate::plugin::{split_macro_key, PluginModule};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

pub const GATE_STRUCTURE: &str = "structure";
pub const GATE_NAMESPACE: &str = "namespace";
pub const GATE_SOURCE_SCAN: &str = "source_scan";
pub const GATE_RESOURCE: &str = "resource";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespacePolicy {
    agent_namespace: String,
    reserved: BTreeSet<String>,
}

impl NamespacePolicy {
    pub fn new(agent_namespace: &str, reserved: impl IntoIterator<Item = String>) -> Self {
        let mut reserved = reserved.into_iter().collect::<BTreeSet<_>>();
        reserved.insert(agent_namespace.to_string());
        Self {
            agent_namespace: agent_namespace.to_string(),
            reserved,
        }
    }

    pub fn agent_namespace(&self) -> &str {
        &self.agent_namespace
    }

    pub fn is_reserved(&self, domain: &str) -> bool {
        self.reserved.contains(domain)
    }

    pub fn in_agent_namespace(&self, key: &str) -> bool {
        key.strip_prefix(self.agent_namespace.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|rest| !rest.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatePolicy {
    pub namespaces: NamespacePolicy,
    pub prohibited_patterns: Vec<String>,
    pub max_source_chars: usize,
    pub max_macros: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedPluginView {
    pub id: String,
    pub macros: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct ValidationRequest<'a> {
    pub loaded: &'a [LoadedPluginView],
    pub is_agent_generated: bool,
    pub source_code: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub gates: Vec<GateResult>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn gate(&self, name: &str) -> Option<&GateResult> {
        self.gates.iter().find(|gate| gate.name == name)
    }
}

/// Pass/fail check run before any activation side effect.
pub trait PluginValidator: Send + Sync {
    fn validate(&self, module: &PluginModule, request: ValidationRequest<'_>) -> ValidationReport;
}

/// Default four-gate validator driven by a `GatePolicy`.
pub struct GateValidator {
    policy: GatePolicy,
}

impl GateValidator {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    fn structure_gate(&self, module: &PluginModule, errors: &mut Vec<String>) -> bool {
        let manifest = &module.manifest;
        let before = errors.len();
        if manifest.id.trim().is_empty() {
            errors.push("structure: plugin id is required".to_string());
        } else if !manifest.id.chars().all(is_id_char) {
            errors.push(format!(
                "structure: plugin id has invalid characters: {}",
                manifest.id
            ));
        }
        if manifest.name.trim().is_empty() {
            errors.push("structure: plugin name is required".to_string());
        }
        if manifest.version.trim().is_empty() {
            errors.push("structure: plugin version is required".to_string());
        }
        errors.len() == before
    }

    fn namespace_gate(
        &self,
        module: &PluginModule,
        request: ValidationRequest<'_>,
        errors: &mut Vec<String>,
    ) -> bool {
        let before = errors.len();
        let id = module.id();
        let namespaces = &self.policy.namespaces;

        if request.loaded.iter().any(|loaded| loaded.id == id) {
            errors.push(format!("namespace: plugin id already loaded: {id}"));
        }

        let taken: HashSet<&str> = request
            .loaded
            .iter()
            .filter(|loaded| loaded.id != id)
            .flat_map(|loaded| loaded.macros.iter().map(String::as_str))
            .collect();

        if request.is_agent_generated && !namespaces.in_agent_namespace(id) {
            errors.push(format!(
                "namespace: agent plugin id must live under {}.*",
                namespaces.agent_namespace()
            ));
        }
        if !request.is_agent_generated && namespaces.in_agent_namespace(id) {
            errors.push(format!(
                "namespace: only agent plugins may use {}.*",
                namespaces.agent_namespace()
            ));
        }

        for key in module.macros.keys() {
            if taken.contains(key.as_str()) {
                errors.push(format!("namespace: macro already registered: {key}"));
            }
            if request.is_agent_generated {
                if !namespaces.in_agent_namespace(key) {
                    errors.push(format!(
                        "namespace: agent macro outside {}.*: {key}",
                        namespaces.agent_namespace()
                    ));
                }
            } else if let Some((domain, _)) = split_macro_key(key) {
                if namespaces.is_reserved(domain) {
                    errors.push(format!("namespace: reserved macro domain: {domain}"));
                }
            }
        }
        errors.len() == before
    }

    fn source_scan_gate(&self, request: ValidationRequest<'_>, errors: &mut Vec<String>) -> bool {
        if !request.is_agent_generated {
            return true;
        }
        let Some(source) = request.source_code else {
            errors.push("source_scan: agent plugin requires a source representation".to_string());
            return false;
        };

        let before = errors.len();
        for pattern in &self.policy.prohibited_patterns {
            if source.contains(pattern.as_str()) {
                errors.push(format!("source_scan: prohibited construct: {pattern}"));
            }
        }
        errors.len() == before
    }

    fn resource_gate(
        &self,
        module: &PluginModule,
        request: ValidationRequest<'_>,
        errors: &mut Vec<String>,
    ) -> bool {
        let before = errors.len();
        if let Some(source) = request.source_code {
            let len = source.chars().count();
            if len > self.policy.max_source_chars {
                errors.push(format!(
                    "resource: source is {len} chars, limit is {}",
                    self.policy.max_source_chars
                ));
            }
        }
        if module.macros.len() > self.policy.max_macros {
            errors.push(format!(
                "resource: {} macros declared, limit is {}",
                module.macros.len(),
                self.policy.max_macros
            ));
        }
        errors.len() == before
    }
}

impl PluginValidator for GateValidator {
    fn validate(&self, module: &PluginModule, request: ValidationRequest<'_>) -> ValidationReport {
        let mut errors = Vec::new();
        let gates = vec![
            GateResult {
                name: GATE_STRUCTURE.to_string(),
                passed: self.structure_gate(module, &mut errors),
            },
            GateResult {
                name: GATE_NAMESPACE.to_string(),
                passed: self.namespace_gate(module, request, &mut errors),
            },
            GateResult {
                name: GATE_SOURCE_SCAN.to_string(),
                passed: self.source_scan_gate(request, &mut errors),
            },
            GateResult {
                name: GATE_RESOURCE.to_string(),
                passed: self.resource_gate(module, request, &mut errors),
            },
        ];

        ValidationReport {
            valid: gates.iter().all(|gate| gate.passed),
            gates,
            errors,
        }
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{InitResult, PluginManifest};
    use crate::settings::RuntimeSettings;

    fn validator() -> GateValidator {
        GateValidator::new(RuntimeSettings::default().gate_policy())
    }

    fn module(id: &str) -> PluginModule {
        PluginModule::new(PluginManifest::new(id, "Demo", "0.1.0"), |_| {
            Ok(InitResult::ok())
        })
    }

    fn human<'a>(loaded: &'a [LoadedPluginView]) -> ValidationRequest<'a> {
        ValidationRequest {
            loaded,
            is_agent_generated: false,
            source_code: None,
        }
    }

    #[test]
    fn well_formed_human_plugin_passes_every_gate() {
        let report = validator().validate(
            &module("x.pins").with_macro("pins.add", |_, v| Ok(v)),
            human(&[]),
        );
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.gates.len(), 4);
        assert!(report.gates.iter().all(|gate| gate.passed));
    }

    #[test]
    fn structure_gate_requires_manifest_fields() {
        let mut bad = module("");
        bad.manifest.version = " ".to_string();
        let report = validator().validate(&bad, human(&[]));
        assert!(!report.valid);
        assert_eq!(report.gate(GATE_STRUCTURE).map(|g| g.passed), Some(false));
        assert_eq!(report.errors.len(), 2);

        let report = validator().validate(&module("X Plugin"), human(&[]));
        assert!(!report.valid);
    }

    #[test]
    fn namespace_gate_rejects_collisions_and_reserved_domains() {
        let loaded = vec![LoadedPluginView {
            id: "x.other".to_string(),
            macros: vec!["pins.add".to_string()],
        }];

        let report = validator().validate(
            &module("x.pins").with_macro("pins.add", |_, v| Ok(v)),
            human(&loaded),
        );
        assert_eq!(report.gate(GATE_NAMESPACE).map(|g| g.passed), Some(false));

        let report = validator().validate(
            &module("x.other").with_macro("notes.x", |_, v| Ok(v)),
            human(&loaded),
        );
        assert!(!report.valid);

        let report = validator().validate(
            &module("x.sneaky").with_macro("system.shutdown", |_, v| Ok(v)),
            human(&[]),
        );
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("reserved macro domain: system")));
    }

    #[test]
    fn agent_plugins_must_stay_in_their_namespace() {
        let source = "// plugin: scanner";
        let request = ValidationRequest {
            loaded: &[],
            is_agent_generated: true,
            source_code: Some(source),
        };

        let ok = module("emergent-gen.scanner")
            .with_macro("emergent-gen.scanner.run", |_, v| Ok(v));
        assert!(validator().validate(&ok, request).valid);

        let escaped = module("emergent-gen.scanner").with_macro("notes.rewrite", |_, v| Ok(v));
        let report = validator().validate(&escaped, request);
        assert_eq!(report.gate(GATE_NAMESPACE).map(|g| g.passed), Some(false));

        let report = validator().validate(&module("scanner"), request);
        assert!(!report.valid);

        let report = validator().validate(&module("emergent-gen.scanner"), human(&[]));
        assert!(report
            .errors
            .iter()
            .any(|e| e == "namespace: only agent plugins may use emergent-gen.*"));
    }

    #[test]
    fn source_scan_flags_prohibited_constructs_for_agent_plugins_only() {
        let source = "fn run() { std::process::exit(1) }";
        let agent = ValidationRequest {
            loaded: &[],
            is_agent_generated: true,
            source_code: Some(source),
        };
        let report = validator().validate(&module("emergent-gen.x"), agent);
        assert_eq!(report.gate(GATE_SOURCE_SCAN).map(|g| g.passed), Some(false));

        let human_request = ValidationRequest {
            is_agent_generated: false,
            ..agent
        };
        let report = validator().validate(&module("x.tool"), human_request);
        assert_eq!(report.gate(GATE_SOURCE_SCAN).map(|g| g.passed), Some(true));

        let missing = ValidationRequest {
            source_code: None,
            ..agent
        };
        let report = validator().validate(&module("emergent-gen.x"), missing);
        assert!(!report.valid);
    }

    #[test]
    fn resource_gate_bounds_source_and_macro_count() {
        let source = "x".repeat(10_001);
        let report = validator().validate(
            &module("x.big"),
            ValidationRequest {
                loaded: &[],
                is_agent_generated: false,
                source_code: Some(&source),
            },
        );
        assert_eq!(report.gate(GATE_RESOURCE).map(|g| g.passed), Some(false));

        let mut many = module("x.many");
        for i in 0..33 {
            many = many.with_macro(format!("many.m{i}"), |_, v| Ok(v));
        }
        let report = validator().validate(&many, human(&[]));
        assert_eq!(report.gate(GATE_RESOURCE).map(|g| g.passed), Some(false));
    }

    #[test]
    fn namespace_policy_always_reserves_the_agent_namespace() {
        let policy = NamespacePolicy::new("gen", Vec::new());
        assert!(policy.is_reserved("gen"));
        assert!(policy.in_agent_namespace("gen.a"));
        assert!(!policy.in_agent_namespace("gen."));
        assert!(!policy.in_agent_namespace("general.a"));
    }
}
