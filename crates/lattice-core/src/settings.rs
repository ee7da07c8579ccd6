use crate::rate_limit::RateLimitConfig;
use crate::validator::{GatePolicy, NamespacePolicy};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default = "default_rate_budget")]
    pub rate_budget: u32,
    #[serde(default = "default_max_agent_plugins")]
    pub max_agent_plugins: usize,
    #[serde(default = "default_max_source_chars")]
    pub max_source_chars: usize,
    #[serde(default = "default_max_macros_per_plugin")]
    pub max_macros_per_plugin: usize,
    #[serde(default = "default_agent_namespace")]
    pub agent_namespace: String,
    #[serde(default = "default_reserved_namespaces")]
    pub reserved_namespaces: Vec<String>,
    #[serde(default = "default_agent_hook_allowlist")]
    pub agent_hook_allowlist: Vec<String>,
    #[serde(default = "default_prohibited_patterns")]
    pub prohibited_patterns: Vec<String>,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_slow_call_warn_ms")]
    pub slow_call_warn_ms: u64,
    #[serde(default = "default_error_ring_capacity")]
    pub error_ring_capacity: usize,
    #[serde(default = "default_error_ring_surface")]
    pub error_ring_surface: usize,
    #[serde(default = "default_agent_license")]
    pub agent_license: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            rate_window_ms: default_rate_window_ms(),
            rate_budget: default_rate_budget(),
            max_agent_plugins: default_max_agent_plugins(),
            max_source_chars: default_max_source_chars(),
            max_macros_per_plugin: default_max_macros_per_plugin(),
            agent_namespace: default_agent_namespace(),
            reserved_namespaces: default_reserved_namespaces(),
            agent_hook_allowlist: default_agent_hook_allowlist(),
            prohibited_patterns: default_prohibited_patterns(),
            init_timeout_ms: default_init_timeout_ms(),
            slow_call_warn_ms: default_slow_call_warn_ms(),
            error_ring_capacity: default_error_ring_capacity(),
            error_ring_surface: default_error_ring_surface(),
            agent_license: default_agent_license(),
        }
    }
}

impl RuntimeSettings {
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window_ms: self.rate_window_ms.max(1),
            budget: self.rate_budget.max(1),
        }
    }

    pub fn namespace_policy(&self) -> NamespacePolicy {
        NamespacePolicy::new(
            self.agent_namespace.trim(),
            self.reserved_namespaces
                .iter()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty()),
        )
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            namespaces: self.namespace_policy(),
            prohibited_patterns: self
                .prohibited_patterns
                .iter()
                .filter(|pattern| !pattern.trim().is_empty())
                .cloned()
                .collect(),
            max_source_chars: self.max_source_chars.max(1),
            max_macros: self.max_macros_per_plugin.max(1),
        }
    }

    pub fn agent_hooks(&self) -> BTreeSet<String> {
        self.agent_hook_allowlist
            .iter()
            .map(|hook| hook.trim().to_string())
            .filter(|hook| !hook.is_empty())
            .collect()
    }

    pub fn normalized_init_timeout_ms(&self) -> u64 {
        self.init_timeout_ms.max(10)
    }

    pub fn normalized_error_ring_capacity(&self) -> usize {
        self.error_ring_capacity.max(1)
    }

    pub fn normalized_error_ring_surface(&self) -> usize {
        self.error_ring_surface
            .max(1)
            .min(self.normalized_error_ring_capacity())
    }

    /// Applies a project overlay. Budgets and caps only tighten, the hook
    /// allowlist only shrinks, reserved namespaces and prohibited patterns
    /// only grow. The agent namespace always comes from the user file.
    pub fn merge_overlay(&self, overlay: &ProjectSettings) -> RuntimeSettings {
        let mut merged = self.clone();
        merged.schema_version = self.schema_version.max(overlay.schema_version);

        if let Some(v) = overlay.rate_window_ms {
            merged.rate_window_ms = merged.rate_window_ms.max(v);
        }
        if let Some(v) = overlay.rate_budget {
            merged.rate_budget = merged.rate_budget.min(v);
        }
        if let Some(v) = overlay.max_agent_plugins {
            merged.max_agent_plugins = merged.max_agent_plugins.min(v);
        }
        if let Some(v) = overlay.max_source_chars {
            merged.max_source_chars = merged.max_source_chars.min(v);
        }
        if let Some(v) = overlay.max_macros_per_plugin {
            merged.max_macros_per_plugin = merged.max_macros_per_plugin.min(v);
        }
        if let Some(v) = overlay.init_timeout_ms {
            merged.init_timeout_ms = merged.init_timeout_ms.min(v);
        }
        if let Some(v) = overlay.slow_call_warn_ms {
            merged.slow_call_warn_ms = v;
        }
        if let Some(v) = overlay.error_ring_capacity {
            merged.error_ring_capacity = v;
        }
        if let Some(v) = overlay.error_ring_surface {
            merged.error_ring_surface = v;
        }
        if let Some(v) = overlay.agent_license.as_ref().filter(|v| !v.trim().is_empty()) {
            merged.agent_license = v.clone();
        }

        if let Some(hooks) = &overlay.agent_hook_allowlist {
            merged
                .agent_hook_allowlist
                .retain(|hook| hooks.iter().any(|allowed| allowed == hook));
        }
        for ns in &overlay.reserved_namespaces {
            if !merged.reserved_namespaces.iter().any(|existing| existing == ns) {
                merged.reserved_namespaces.push(ns.clone());
            }
        }
        for pattern in &overlay.prohibited_patterns {
            if !merged
                .prohibited_patterns
                .iter()
                .any(|existing| existing == pattern)
            {
                merged.prohibited_patterns.push(pattern.clone());
            }
        }
        merged
    }
}

/// Project-level overlay (`.lattice/plugins.json`). Absent keys leave the
/// user's value alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSettings {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_window_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agent_plugins: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_macros_per_plugin: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_hook_allowlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prohibited_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_call_warn_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ring_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ring_surface: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_license: Option<String>,
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join("settings.json")
}

pub fn project_settings_path(project_root: &Path) -> PathBuf {
    project_root.join(".lattice").join("plugins.json")
}

pub fn load_settings(config_dir: &Path) -> Result<RuntimeSettings> {
    load_settings_from_path(&settings_path(config_dir))
}

pub fn load_project_settings(project_root: &Path) -> Result<Option<ProjectSettings>> {
    let path = project_settings_path(project_root);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read project plugin settings: {}", path.display()))?;
    let overlay: ProjectSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse project plugin settings: {}", path.display()))?;
    Ok(Some(overlay))
}

pub fn load_effective_settings(
    config_dir: &Path,
    project_root: Option<&Path>,
) -> Result<RuntimeSettings> {
    let user = load_settings(config_dir)?;
    if let Some(project_root) = project_root {
        if let Some(project) = load_project_settings(project_root)? {
            return Ok(user.merge_overlay(&project));
        }
    }
    Ok(user)
}

pub fn save_settings(config_dir: &Path, settings: &RuntimeSettings) -> Result<()> {
    save_settings_to_path(&settings_path(config_dir), settings)
}

pub fn save_project_settings(project_root: &Path, overlay: &ProjectSettings) -> Result<()> {
    let path = project_settings_path(project_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create project config dir: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(overlay)?;
    fs::write(&path, json)
        .with_context(|| format!("write project plugin settings: {}", path.display()))?;
    Ok(())
}

fn load_settings_from_path(path: &Path) -> Result<RuntimeSettings> {
    if !path.exists() {
        return Ok(RuntimeSettings::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("read plugin settings file: {}", path.display()))?;
    let settings: RuntimeSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse plugin settings file: {}", path.display()))?;
    Ok(settings)
}

fn save_settings_to_path(path: &Path, settings: &RuntimeSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)
        .with_context(|| format!("write plugin settings file: {}", path.display()))?;
    Ok(())
}

const fn default_schema_version() -> u32 {
    1
}

const fn default_rate_window_ms() -> u64 {
    60_000
}

const fn default_rate_budget() -> u32 {
    50
}

const fn default_max_agent_plugins() -> usize {
    10
}

const fn default_max_source_chars() -> usize {
    10_000
}

const fn default_max_macros_per_plugin() -> usize {
    32
}

fn default_agent_namespace() -> String {
    "emergent-gen".to_string()
}

fn default_reserved_namespaces() -> Vec<String> {
    ["system", "governance", "admin", "auth", "plugin", "emergent-gen"]
        .iter()
        .map(|ns| ns.to_string())
        .collect()
}

fn default_agent_hook_allowlist() -> Vec<String> {
    ["dtu:afterCreate", "dtu:afterUpdate", "dtu:afterDelete"]
        .iter()
        .map(|hook| hook.to_string())
        .collect()
}

fn default_prohibited_patterns() -> Vec<String> {
    [
        "std::process",
        "std::fs",
        "unsafe",
        "extern",
        "include!",
        "env!",
        "Command::new",
        "libc::",
    ]
    .iter()
    .map(|pattern| pattern.to_string())
    .collect()
}

const fn default_init_timeout_ms() -> u64 {
    2000
}

const fn default_slow_call_warn_ms() -> u64 {
    250
}

const fn default_error_ring_capacity() -> usize {
    20
}

const fn default_error_ring_surface() -> usize {
    10
}

fn default_agent_license() -> String {
    "emergent-gen-restricted".to_string()
}
