use crate::clock::format_epoch_ms;
use crate::compiler::CompiledPlugin;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{PluginIntent, PluginModule};
use crate::validator::GateResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the external governance process votes on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceProposal {
    pub plugin_id: String,
    pub emergent_id: String,
    pub name: String,
    pub description: Option<String>,
    pub intent: Option<PluginIntent>,
    pub macro_count: usize,
    pub hook_count: usize,
    pub has_tick: bool,
    pub gates: Vec<GateResult>,
    pub rejected_handlers: Vec<String>,
    pub dropped_hooks: Vec<String>,
    pub proposed_at_ms: u64,
    pub submitted_at_ms: u64,
    pub submitted_at: String,
}

/// A compiled module parked until governance decides on it.
#[derive(Clone, Debug)]
pub struct PendingGovernance {
    pub proposal: GovernanceProposal,
    pub module: PluginModule,
    pub source: String,
}

#[derive(Debug, Default)]
pub struct GovernanceQueue {
    entries: HashMap<String, PendingGovernance>,
}

impl GovernanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(
        &mut self,
        compiled: CompiledPlugin,
        submitted_at_ms: u64,
    ) -> PluginResult<GovernanceProposal> {
        let plugin_id = compiled.module.id().to_string();
        if self.entries.contains_key(&plugin_id) {
            return Err(PluginError::AlreadyPending { id: plugin_id });
        }

        let manifest = &compiled.module.manifest;
        let proposal = GovernanceProposal {
            plugin_id: plugin_id.clone(),
            emergent_id: compiled.emergent_id.clone(),
            name: manifest.name.clone(),
            description: manifest.description.clone(),
            intent: manifest.intent.clone(),
            macro_count: compiled.module.macros.len(),
            hook_count: compiled.module.hooks.len(),
            has_tick: compiled.module.tick.is_some(),
            gates: compiled.validation.gates.clone(),
            rejected_handlers: compiled.rejected_handlers.clone(),
            dropped_hooks: compiled.dropped_hooks.clone(),
            proposed_at_ms: compiled.proposed_at_ms,
            submitted_at_ms,
            submitted_at: format_epoch_ms(submitted_at_ms),
        };

        self.entries.insert(
            plugin_id,
            PendingGovernance {
                proposal: proposal.clone(),
                module: compiled.module,
                source: compiled.source,
            },
        );
        Ok(proposal)
    }

    pub fn get(&self, plugin_id: &str) -> Option<&PendingGovernance> {
        self.entries.get(plugin_id)
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.entries.contains_key(plugin_id)
    }

    pub fn take(&mut self, plugin_id: &str) -> PluginResult<PendingGovernance> {
        self.entries
            .remove(plugin_id)
            .ok_or_else(|| PluginError::NoPendingPlugin {
                id: plugin_id.to_string(),
            })
    }

    /// Pending proposals, oldest submission first.
    pub fn proposals(&self) -> Vec<GovernanceProposal> {
        let mut proposals = self
            .entries
            .values()
            .map(|entry| entry.proposal.clone())
            .collect::<Vec<_>>();
        proposals.sort_by(|a, b| {
            a.submitted_at_ms
                .cmp(&b.submitted_at_ms)
                .then_with(|| a.plugin_id.cmp(&b.plugin_id))
        });
        proposals
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
