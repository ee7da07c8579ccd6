use crate::guard::guarded_timed;
use crate::plugin::HookFn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookName {
    DtuBeforeCreate,
    DtuAfterCreate,
    DtuBeforeUpdate,
    DtuAfterUpdate,
    DtuBeforeDelete,
    DtuAfterDelete,
    MacroBeforeExecute,
    MacroAfterExecute,
}

impl HookName {
    pub const ALL: [HookName; 8] = [
        Self::DtuBeforeCreate,
        Self::DtuAfterCreate,
        Self::DtuBeforeUpdate,
        Self::DtuAfterUpdate,
        Self::DtuBeforeDelete,
        Self::DtuAfterDelete,
        Self::MacroBeforeExecute,
        Self::MacroAfterExecute,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DtuBeforeCreate => "dtu:beforeCreate",
            Self::DtuAfterCreate => "dtu:afterCreate",
            Self::DtuBeforeUpdate => "dtu:beforeUpdate",
            Self::DtuAfterUpdate => "dtu:afterUpdate",
            Self::DtuBeforeDelete => "dtu:beforeDelete",
            Self::DtuAfterDelete => "dtu:afterDelete",
            Self::MacroBeforeExecute => "macro:beforeExecute",
            Self::MacroAfterExecute => "macro:afterExecute",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        input.parse().ok()
    }

    /// Before-hooks run ahead of a mutation and can observe or stall it.
    pub fn is_before(self) -> bool {
        self.as_str().contains("before")
    }
}

impl std::str::FromStr for HookName {
    type Err = ();

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|hook| hook.as_str() == input.trim())
            .ok_or(())
    }
}

impl std::fmt::Display for HookName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct HookSubscriber {
    pub plugin_id: String,
    pub handler: HookFn,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchError {
    pub plugin_id: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub called: usize,
    pub errors: Vec<DispatchError>,
}

/// Ordered subscriber lists, one per known hook name.
#[derive(Clone, Default)]
pub struct HookTable {
    lists: BTreeMap<HookName, Vec<HookSubscriber>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, hook: HookName, plugin_id: &str, handler: HookFn) {
        self.lists.entry(hook).or_default().push(HookSubscriber {
            plugin_id: plugin_id.to_string(),
            handler,
        });
    }

    /// Drops every entry owned by `plugin_id` from every list.
    pub fn remove_plugin(&mut self, plugin_id: &str) -> usize {
        let mut removed = 0;
        for list in self.lists.values_mut() {
            let before = list.len();
            list.retain(|subscriber| subscriber.plugin_id != plugin_id);
            removed += before - list.len();
        }
        self.lists.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn subscriber_ids(&self, hook: HookName) -> Vec<&str> {
        self.lists
            .get(&hook)
            .map(|list| list.iter().map(|s| s.plugin_id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn count_for(&self, plugin_id: &str) -> usize {
        self.lists
            .values()
            .flatten()
            .filter(|subscriber| subscriber.plugin_id == plugin_id)
            .count()
    }

    pub fn fire(&self, hook: HookName, payload: &Value, slow_call_warn_ms: u64) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let Some(list) = self.lists.get(&hook) else {
            return outcome;
        };

        for subscriber in list {
            let call = guarded_timed(|| (subscriber.handler)(payload));
            if call.elapsed_ms > slow_call_warn_ms as u128 {
                warn!(
                    plugin_id = %subscriber.plugin_id,
                    hook = hook.as_str(),
                    elapsed_ms = call.elapsed_ms as u64,
                    "slow hook handler"
                );
            }
            match call.result {
                Ok(()) => outcome.called += 1,
                Err(error) => {
                    debug!(plugin_id = %subscriber.plugin_id, hook = hook.as_str(), %error, "hook handler failed");
                    outcome.errors.push(DispatchError {
                        plugin_id: subscriber.plugin_id.clone(),
                        error,
                    });
                }
            }
        }
        outcome
    }
}
