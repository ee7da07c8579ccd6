use crate::validator::ValidationReport;

/// Every failure the plugin runtime reports to its host.
///
/// `Display` renders the wire form the host forwards to callers, `as_tag`
/// the bare code used for metrics and log fields.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("validation_failed")]
    ValidationFailed { report: ValidationReport },
    #[error("init_threw: {0}")]
    InitThrew(String),
    #[error("init_returned_not_ok")]
    InitReturnedNotOk { reason: Option<String> },
    #[error("init_timed_out")]
    InitTimedOut { elapsed_ms: u128, limit_ms: u64 },
    #[error("activation_cancelled")]
    ActivationCancelled,
    #[error("macro_register_failed:{name}")]
    MacroRegisterFailed { name: String, detail: String },
    #[error("max_emergent_plugins_reached: limit is {limit}")]
    MaxAgentPluginsReached { limit: usize },
    #[error("source_too_large")]
    SourceTooLarge { len: usize, limit: usize },
    #[error("emergentId_and_name_required")]
    ProposalIdentityRequired,
    #[error("emergent_gen_cannot_call: {domain}.*")]
    ReservedNamespace { domain: String },
    #[error("rate_limit_exceeded")]
    RateLimitExceeded,
    #[error("{0}")]
    MacroFailed(String),
    #[error("destroy_error: {0}")]
    DestroyFailed(String),
    #[error("plugin_not_loaded")]
    PluginNotLoaded { id: String },
    #[error("no_pending_plugin_with_id")]
    NoPendingPlugin { id: String },
    #[error("plugin_already_pending")]
    AlreadyPending { id: String },
}

impl PluginError {
    pub const fn as_tag(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation_failed",
            Self::InitThrew(_) => "init_threw",
            Self::InitReturnedNotOk { .. } => "init_returned_not_ok",
            Self::InitTimedOut { .. } => "init_timed_out",
            Self::ActivationCancelled => "activation_cancelled",
            Self::MacroRegisterFailed { .. } => "macro_register_failed",
            Self::MaxAgentPluginsReached { .. } => "max_emergent_plugins_reached",
            Self::SourceTooLarge { .. } => "source_too_large",
            Self::ProposalIdentityRequired => "emergentId_and_name_required",
            Self::ReservedNamespace { .. } => "emergent_gen_cannot_call",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::MacroFailed(_) => "macro_failed",
            Self::DestroyFailed(_) => "destroy_error",
            Self::PluginNotLoaded { .. } => "plugin_not_loaded",
            Self::NoPendingPlugin { .. } => "no_pending_plugin_with_id",
            Self::AlreadyPending { .. } => "plugin_already_pending",
        }
    }

    pub fn validation_errors(&self) -> &[String] {
        match self {
            Self::ValidationFailed { report } => &report.errors,
            _ => &[],
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_tags() {
        assert_eq!(
            PluginError::MaxAgentPluginsReached { limit: 10 }.to_string(),
            "max_emergent_plugins_reached: limit is 10"
        );
        assert_eq!(
            PluginError::ReservedNamespace {
                domain: "system".to_string()
            }
            .to_string(),
            "emergent_gen_cannot_call: system.*"
        );
        assert_eq!(
            PluginError::MacroRegisterFailed {
                name: "notes.pin".to_string(),
                detail: "duplicate".to_string(),
            }
            .to_string(),
            "macro_register_failed:notes.pin"
        );
        assert_eq!(
            PluginError::MacroFailed("boom".to_string()).to_string(),
            "boom"
        );
    }

    #[test]
    fn tags_drop_detail() {
        let err = PluginError::InitThrew("bad state".to_string());
        assert_eq!(err.to_string(), "init_threw: bad state");
        assert_eq!(err.as_tag(), "init_threw");
        assert!(err.validation_errors().is_empty());
    }
}
