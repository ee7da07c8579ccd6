pub mod clock;
pub mod compiler;
pub mod context;
pub mod error;
pub mod governance;
pub mod guard;
pub mod hooks;
pub mod host;
pub mod metrics;
pub mod plugin;
pub mod plugin_protocol;
pub mod plugin_transport;
pub mod process_runtime;
pub mod rate_limit;
pub mod registry;
pub mod settings;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compiler::{AgentProposal, CompiledPlugin, ProposalIntent, ProposedHandler, RuntimeCompiler};
pub use context::{ContextServices, PluginContext, PluginStore, RateLimitView};
pub use error::{PluginError, PluginResult};
pub use governance::{GovernanceProposal, GovernanceQueue, PendingGovernance};
pub use hooks::{DispatchError, DispatchOutcome, HookName};
pub use host::{
    Dtu, EmergentView, HostLogger, HostState, LogLevel, MacroActor, MacroCallContext, MacroHost,
    MacroMetadata, MemoryHostState, MemoryMacroHost, TracingLogger,
};
pub use metrics::{LoadErrorRecord, MetricsSnapshot};
pub use plugin::{ActivationCancellation, InitResult, PluginIntent, PluginManifest, PluginModule};
pub use process_runtime::{
    process_plugin_module, ProcessHandle, ProcessRuntimeConfig, ProcessTelemetry,
};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::{HostServices, PluginRegistry, PluginSummary, RegisterOptions};
pub use settings::{ProjectSettings, RuntimeSettings};
pub use validator::{GateValidator, PluginValidator, ValidationReport, ValidationRequest};
