use crate::context::PluginContext;
use crate::plugin::{HookFn, InitResult, PluginManifest, PluginModule, TickFn};
use crate::plugin_protocol::{PluginWireMessage, PLUGIN_PROTOCOL_VERSION};
use crate::plugin_transport::{PluginTransport, StdioProcessTransport};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRuntimeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub extra_env: HashMap<String, String>,
    pub watchdog_interval_ms: u64,
    pub protocol_version: u32,
    pub supported_protocol_versions: Vec<u32>,
    /// Budget for spawn, handshake and `init` together.
    pub startup_timeout_ms: u64,
    /// Budget for each hook or tick round trip.
    pub call_timeout_ms: u64,
    pub hooks: Vec<String>,
    pub tick: bool,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        #[cfg(target_os = "windows")]
        let worker_binary = "lattice-plugin-worker.exe";
        #[cfg(not(target_os = "windows"))]
        let worker_binary = "lattice-plugin-worker";

        let worker_path = std::env::var("LATTICE_PLUGIN_WORKER_BIN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| worker_binary.to_string());

        Self {
            command: worker_path,
            args: Vec::new(),
            extra_env: HashMap::new(),
            watchdog_interval_ms: 10,
            protocol_version: PLUGIN_PROTOCOL_VERSION,
            supported_protocol_versions: vec![PLUGIN_PROTOCOL_VERSION],
            startup_timeout_ms: 5_000,
            call_timeout_ms: 1_000,
            hooks: Vec::new(),
            tick: false,
        }
    }
}

impl ProcessRuntimeConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    fn normalized_watchdog_interval_ms(&self) -> u64 {
        self.watchdog_interval_ms.max(1)
    }

    fn normalized_supported_protocol_versions(&self) -> Vec<u32> {
        let mut versions = self
            .supported_protocol_versions
            .iter()
            .copied()
            .filter(|v| *v > 0)
            .collect::<Vec<_>>();
        if !versions.contains(&self.protocol_version) {
            versions.push(self.protocol_version);
        }
        versions.sort_unstable();
        versions.dedup();
        versions.reverse();
        versions
    }

    fn negotiate_protocol(&self, worker_version: u32) -> Option<u32> {
        if worker_version == 0 {
            return None;
        }
        self.normalized_supported_protocol_versions()
            .contains(&worker_version)
            .then_some(worker_version)
    }

    fn normalized_startup_timeout_ms(&self) -> u64 {
        self.startup_timeout_ms.max(10)
    }

    fn normalized_call_timeout_ms(&self) -> u64 {
        self.call_timeout_ms.max(10)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessTelemetry {
    pub spawn_count: u64,
    pub handshake_count: u64,
    pub call_count: u64,
    pub timeout_count: u64,
    pub failure_count: u64,
}

enum WaitError {
    TimedOut,
    Transport(String),
}

fn recv_with_watchdog(
    transport: &mut dyn PluginTransport,
    deadline: Instant,
    request_id: Option<&str>,
    watchdog_tick: Duration,
) -> Result<PluginWireMessage, WaitError> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut);
        }

        let wait_for = deadline.saturating_duration_since(now).min(watchdog_tick);
        match transport.receive(wait_for) {
            Ok(Some(message)) => {
                if let (Some(expected), Some(actual)) = (request_id, message.request_id()) {
                    if expected != actual {
                        continue;
                    }
                }
                return Ok(message);
            }
            Ok(None) => continue,
            Err(err) => return Err(WaitError::Transport(err)),
        }
    }
}

struct WorkerSession {
    transport: Box<dyn PluginTransport>,
}

/// Owns the worker children for one process-backed plugin, one per
/// activation. A reload starts the new activation's worker before the old
/// activation is destroyed, so both may briefly be alive; calls always go to
/// the newest.
struct ProcessWorker {
    manifest: PluginManifest,
    config: ProcessRuntimeConfig,
    sessions: Mutex<BTreeMap<u64, WorkerSession>>,
    telemetry: Mutex<ProcessTelemetry>,
    next_request: Mutex<u64>,
}

impl ProcessWorker {
    fn new(manifest: PluginManifest, config: ProcessRuntimeConfig) -> Self {
        Self {
            manifest,
            config,
            sessions: Mutex::new(BTreeMap::new()),
            telemetry: Mutex::new(ProcessTelemetry::default()),
            next_request: Mutex::new(0),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<u64, WorkerSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn telemetry(&self) -> MutexGuard<'_, ProcessTelemetry> {
        self.telemetry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_request_id(&self, prefix: &str) -> String {
        let mut next = self
            .next_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *next = next.saturating_add(1);
        format!("{prefix}-{}-{}", self.manifest.id, *next)
    }

    fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.config.normalized_watchdog_interval_ms())
    }

    fn start(&self, activation: u64) -> Result<InitResult, String> {
        if let Some(mut stale) = self.sessions().remove(&activation) {
            stale.transport.terminate();
        }

        if self.config.command.trim().is_empty() {
            return Err("process runtime command is empty".to_string());
        }

        let startup_ms = self.config.normalized_startup_timeout_ms();
        let deadline = Instant::now() + Duration::from_millis(startup_ms);
        let mut session = self.spawn(startup_ms)?;

        let started = self
            .handshake(session.transport.as_mut(), deadline)
            .and_then(|()| self.request_init(session.transport.as_mut(), deadline, startup_ms));
        match started {
            Ok(result) => {
                if result.ok {
                    self.sessions().insert(activation, session);
                } else {
                    session.transport.terminate();
                }
                Ok(result)
            }
            Err(err) => {
                self.telemetry().failure_count += 1;
                session.transport.terminate();
                Err(err)
            }
        }
    }

    fn spawn(&self, startup_ms: u64) -> Result<WorkerSession, String> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env("LATTICE_PLUGIN_ID", self.manifest.id.as_str())
            .env("LATTICE_PLUGIN_VERSION", self.manifest.version.as_str())
            .env("LATTICE_PLUGIN_TIMEOUT_MS", startup_ms.to_string());

        for (key, value) in &self.config.extra_env {
            command.env(key, value);
        }

        let transport = StdioProcessTransport::spawn(&mut command, &self.manifest.id)?;
        self.telemetry().spawn_count += 1;
        debug!(plugin_id = %self.manifest.id, command = %self.config.command, "spawned plugin worker");
        Ok(WorkerSession {
            transport: Box::new(transport),
        })
    }

    fn handshake(&self, transport: &mut dyn PluginTransport, deadline: Instant) -> Result<(), String> {
        transport.send(&PluginWireMessage::Handshake {
            protocol_version: self.config.protocol_version,
            supported_protocol_versions: self.config.normalized_supported_protocol_versions(),
            plugin_id: self.manifest.id.clone(),
            plugin_version: self.manifest.version.clone(),
            hooks: self.config.hooks.clone(),
            tick: self.config.tick,
        })?;

        match recv_with_watchdog(transport, deadline, None, self.watchdog_tick()) {
            Ok(PluginWireMessage::HandshakeAck {
                protocol_version,
                accepted,
                reason,
                reported_hooks,
            }) => {
                if !accepted {
                    return Err(reason.unwrap_or_else(|| "worker handshake rejected".to_string()));
                }
                if self.config.negotiate_protocol(protocol_version).is_none() {
                    return Err(format!(
                        "protocol version mismatch: host_supported={:?} worker={}",
                        self.config.normalized_supported_protocol_versions(),
                        protocol_version
                    ));
                }

                let declared = self.config.hooks.iter().cloned().collect::<BTreeSet<_>>();
                let undeclared = reported_hooks
                    .into_iter()
                    .filter(|hook| !declared.contains(hook))
                    .collect::<Vec<_>>();
                if !undeclared.is_empty() {
                    return Err(format!(
                        "worker reported undeclared hooks: {}",
                        undeclared.join(",")
                    ));
                }
                self.telemetry().handshake_count += 1;
                Ok(())
            }
            Ok(_) => Err("unexpected worker message before handshake ack".to_string()),
            Err(WaitError::TimedOut) => {
                self.telemetry().timeout_count += 1;
                Err("worker handshake timed out".to_string())
            }
            Err(WaitError::Transport(err)) => Err(err),
        }
    }

    fn request_init(
        &self,
        transport: &mut dyn PluginTransport,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<InitResult, String> {
        let request_id = self.next_request_id("init");
        transport.send(&PluginWireMessage::Init {
            request_id: request_id.clone(),
            timeout_ms,
        })?;

        match recv_with_watchdog(transport, deadline, Some(&request_id), self.watchdog_tick()) {
            Ok(PluginWireMessage::InitResult { ok, reason, .. }) => Ok(InitResult { ok, reason }),
            Ok(_) => Err("unexpected worker message before init result".to_string()),
            Err(WaitError::TimedOut) => {
                self.telemetry().timeout_count += 1;
                let _ = transport.send(&PluginWireMessage::Cancel {
                    request_id,
                    reason: "host_timeout".to_string(),
                });
                Err("worker init timed out".to_string())
            }
            Err(WaitError::Transport(err)) => Err(err),
        }
    }

    /// One request/response round trip against the newest activation's
    /// worker. A timeout or transport failure kills that worker; later calls
    /// fail until the plugin is re-activated.
    fn call(&self, prefix: &str, build: impl FnOnce(String) -> PluginWireMessage) -> Result<(), String> {
        let mut sessions = self.sessions();
        let Some(mut entry) = sessions.last_entry() else {
            return Err("plugin worker is not running".to_string());
        };

        let request_id = self.next_request_id(prefix);
        let deadline = Instant::now() + Duration::from_millis(self.config.normalized_call_timeout_ms());
        self.telemetry().call_count += 1;

        let session = entry.get_mut();
        let outcome = session
            .transport
            .send(&build(request_id.clone()))
            .map_err(WaitError::Transport)
            .and_then(|()| {
                recv_with_watchdog(
                    session.transport.as_mut(),
                    deadline,
                    Some(&request_id),
                    self.watchdog_tick(),
                )
            });

        match outcome {
            Ok(PluginWireMessage::CallResult { ok: true, .. }) => Ok(()),
            Ok(PluginWireMessage::CallResult { error, .. }) => {
                Err(error.unwrap_or_else(|| "worker call failed".to_string()))
            }
            Ok(_) => Err("unexpected worker message before call result".to_string()),
            Err(failure) => {
                let detail = match failure {
                    WaitError::TimedOut => {
                        self.telemetry().timeout_count += 1;
                        let _ = session.transport.send(&PluginWireMessage::Cancel {
                            request_id,
                            reason: "host_timeout".to_string(),
                        });
                        format!("worker {prefix} call timed out")
                    }
                    WaitError::Transport(err) => {
                        self.telemetry().failure_count += 1;
                        err
                    }
                };
                warn!(plugin_id = %self.manifest.id, error = %detail, "stopping plugin worker");
                let mut session = entry.remove();
                session.transport.terminate();
                Err(detail)
            }
        }
    }

    /// Stops the worker started by `activation`, leaving any newer one alone.
    fn stop(&self, activation: u64) {
        let stopped = self.sessions().remove(&activation);
        if let Some(mut session) = stopped {
            let _ = session.transport.send(&PluginWireMessage::Shutdown);
            session.transport.terminate();
            info!(plugin_id = %self.manifest.id, activation, "plugin worker stopped");
        }
    }

    fn stop_all(&self) {
        let activations = self.sessions().keys().copied().collect::<Vec<_>>();
        for activation in activations {
            self.stop(activation);
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Observes the workers behind a module built by [`process_plugin_module`].
#[derive(Clone)]
pub struct ProcessHandle {
    worker: Arc<ProcessWorker>,
}

impl ProcessHandle {
    pub fn telemetry(&self) -> ProcessTelemetry {
        self.worker.telemetry().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.worker.sessions().is_empty()
    }

    /// Live worker children; more than one only while a reload is in flight.
    pub fn worker_count(&self) -> usize {
        self.worker.sessions().len()
    }
}

/// Builds a module whose callables forward to a worker process.
///
/// Each activation spawns and handshakes its own worker inside `init`;
/// `destroy` shuts down only the worker of the activation being torn down.
/// Hooks and the tick are those declared in `config`.
pub fn process_plugin_module(
    manifest: PluginManifest,
    config: ProcessRuntimeConfig,
) -> (PluginModule, ProcessHandle) {
    let hooks = config.hooks.clone();
    let tick = config.tick;
    let worker = Arc::new(ProcessWorker::new(manifest.clone(), config));

    let init_worker = worker.clone();
    let destroy_worker = worker.clone();
    let mut module = PluginModule::new(manifest, move |ctx: &PluginContext| {
        init_worker.start(ctx.activation_id())
    })
    .with_destroy(move |ctx: &PluginContext| {
        destroy_worker.stop(ctx.activation_id());
        Ok(())
    });

    for hook in hooks {
        let hook_worker = worker.clone();
        let name = hook.clone();
        let handler: HookFn = Arc::new(move |payload: &Value| {
            let hook = name.clone();
            let payload = payload.clone();
            hook_worker.call("hook", move |request_id| PluginWireMessage::Hook {
                request_id,
                hook,
                payload,
            })
        });
        module.hooks.insert(hook, handler);
    }

    if tick {
        let tick_worker = worker.clone();
        let handler: TickFn = Arc::new(move |_: &PluginContext| {
            tick_worker.call("tick", |request_id| PluginWireMessage::Tick { request_id })
        });
        module.tick = Some(handler);
    }

    (module, ProcessHandle { worker })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedTransport {
        sent: Arc<Mutex<Vec<PluginWireMessage>>>,
        replies: VecDeque<PluginWireMessage>,
    }

    impl PluginTransport for ScriptedTransport {
        fn send(&mut self, message: &PluginWireMessage) -> Result<(), String> {
            self.sent.lock().expect("sent").push(message.clone());
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<PluginWireMessage>, String> {
            Ok(self.replies.pop_front())
        }

        fn terminate(&mut self) {}
    }

    fn worker_with(replies: Vec<PluginWireMessage>) -> (ProcessWorker, Arc<Mutex<Vec<PluginWireMessage>>>) {
        let mut config = ProcessRuntimeConfig::new("unused", Vec::new());
        config.call_timeout_ms = 20;
        config.watchdog_interval_ms = 1;
        let worker = ProcessWorker::new(PluginManifest::new("x.proc", "Proc", "0.1.0"), config);
        let transport = ScriptedTransport {
            replies: VecDeque::from(replies),
            ..ScriptedTransport::default()
        };
        let sent = transport.sent.clone();
        worker.sessions().insert(
            1,
            WorkerSession {
                transport: Box::new(transport),
            },
        );
        (worker, sent)
    }

    #[test]
    fn config_negotiates_protocol_from_supported_set() {
        let mut config = ProcessRuntimeConfig::new("worker", Vec::new());
        config.protocol_version = 2;
        config.supported_protocol_versions = vec![1, 0, 2, 1];

        assert_eq!(config.normalized_supported_protocol_versions(), vec![2, 1]);
        assert_eq!(config.negotiate_protocol(1), Some(1));
        assert_eq!(config.negotiate_protocol(3), None);
        assert_eq!(config.negotiate_protocol(0), None);
    }

    #[test]
    fn call_skips_stale_replies_and_matches_request_ids() {
        let (worker, sent) = worker_with(vec![
            PluginWireMessage::CallResult {
                request_id: "tick-x.proc-0".to_string(),
                ok: false,
                error: Some("stale".to_string()),
            },
            PluginWireMessage::CallResult {
                request_id: "tick-x.proc-1".to_string(),
                ok: true,
                error: None,
            },
        ]);

        worker
            .call("tick", |request_id| PluginWireMessage::Tick { request_id })
            .expect("tick");
        assert_eq!(sent.lock().expect("sent").len(), 1);
        assert_eq!(worker.telemetry().call_count, 1);
    }

    #[test]
    fn call_reports_worker_errors_and_keeps_running() {
        let (worker, _) = worker_with(vec![PluginWireMessage::CallResult {
            request_id: "hook-x.proc-1".to_string(),
            ok: false,
            error: Some("handler failed".to_string()),
        }]);

        let err = worker
            .call("hook", |request_id| PluginWireMessage::Hook {
                request_id,
                hook: "dtu:afterCreate".to_string(),
                payload: Value::Null,
            })
            .expect_err("worker error");
        assert_eq!(err, "handler failed");
        assert_eq!(worker.sessions().len(), 1);
    }

    #[test]
    fn call_timeout_cancels_and_stops_the_worker() {
        let (worker, sent) = worker_with(Vec::new());

        let err = worker
            .call("tick", |request_id| PluginWireMessage::Tick { request_id })
            .expect_err("timeout");
        assert_eq!(err, "worker tick call timed out");
        assert!(worker.sessions().is_empty());
        assert_eq!(worker.telemetry().timeout_count, 1);
        assert!(sent
            .lock()
            .expect("sent")
            .iter()
            .any(|message| matches!(message, PluginWireMessage::Cancel { .. })));

        let err = worker
            .call("tick", |request_id| PluginWireMessage::Tick { request_id })
            .expect_err("stopped");
        assert_eq!(err, "plugin worker is not running");
    }

    #[test]
    fn stopping_an_old_activation_keeps_the_newer_worker() {
        let (worker, old_sent) = worker_with(Vec::new());
        let newer = ScriptedTransport {
            replies: VecDeque::from(vec![PluginWireMessage::CallResult {
                request_id: "tick-x.proc-1".to_string(),
                ok: true,
                error: None,
            }]),
            ..ScriptedTransport::default()
        };
        let new_sent = newer.sent.clone();
        worker.sessions().insert(
            2,
            WorkerSession {
                transport: Box::new(newer),
            },
        );

        worker.stop(1);
        assert!(old_sent
            .lock()
            .expect("sent")
            .iter()
            .any(|message| matches!(message, PluginWireMessage::Shutdown)));
        assert_eq!(worker.sessions().keys().copied().collect::<Vec<_>>(), vec![2]);

        worker
            .call("tick", |request_id| PluginWireMessage::Tick { request_id })
            .expect("newer worker answers");
        assert_eq!(new_sent.lock().expect("sent").len(), 1);

        worker.stop(1);
        assert_eq!(worker.sessions().len(), 1);
    }

    #[test]
    fn spawn_failure_surfaces_as_init_error() {
        let mut config = ProcessRuntimeConfig::new("__lattice_missing_worker__", Vec::new());
        config.hooks = vec!["dtu:afterCreate".to_string()];
        config.tick = true;
        let (module, handle) =
            process_plugin_module(PluginManifest::new("x.missing", "Missing", "0.1.0"), config);

        assert!(module.hooks.contains_key("dtu:afterCreate"));
        assert!(module.tick.is_some());

        let fx = crate::context::tests::fixture();
        let ctx = crate::context::PluginContext::new("x.missing", false, fx.services.clone());
        let err = (module.init)(&ctx).expect_err("spawn fails");
        assert!(err.starts_with("spawn plugin worker failed"));
        assert!(!handle.is_running());
        assert_eq!(handle.telemetry().spawn_count, 0);
    }
}
