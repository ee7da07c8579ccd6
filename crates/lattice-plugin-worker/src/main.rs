use lattice_core::plugin_protocol::PluginWireMessage;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

struct WorkerKnobs {
    delay_ms: u64,
    init_ok: bool,
    failing_hooks: Vec<String>,
    fail_tick: bool,
    protocol_override: Option<u32>,
    reported_hooks: Option<Vec<String>>,
}

impl WorkerKnobs {
    fn from_env() -> Self {
        Self {
            delay_ms: env_var("LATTICE_PLUGIN_WORKER_DELAY_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
            init_ok: env_var("LATTICE_PLUGIN_WORKER_INIT_OK")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(true),
            failing_hooks: env_var("LATTICE_PLUGIN_WORKER_FAIL_HOOKS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            fail_tick: env_var("LATTICE_PLUGIN_WORKER_FAIL_TICK")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            protocol_override: env_var("LATTICE_PLUGIN_WORKER_PROTOCOL_VERSION")
                .and_then(|v| v.parse::<u32>().ok()),
            reported_hooks: env_var("LATTICE_PLUGIN_WORKER_REPORTED_HOOKS").map(|raw| split_list(&raw)),
        }
    }

    fn pause(&self, budget_ms: u64) {
        if self.delay_ms > 0 {
            let sleep_ms = self.delay_ms.min(budget_ms.saturating_mul(3).max(1));
            thread::sleep(Duration::from_millis(sleep_ms));
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let knobs = WorkerKnobs::from_env();
    let plugin_id = env_var("LATTICE_PLUGIN_ID").unwrap_or_else(|| "unknown".to_string());
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut seen_handshake = false;
    let mut initialized = false;
    let mut declared_hooks: Vec<String> = Vec::new();

    info!(plugin_id = %plugin_id, "plugin worker started");

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<PluginWireMessage>(trimmed) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "unreadable host message");
                break;
            }
        };
        debug!(?message, "host message");

        let response = match message {
            PluginWireMessage::Handshake {
                protocol_version,
                supported_protocol_versions,
                hooks,
                ..
            } => {
                seen_handshake = true;
                let selected_protocol_version = if supported_protocol_versions
                    .iter()
                    .any(|candidate| *candidate == protocol_version)
                {
                    protocol_version
                } else {
                    supported_protocol_versions
                        .iter()
                        .copied()
                        .max()
                        .unwrap_or(protocol_version)
                };
                declared_hooks = hooks.clone();
                PluginWireMessage::HandshakeAck {
                    protocol_version: knobs.protocol_override.unwrap_or(selected_protocol_version),
                    accepted: true,
                    reason: None,
                    reported_hooks: knobs.reported_hooks.clone().unwrap_or(hooks),
                }
            }
            PluginWireMessage::Init {
                request_id,
                timeout_ms,
            } => {
                if !seen_handshake {
                    break;
                }
                knobs.pause(timeout_ms);
                initialized = knobs.init_ok;
                PluginWireMessage::InitResult {
                    request_id,
                    ok: knobs.init_ok,
                    reason: (!knobs.init_ok).then(|| "worker init failed".to_string()),
                }
            }
            PluginWireMessage::Hook {
                request_id, hook, ..
            } => {
                if !initialized {
                    break;
                }
                knobs.pause(1_000);
                let error = if !declared_hooks.contains(&hook) {
                    Some(format!("hook not declared: {hook}"))
                } else if knobs.failing_hooks.contains(&hook) {
                    Some(format!("worker hook failed: {hook}"))
                } else {
                    None
                };
                PluginWireMessage::CallResult {
                    request_id,
                    ok: error.is_none(),
                    error,
                }
            }
            PluginWireMessage::Tick { request_id } => {
                if !initialized {
                    break;
                }
                knobs.pause(1_000);
                PluginWireMessage::CallResult {
                    request_id,
                    ok: !knobs.fail_tick,
                    error: knobs.fail_tick.then(|| "worker tick failed".to_string()),
                }
            }
            PluginWireMessage::Ping { request_id } => {
                if !seen_handshake {
                    break;
                }
                PluginWireMessage::Pong { request_id }
            }
            PluginWireMessage::Cancel { request_id, reason } => {
                info!(%request_id, %reason, "host cancelled request");
                break;
            }
            PluginWireMessage::Shutdown => {
                info!(plugin_id = %plugin_id, "shutdown requested");
                break;
            }
            PluginWireMessage::HandshakeAck { .. }
            | PluginWireMessage::InitResult { .. }
            | PluginWireMessage::CallResult { .. }
            | PluginWireMessage::Pong { .. } => continue,
        };

        if write_message(&mut stdout, &response).is_err() {
            break;
        }
    }
}

fn write_message(stdout: &mut impl Write, message: &PluginWireMessage) -> io::Result<()> {
    let payload = serde_json::to_string(message)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    stdout.write_all(payload.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()
}
