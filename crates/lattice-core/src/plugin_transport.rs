use crate::plugin_protocol::PluginWireMessage;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// A bidirectional channel to one worker process.
pub trait PluginTransport: Send {
    fn send(&mut self, message: &PluginWireMessage) -> Result<(), String>;
    fn receive(&mut self, timeout: Duration) -> Result<Option<PluginWireMessage>, String>;
    fn terminate(&mut self);
}

/// Worker child speaking JSON lines over its stdio. The child is killed when
/// the transport is terminated or dropped, so a worker never outlives the
/// activation that spawned it.
pub struct StdioProcessTransport {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    rx: Receiver<Result<PluginWireMessage, String>>,
}

impl StdioProcessTransport {
    /// Spawns `command` with piped stdin/stdout. Stderr is inherited so the
    /// worker's logs reach the host's stderr.
    pub fn spawn(command: &mut Command, label: &str) -> Result<Self, String> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| format!("spawn plugin worker failed: {err}"))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_and_wait(&mut child);
            return Err("worker stdio is not piped".to_string());
        };
        let rx = match spawn_reader_thread(stdout, label) {
            Ok(rx) => rx,
            Err(err) => {
                kill_and_wait(&mut child);
                return Err(err);
            }
        };

        debug!(worker = %label, pid = child.id(), "plugin worker spawned");
        Ok(Self {
            label: label.to_string(),
            child,
            stdin: Some(stdin),
            rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn exit_detail(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("worker exited: {status}"),
            Ok(None) => "worker closed stdout".to_string(),
            Err(err) => format!("worker status unavailable: {err}"),
        }
    }
}

impl PluginTransport for StdioProcessTransport {
    fn send(&mut self, message: &PluginWireMessage) -> Result<(), String> {
        let mut line = serde_json::to_string(message)
            .map_err(|err| format!("serialize worker message failed: {err}"))?;
        line.push('\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err("worker stdin is closed".to_string());
        };
        if let Err(err) = stdin.write_all(line.as_bytes()).and_then(|()| stdin.flush()) {
            self.stdin = None;
            return Err(format!("write worker stdin failed: {err}"));
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<PluginWireMessage>, String> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.exit_detail()),
        }
    }

    fn terminate(&mut self) {
        self.stdin = None;
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        kill_and_wait(&mut self.child);
        debug!(worker = %self.label, "plugin worker killed");
    }
}

impl Drop for StdioProcessTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_reader_thread(
    stdout: impl Read + Send + 'static,
    label: &str,
) -> Result<Receiver<Result<PluginWireMessage, String>>, String> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("plugin-worker-{label}"))
        .spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        let _ = tx.send(Err(format!("read worker stdout failed: {err}")));
                        return;
                    }
                };

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let parsed = serde_json::from_str::<PluginWireMessage>(trimmed)
                    .map_err(|err| format!("invalid worker message: {err}"));
                if tx.send(parsed).is_err() {
                    return;
                }
            }
        })
        .map_err(|err| format!("spawn worker reader failed: {err}"))?;
    Ok(rx)
}

fn kill_and_wait(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
