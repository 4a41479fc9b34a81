//! WhatsApp bridge adapter.
//!
//! Drives the headless-browser bridge as a subprocess speaking newline-delimited JSON on
//! stdin/stdout. Commands go in (`init`, `send`, `destroy`); lifecycle events and send
//! acknowledgements come out and are forwarded to the connection manager.

use std::{
    collections::{HashMap, VecDeque},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use relay_core::{
    connection::{BridgeInvocation, ClientEvent, EventSender, MessagingClient},
    domain::{ChatAddress, PairingCode, SessionBlob},
    errors::Error,
    utils::truncate_text,
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

/// How long `destroy` gets before the bridge is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on a single command write when the bridge stops reading stdin.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingSends = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<()>>>>>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Init {
        session: Option<&'a serde_json::Value>,
    },
    Send {
        id: u64,
        to: &'a str,
        text: &'a str,
    },
    Destroy,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeMessage {
    Qr {
        code: String,
    },
    Authenticated {
        #[serde(default)]
        session: Option<serde_json::Value>,
    },
    Ready,
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    SendResult {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Locked apart from `Running` so a stalled write never blocks `shutdown`.
type SharedStdin = Arc<Mutex<ChildStdin>>;

struct Running {
    child: Child,
    stdin: SharedStdin,
    reader: JoinHandle<()>,
    /// Cancelled when we stop the bridge on purpose, so its exit is not reported as fatal.
    stopping: CancellationToken,
}

pub struct BridgeClient {
    inv: BridgeInvocation,
    running: Mutex<Option<Running>>,
    pending: PendingSends,
    next_id: AtomicU64,
}

impl BridgeClient {
    pub fn new(inv: BridgeInvocation) -> Self {
        Self {
            inv,
            running: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    async fn stop(&self, running: Running) -> Result<()> {
        let Running {
            mut child,
            stdin,
            reader,
            stopping,
        } = running;
        stopping.cancel();

        let graceful = async {
            match stdin.try_lock() {
                Ok(mut stdin) => {
                    if let Err(e) = write_command(&mut stdin, &BridgeCommand::Destroy).await {
                        tracing::debug!(error = %e, "failed to send destroy to bridge");
                    }
                }
                Err(_) => tracing::debug!("bridge stdin busy; skipping destroy"),
            }
            drop(stdin);
            child.wait().await
        };
        let waited = tokio::time::timeout(SHUTDOWN_GRACE, graceful).await;

        let result = match waited {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "bridge exited");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                tracing::warn!("bridge ignored destroy; killing it");
                kill_child(&mut child).await
            }
        };

        reader.abort();
        fail_pending(&self.pending, "bridge stopped");
        result
    }
}

#[async_trait]
impl MessagingClient for BridgeClient {
    async fn start(&self, session: Option<SessionBlob>, events: EventSender) -> Result<()> {
        let mut guard = self.running.lock().await;
        if let Some(prev) = guard.take() {
            self.stop(prev).await?;
        }

        let mut cmd = Command::new(&self.inv.program);
        cmd.args(&self.inv.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.inv.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.inv.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::External(format!(
                "failed to start bridge {}: {e}",
                self.inv.program.display()
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("bridge stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        // Drain stderr in background to avoid blocking on a full pipe.
        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
        let stderr_task = stderr.map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::debug!(target: "relay_bridge::stderr", "{line}");
                    tail.lock().await.push_line(line);
                }
            })
        });

        let stopping = CancellationToken::new();
        let reader = tokio::spawn(read_events(
            stdout,
            events,
            self.pending.clone(),
            stderr_tail,
            stderr_task,
            stopping.clone(),
        ));

        let init = BridgeCommand::Init {
            session: session.as_ref().map(|s| &s.0),
        };
        if let Err(e) = write_command(&mut stdin, &init).await {
            stopping.cancel();
            reader.abort();
            if let Err(kill_e) = kill_child(&mut child).await {
                return Err(Error::External(format!(
                    "failed to initialize bridge: {e} (also failed to kill it: {kill_e})"
                )));
            }
            return Err(Error::External(format!("failed to initialize bridge: {e}")));
        }

        tracing::info!(pid = ?child.id(), resume = session.is_some(), "bridge started");
        *guard = Some(Running {
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            reader,
            stopping,
        });
        Ok(())
    }

    async fn send_text(&self, to: &ChatAddress, text: &str) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _pending = PendingGuard::insert(&self.pending, id, tx);

        let stdin = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| running.stdin.clone())
            .ok_or_else(|| Error::External("bridge is not running".to_string()))?;
        let cmd = BridgeCommand::Send {
            id,
            to: to.as_str(),
            text,
        };
        let written = tokio::time::timeout(WRITE_TIMEOUT, async {
            let mut stdin = stdin.lock().await;
            write_command(&mut stdin, &cmd).await
        })
        .await;
        match written {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::External(format!(
                    "bridge did not accept the send within {WRITE_TIMEOUT:?}"
                )))
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::External(
                "bridge went away before confirming the send".to_string(),
            )),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let running = self.running.lock().await.take();
        match running {
            Some(running) => self.stop(running).await,
            None => Ok(()),
        }
    }
}

/// Removes a pending send when its caller stops waiting (e.g. on timeout).
struct PendingGuard<'a> {
    pending: &'a PendingSends,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    fn insert(pending: &'a PendingSends, id: u64, tx: oneshot::Sender<Result<()>>) -> Self {
        lock(pending).insert(id, tx);
        Self { pending, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock(
    pending: &PendingSends,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<()>>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

fn fail_pending(pending: &PendingSends, reason: &str) {
    for (_, tx) in lock(pending).drain() {
        let _ = tx.send(Err(Error::External(reason.to_string())));
    }
}

async fn write_command(stdin: &mut ChildStdin, cmd: &BridgeCommand<'_>) -> Result<()> {
    let mut line = serde_json::to_string(cmd)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_events(
    stdout: ChildStdout,
    events: EventSender,
    pending: PendingSends,
    stderr_tail: Arc<Mutex<StderrTail>>,
    stderr_task: Option<JoinHandle<()>>,
    stopping: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
          _ = stopping.cancelled() => return,
          line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => handle_line(&line, &events, &pending),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "bridge stdout read failed");
                break;
            }
        }
    }

    if stopping.is_cancelled() {
        return;
    }

    // Let the stderr drain catch up so the tail includes the bridge's last words.
    if let Some(task) = stderr_task {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    fail_pending(&pending, "bridge exited");
    let stderr = stderr_tail.lock().await.snapshot();
    let mut msg = "bridge exited".to_string();
    if !stderr.trim().is_empty() {
        msg.push_str("\nstderr (tail):\n");
        msg.push_str(&stderr);
    }
    let _ = events.send(ClientEvent::Fatal(msg));
}

fn handle_line(line: &str, events: &EventSender, pending: &PendingSends) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let msg: BridgeMessage = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(line = %truncate_text(line, 200), error = %e, "ignoring non-protocol bridge output");
            return;
        }
    };

    let event = match msg {
        BridgeMessage::Qr { code } => ClientEvent::PairingCode(PairingCode(code)),
        BridgeMessage::Authenticated { session } => {
            ClientEvent::Authenticated(session.map(SessionBlob))
        }
        BridgeMessage::Ready => ClientEvent::Ready,
        BridgeMessage::AuthFailure { message } => ClientEvent::AuthFailure(message),
        BridgeMessage::Disconnected { reason } => ClientEvent::Disconnected(reason),
        BridgeMessage::SendResult { id, ok, error } => {
            let Some(tx) = lock(pending).remove(&id) else {
                tracing::debug!(id, "send result for unknown or abandoned send");
                return;
            };
            let result = if ok {
                Ok(())
            } else {
                Err(Error::External(
                    error.unwrap_or_else(|| "send rejected by bridge".to_string()),
                ))
            };
            let _ = tx.send(result);
            return;
        }
    };
    let _ = events.send(event);
}

async fn kill_child(child: &mut Child) -> Result<()> {
    // If it's already exited, `try_wait` reaps it.
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    match child.kill().await {
        Ok(()) => {
            let _ = child.wait().await?;
        }
        Err(e) => {
            // If it exited between `try_wait` and `kill`, `wait` will reap it.
            if child.try_wait()?.is_none() {
                return Err(Error::Io(e));
            }
        }
    }
    Ok(())
}
