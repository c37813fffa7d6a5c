//! Command Supervisor for the operations daemon
//!
//! Spawns OS commands, owns the table of running and recently finished
//! commands, and streams each command's lifecycle as `CommandEvent`s on a
//! single channel: `Running`, any number of output chunks, then exactly one
//! terminal status.

use crate::config::SupervisorConfig;
use crate::error::SpawnError;
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use ops_types::{CommandEvent, CommandId, CommandRecord, CommandStatus, Invocation, OutputStream};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct CommandEntry {
    record: CommandRecord,
    status_tx: watch::Sender<CommandStatus>,
    kill_tx: Option<oneshot::Sender<()>>,
    stop_requested: bool,
}

struct CommandTable {
    entries: HashMap<CommandId, CommandEntry>,
    /// Terminal commands, oldest first.
    finished: VecDeque<CommandId>,
    events: Option<flume::Sender<CommandEvent>>,
    closed: bool,
}

fn lock_table(table: &Mutex<CommandTable>) -> MutexGuard<'_, CommandTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every supervised OS process. The only writer of command records.
pub struct CommandSupervisor {
    table: Arc<Mutex<CommandTable>>,
    config: SupervisorConfig,
    default_cwd: Option<PathBuf>,
}

impl CommandSupervisor {
    /// Creates a supervisor and the receiving end of its event stream.
    pub fn new(config: SupervisorConfig) -> (Self, flume::Receiver<CommandEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let table = CommandTable {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            events: Some(events_tx),
            closed: false,
        };
        let supervisor = Self {
            table: Arc::new(Mutex::new(table)),
            config,
            default_cwd: None,
        };
        (supervisor, events_rx)
    }

    /// Working directory for commands that do not name their own.
    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.default_cwd = dir;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CommandTable> {
        lock_table(&self.table)
    }

    /// Spawns a command and returns its id without waiting for it to finish.
    pub fn start(&self, invocation: Invocation) -> Result<CommandId, SpawnError> {
        self.start_with(invocation, |_| {})
    }

    /// Like [`start`](Self::start), but runs `before_events` with the new id
    /// before any event for the command is emitted.
    pub fn start_with<F>(&self, invocation: Invocation, before_events: F) -> Result<CommandId, SpawnError>
    where
        F: FnOnce(&CommandId),
    {
        if invocation.is_empty() {
            return Err(SpawnError::EmptyInvocation);
        }
        if self.lock().closed {
            return Err(SpawnError::ShuttingDown);
        }

        let mut child = self
            .build_command(&invocation)
            .spawn()
            .map_err(|e| SpawnError::from_io(&invocation.program, e))?;
        let pid = child.id();

        let id = CommandId::new();
        let (kill_tx, kill_rx) = oneshot::channel();
        let events = {
            let mut table = self.lock();
            let events = match (&table.events, table.closed) {
                (Some(events), false) => events.clone(),
                // Dropping the child kills it.
                _ => return Err(SpawnError::ShuttingDown),
            };
            let (status_tx, _) = watch::channel(CommandStatus::Running);
            let record = CommandRecord {
                id,
                invocation: invocation.clone(),
                status: CommandStatus::Running,
                exit_code: None,
                pid,
                started_at: Utc::now(),
                finished_at: None,
            };
            table.entries.insert(
                id,
                CommandEntry {
                    record,
                    status_tx,
                    kill_tx: Some(kill_tx),
                    stop_requested: false,
                },
            );
            events
        };

        info!(command_id = %id, pid = ?pid, command = %invocation, "Command started");
        before_events(&id);

        let _ = events.send(CommandEvent::Status {
            command_id: id,
            status: CommandStatus::Running,
            exit_code: None,
        });

        let buffer_size = self.config.read_buffer_size.max(1);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(id, OutputStream::Stdout, stdout, events.clone(), buffer_size));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(id, OutputStream::Stderr, stderr, events.clone(), buffer_size));
        }

        tokio::spawn(supervise(
            self.table.clone(),
            id,
            pid,
            child,
            kill_rx,
            readers,
            events,
            self.config.clone(),
        ));

        Ok(id)
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let mut command = if invocation.shell {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&invocation.program);
            command
        } else {
            Command::new(&invocation.program)
        };
        command.args(&invocation.args);

        if let Some(dir) = invocation.cwd.as_ref().or(self.default_cwd.as_ref()) {
            command.current_dir(dir);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group so stop reaches everything the command forks.
            .process_group(0);
        command
    }

    /// Stops a command: SIGTERM to its process group, SIGKILL once the grace
    /// period runs out. Unknown and already finished commands are ignored.
    pub async fn stop(&self, id: &CommandId) {
        let (pid, mut status_rx) = {
            let mut table = self.lock();
            let Some(entry) = table.entries.get_mut(id) else {
                debug!(command_id = %id, "Stop requested for unknown command");
                return;
            };
            if entry.record.status.is_terminal() {
                return;
            }
            entry.stop_requested = true;
            (entry.record.pid, entry.status_tx.subscribe())
        };

        info!(command_id = %id, "Stopping command");
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGTERM);
        }

        let grace = self.config.grace_period();
        if tokio::time::timeout(grace, status_rx.wait_for(|s| s.is_terminal()))
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            command_id = %id,
            grace_ms = grace.as_millis() as u64,
            "Command did not exit within its grace period, killing"
        );
        let kill_tx = self
            .lock()
            .entries
            .get_mut(id)
            .and_then(|entry| entry.kill_tx.take());
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }

        if tokio::time::timeout(self.config.kill_wait(), status_rx.wait_for(|s| s.is_terminal()))
            .await
            .is_err()
        {
            error!(command_id = %id, "Command still running after SIGKILL");
        }
    }

    /// Stops every active command and waits for all of them. Returns how many
    /// commands were asked to stop.
    pub async fn stop_all(&self) -> usize {
        let ids = self.active_ids();
        if ids.is_empty() {
            return 0;
        }
        info!(count = ids.len(), "Stopping all commands");
        join_all(ids.iter().map(|id| self.stop(id))).await;
        ids.len()
    }

    /// Refuses new commands, stops the running ones and closes the event
    /// stream once their final events are out.
    pub async fn shutdown(&self) -> usize {
        self.lock().closed = true;
        let stopped = self.stop_all().await;
        self.lock().events = None;
        info!(stopped, "Command supervisor shut down");
        stopped
    }

    pub fn get(&self, id: &CommandId) -> Option<CommandRecord> {
        self.lock().entries.get(id).map(|entry| entry.record.clone())
    }

    /// All known commands, oldest first.
    pub fn list(&self) -> Vec<CommandRecord> {
        let mut records: Vec<CommandRecord> = self
            .lock()
            .entries
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.started_at);
        records
    }

    pub fn status(&self, id: &CommandId) -> Option<CommandStatus> {
        self.lock().entries.get(id).map(|entry| entry.record.status)
    }

    /// Whether the command exists and has not reached a terminal status.
    pub fn is_active(&self, id: &CommandId) -> bool {
        self.status(id).is_some_and(|status| !status.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| !entry.record.status.is_terminal())
            .count()
    }

    fn active_ids(&self) -> Vec<CommandId> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.record.status.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }
}

fn signal_group(pid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, "Failed to signal process group: {}", e),
    }
}

/// Waits for the child, drains its output and publishes the terminal status.
async fn supervise(
    table: Arc<Mutex<CommandTable>>,
    id: CommandId,
    pgid: Option<u32>,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    events: flume::Sender<CommandEvent>,
    config: SupervisorConfig,
) {
    let waited = tokio::select! {
        result = child.wait() => result,
        Ok(()) = &mut kill_rx => {
            if let Some(pid) = child.id() {
                signal_group(pid, Signal::SIGKILL);
            }
            let _ = child.start_kill();
            child.wait().await
        }
    };

    // The child is reaped, so its pid may be reused from here on.
    let stop_requested = {
        let mut table = lock_table(&table);
        match table.entries.get_mut(&id) {
            Some(entry) => {
                entry.record.pid = None;
                entry.stop_requested
            }
            None => false,
        }
    };

    // The leader is gone, but other members of its group may not be.
    if stop_requested {
        kill_group(id, pgid);
    }
    if !drain_readers(id, readers, config.output_drain()).await && !stop_requested {
        kill_group(id, pgid);
    }

    let (status, exit_code) = classify(&waited, stop_requested);
    match &waited {
        Ok(exit) => info!(command_id = %id, %status, ?exit_code, "Command finished ({})", exit),
        Err(e) => error!(command_id = %id, "Failed to wait for command: {}", e),
    }

    let mut table = lock_table(&table);
    if let Some(entry) = table.entries.get_mut(&id) {
        if finish_record(&mut entry.record, status, exit_code) {
            entry.kill_tx = None;
            let _ = events.send(CommandEvent::Status {
                command_id: id,
                status,
                exit_code,
            });
            entry.status_tx.send_replace(status);
        } else {
            warn!(
                command_id = %id,
                from = %entry.record.status,
                to = %status,
                "Ignoring out-of-order status change"
            );
        }
    }
    table.finished.push_back(id);
    while table.finished.len() > config.max_retained {
        if let Some(evicted) = table.finished.pop_front() {
            table.entries.remove(&evicted);
        }
    }
}

fn kill_group(id: CommandId, pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        debug!(command_id = %id, pgid, "Killing what is left of the process group");
        signal_group(pgid, Signal::SIGKILL);
    }
}

/// Moves a record to its terminal state. Leaves it untouched and returns
/// false when the lifecycle does not allow the change.
fn finish_record(record: &mut CommandRecord, status: CommandStatus, exit_code: Option<i32>) -> bool {
    if !record.status.can_transition_to(status) {
        return false;
    }
    record.status = status;
    record.exit_code = exit_code;
    record.finished_at = Some(Utc::now());
    true
}

/// Gives output readers a bounded time to hit EOF. A reader is still open
/// when a grandchild inherited the pipe; it is cancelled so no output can
/// follow the terminal status. Returns false if any reader was cancelled.
async fn drain_readers(id: CommandId, readers: Vec<JoinHandle<()>>, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    let mut drained = true;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            debug!(command_id = %id, "Output pipe still open after exit, cancelling reader");
            reader.abort();
            let _ = reader.await;
            drained = false;
        }
    }
    drained
}

fn classify(waited: &io::Result<ExitStatus>, stop_requested: bool) -> (CommandStatus, Option<i32>) {
    if stop_requested {
        return (CommandStatus::Stopped, None);
    }
    match waited {
        Ok(exit) if exit.success() => (CommandStatus::Completed, Some(0)),
        Ok(exit) => (CommandStatus::Failed, exit_code_of(exit)),
        Err(_) => (CommandStatus::Failed, None),
    }
}

/// Exit code, or 128 + signal number for a signalled process.
fn exit_code_of(exit: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    exit.code().or_else(|| exit.signal().map(|signal| 128 + signal))
}

fn spawn_reader<R>(
    command_id: CommandId,
    stream: OutputStream,
    mut reader: R,
    events: flume::Sender<CommandEvent>,
    buffer_size: usize,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(command_id = %command_id, ?stream, "Error reading command output: {}", e);
                    break;
                }
            };
            pending.extend_from_slice(&buf[..n]);
            let cut = utf8_boundary(&pending);
            if cut == 0 {
                continue;
            }
            let data = Bytes::copy_from_slice(&pending[..cut]);
            pending.drain(..cut);
            if events
                .send(CommandEvent::Output {
                    command_id,
                    stream,
                    data,
                })
                .is_err()
            {
                return;
            }
        }
        if !pending.is_empty() {
            let _ = events.send(CommandEvent::Output {
                command_id,
                stream,
                data: Bytes::from(pending),
            });
        }
    })
}

/// Length of the prefix of `bytes` that does not end inside a UTF-8
/// sequence. Invalid bytes are passed through as they are.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A character is at most four bytes, so only the last three can start
    // an unfinished one.
    for back in 1..=len.min(3) {
        let start = len - back;
        if bytes[start] & 0xC0 == 0x80 {
            continue;
        }
        return match std::str::from_utf8(&bytes[start..]) {
            Err(e) if e.valid_up_to() == 0 && e.error_len().is_none() => start,
            _ => len,
        };
    }
    len
}
