//! Completion-gated FIFO command queue.
//!
//! Producers append a command and block until a consumer retires it. The
//! backlog is a mutex-guarded `VecDeque`; every command carries a one-shot
//! completion that only `Consumer::finish` signals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::config::QueueConfig;
use crate::consumer::Consumer;
use crate::error::{QueueError, QueueResult};
use crate::liveness::{ClaimMonitor, StalledClaim};
use crate::status::StatusStore;
use crate::types::{ClaimId, CommandId, CommandKind, ConsumerId, StatusRecord};

/// One-shot signal: set once, never reset.
pub(crate) struct Completion {
    done: Mutex<bool>,
    signaled: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            signaled: Condvar::new(),
        }
    }

    /// Signal all waiters. Returns `false` if the signal was already given.
    pub(crate) fn complete(&self) -> QueueResult<bool> {
        let mut done = self
            .done
            .lock()
            .map_err(|_| QueueError::LockPoisoned("completion"))?;
        if *done {
            return Ok(false);
        }
        *done = true;
        self.signaled.notify_all();
        Ok(true)
    }

    fn wait(&self) -> QueueResult<()> {
        let mut done = self
            .done
            .lock()
            .map_err(|_| QueueError::LockPoisoned("completion"))?;
        while !*done {
            // Wait releases the lock and re-acquires it before returning.
            done = self
                .signaled
                .wait(done)
                .map_err(|_| QueueError::LockPoisoned("completion"))?;
        }
        Ok(())
    }

    fn wait_timeout(&self, timeout: Duration) -> QueueResult<bool> {
        let done = self
            .done
            .lock()
            .map_err(|_| QueueError::LockPoisoned("completion"))?;
        let (done, _) = self
            .signaled
            .wait_timeout_while(done, timeout, |done| !*done)
            .map_err(|_| QueueError::LockPoisoned("completion"))?;
        Ok(*done)
    }

    fn is_complete(&self) -> QueueResult<bool> {
        self.done
            .lock()
            .map(|done| *done)
            .map_err(|_| QueueError::LockPoisoned("completion"))
    }
}

/// A submitted command, shared between its waiting producer and whoever
/// currently owns it (the backlog, then one consumer).
pub(crate) struct Command {
    pub(crate) id: CommandId,
    pub(crate) kind: CommandKind,
    pub(crate) completion: Completion,
}

/// Producer side of a queued command.
///
/// Dropping a `Pending` does not withdraw the command; it is still taken and
/// retired, nobody just waits for it.
#[must_use = "a pending command should be waited on"]
pub struct Pending {
    command: Arc<Command>,
}

impl Pending {
    pub fn id(&self) -> CommandId {
        self.command.id
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind
    }

    /// Whether a consumer has finished this command.
    pub fn is_retired(&self) -> QueueResult<bool> {
        self.command.completion.is_complete()
    }

    /// Block until the command is retired.
    pub fn wait(self) -> QueueResult<()> {
        self.command.completion.wait()
    }

    /// Block up to `timeout`; returns whether the command was retired.
    pub fn wait_timeout(&self, timeout: Duration) -> QueueResult<bool> {
        self.command.completion.wait_timeout(timeout)
    }
}

struct Backlog {
    queue: VecDeque<Arc<Command>>,
    next_command: CommandId,
}

/// The dispatch queue shared by producers and consumers.
pub struct CommandQueue {
    backlog: Mutex<Backlog>,
    status: StatusStore,
    monitor: ClaimMonitor,
    config: QueueConfig,
    next_consumer: AtomicU64,
    next_claim: AtomicU64,
    retired: AtomicU64,
}

impl CommandQueue {
    /// Create an empty queue with default configuration.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            backlog: Mutex::new(Backlog {
                queue: VecDeque::new(),
                next_command: 1,
            }),
            status: StatusStore::new(),
            monitor: ClaimMonitor::new(),
            config,
            next_consumer: AtomicU64::new(1),
            next_claim: AtomicU64::new(1),
            retired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a command to the backlog tail without waiting for it.
    pub fn enqueue(&self, kind: CommandKind) -> QueueResult<Pending> {
        let mut guard = self
            .backlog
            .lock()
            .map_err(|_| QueueError::LockPoisoned("backlog"))?;
        let capacity = self.config.backlog_capacity;
        if guard.queue.len() >= capacity {
            warn!("backlog full, rejecting {kind} (capacity={capacity})");
            return Err(QueueError::BacklogFull { capacity });
        }
        let id = guard.next_command;
        guard.next_command += 1;
        let command = Arc::new(Command {
            id,
            kind,
            completion: Completion::new(),
        });
        guard.queue.push_back(Arc::clone(&command));
        debug!("queued command {id} ({kind}) depth={}", guard.queue.len());
        Ok(Pending { command })
    }

    /// Queue `kind` and block until a consumer retires it.
    pub fn submit(&self, kind: CommandKind) -> QueueResult<()> {
        let pending = self.enqueue(kind)?;
        let id = pending.id();
        pending.wait()?;
        debug!("command {id} ({kind}) retired, producer released");
        Ok(())
    }

    /// Validate a raw command code, then [`submit`](Self::submit) it.
    ///
    /// Invalid codes fail immediately and never reach the backlog.
    pub fn submit_code(&self, code: i32) -> QueueResult<()> {
        let kind = CommandKind::try_from(code).inspect_err(|_| {
            warn!("rejecting invalid command code {code}");
        })?;
        self.submit(kind)
    }

    /// Open a new consumer handle with its own identity and claim slot.
    pub fn open_consumer(self: &Arc<Self>) -> Consumer {
        let id = self.next_consumer.fetch_add(1, Ordering::SeqCst);
        self.monitor.register_consumer(id);
        debug!("consumer {id} opened");
        Consumer::new(id, Arc::clone(self))
    }

    /// Replace the shared status record.
    pub fn write_status(&self, record: StatusRecord) -> QueueResult<()> {
        self.status.write(record)
    }

    /// Copy out the shared status record.
    pub fn read_status(&self) -> QueueResult<StatusRecord> {
        self.status.read()
    }

    /// Number of queued, not yet taken commands.
    pub fn len(&self) -> QueueResult<usize> {
        self.backlog
            .lock()
            .map(|guard| guard.queue.len())
            .map_err(|_| QueueError::LockPoisoned("backlog"))
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        self.len().map(|len| len == 0)
    }

    /// Total commands retired since the queue was created.
    pub fn retired_total(&self) -> u64 {
        self.retired.load(Ordering::SeqCst)
    }

    /// Claims silent longer than the configured stall timeout, or abandoned.
    pub fn stalled_claims(&self) -> Vec<StalledClaim> {
        self.monitor.detect_stalled(self.config.stall_timeout)
    }

    pub fn monitor(&self) -> &ClaimMonitor {
        &self.monitor
    }

    /// Remove and return the oldest queued command, if any.
    pub(crate) fn pop_oldest(&self) -> QueueResult<Option<Arc<Command>>> {
        let mut guard = self
            .backlog
            .lock()
            .map_err(|_| QueueError::LockPoisoned("backlog"))?;
        Ok(guard.queue.pop_front())
    }

    pub(crate) fn next_claim_id(&self) -> ClaimId {
        self.next_claim.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn note_retired(&self, consumer: ConsumerId) {
        self.retired.fetch_add(1, Ordering::SeqCst);
        self.monitor.released(consumer);
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
