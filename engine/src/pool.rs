//! Ownership of engine channels across evaluations.
//!
//! A channel is leased to exactly one session at a time. When every slot is
//! leased, further requests are either rejected or queued according to the
//! pool's [`AcquirePolicy`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::channel::{ChannelError, EngineChannel, WorkerInbox, WorkerOutbox};

/// Creates new engine channels on demand.
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, label: &str) -> Result<EngineChannel, ChannelError>;
}

/// Launches an engine executable, resolved through `PATH` when relative.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl EngineLauncher for ProcessLauncher {
    fn launch(&self, label: &str) -> Result<EngineChannel, ChannelError> {
        EngineChannel::spawn_process(&self.program, &self.args, label)
    }
}

/// Launches an in-process worker per channel.
pub struct WorkerLauncher<F> {
    factory: F,
}

impl<F> WorkerLauncher<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, Fut> EngineLauncher for WorkerLauncher<F>
where
    F: Fn(WorkerInbox, WorkerOutbox) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn launch(&self, label: &str) -> Result<EngineChannel, ChannelError> {
        Ok(EngineChannel::spawn_worker(label, |inbox, outbox| {
            (self.factory)(inbox, outbox)
        }))
    }
}

/// What to do with a request when every engine is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Fail immediately with [`PoolError::Busy`].
    #[default]
    Reject,
    /// Wait until a lease is released.
    Wait,
}

impl std::str::FromStr for AcquirePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(AcquirePolicy::Reject),
            "wait" => Ok(AcquirePolicy::Wait),
            other => Err(format!("unknown acquire policy: {}", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("All engines are busy")]
    Busy,
    #[error("Engine pool is closed")]
    Closed,
    #[error(transparent)]
    Launch(#[from] ChannelError),
}

/// Bounded set of reusable engine channels.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    launcher: Arc<dyn EngineLauncher>,
    idle: Mutex<Vec<EngineChannel>>,
    slots: Arc<Semaphore>,
    policy: AcquirePolicy,
    launched: AtomicU64,
}

impl EnginePool {
    pub fn new(launcher: Arc<dyn EngineLauncher>, size: usize, policy: AcquirePolicy) -> Self {
        let size = size.max(1);
        tracing::info!(size, ?policy, "Creating engine pool");
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                idle: Mutex::new(Vec::with_capacity(size)),
                slots: Arc::new(Semaphore::new(size)),
                policy,
                launched: AtomicU64::new(0),
            }),
        }
    }

    /// Single-engine pool that rejects concurrent requests.
    pub fn single(launcher: Arc<dyn EngineLauncher>) -> Self {
        Self::new(launcher, 1, AcquirePolicy::Reject)
    }

    pub fn policy(&self) -> AcquirePolicy {
        self.inner.policy
    }

    /// Number of slots not currently leased.
    pub fn available(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Lease a channel, reusing an idle live one before launching a new one.
    pub async fn acquire(&self) -> Result<EngineLease, PoolError> {
        let permit = match self.inner.policy {
            AcquirePolicy::Reject => self
                .inner
                .slots
                .clone()
                .try_acquire_owned()
                .map_err(|e| match e {
                    TryAcquireError::NoPermits => PoolError::Busy,
                    TryAcquireError::Closed => PoolError::Closed,
                })?,
            AcquirePolicy::Wait => self
                .inner
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?,
        };

        let reused = {
            let mut idle = self.inner.idle.lock().await;
            let mut found = None;
            while let Some(channel) = idle.pop() {
                if channel.has_exited() {
                    tracing::debug!(label = channel.label(), "Discarding exited idle engine");
                    continue;
                }
                found = Some(channel);
                break;
            }
            found
        };

        let channel = match reused {
            Some(channel) => {
                tracing::debug!(label = channel.label(), "Reusing idle engine");
                channel
            }
            None => {
                let n = self.inner.launched.fetch_add(1, Ordering::Relaxed);
                let label = format!("engine-{}", n);
                tracing::info!(label = %label, "Launching engine");
                self.inner.launcher.launch(&label)?
            }
        };

        Ok(EngineLease {
            channel,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Close the pool: pending and future acquisitions fail, idle engines
    /// are terminated.
    pub async fn close(&self) {
        self.inner.slots.close();
        let idle: Vec<EngineChannel> = self.inner.idle.lock().await.drain(..).collect();
        tracing::info!(idle = idle.len(), "Closing engine pool");
        drop(idle);
    }
}

/// Exclusive use of one engine channel.
///
/// Call [`EngineLease::release`] to hand a healthy channel back to the pool.
/// Dropping the lease without releasing terminates the channel.
pub struct EngineLease {
    channel: EngineChannel,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl EngineLease {
    pub fn channel(&self) -> &EngineChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut EngineChannel {
        &mut self.channel
    }

    /// Return the channel to the pool for the next session.
    pub async fn release(self) {
        let EngineLease {
            channel,
            pool,
            _permit,
        } = self;
        if channel.has_exited() || pool.slots.is_closed() {
            return;
        }
        tracing::debug!(label = channel.label(), "Returning engine to pool");
        pool.idle.lock().await.push(channel);
    }

    /// Kill the channel and free the slot.
    pub fn terminate(mut self) {
        self.channel.terminate();
    }
}
