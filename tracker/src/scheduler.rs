use crate::sync::{SyncError, SyncReport, Synchronizer};
use crate::types::{Credential, CredentialError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug)]
pub enum Command {
    // Run a cycle outside of the normal interval. Without a credential the
    // service's own credential is used. The worker replies when the cycle ends.
    Refresh {
        credential: Option<Credential>,
        respond_to: oneshot::Sender<Result<SyncReport, SyncError>>,
    },
    // Stop the worker after the current cycle
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub run_on_start: bool,
}

struct SyncServiceInner {
    synchronizer: Arc<Synchronizer>,
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_report: Arc<RwLock<Option<SyncReport>>>,
}

/// Owns the background sync worker. Timer-driven and manual cycles are both
/// executed by the worker, so they never overlap.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<SyncServiceInner>,
}

impl SyncService {
    /// Spawns the worker. With no schedule, cycles only run on `refresh`.
    pub fn spawn(
        synchronizer: Arc<Synchronizer>,
        credential: Result<Credential, CredentialError>,
        schedule: Option<Schedule>,
    ) -> Self {
        // Channel to send commands to the worker task.
        let (tx, rx) = mpsc::channel::<Command>(16);
        let last_report = Arc::new(RwLock::new(None));

        let worker = Worker {
            synchronizer: synchronizer.clone(),
            credential,
            last_report: last_report.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, schedule));

        SyncService {
            inner: Arc::new(SyncServiceInner {
                synchronizer,
                tx,
                handle: Mutex::new(Some(handle)),
                last_report,
            }),
        }
    }

    pub async fn refresh(
        &self,
        credential: Option<Credential>,
    ) -> Result<SyncReport, SyncError> {
        let (respond_to, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Refresh {
                credential,
                respond_to,
            })
            .await
            .map_err(|_| SyncError::Closed)?;

        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Stops the worker. A cycle in progress ends at the next repository.
    pub async fn shutdown(&self) {
        self.inner.synchronizer.request_stop();
        let _ = self.inner.tx.send(Command::Shutdown).await;

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "sync worker panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.inner.last_report.read().clone()
    }
}

struct Worker {
    synchronizer: Arc<Synchronizer>,
    credential: Result<Credential, CredentialError>,
    last_report: Arc<RwLock<Option<SyncReport>>>,
}

impl Worker {
    /// Runs cycles at the configured interval or when a Refresh command is
    /// received, until Shutdown is received or every sender is gone.
    async fn run(self, mut rx: mpsc::Receiver<Command>, schedule: Option<Schedule>) {
        let mut ticker = schedule.map(|schedule| {
            let start = if schedule.run_on_start {
                Instant::now()
            } else {
                Instant::now() + schedule.interval
            };
            let mut ticker = tokio::time::interval_at(start, schedule.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        if let Some(schedule) = schedule {
            tracing::info!(interval_secs = schedule.interval.as_secs(), "sync scheduler started");
        }

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh { credential, respond_to }) => {
                        tracing::info!("manual sync requested");
                        let credential = match credential {
                            Some(credential) => Ok(credential),
                            None => self.credential.clone(),
                        };
                        let result = self.cycle(credential).await;
                        let _ = respond_to.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = tick(&mut ticker) => {
                    if let Err(e) = self.cycle(self.credential.clone()).await {
                        tracing::error!(error = %e, "scheduled sync failed");
                    }
                }
            }
        }

        tracing::info!("sync worker stopped");
    }

    async fn cycle(
        &self,
        credential: Result<Credential, CredentialError>,
    ) -> Result<SyncReport, SyncError> {
        let result = match credential {
            Ok(credential) => self.synchronizer.run_sync_cycle(&credential).await,
            Err(e) => Err(e.into()),
        };
        if let Ok(report) = &result {
            *self.last_report.write() = Some(report.clone());
        }
        result
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
