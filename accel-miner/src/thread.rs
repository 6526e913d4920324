//! Per-accelerator worker.
//!
//! [`AccelThread`] is an actor owning one [`WorkScanner`]. The owner assigns
//! work with [`replace_work`](AccelThread::replace_work); the actor scans it
//! and reports shares, completed work and faults as [`ThreadEvent`]s. New
//! work arriving mid-scan cancels the scan's restart token, so the old search
//! is abandoned within one wait tick.
//!
//! A work item is consumed by any scan that ends on its own (found,
//! exhausted, no result, fault). The accelerator always starts from nonce
//! zero, so rescanning the same item would only repeat the same answer.

use std::sync::{Arc, RwLock};

use bitcoin::hashes::Hash;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::scanner::{ScanOutcome, ScannerProbe, WorkScanner};
use crate::tracing::prelude::*;
use crate::types::{BlockHash, HashRate};
use crate::work::WorkItem;

/// Current runtime status of an AccelThread.
#[derive(Debug, Clone, Default)]
pub struct ThreadStatus {
    /// Hashrate of the most recent scan
    pub hashrate: HashRate,

    /// Candidates that met the exact target
    pub shares_found: u64,

    /// Candidates accepted by the mask but above the target
    pub false_positives: u64,

    /// Faulted scans and failed opens
    pub hardware_errors: u64,

    pub total_hashes: u64,

    pub temperature_c: Option<f64>,

    /// Whether a scan is in progress
    pub is_active: bool,
}

/// Verified share.
#[derive(Debug, Clone)]
pub struct Share {
    pub work: Arc<WorkItem>,
    pub nonce: u32,
    pub hash: BlockHash,
}

/// Events emitted by an AccelThread to its owner.
///
/// When the thread exits it closes its event channel.
#[derive(Debug)]
pub enum ThreadEvent {
    ShareFound(Share),

    /// Mask-accepted nonce that failed re-verification
    FalsePositive { work: Arc<WorkItem>, nonce: u32 },

    /// The work item is finished, including when the device could not be
    /// opened. The thread is idle until given more.
    WorkComplete { work: Arc<WorkItem>, hashes: u64 },

    Fault(String),

    StatusUpdate(ThreadStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("Thread has been shut down")]
    ThreadOffline,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

type WorkResponse = oneshot::Sender<Option<Arc<WorkItem>>>;

#[derive(Debug)]
enum ThreadCommand {
    ReplaceWork {
        work: WorkItem,
        response_tx: WorkResponse,
    },
    GoIdle {
        response_tx: WorkResponse,
    },
}

/// Handle to a running accelerator worker.
pub struct AccelThread {
    name: String,
    command_tx: mpsc::Sender<ThreadCommand>,
    event_rx: Option<mpsc::Receiver<ThreadEvent>>,
    status: Arc<RwLock<ThreadStatus>>,
    probe: ScannerProbe,
}

impl AccelThread {
    /// Start the actor on `tracker`. It runs until `shutdown` fires or the
    /// handle is dropped.
    pub fn spawn(
        name: impl Into<String>,
        scanner: WorkScanner,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let name = name.into();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(100);
        let status = Arc::new(RwLock::new(ThreadStatus::default()));
        let probe = scanner.probe();

        let actor = Actor {
            name: name.clone(),
            scanner,
            command_rx,
            event_tx,
            status: Arc::clone(&status),
            shutdown,
        };
        tracker.spawn(actor.run());

        Self {
            name,
            command_tx,
            event_rx: Some(event_rx),
            status,
            probe,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn command(
        &self,
        make: impl FnOnce(WorkResponse) -> ThreadCommand,
    ) -> Result<Option<Arc<WorkItem>>, ThreadError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(make(response_tx))
            .await
            .map_err(|_| ThreadError::ThreadOffline)?;
        response_rx
            .await
            .map_err(|_| ThreadError::ChannelClosed("no response from thread".into()))
    }

    /// Replace the current work. Returns the work that was displaced.
    pub async fn replace_work(
        &self,
        work: WorkItem,
    ) -> Result<Option<Arc<WorkItem>>, ThreadError> {
        self.command(|response_tx| ThreadCommand::ReplaceWork { work, response_tx })
            .await
    }

    /// Stop scanning. Returns the work that was in progress.
    pub async fn go_idle(&self) -> Result<Option<Arc<WorkItem>>, ThreadError> {
        self.command(|response_tx| ThreadCommand::GoIdle { response_tx })
            .await
    }

    /// Take the event receiver. Only the first call returns it.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ThreadEvent>> {
        self.event_rx.take()
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Live device summary, `"closed"` between scans.
    pub fn status_line(&self) -> String {
        self.probe.status_line()
    }
}

struct Actor {
    name: String,
    scanner: WorkScanner,
    command_rx: mpsc::Receiver<ThreadCommand>,
    event_tx: mpsc::Sender<ThreadEvent>,
    status: Arc<RwLock<ThreadStatus>>,
    shutdown: CancellationToken,
}

impl Actor {
    fn update_status(&self, f: impl FnOnce(&mut ThreadStatus)) -> ThreadStatus {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
        status.clone()
    }

    async fn emit(&self, event: ThreadEvent) {
        if self.event_tx.send(event).await.is_err() {
            trace!(thread = %self.name, "Event receiver dropped");
        }
    }

    async fn run(mut self) {
        debug!(thread = %self.name, device = self.scanner.device_name(), "Thread started");
        let mut current: Option<Arc<WorkItem>> = None;
        let mut commands_open = true;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let Some(work) = current.clone() else {
                if !commands_open {
                    break;
                }
                tokio::select! {
                    cmd = self.command_rx.recv() => match cmd {
                        Some(ThreadCommand::ReplaceWork { work, response_tx }) => {
                            current = Some(Arc::new(work));
                            let _ = response_tx.send(None);
                        }
                        Some(ThreadCommand::GoIdle { response_tx }) => {
                            let _ = response_tx.send(None);
                        }
                        None => commands_open = false,
                    },
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            };

            self.update_status(|s| s.is_active = true);
            let restart = self.shutdown.child_token();
            let started = Instant::now();

            let result = {
                let scan = self.scanner.scan(&work, &restart);
                tokio::pin!(scan);
                loop {
                    tokio::select! {
                        result = &mut scan => break result,
                        cmd = self.command_rx.recv(), if commands_open => match cmd {
                            Some(ThreadCommand::ReplaceWork { work, response_tx }) => {
                                debug!(thread = %self.name, "Work replaced mid-scan");
                                let old = current.replace(Arc::new(work));
                                restart.cancel();
                                let _ = response_tx.send(old);
                            }
                            Some(ThreadCommand::GoIdle { response_tx }) => {
                                let old = current.take();
                                restart.cancel();
                                let _ = response_tx.send(old);
                            }
                            None => {
                                commands_open = false;
                                current = None;
                                restart.cancel();
                            }
                        },
                    }
                }
            };
            let elapsed = started.elapsed();

            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    error!(thread = %self.name, error = %e, "Failed to open accelerator");
                    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &work)) {
                        current = None;
                    }
                    let status = self.update_status(|s| {
                        s.hardware_errors += 1;
                        s.is_active = false;
                    });
                    self.emit(ThreadEvent::Fault(e.to_string())).await;
                    self.emit(ThreadEvent::WorkComplete { work, hashes: 0 }).await;
                    self.emit(ThreadEvent::StatusUpdate(status)).await;
                    continue;
                }
            };

            let hashes = report.hashes;
            let consumed = !matches!(report.outcome, ScanOutcome::Restarted);
            match report.outcome {
                ScanOutcome::Found(candidate) if candidate.meets_target => {
                    self.update_status(|s| s.shares_found += 1);
                    self.emit(ThreadEvent::ShareFound(Share {
                        work: Arc::clone(&work),
                        nonce: candidate.nonce,
                        hash: BlockHash::from_byte_array(candidate.hash),
                    }))
                    .await;
                }
                ScanOutcome::Found(candidate) => {
                    self.update_status(|s| s.false_positives += 1);
                    self.emit(ThreadEvent::FalsePositive {
                        work: Arc::clone(&work),
                        nonce: candidate.nonce,
                    })
                    .await;
                }
                ScanOutcome::Faulted(fault) => {
                    self.update_status(|s| s.hardware_errors += 1);
                    self.emit(ThreadEvent::Fault(fault.to_string())).await;
                }
                ScanOutcome::Exhausted | ScanOutcome::NoResult | ScanOutcome::Restarted => {}
            }

            // Work replaced during the scan stays queued as `current`
            let still_current = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &work));
            if consumed && still_current {
                current = None;
            }
            if consumed {
                self.emit(ThreadEvent::WorkComplete {
                    work: Arc::clone(&work),
                    hashes,
                })
                .await;
            }

            let temperature = self.scanner.probe().temperature();
            let status = self.update_status(|s| {
                s.total_hashes += hashes;
                s.hashrate = HashRate::from_hashes(hashes, elapsed);
                s.temperature_c = temperature.or(s.temperature_c);
                s.is_active = false;
            });
            self.emit(ThreadEvent::StatusUpdate(status)).await;
        }

        self.update_status(|s| s.is_active = false);
        debug!(thread = %self.name, "Thread stopped");
    }
}
