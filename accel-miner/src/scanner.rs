//! Work scanner: drives one work item through an accelerator.
//!
//! A scan opens the device, programs the clock, resets, waits for READY,
//! loads the work, starts the search, and then waits tick by tick for a
//! completion. Each tick checks the restart token, samples the status word,
//! and refreshes telemetry. Whatever the outcome, the scan reads the search
//! counter as its hash count and closes the session before returning.
//!
//! ```text
//! Idle -> Configuring -> Ready -> Running -> Found | Exhausted | NoResult
//!              |           |         |     -> Restarted | Faulted
//!              +-----------+---------+------------------------> Closed
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bitcoin::hex::DisplayHex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::accel::{AccelError, AcceleratorSession, CompletionMessage, Device, Status};
use crate::config::DEFAULT_WAIT_TICK;
use crate::thermal::ThermalSensor;
use crate::tracing::prelude::*;
use crate::work::WorkItem;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Longest wait for a completion before checking restart and status.
    pub wait_tick: Duration,

    /// Interval between status reads while waiting for READY.
    pub ready_poll: Duration,

    /// Give up on a device that does not report READY after reset.
    pub ready_timeout: Duration,

    /// After RUNNING is seen clear with no message, how long to wait for the
    /// interrupt path to deliver one before declaring a fault.
    pub stop_grace: Duration,

    /// Clock register value, when the layout has one.
    pub clock_speed: Option<u32>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            wait_tick: DEFAULT_WAIT_TICK,
            ready_poll: Duration::from_millis(1),
            ready_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_millis(50),
            clock_speed: None,
        }
    }
}

/// Where a scan is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Configuring,
    Ready,
    Running,
    Found,
    Exhausted,
    NoResult,
    Restarted,
    Faulted,
    Closed,
}

/// A nonce reported by the accelerator, re-checked in software.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub nonce: u32,

    /// Double SHA-256 digest of the completed header.
    pub hash: [u8; 32],

    /// Whether the hash is below the exact target. The hardware compares
    /// against a mask, so this may be false.
    pub meets_target: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFault {
    /// RUNNING cleared without a completion message
    HardwareStopped,

    /// READY not reported within the deadline
    ReadyTimeout,

    /// A control request failed
    Protocol(String),
}

impl fmt::Display for ScanFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFault::HardwareStopped => f.write_str("hardware stopped unexpectedly"),
            ScanFault::ReadyTimeout => f.write_str("device never became ready"),
            ScanFault::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl From<AccelError> for ScanFault {
    fn from(e: AccelError) -> Self {
        ScanFault::Protocol(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(Candidate),
    Exhausted,
    /// The completion record was stale or truncated
    NoResult,
    Restarted,
    Faulted(ScanFault),
}

impl ScanOutcome {
    fn state(&self) -> ScanState {
        match self {
            ScanOutcome::Found(_) => ScanState::Found,
            ScanOutcome::Exhausted => ScanState::Exhausted,
            ScanOutcome::NoResult => ScanState::NoResult,
            ScanOutcome::Restarted => ScanState::Restarted,
            ScanOutcome::Faulted(_) => ScanState::Faulted,
        }
    }
}

/// Result of a scan that reached the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub outcome: ScanOutcome,

    /// Search counter at the end of the scan; zero if it could not be read.
    pub hashes: u64,
}

/// The open session of a running scan. Observers read it under the lock and
/// never keep their own reference, so clearing the slot leaves the scan as
/// the only owner.
type SessionSlot = Arc<RwLock<Option<Arc<AcceleratorSession>>>>;

/// Read-only view of a scanner for status displays.
#[derive(Clone)]
pub struct ScannerProbe {
    session: SessionSlot,
    thermal: Option<Arc<ThermalSensor>>,
    state: watch::Receiver<ScanState>,
}

impl ScannerProbe {
    /// Live device summary, or `"closed"` between scans.
    pub fn status_line(&self) -> String {
        let slot = self.session.read().unwrap_or_else(|e| e.into_inner());
        match slot.as_deref() {
            Some(session) => session.status_line(self.temperature()),
            None => "closed".to_string(),
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Last good temperature reading, if a sensor is attached.
    pub fn temperature(&self) -> Option<f64> {
        self.thermal.as_ref().and_then(|t| t.last())
    }

    /// Channel of state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state.clone()
    }
}

enum ReadyWait {
    Ready,
    Restarted,
    TimedOut,
}

/// Scans work items on one accelerator.
pub struct WorkScanner {
    device: Arc<dyn Device>,
    config: ScannerConfig,
    thermal: Option<Arc<ThermalSensor>>,
    session: SessionSlot,
    state: watch::Sender<ScanState>,
}

impl WorkScanner {
    pub fn new(device: Arc<dyn Device>, config: ScannerConfig) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            device,
            config,
            thermal: None,
            session: Arc::new(RwLock::new(None)),
            state,
        }
    }

    pub fn with_thermal(mut self, sensor: Arc<ThermalSensor>) -> Self {
        self.thermal = Some(sensor);
        self
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn probe(&self) -> ScannerProbe {
        ScannerProbe {
            session: Arc::clone(&self.session),
            thermal: self.thermal.clone(),
            state: self.state.subscribe(),
        }
    }

    fn set_state(&self, state: ScanState) {
        trace!(device = self.device.name(), ?state, "Scan state");
        self.state.send_replace(state);
    }

    fn publish(&self, session: Option<Arc<AcceleratorSession>>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    /// Search `work` until a result, exhaustion, fault, or `restart`.
    ///
    /// Fails only if the device could not be opened, in which case no
    /// search was attempted.
    pub async fn scan(
        &self,
        work: &WorkItem,
        restart: &CancellationToken,
    ) -> Result<ScanReport, AccelError> {
        self.set_state(ScanState::Configuring);
        let mask = work.mask();
        debug!(
            device = self.device.name(),
            leading_bits = mask.leading_ones(),
            "Scanning work"
        );

        let session = match AcceleratorSession::open(self.device.as_ref()) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.set_state(ScanState::Closed);
                return Err(e);
            }
        };
        self.publish(Some(Arc::clone(&session)));

        let outcome = match self.drive(&session, work, restart).await {
            Ok(outcome) => outcome,
            Err(fault) => ScanOutcome::Faulted(fault),
        };
        self.set_state(outcome.state());
        self.log_outcome(&outcome);

        let hashes = match session.current_nonce() {
            Ok(nonce) => nonce as u64,
            Err(e) => {
                debug!(device = self.device.name(), error = %e, "Could not read search counter");
                0
            }
        };

        // Waits out any status read in progress
        self.publish(None);
        if Arc::strong_count(&session) > 1 {
            warn!(device = self.device.name(), "Session still referenced after scan");
        }
        drop(session);
        self.set_state(ScanState::Closed);

        Ok(ScanReport { outcome, hashes })
    }

    async fn drive(
        &self,
        session: &AcceleratorSession,
        work: &WorkItem,
        restart: &CancellationToken,
    ) -> Result<ScanOutcome, ScanFault> {
        if let Some(mhz) = self.config.clock_speed {
            session.set_clock_speed(mhz)?;
        }
        session.reset()?;

        match self.wait_ready(session, restart).await? {
            ReadyWait::Ready => {}
            ReadyWait::Restarted => return Ok(ScanOutcome::Restarted),
            ReadyWait::TimedOut => return Err(ScanFault::ReadyTimeout),
        }
        self.set_state(ScanState::Ready);

        session.set_state_in(work.midstate())?;
        session.set_prefix(work.prefix())?;
        session.set_difficulty(session.layout().difficulty(&work.mask()))?;
        session.start()?;
        self.set_state(ScanState::Running);

        loop {
            match session.wait_completion(self.config.wait_tick).await {
                Ok(Some(msg)) => return Ok(self.classify(work, msg)),
                Ok(None) => {}
                Err(AccelError::ShortRead { got, expected }) => {
                    return Ok(self.short_record(got, expected));
                }
                Err(e) => return Err(e.into()),
            }

            // Tick elapsed with no completion
            if restart.is_cancelled() {
                return Ok(ScanOutcome::Restarted);
            }

            let status = session.status()?;
            trace!(
                device = self.device.name(),
                status = format_args!("{:08x}", status.bits()),
                "Tick"
            );
            if !status.is_running() {
                // The completion may still be on its way from the interrupt path
                return match session.wait_completion(self.config.stop_grace).await {
                    Ok(Some(msg)) => Ok(self.classify(work, msg)),
                    Ok(None) => Err(ScanFault::HardwareStopped),
                    Err(AccelError::ShortRead { got, expected }) => {
                        Ok(self.short_record(got, expected))
                    }
                    Err(e) => Err(e.into()),
                };
            }

            if let Some(thermal) = &self.thermal {
                thermal.refresh().await;
            }
        }
    }

    async fn wait_ready(
        &self,
        session: &AcceleratorSession,
        restart: &CancellationToken,
    ) -> Result<ReadyWait, AccelError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            if session.status()?.is_ready() {
                return Ok(ReadyWait::Ready);
            }
            if restart.is_cancelled() {
                return Ok(ReadyWait::Restarted);
            }
            if Instant::now() >= deadline {
                return Ok(ReadyWait::TimedOut);
            }
            tokio::time::sleep(self.config.ready_poll).await;
        }
    }

    fn classify(&self, work: &WorkItem, msg: CompletionMessage) -> ScanOutcome {
        let status = msg.status();
        if status.contains(Status::FOUND) {
            let nonce = msg.nonce_candidate;
            let hash = work.hash_nonce(nonce);
            let meets_target = work.meets_target(&hash);
            ScanOutcome::Found(Candidate {
                nonce,
                hash,
                meets_target,
            })
        } else if status.contains(Status::EXHAUSTED) {
            ScanOutcome::Exhausted
        } else {
            debug!(
                device = self.device.name(),
                status = format_args!("{:08x}", msg.status),
                "Completion without a result"
            );
            ScanOutcome::NoResult
        }
    }

    fn short_record(&self, got: usize, expected: usize) -> ScanOutcome {
        warn!(device = self.device.name(), got, expected, "Short completion record");
        ScanOutcome::NoResult
    }

    fn log_outcome(&self, outcome: &ScanOutcome) {
        let device = self.device.name();
        match outcome {
            ScanOutcome::Found(c) if c.meets_target => info!(
                device,
                nonce = format_args!("{:#010x}", c.nonce),
                "Found nonce"
            ),
            ScanOutcome::Found(c) => warn!(
                device,
                nonce = format_args!("{:#010x}", c.nonce),
                hash = %display_hash(&c.hash),
                "False positive, hash above target"
            ),
            ScanOutcome::Exhausted => debug!(device, "Nonce space exhausted"),
            ScanOutcome::NoResult => debug!(device, "Scan ended without a result"),
            ScanOutcome::Restarted => info!(device, "Dropping work, restart requested"),
            ScanOutcome::Faulted(fault) => error!(device, %fault, "Scan faulted"),
        }
    }
}

/// Hash in the conventional byte-reversed display order.
fn display_hash(hash: &[u8; 32]) -> String {
    let mut be = *hash;
    be.reverse();
    be[..].to_lower_hex_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::accel::{Port, RegisterLayout, Reply, Request};
    use crate::sim::{SimConfig, SimulatedCore};
    use crate::types::target_with_leading_zeros;

    fn unreachable_work() -> WorkItem {
        WorkItem::new([7; 32], [0; 12], target_with_leading_zeros(200))
    }

    fn quick_config() -> ScannerConfig {
        ScannerConfig {
            wait_tick: Duration::from_millis(20),
            ..ScannerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_failure_is_no_attempt() {
        let (driver, _core) = SimulatedCore::with_driver("sim0", SimConfig::default()).unwrap();
        let driver = Arc::new(driver);
        let _held = driver.open().unwrap();

        let scanner = WorkScanner::new(driver.clone(), quick_config());
        let result = scanner.scan(&unreachable_work(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(AccelError::Busy)));
        assert_eq!(scanner.probe().state(), ScanState::Closed);
    }

    #[tokio::test]
    async fn test_never_ready_faults_and_releases() {
        let (driver, _core) = SimulatedCore::with_driver(
            "sim0",
            SimConfig {
                reset_latency: Duration::from_secs(60),
                ..SimConfig::default()
            },
        )
        .unwrap();
        let driver = Arc::new(driver);

        let scanner = WorkScanner::new(
            driver.clone(),
            ScannerConfig {
                ready_timeout: Duration::from_millis(30),
                ..quick_config()
            },
        );
        let report = scanner
            .scan(&unreachable_work(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ScanOutcome::Faulted(ScanFault::ReadyTimeout));
        assert_eq!(report.hashes, 0);
        assert!(driver.open().is_ok());
    }

    #[tokio::test]
    async fn test_restart_while_waiting_for_ready() {
        let (driver, _core) = SimulatedCore::with_driver(
            "sim0",
            SimConfig {
                reset_latency: Duration::from_secs(60),
                ..SimConfig::default()
            },
        )
        .unwrap();

        let scanner = WorkScanner::new(Arc::new(driver), quick_config());
        let restart = CancellationToken::new();
        restart.cancel();

        let report = scanner.scan(&unreachable_work(), &restart).await.unwrap();
        assert_eq!(report.outcome, ScanOutcome::Restarted);
    }

    #[tokio::test]
    async fn test_probe_reports_live_device_then_closed() {
        let (driver, _core) = SimulatedCore::with_driver("sim0", SimConfig::default()).unwrap();
        let scanner = Arc::new(WorkScanner::new(Arc::new(driver), quick_config()));
        let probe = scanner.probe();
        assert_eq!(probe.status_line(), "closed");

        let restart = CancellationToken::new();
        let task = tokio::spawn({
            let scanner = Arc::clone(&scanner);
            let restart = restart.clone();
            async move { scanner.scan(&unreachable_work(), &restart).await }
        });

        let mut states = probe.subscribe();
        states
            .wait_for(|s| *s == ScanState::Running)
            .await
            .unwrap();
        let line = probe.status_line();
        assert!(line.starts_with("temperature=n/a status=00000002"), "{}", line);

        restart.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.outcome, ScanOutcome::Restarted);
        assert_eq!(probe.status_line(), "closed");
    }

    /// Device whose core is instantly ready and whose read stream only
    /// ever yields half a record.
    struct TruncatingDevice;

    struct TruncatingPort;

    #[async_trait]
    impl Port for TruncatingPort {
        fn request(&self, request: Request) -> Result<Reply, AccelError> {
            Ok(match request {
                Request::GetStatus => Reply::Word(Status::READY.bits()),
                Request::GetNonceCurrent => Reply::Word(17),
                _ => Reply::Done,
            })
        }

        fn try_read(&self, buf: &mut [u8]) -> Result<usize, AccelError> {
            let n = buf.len().min(4);
            buf[..n].fill(0);
            Ok(n)
        }

        async fn read(
            &self,
            buf: &mut [u8],
            _cancel: &CancellationToken,
        ) -> Result<usize, AccelError> {
            self.try_read(buf)
        }

        fn poll_readable(&self) -> Result<bool, AccelError> {
            Ok(true)
        }

        async fn readable(&self) -> Result<(), AccelError> {
            Ok(())
        }
    }

    impl Device for TruncatingDevice {
        fn name(&self) -> &str {
            "truncating"
        }

        fn layout(&self) -> RegisterLayout {
            RegisterLayout::ZeroCount
        }

        fn open(&self) -> Result<Box<dyn Port>, AccelError> {
            Ok(Box::new(TruncatingPort))
        }
    }

    #[tokio::test]
    async fn test_short_record_is_no_result() {
        let scanner = WorkScanner::new(Arc::new(TruncatingDevice), quick_config());
        let report = scanner
            .scan(&unreachable_work(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ScanOutcome::NoResult);
        assert_eq!(report.hashes, 17);
    }

    /// Device that starts, then clears RUNNING before its half record
    /// becomes readable.
    struct StoppingDevice;

    #[derive(Default)]
    struct StoppingPort {
        started: AtomicBool,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Port for StoppingPort {
        fn request(&self, request: Request) -> Result<Reply, AccelError> {
            Ok(match request {
                Request::Start => {
                    self.started.store(true, Ordering::SeqCst);
                    Reply::Done
                }
                Request::GetStatus if self.started.load(Ordering::SeqCst) => {
                    self.stopped.store(true, Ordering::SeqCst);
                    Reply::Word(0)
                }
                Request::GetStatus => Reply::Word(Status::READY.bits()),
                Request::GetNonceCurrent => Reply::Word(5),
                _ => Reply::Done,
            })
        }

        fn try_read(&self, buf: &mut [u8]) -> Result<usize, AccelError> {
            if !self.stopped.load(Ordering::SeqCst) {
                return Err(AccelError::WouldBlock);
            }
            let n = buf.len().min(4);
            buf[..n].fill(0);
            Ok(n)
        }

        async fn read(
            &self,
            buf: &mut [u8],
            _cancel: &CancellationToken,
        ) -> Result<usize, AccelError> {
            self.try_read(buf)
        }

        fn poll_readable(&self) -> Result<bool, AccelError> {
            Ok(self.stopped.load(Ordering::SeqCst))
        }

        async fn readable(&self) -> Result<(), AccelError> {
            while !self.stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok(())
        }
    }

    impl Device for StoppingDevice {
        fn name(&self) -> &str {
            "stopping"
        }

        fn layout(&self) -> RegisterLayout {
            RegisterLayout::ZeroCount
        }

        fn open(&self) -> Result<Box<dyn Port>, AccelError> {
            Ok(Box::new(StoppingPort::default()))
        }
    }

    #[tokio::test]
    async fn test_short_record_after_stop_is_no_result() {
        let scanner = WorkScanner::new(Arc::new(StoppingDevice), quick_config());
        let report = scanner
            .scan(&unreachable_work(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ScanOutcome::NoResult);
        assert_eq!(report.hashes, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_released_while_status_is_read() {
        let (driver, _core) = SimulatedCore::with_driver("sim0", SimConfig::default()).unwrap();
        let driver = Arc::new(driver);
        let scanner = Arc::new(WorkScanner::new(driver.clone(), quick_config()));
        let probe = scanner.probe();

        let stop = Arc::new(AtomicBool::new(false));
        let reader = std::thread::spawn({
            let probe = probe.clone();
            let stop = Arc::clone(&stop);
            move || {
                while !stop.load(Ordering::Relaxed) {
                    probe.status_line();
                }
            }
        });

        for _ in 0..5 {
            let restart = CancellationToken::new();
            let mut states = probe.subscribe();
            let task = tokio::spawn({
                let scanner = Arc::clone(&scanner);
                let restart = restart.clone();
                async move { scanner.scan(&unreachable_work(), &restart).await }
            });

            states
                .wait_for(|s| *s == ScanState::Running)
                .await
                .unwrap();
            restart.cancel();
            let report = task.await.unwrap().unwrap();
            assert_eq!(report.outcome, ScanOutcome::Restarted);

            // Released before scan returned
            assert!(driver.open().is_ok());
        }

        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[test]
    fn test_display_hash_reverses() {
        let mut hash = [0u8; 32];
        hash[31] = 0xab;
        assert!(display_hash(&hash).starts_with("ab00"));
    }
}
