//! Software model of an accelerator core.
//!
//! [`SimulatedCore`] implements [`RegisterFile`] for either register layout
//! and behaves like the hardware as seen from the bus: a reset takes a while
//! to report READY, START runs a nonce search on a worker thread while the
//! current-nonce counter advances, and the search ends by latching FOUND or
//! EXHAUSTED and raising the interrupt line.
//!
//! Fault hooks let tests stop the core without an interrupt or raise an
//! interrupt with nothing to report.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::accel::{RegisterLayout, Status};
use crate::driver::Driver;
use crate::driver::regs::{
    self, bytes_from_words, control, irq_line, words_from_bytes, Bank, Command, IrqLine,
    IrqSender, RegisterFile,
};
use crate::hasher;
use crate::mask::DifficultyMask;
use crate::tracing::prelude::*;

/// Simulated core parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub layout: RegisterLayout,

    /// Delay between RESET and READY.
    pub reset_latency: Duration,

    /// Last nonce searched before reporting exhaustion.
    pub last_nonce: u32,

    /// Nonces hashed per worker step.
    pub batch: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            layout: RegisterLayout::Mask,
            reset_latency: Duration::from_millis(2),
            last_nonce: u32::MAX,
            batch: 256,
        }
    }
}

/// Parameters latched by START.
#[derive(Debug, Clone, Copy)]
struct Job {
    midstate: [u8; 32],
    prefix: [u8; 12],
    mask: [u8; 32],
    /// Next nonce to evaluate; one past `u32::MAX` when the space is done
    next: u64,
}

impl Job {
    fn accepts(&self, digest: &[u8; 32]) -> bool {
        // Mask bytes are most significant first; the digest is little-endian
        self.mask
            .iter()
            .zip(digest.iter().rev())
            .all(|(m, h)| m & h == 0)
    }

    fn hash(&self, nonce: u32) -> [u8; 32] {
        hasher::candidate_hash(&self.midstate, &self.prefix, nonce)
    }
}

#[derive(Debug, Default)]
struct CoreState {
    state_in: [u8; 32],
    prefix: [u8; 12],
    mask: [u8; 32],
    zero_count: u8,
    clock: u32,

    status: Status,
    ready_at: Option<Instant>,
    nonce_current: u32,
    nonce_candidate: u32,
    halted: bool,

    /// Bumped on every reset or stall to retire the search worker
    run: u64,
    job: Option<Job>,

    bank: Option<Bank>,
    cursor: usize,
}

struct Shared {
    config: SimConfig,
    core: Mutex<CoreState>,
    irq: IrqSender,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, CoreState> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A simulated accelerator core.
pub struct SimulatedCore {
    shared: Arc<Shared>,
}

impl SimulatedCore {
    /// Create a core and the interrupt line its driver should service.
    pub fn new(config: SimConfig) -> (Arc<Self>, IrqLine) {
        let (irq, line) = irq_line();
        let core = Arc::new(Self {
            shared: Arc::new(Shared {
                config,
                core: Mutex::new(CoreState::default()),
                irq,
            }),
        });
        (core, line)
    }

    /// Create a core with a driver already bound to it.
    pub fn with_driver(
        name: impl Into<String>,
        config: SimConfig,
    ) -> std::io::Result<(Driver, Arc<Self>)> {
        let layout = config.layout;
        let (core, irq) = Self::new(config);
        let driver = Driver::new(name, layout, core.clone(), irq)?;
        Ok((driver, core))
    }

    pub fn layout(&self) -> RegisterLayout {
        self.shared.config.layout
    }

    /// Stop the search without latching a result or raising the interrupt,
    /// as a hung or power-cycled core would.
    pub fn inject_stall(&self) {
        let mut core = self.shared.core();
        core.run += 1;
        core.job = None;
        core.status = Status::empty();
        warn!("Simulated core stalled");
    }

    /// Raise the interrupt with no completion latched.
    pub fn inject_spurious_irq(&self) {
        self.shared.irq.raise();
    }

    /// Hold or release the core at its current nonce.
    pub fn set_halted(&self, halted: bool) {
        self.shared.core().halted = halted;
    }

    /// Clock register value last written.
    pub fn clock(&self) -> u32 {
        self.shared.core().clock
    }

    fn reset(&self, core: &mut CoreState) {
        let clock = core.clock;
        let run = core.run + 1;
        *core = CoreState {
            clock,
            run,
            ..CoreState::default()
        };
        if self.shared.config.reset_latency.is_zero() {
            core.status = Status::READY;
        } else {
            core.ready_at = Some(Instant::now() + self.shared.config.reset_latency);
        }
        trace!("Simulated core reset");
    }

    fn start(&self, core: &mut CoreState) {
        refresh_status(core);
        if !core.status.is_ready() {
            debug!(status = ?core.status, "START ignored, core not ready");
            return;
        }

        let mask = match self.shared.config.layout {
            RegisterLayout::ZeroCount => {
                *DifficultyMask::from_leading_zeros(core.zero_count as u32).as_bytes()
            }
            RegisterLayout::Mask => core.mask,
        };
        core.job = Some(Job {
            midstate: core.state_in,
            prefix: core.prefix,
            mask,
            next: 0,
        });
        core.status = Status::RUNNING;
        core.nonce_current = 0;

        let shared = Arc::clone(&self.shared);
        let run = core.run;
        let spawned = std::thread::Builder::new()
            .name("accel-sim".to_string())
            .spawn(move || search(shared, run));
        if let Err(e) = spawned {
            error!("Failed to spawn simulated search: {}", e);
            core.job = None;
            core.status = Status::empty();
        }
    }

    fn step(&self, core: &mut CoreState) {
        if !core.halted || !core.status.is_running() {
            return;
        }
        let Some(job) = core.job else {
            return;
        };
        let nonce = job.next as u32;
        let found = job.accepts(&job.hash(nonce));
        advance(&self.shared, core, nonce, found);
    }

    fn control(&self, core: &mut CoreState, value: u32) {
        match value {
            control::RESET => self.reset(core),
            control::START => self.start(core),
            control::STEP => self.step(core),
            other => debug!(value = other, "Unknown control value"),
        }
    }

    fn read_bank(&self, core: &mut CoreState) -> u32 {
        let Some(bank) = core.bank else {
            return 0;
        };
        let index = core.cursor;
        core.cursor += 1;
        if index >= bank.words() {
            return 0;
        }
        match bank {
            Bank::StateIn => words_from_bytes::<8>(&core.state_in)[index],
            Bank::Prefix => words_from_bytes::<3>(&core.prefix)[index],
            Bank::Mask => words_from_bytes::<8>(&core.mask)[index],
            Bank::Clock => core.clock,
            Bank::NonceCandidate => core.nonce_candidate,
            Bank::DebugEnable => !core.halted as u32,
        }
    }

    fn write_bank(&self, core: &mut CoreState, value: u32) {
        let Some(bank) = core.bank else {
            return;
        };
        let index = core.cursor;
        core.cursor += 1;
        if index >= bank.words() {
            return;
        }
        match bank {
            Bank::StateIn => put_word(&mut core.state_in, index, value),
            Bank::Prefix => put_word(&mut core.prefix, index, value),
            Bank::Mask => put_word(&mut core.mask, index, value),
            Bank::Clock => core.clock = value,
            Bank::NonceCandidate => {}
            Bank::DebugEnable => core.halted = value == 0,
        }
    }
}

fn put_word(bytes: &mut [u8], index: usize, value: u32) {
    bytes_from_words(&[value], &mut bytes[index * 4..index * 4 + 4]);
}

fn refresh_status(core: &mut CoreState) {
    if let Some(at) = core.ready_at {
        if Instant::now() >= at {
            core.ready_at = None;
            core.status = Status::READY;
        }
    }
}

/// Record that `nonce` was evaluated and finish the search if it was accepted
/// or was the last one.
fn advance(shared: &Shared, core: &mut CoreState, nonce: u32, found: bool) {
    let Some(job) = core.job.as_mut() else {
        return;
    };
    job.next = nonce as u64 + 1;
    core.nonce_current = job.next.min(u32::MAX as u64) as u32;

    let outcome = if found {
        core.nonce_candidate = nonce;
        Status::FOUND
    } else if nonce == shared.config.last_nonce {
        Status::EXHAUSTED
    } else {
        return;
    };

    core.job = None;
    core.status = outcome;
    shared.irq.raise();
}

/// Search worker for one START.
fn search(shared: Arc<Shared>, run: u64) {
    let last = shared.config.last_nonce as u64;
    let batch = shared.config.batch.max(1) as u64;

    loop {
        let job = {
            let core = shared.core();
            if core.run != run {
                return;
            }
            match core.job {
                Some(job) if !core.halted => Some(job),
                Some(_) => None,
                None => return,
            }
        };

        let Some(job) = job else {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };

        let start = job.next;
        let end = (start + batch - 1).min(last);
        let hit = (start..=end)
            .map(|n| n as u32)
            .find(|&nonce| job.accepts(&job.hash(nonce)));

        let mut core = shared.core();
        if core.run != run {
            return;
        }
        // A step may have moved the counter while we were hashing
        if core.job.map(|j| j.next) != Some(start) {
            continue;
        }
        match hit {
            Some(nonce) => {
                advance(&shared, &mut core, nonce, true);
                return;
            }
            None => advance(&shared, &mut core, end as u32, false),
        }
        if core.job.is_none() {
            return;
        }
    }
}

impl RegisterFile for SimulatedCore {
    fn read(&self, word: usize) -> u32 {
        let mut core = self.shared.core();
        refresh_status(&mut core);

        match self.shared.config.layout {
            RegisterLayout::ZeroCount => {
                use regs::zero_count as zc;
                match word {
                    zc::STATE_IN..=7 => words_from_bytes::<8>(&core.state_in)[word - zc::STATE_IN],
                    zc::PREFIX..=10 => words_from_bytes::<3>(&core.prefix)[word - zc::PREFIX],
                    zc::LEADING_ZEROS => core.zero_count as u32,
                    zc::NONCE_CANDIDATE => core.nonce_candidate,
                    zc::NONCE_CURRENT => core.nonce_current,
                    zc::STATUS => core.status.bits(),
                    zc::DEBUG_ENABLE => !core.halted as u32,
                    _ => 0,
                }
            }
            RegisterLayout::Mask => match word {
                regs::mask::COMMAND => core.bank.map(Bank::select).unwrap_or(0),
                regs::mask::DATA => self.read_bank(&mut core),
                regs::mask::STATUS => core.status.bits(),
                regs::mask::NONCE_CURRENT => core.nonce_current,
                _ => 0,
            },
        }
    }

    fn write(&self, word: usize, value: u32) {
        let mut core = self.shared.core();

        match self.shared.config.layout {
            RegisterLayout::ZeroCount => {
                use regs::zero_count as zc;
                match word {
                    zc::STATE_IN..=7 => put_word(&mut core.state_in, word - zc::STATE_IN, value),
                    zc::PREFIX..=10 => put_word(&mut core.prefix, word - zc::PREFIX, value),
                    zc::LEADING_ZEROS => core.zero_count = value as u8,
                    zc::CONTROL => self.control(&mut core, value),
                    zc::DEBUG_ENABLE => core.halted = value == 0,
                    _ => {}
                }
            }
            RegisterLayout::Mask => match word {
                regs::mask::COMMAND => match Command::decode(value) {
                    Command::Select(bank) => {
                        core.bank = Some(bank);
                        core.cursor = 0;
                    }
                    Command::Control(value) => self.control(&mut core, value),
                    Command::Invalid(value) => debug!(value, "Invalid command word"),
                },
                regs::mask::DATA => self.write_bank(&mut core, value),
                _ => {}
            },
        }
    }

    fn write_byte(&self, word: usize, value: u8) {
        self.write(word, value as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_status(core: &SimulatedCore, word: usize, want: impl Fn(Status) -> bool) -> Status {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = Status::from_bits_retain(core.read(word));
            if want(status) || Instant::now() > deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_reset_reports_ready_after_latency() {
        let (core, _irq) = SimulatedCore::new(SimConfig {
            layout: RegisterLayout::ZeroCount,
            reset_latency: Duration::from_millis(20),
            ..SimConfig::default()
        });

        core.write(regs::zero_count::CONTROL, control::RESET);
        assert_eq!(core.read(regs::zero_count::STATUS), 0);

        let status = wait_status(&core, regs::zero_count::STATUS, Status::is_ready);
        assert!(status.is_ready());
    }

    #[test]
    fn test_exhausts_and_raises_interrupt() {
        let (core, irq) = SimulatedCore::new(SimConfig {
            layout: RegisterLayout::ZeroCount,
            reset_latency: Duration::ZERO,
            last_nonce: 99,
            batch: 16,
        });

        core.write(regs::zero_count::CONTROL, control::RESET);
        core.write_byte(regs::zero_count::LEADING_ZEROS, 200);
        core.write(regs::zero_count::CONTROL, control::START);

        assert!(irq.wait());
        let status = Status::from_bits_retain(core.read(regs::zero_count::STATUS));
        assert_eq!(status, Status::EXHAUSTED);
        assert_eq!(core.read(regs::zero_count::NONCE_CURRENT), 100);
    }

    #[test]
    fn test_start_before_ready_is_ignored() {
        let (core, _irq) = SimulatedCore::new(SimConfig::default());
        core.write(regs::mask::COMMAND, control::START);
        assert_eq!(core.read(regs::mask::STATUS), 0);
    }

    #[test]
    fn test_mask_banks_auto_increment() {
        let (core, _irq) = SimulatedCore::new(SimConfig::default());

        core.write(regs::mask::COMMAND, Bank::Prefix.select());
        for value in [1, 2, 3, 4] {
            core.write(regs::mask::DATA, value);
        }
        core.write(regs::mask::COMMAND, Bank::Prefix.select());
        let words: Vec<u32> = (0..4).map(|_| core.read(regs::mask::DATA)).collect();
        // The fourth write and read fall off the end of the bank
        assert_eq!(words, vec![1, 2, 3, 0]);

        core.write(regs::mask::COMMAND, Bank::Clock.select());
        core.write(regs::mask::DATA, 110);
        assert_eq!(core.clock(), 110);
    }

    #[test]
    fn test_halted_core_steps_one_nonce() {
        let (core, _irq) = SimulatedCore::new(SimConfig {
            layout: RegisterLayout::ZeroCount,
            reset_latency: Duration::ZERO,
            ..SimConfig::default()
        });
        core.write(regs::zero_count::CONTROL, control::RESET);
        core.write_byte(regs::zero_count::LEADING_ZEROS, 200);
        core.set_halted(true);
        core.write(regs::zero_count::CONTROL, control::START);

        for _ in 0..3 {
            core.write(regs::zero_count::CONTROL, control::STEP);
        }
        assert_eq!(core.read(regs::zero_count::NONCE_CURRENT), 3);
        assert!(Status::from_bits_retain(core.read(regs::zero_count::STATUS)).is_running());

        core.write(regs::zero_count::CONTROL, control::RESET);
    }

    #[test]
    fn test_stall_clears_running_silently() {
        let (core, _irq) = SimulatedCore::new(SimConfig {
            reset_latency: Duration::ZERO,
            ..SimConfig::default()
        });
        core.write(regs::mask::COMMAND, control::RESET);
        core.write(regs::mask::COMMAND, Bank::Mask.select());
        for _ in 0..8 {
            core.write(regs::mask::DATA, u32::MAX);
        }
        core.write(regs::mask::COMMAND, control::START);
        assert!(Status::from_bits_retain(core.read(regs::mask::STATUS)).is_running());

        core.inject_stall();
        assert_eq!(core.read(regs::mask::STATUS), 0);
    }
}
