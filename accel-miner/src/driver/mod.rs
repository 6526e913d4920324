//! Device-side driver for an accelerator core behind a register file.
//!
//! The driver owns the register window, translates [`Request`]s into
//! register sequences for the core's layout, and services the interrupt line
//! on a dedicated thread. Each interrupt latches the status and nonce
//! candidate into a [`CompletionMessage`] on the completion queue, from which
//! the open handle reads.
//!
//! Only one handle may be open at a time. A reset discards any completion
//! messages still queued from earlier work.

pub mod regs;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::accel::{
    AccelError, CompletionMessage, CompletionQueue, Device, Port, RegisterLayout, Reply, Request,
    Status,
};
use crate::tracing::prelude::*;
use regs::{control, words_from_bytes, Bank, IrqLine, RegisterFile};

/// Driver instance for one core.
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    name: String,
    layout: RegisterLayout,
    regs: Arc<dyn RegisterFile>,

    /// Serializes multi-word register sequences, including the interrupt
    /// service routine.
    io: Mutex<()>,

    queue: CompletionQueue,

    /// Held by the open handle.
    exclusive: Arc<tokio::sync::Mutex<()>>,

    interrupts: AtomicU64,
    spurious: AtomicU64,
}

impl Driver {
    /// Bind a driver to a register window and its interrupt line.
    ///
    /// Spawns the interrupt service thread, which exits when the interrupt
    /// source goes away or the driver is dropped.
    pub fn new(
        name: impl Into<String>,
        layout: RegisterLayout,
        regs: Arc<dyn RegisterFile>,
        irq: IrqLine,
    ) -> std::io::Result<Self> {
        let inner = Arc::new(DriverInner {
            name: name.into(),
            layout,
            regs,
            io: Mutex::new(()),
            queue: CompletionQueue::new(),
            exclusive: Arc::new(tokio::sync::Mutex::new(())),
            interrupts: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("accel-irq".to_string())
            .spawn(move || service_loop(weak, irq))?;

        info!(device = %inner.name, layout = %layout, "Accelerator driver bound");
        Ok(Self { inner })
    }

    /// Completion messages waiting to be read.
    pub fn pending_messages(&self) -> usize {
        self.inner.queue.len()
    }

    /// Interrupts serviced, including spurious ones.
    pub fn interrupt_count(&self) -> u64 {
        self.inner.interrupts.load(Ordering::Relaxed)
    }

    /// Interrupts that carried no completion and were dropped.
    pub fn spurious_count(&self) -> u64 {
        self.inner.spurious.load(Ordering::Relaxed)
    }
}

impl Device for Driver {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn layout(&self) -> RegisterLayout {
        self.inner.layout
    }

    fn open(&self) -> Result<Box<dyn Port>, AccelError> {
        let guard = Arc::clone(&self.inner.exclusive)
            .try_lock_owned()
            .map_err(|_| AccelError::Busy)?;

        Ok(Box::new(DriverHandle {
            inner: Arc::clone(&self.inner),
            _exclusive: guard,
        }))
    }
}

fn service_loop(inner: Weak<DriverInner>, irq: IrqLine) {
    while irq.wait() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.service_interrupt();
        inner.interrupts.fetch_add(1, Ordering::Relaxed);
    }
    trace!("Interrupt thread exiting");
}

impl DriverInner {
    fn io(&self) -> MutexGuard<'_, ()> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_word(&self) -> usize {
        match self.layout {
            RegisterLayout::ZeroCount => regs::zero_count::STATUS,
            RegisterLayout::Mask => regs::mask::STATUS,
        }
    }

    fn nonce_current_word(&self) -> usize {
        match self.layout {
            RegisterLayout::ZeroCount => regs::zero_count::NONCE_CURRENT,
            RegisterLayout::Mask => regs::mask::NONCE_CURRENT,
        }
    }

    fn command(&self, value: u32) {
        match self.layout {
            RegisterLayout::ZeroCount => self.regs.write(regs::zero_count::CONTROL, value),
            RegisterLayout::Mask => self.regs.write(regs::mask::COMMAND, value),
        }
    }

    fn write_bank(&self, bank: Bank, words: &[u32]) {
        self.regs.write(regs::mask::COMMAND, bank.select());
        for word in words {
            self.regs.write(regs::mask::DATA, *word);
        }
    }

    fn read_bank(&self, bank: Bank) -> Vec<u32> {
        self.regs.write(regs::mask::COMMAND, bank.select());
        (0..bank.words())
            .map(|_| self.regs.read(regs::mask::DATA))
            .collect()
    }

    fn set_debug_enable(&self, enabled: bool) {
        let value = enabled as u32;
        match self.layout {
            RegisterLayout::ZeroCount => self.regs.write(regs::zero_count::DEBUG_ENABLE, value),
            RegisterLayout::Mask => self.write_bank(Bank::DebugEnable, &[value]),
        }
    }

    fn reset(&self) {
        self.command(control::RESET);
        let dropped = self.queue.flush();
        if dropped > 0 {
            debug!(device = %self.name, dropped, "Discarded stale completions on reset");
        }
    }

    fn dispatch(&self, request: Request) -> Result<Reply, AccelError> {
        trace!(device = %self.name, request = request.name(), "Request");
        let _io = self.io();

        use regs::zero_count as zc;
        use RegisterLayout::{Mask, ZeroCount};

        match (self.layout, request) {
            (_, Request::Reset) => self.reset(),
            (_, Request::Start) => self.command(control::START),
            (_, Request::Step) => {
                if !cfg!(debug_assertions) {
                    return Err(AccelError::Unsupported("Step in release builds".into()));
                }
                self.command(control::STEP);
            }

            (_, Request::GetStatus) => {
                return Ok(Reply::Word(self.regs.read(self.status_word())));
            }
            (_, Request::GetNonceCurrent) => {
                return Ok(Reply::Word(self.regs.read(self.nonce_current_word())));
            }
            (_, Request::GetDebugRegisters) => {
                return Ok(Reply::Registers(self.dump_registers()));
            }

            (ZeroCount, Request::SetStateIn(bytes)) => {
                let words: [u32; 8] = words_from_bytes(&bytes);
                for (i, word) in words.iter().enumerate() {
                    self.regs.write(zc::STATE_IN + i, *word);
                }
            }
            (ZeroCount, Request::SetPrefix(bytes)) => {
                let words: [u32; 3] = words_from_bytes(&bytes);
                for (i, word) in words.iter().enumerate() {
                    self.regs.write(zc::PREFIX + i, *word);
                }
            }
            (ZeroCount, Request::SetNumLeadingZeros(count)) => {
                self.regs.write_byte(zc::LEADING_ZEROS, count);
            }
            (ZeroCount, Request::SetDifficultyMask(_) | Request::SetClockSpeed(_)) => {
                return Err(AccelError::Unsupported(format!(
                    "{} on the {} layout",
                    request.name(),
                    self.layout
                )));
            }

            (Mask, Request::SetStateIn(bytes)) => {
                self.write_bank(Bank::StateIn, &words_from_bytes::<8>(&bytes))
            }
            (Mask, Request::SetPrefix(bytes)) => {
                self.write_bank(Bank::Prefix, &words_from_bytes::<3>(&bytes))
            }
            (Mask, Request::SetDifficultyMask(bytes)) => {
                self.write_bank(Bank::Mask, &words_from_bytes::<8>(&bytes))
            }
            (Mask, Request::SetNumLeadingZeros(_)) => {
                return Err(AccelError::Unsupported(format!(
                    "{} on the {} layout",
                    request.name(),
                    self.layout
                )));
            }
            (Mask, Request::SetClockSpeed(mhz)) => self.write_bank(Bank::Clock, &[mhz]),
        }

        Ok(Reply::Done)
    }

    /// Snapshot every register with the core halted.
    fn dump_registers(&self) -> Vec<u32> {
        self.set_debug_enable(false);
        let words = match self.layout {
            RegisterLayout::ZeroCount => (0..regs::zero_count::WORDS)
                .map(|word| self.regs.read(word))
                .collect(),
            RegisterLayout::Mask => {
                let mut words = vec![
                    self.regs.read(regs::mask::STATUS),
                    self.regs.read(regs::mask::NONCE_CURRENT),
                ];
                for bank in Bank::ALL {
                    words.extend(self.read_bank(bank));
                }
                words
            }
        };
        self.set_debug_enable(true);
        words
    }

    fn service_interrupt(&self) {
        // Push under the register lock so a concurrent reset either flushes
        // this message or runs before the status read
        let _io = self.io();
        let status = self.regs.read(self.status_word());
        if !Status::from_bits_retain(status).is_completion() {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            trace!(device = %self.name, status = format_args!("{:08x}", status), "Spurious interrupt");
            return;
        }

        let nonce_candidate = match self.layout {
            RegisterLayout::ZeroCount => self.regs.read(regs::zero_count::NONCE_CANDIDATE),
            RegisterLayout::Mask => self.read_bank(Bank::NonceCandidate)[0],
        };
        self.set_debug_enable(true);

        let msg = CompletionMessage {
            status,
            nonce_candidate,
        };
        trace!(
            device = %self.name,
            status = format_args!("{:08x}", msg.status),
            nonce = format_args!("{:08x}", msg.nonce_candidate),
            "Completion queued"
        );
        self.queue.push(msg);
    }
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        // Leave the core stopped
        let _io = self.io();
        self.command(control::RESET);
        let dropped = self.queue.drain().len();
        debug!(device = %self.name, dropped, "Accelerator driver unbound");
    }
}

/// The open, exclusive handle returned by [`Driver::open`](Device::open).
struct DriverHandle {
    inner: Arc<DriverInner>,
    _exclusive: OwnedMutexGuard<()>,
}

impl DriverHandle {
    fn copy_out(msg: CompletionMessage, buf: &mut [u8]) -> usize {
        let bytes = msg.to_bytes();
        let n = buf.len().min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        n
    }
}

#[async_trait]
impl Port for DriverHandle {
    fn request(&self, request: Request) -> Result<Reply, AccelError> {
        self.inner.dispatch(request)
    }

    fn try_read(&self, buf: &mut [u8]) -> Result<usize, AccelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let msg = self.inner.queue.try_recv().ok_or(AccelError::WouldBlock)?;
        Ok(Self::copy_out(msg, buf))
    }

    async fn read(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, AccelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let msg = self.inner.queue.recv(cancel).await?;
        Ok(Self::copy_out(msg, buf))
    }

    fn poll_readable(&self) -> Result<bool, AccelError> {
        Ok(self.inner.queue.is_ready())
    }

    async fn readable(&self) -> Result<(), AccelError> {
        self.inner.queue.readable().await;
        Ok(())
    }
}
