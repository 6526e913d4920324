//! Register windows of the two core variants and the interrupt line.
//!
//! All offsets are in 32-bit words from the start of the window.

use std::sync::mpsc;

use strum::FromRepr;

/// Memory-mapped register window of one accelerator core.
///
/// Implementations must tolerate concurrent access; the driver serializes
/// multi-word sequences itself.
pub trait RegisterFile: Send + Sync {
    fn read(&self, word: usize) -> u32;

    fn write(&self, word: usize, value: u32);

    /// Single-byte store at the start of `word`.
    fn write_byte(&self, word: usize, value: u8);
}

/// Values written to the control register (count layout) or issued as
/// commands (mask layout).
pub mod control {
    pub const RESET: u32 = 0x1;
    pub const START: u32 = 0x2;
    pub const STEP: u32 = 0x4;
}

/// Flat layout with a one-byte leading-zero count.
pub mod zero_count {
    pub const STATE_IN: usize = 0;
    pub const PREFIX: usize = 8;
    pub const LEADING_ZEROS: usize = 11;
    pub const NONCE_CANDIDATE: usize = 12;
    pub const NONCE_CURRENT: usize = 13;
    pub const STATUS: usize = 14;
    pub const CONTROL: usize = 15;
    /// 0 halts the core, 1 lets it run
    pub const DEBUG_ENABLE: usize = 16;
    pub const WORDS: usize = 17;
}

/// Banked layout: parameters are written through an auto-incrementing data
/// port after selecting a bank.
pub mod mask {
    pub const COMMAND: usize = 0;
    pub const DATA: usize = 1;
    pub const STATUS: usize = 2;
    pub const NONCE_CURRENT: usize = 3;
    pub const WORDS: usize = 4;

    /// Command-register flag marking a bank selection.
    pub const SELECT: u32 = 0x100;
}

/// Data banks of the mask layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum Bank {
    StateIn = 0,
    Prefix = 1,
    Mask = 2,
    Clock = 3,
    NonceCandidate = 4,
    DebugEnable = 5,
}

impl Bank {
    pub const ALL: [Bank; 6] = [
        Bank::StateIn,
        Bank::Prefix,
        Bank::Mask,
        Bank::Clock,
        Bank::NonceCandidate,
        Bank::DebugEnable,
    ];

    /// Size of the bank in words.
    pub fn words(self) -> usize {
        match self {
            Bank::StateIn | Bank::Mask => 8,
            Bank::Prefix => 3,
            Bank::Clock | Bank::NonceCandidate | Bank::DebugEnable => 1,
        }
    }

    /// Command word that selects this bank and rewinds its cursor.
    pub fn select(self) -> u32 {
        mask::SELECT | self as u32
    }
}

/// Decoded mask-layout command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Select(Bank),
    Control(u32),
    Invalid(u32),
}

impl Command {
    pub fn decode(word: u32) -> Self {
        if word & mask::SELECT != 0 {
            match Bank::from_repr(word & !mask::SELECT) {
                Some(bank) => Command::Select(bank),
                None => Command::Invalid(word),
            }
        } else {
            Command::Control(word)
        }
    }
}

/// Pack bytes into words the way a byte copy into the window would.
pub fn words_from_bytes<const W: usize>(bytes: &[u8]) -> [u32; W] {
    let mut words = [0u32; W];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Inverse of [`words_from_bytes`].
pub fn bytes_from_words(words: &[u32], bytes: &mut [u8]) {
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
}

/// Create a connected interrupt source and line.
pub fn irq_line() -> (IrqSender, IrqLine) {
    let (tx, rx) = mpsc::channel();
    (IrqSender(tx), IrqLine(rx))
}

/// Core side of the interrupt line.
#[derive(Debug, Clone)]
pub struct IrqSender(mpsc::Sender<()>);

impl IrqSender {
    /// Assert the interrupt. Returns false once nothing services the line.
    pub fn raise(&self) -> bool {
        self.0.send(()).is_ok()
    }
}

/// Driver side of the interrupt line.
#[derive(Debug)]
pub struct IrqLine(mpsc::Receiver<()>);

impl IrqLine {
    /// Block until the next interrupt. Returns false once the source is gone.
    pub fn wait(&self) -> bool {
        self.0.recv().is_ok()
    }
}
