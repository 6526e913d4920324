//! Command set, status word and completion message format.

use bytes::{Buf, BufMut};
use strum::{EnumString, FromRepr, IntoStaticStr};

use super::AccelError;
use crate::mask::DifficultyMask;

/// Number of words returned by a debug register dump over the character
/// device.
pub const DEBUG_REGISTER_COUNT: usize = 20;

bitflags::bitflags! {
    /// Accelerator status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Status: u32 {
        /// Reset complete, parameters may be written
        const READY = 0x01;
        /// Search in progress
        const RUNNING = 0x02;
        /// Search stopped on a mask-accepted nonce
        const FOUND = 0x10;
        /// Search stopped after the last nonce
        const EXHAUSTED = 0x20;
    }
}

impl Status {
    /// Ready and nothing else: the state right after a completed reset.
    pub fn is_ready(self) -> bool {
        self.intersection(Status::all()) == Status::READY
    }

    pub fn is_running(self) -> bool {
        self.contains(Status::RUNNING)
    }

    /// Whether the status carries a search result.
    pub fn is_completion(self) -> bool {
        self.intersects(Status::FOUND | Status::EXHAUSTED)
    }
}

/// Result of one search, as delivered through the read stream.
///
/// On the wire this is two native-endian 32-bit words: the status word latched
/// at completion, then the nonce candidate register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionMessage {
    pub status: u32,
    pub nonce_candidate: u32,
}

impl CompletionMessage {
    /// Encoded size in bytes.
    pub const LEN: usize = 8;

    pub fn new(status: Status, nonce_candidate: u32) -> Self {
        Self {
            status: status.bits(),
            nonce_candidate,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_bits_retain(self.status)
    }

    pub fn is_found(&self) -> bool {
        self.status().contains(Status::FOUND)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        let mut dst = &mut out[..];
        dst.put_u32_ne(self.status);
        dst.put_u32_ne(self.nonce_candidate);
        out
    }

    /// Decode from the first eight bytes of `src`.
    pub fn decode(mut src: &[u8]) -> Result<Self, AccelError> {
        if src.len() < Self::LEN {
            return Err(AccelError::ShortRead {
                got: src.len(),
                expected: Self::LEN,
            });
        }
        Ok(Self {
            status: src.get_u32_ne(),
            nonce_candidate: src.get_u32_ne(),
        })
    }
}

/// Register layout variant of the accelerator core.
///
/// The two variants differ in how difficulty is expressed: a one-byte count of
/// required leading zero bits, or a full 32-byte mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumString)]
pub enum RegisterLayout {
    /// Flat 17-word window with a leading-zero count byte
    #[strum(serialize = "count")]
    ZeroCount,

    /// Four-word window with a command register and banked data port
    #[strum(serialize = "mask")]
    Mask,
}

impl RegisterLayout {
    /// Encode a mask as this layout's difficulty parameter.
    pub fn difficulty(&self, mask: &DifficultyMask) -> Difficulty {
        match self {
            RegisterLayout::ZeroCount => Difficulty::LeadingZeros(mask.zero_count()),
            RegisterLayout::Mask => Difficulty::Mask(*mask),
        }
    }

    /// Whether the layout exposes a clock-speed register.
    pub fn has_clock(&self) -> bool {
        matches!(self, RegisterLayout::Mask)
    }
}

/// Difficulty parameter in either encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    LeadingZeros(u8),
    Mask(DifficultyMask),
}

impl Difficulty {
    pub fn request(&self) -> Request {
        match self {
            Difficulty::LeadingZeros(n) => Request::SetNumLeadingZeros(*n),
            Difficulty::Mask(mask) => Request::SetDifficultyMask(*mask.as_bytes()),
        }
    }
}

/// Request numbers of the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum RequestCode {
    Reset = 0,
    Start = 1,
    SetStateIn = 2,
    SetPrefix = 3,
    SetNumLeadingZeros = 4,
    // 5 was a raw control-word write, superseded by Reset/Start/Step
    GetNonceCurrent = 6,
    GetStatus = 7,
    GetDebugRegisters = 8,
    SetDifficultyMask = 9,
    SetClockSpeed = 10,
    Step = 11,
}

/// A control request with its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Reset,
    Start,
    SetStateIn([u8; 32]),
    SetPrefix([u8; 12]),
    SetNumLeadingZeros(u8),
    SetDifficultyMask([u8; 32]),
    SetClockSpeed(u32),
    GetNonceCurrent,
    GetStatus,
    GetDebugRegisters,
    /// Advance a halted core by one nonce (debug builds only)
    Step,
}

impl Request {
    pub fn code(&self) -> RequestCode {
        match self {
            Request::Reset => RequestCode::Reset,
            Request::Start => RequestCode::Start,
            Request::SetStateIn(_) => RequestCode::SetStateIn,
            Request::SetPrefix(_) => RequestCode::SetPrefix,
            Request::SetNumLeadingZeros(_) => RequestCode::SetNumLeadingZeros,
            Request::SetDifficultyMask(_) => RequestCode::SetDifficultyMask,
            Request::SetClockSpeed(_) => RequestCode::SetClockSpeed,
            Request::GetNonceCurrent => RequestCode::GetNonceCurrent,
            Request::GetStatus => RequestCode::GetStatus,
            Request::GetDebugRegisters => RequestCode::GetDebugRegisters,
            Request::Step => RequestCode::Step,
        }
    }

    pub fn name(&self) -> &'static str {
        self.code().into()
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    Word(u32),
    Registers(Vec<u32>),
}

impl Reply {
    pub fn into_word(self) -> Result<u32, AccelError> {
        match self {
            Reply::Word(word) => Ok(word),
            other => Err(AccelError::ProtocolViolation(format!(
                "expected a word reply, got {:?}",
                other
            ))),
        }
    }

    pub fn into_registers(self) -> Result<Vec<u32>, AccelError> {
        match self {
            Reply::Registers(words) => Ok(words),
            other => Err(AccelError::ProtocolViolation(format!(
                "expected a register dump, got {:?}",
                other
            ))),
        }
    }
}
