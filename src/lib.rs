//! picoboot3 bootloader client.
//!
//! Reprograms the flash of a device running the picoboot3 bootloader over
//! UART, I2C or SPI. A [`Programmer`] owns a [`Transport`] and walks the
//! session through activation, info queries, erase, program with
//! read-back verify, verify, blank check and dump.
//!
//! ```ignore
//! let mut p = Programmer::new(transport, Options::default())?;
//! p.open()?;
//! if !p.activate()? {
//!     // not a picoboot3 device
//! }
//! let size = p.flash_size_command()?;
//! ```

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

use thiserror::Error;

pub mod chunk;
pub mod protocol;
pub mod transport;

mod programmer;

#[cfg(feature = "linux")]
pub mod linux;

pub use chunk::{Control, NoProgress, Outcome, Progress, StopReason, Stopped};
pub use programmer::{Geometry, Programmer, Region, SectorRange, Version};
pub use protocol::{Envelope, ProtocolError, Status};
pub use transport::{LinkOptions, SerialPort, Transport, TransportError};

/// Default flash sector size, the minimum erasable unit
pub const FLASH_SECTOR_SIZE: u32 = 4096;

/// Default first flash offset owned by application code
pub const APPCODE_OFFSET: u32 = 0x8000;

/// Default value of an erased flash byte
pub const ERASED_VALUE: u8 = 0xFF;

pub const MIN_TRANSFER_SIZE: u8 = 1;
pub const MAX_TRANSFER_SIZE: u8 = 16;

/// Session state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Not activated, the link may or may not be open
    Closed,
    /// Bootloader answered the activation handshake
    Activated,
    /// Flash geometry known, flash operations allowed
    Ready,
    /// A corrupt or unexpected reply desynchronised the session
    Faulted,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Bytes per program/read transfer and sectors per erase transfer (1-16)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "16"))]
    pub transfer_size: u8,

    /// Flash sector size in bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "4096"))]
    pub sector_size: u32,

    /// First flash offset available to application code
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "32768"))]
    pub appcode_offset: u32,

    /// Value of an erased flash byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "255"))]
    pub erased_value: u8,

    /// Log progress of each operation
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            transfer_size: MAX_TRANSFER_SIZE,
            sector_size: FLASH_SECTOR_SIZE,
            appcode_offset: APPCODE_OFFSET,
            erased_value: ERASED_VALUE,
            verbose: false,
        }
    }
}

impl Options {
    /// Check option ranges, done once when a programmer is built
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_size < MIN_TRANSFER_SIZE || self.transfer_size > MAX_TRANSFER_SIZE {
            return Err(ConfigError::TransferSize(self.transfer_size));
        }
        if self.sector_size == 0 {
            return Err(ConfigError::SectorSize);
        }
        if self.appcode_offset % self.sector_size != 0 {
            return Err(ConfigError::AppcodeAlignment {
                offset: self.appcode_offset,
                sector_size: self.sector_size,
            });
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum ConfigError {
    #[error("transfer size {0} outside 1..=16")]
    TransferSize(u8),

    #[error("sector size must be non-zero")]
    SectorSize,

    #[error("appcode offset 0x{offset:x} is not aligned to the {sector_size} byte sector size")]
    AppcodeAlignment { offset: u32, sector_size: u32 },
}

/// Requests refused before anything is sent to the device
#[derive(Clone, PartialEq, Debug, Error)]
pub enum PreconditionError {
    #[error("link is not open")]
    NotOpen,

    #[error("bootloader is not activated")]
    NotActivated,

    #[error("sector range is empty")]
    EmptyRange,

    #[error("flash region is empty")]
    EmptyRegion,

    #[error("0x{start:x} lies in the bootloader region below 0x{appcode_offset:x}")]
    Protected { start: u32, appcode_offset: u32 },

    #[error("sector {sector} lies in the bootloader region below sector {first_app_sector}")]
    ProtectedSector { sector: u32, first_app_sector: u32 },

    #[error("end 0x{end:x} exceeds flash size 0x{flash_size:x}")]
    OutOfBounds { end: u64, flash_size: u32 },
}

/// Failure of a single request/reply exchange
#[derive(Debug, Error)]
pub enum ExchangeError<E: Debug> {
    #[error("{0}")]
    Transport(TransportError<E>),

    #[error("{0}")]
    Protocol(ProtocolError),

    #[error("device replied {0:?}")]
    Rejected(Status),
}

#[derive(Debug, Error)]
pub enum Error<E: Debug> {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(TransportError<E>),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("device replied {0:?}")]
    Rejected(Status),

    /// A multi-chunk operation failed, chunks before `index` were applied
    #[error("chunk {index} at 0x{start:x} failed: {cause}")]
    Chunk {
        index: usize,
        start: u32,
        cause: ExchangeError<E>,
    },

    #[error("cancelled after {completed} bytes")]
    Cancelled { completed: usize },

    #[error("session faulted, close and reopen it")]
    Faulted,
}

impl<E: Debug> From<TransportError<E>> for Error<E> {
    fn from(e: TransportError<E>) -> Self {
        Self::Transport(e)
    }
}

impl<E: Debug> From<ProtocolError> for Error<E> {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl<E: Debug> From<ExchangeError<E>> for Error<E> {
    fn from(e: ExchangeError<E>) -> Self {
        match e {
            ExchangeError::Transport(e) => Self::Transport(e),
            ExchangeError::Protocol(e) => Self::Protocol(e),
            ExchangeError::Rejected(s) => Self::Rejected(s),
        }
    }
}

impl<E: Debug> Error<E> {
    /// True for errors raised before any device interaction
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_))
    }
}
