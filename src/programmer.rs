//! Bootloader session and flash operations.

use core::fmt;
use core::ops::{Range, RangeInclusive};

use crate::chunk::{Chunks, Halt, NoProgress, Outcome, Progress, Step, StopReason};
use crate::protocol::{self, Reply, Request, ACTIVATION_MAGIC};
use crate::transport::Transport;
use crate::{ConfigError, Error, ExchangeError, Options, PreconditionError, State};

/// Bootloader version reported by the device
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Flash layout as seen by the session
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Geometry {
    pub sector_size: u32,
    pub appcode_offset: u32,
    /// Total flash size, known once queried
    pub flash_size: Option<u32>,
}

impl Geometry {
    /// First sector owned by application code
    pub fn first_app_sector(&self) -> u32 {
        self.appcode_offset / self.sector_size
    }

    /// Bytes available to application code
    pub fn available(&self) -> Option<u32> {
        self.flash_size.map(|s| s.saturating_sub(self.appcode_offset))
    }

    /// Number of sectors needed to hold `len` bytes
    pub fn sectors_for(&self, len: usize) -> u32 {
        ((len as u64 + self.sector_size as u64 - 1) / self.sector_size as u64) as u32
    }
}

/// Inclusive range of flash sector indices
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SectorRange {
    first: u32,
    count: u64,
}

impl SectorRange {
    pub fn new(first: u32, count: u32) -> Self {
        Self { first, count: count as u64 }
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    /// Last sector, `None` for an empty range
    pub fn last(&self) -> Option<u64> {
        if self.count == 0 {
            None
        } else {
            Some(self.end() - 1)
        }
    }

    /// One past the last sector
    pub fn end(&self) -> u64 {
        self.first as u64 + self.count
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl From<Range<u32>> for SectorRange {
    fn from(r: Range<u32>) -> Self {
        Self::new(r.start, r.end.saturating_sub(r.start))
    }
}

impl From<RangeInclusive<u32>> for SectorRange {
    fn from(r: RangeInclusive<u32>) -> Self {
        let (first, last) = r.into_inner();
        let count = (last as u64 + 1).saturating_sub(first as u64);
        Self { first, count }
    }
}

/// Byte region of flash targeted by program, verify and dump
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Region {
    pub offset: u32,
    pub len: usize,
}

impl Region {
    pub fn new(offset: u32, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.len as u64
    }
}

/// picoboot3 session over a transport
pub struct Programmer<T> {
    transport: T,
    options: Options,
    state: State,
    linked: bool,
    version: Option<Version>,
    flash_size: Option<u32>,
}

impl<T> Programmer<T>
where
    T: Transport,
{
    /// Create a new programmer instance, rejecting invalid options
    pub fn new(transport: T, options: Options) -> Result<Self, ConfigError> {
        options.validate()?;

        Ok(Self {
            transport,
            options,
            state: State::Closed,
            linked: false,
            version: None,
            flash_size: None,
        })
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            sector_size: self.options.sector_size,
            appcode_offset: self.options.appcode_offset,
            flash_size: self.flash_size,
        }
    }

    /// Release the transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Establish the physical link, the session stays closed until activated
    pub fn open(&mut self) -> Result<(), Error<T::Error>> {
        if self.state == State::Faulted {
            return Err(Error::Faulted);
        }

        debug!("Opening link");
        self.transport.open()?;
        self.linked = true;

        Ok(())
    }

    /// Release the link and forget cached device info
    pub fn close(&mut self) -> Result<(), Error<T::Error>> {
        let linked = self.linked;

        self.linked = false;
        self.state = State::Closed;
        self.version = None;
        self.flash_size = None;

        if linked {
            debug!("Closing link");
            self.transport.close()?;
        }

        Ok(())
    }

    /// Run the activation handshake.
    ///
    /// Returns `false` when the device does not answer like a picoboot3
    /// bootloader; the session then stays closed.
    pub fn activate(&mut self) -> Result<bool, Error<T::Error>> {
        if self.state == State::Faulted {
            return Err(Error::Faulted);
        }
        if !self.linked {
            return Err(PreconditionError::NotOpen.into());
        }

        debug!("Sending activation command");

        let reply = match self.transact(&Request::activate()) {
            Ok(r) => r,
            Err(e) => {
                warn!("No valid activation reply: {}", e);
                return Ok(false);
            }
        };

        if !reply.is_ack() || reply.payload[..] != ACTIVATION_MAGIC[..] {
            warn!("Unexpected activation reply: {:?} {:02x?}", reply.status, reply.payload);
            return Ok(false);
        }

        if self.state == State::Closed {
            self.state = State::Activated;
        }
        self.note(format_args!("Bootloader activated"));

        Ok(true)
    }

    /// Fetch the bootloader version
    pub fn version_command(&mut self) -> Result<Version, Error<T::Error>> {
        self.check_activated()?;

        if let Some(v) = self.version {
            return Ok(v);
        }

        let reply = self.query(&Request::version())?;
        let v = Version {
            major: reply.payload[0],
            minor: reply.payload[1],
            patch: reply.payload[2],
        };

        debug!("Bootloader version {}", v);
        self.version = Some(v);

        Ok(v)
    }

    /// Fetch the total flash size in bytes
    pub fn flash_size_command(&mut self) -> Result<u32, Error<T::Error>> {
        self.check_activated()?;

        if let Some(s) = self.flash_size {
            return Ok(s);
        }

        let reply = self.query(&Request::flash_size())?;
        let size = u32::from_le_bytes([reply.payload[0], reply.payload[1], reply.payload[2], reply.payload[3]]);

        if size <= self.options.appcode_offset {
            error!("Flash size 0x{:x} leaves no room for application code", size);
            self.state = State::Faulted;
            return Err(Error::Faulted);
        }

        debug!("Flash size {} bytes", size);
        self.flash_size = Some(size);
        self.state = State::Ready;

        Ok(size)
    }

    /// Erase a range of sectors
    pub fn erase<R: Into<SectorRange>>(&mut self, sectors: R) -> Result<Outcome, Error<T::Error>> {
        self.erase_with(sectors, &mut NoProgress)
    }

    /// Erase a range of sectors, reporting progress in sectors
    pub fn erase_with<R, P>(&mut self, sectors: R, progress: &mut P) -> Result<Outcome, Error<T::Error>>
    where
        R: Into<SectorRange>,
        P: Progress + ?Sized,
    {
        let range = sectors.into();
        let geometry = self.geometry();

        self.check_activated()?;

        let last = range.last().ok_or(PreconditionError::EmptyRange)?;
        if range.first() < geometry.first_app_sector() {
            return Err(PreconditionError::ProtectedSector {
                sector: range.first(),
                first_app_sector: geometry.first_app_sector(),
            }
            .into());
        }

        // Bounds are checked in u64 before any sector index is formed as u32
        let flash_size = self.flash_size_command()?;
        let end = range
            .end()
            .checked_mul(geometry.sector_size as u64)
            .unwrap_or(u64::MAX);
        if end > flash_size as u64 {
            return Err(PreconditionError::OutOfBounds { end, flash_size }.into());
        }

        self.note(format_args!("Erasing sectors {}..={}", range.first(), last));

        let chunks = Chunks::sectors(range.first(), range.count() as usize, self.transfer_size());
        let result = chunks.run(progress, |chunk| {
            let sectors: Vec<u32> = (chunk.start..chunk.start + chunk.len as u32).collect();
            let reply = self.request(&Request::erase(&sectors))?;

            if reply.is_ack() {
                Ok(Step::Continue)
            } else {
                Ok(Step::Stop(StopReason::Rejected(reply.status)))
            }
        });

        self.finish("Erase", result)
    }

    /// Program `data` at `offset`, reading back every chunk
    pub fn program(&mut self, offset: u32, data: &[u8]) -> Result<Outcome, Error<T::Error>> {
        self.program_with(offset, data, &mut NoProgress)
    }

    /// Program `data` at `offset`, reporting progress in bytes.
    ///
    /// Each chunk is written then read back and compared before the next one
    /// is sent. A refused or mismatching chunk stops the operation, leaving
    /// the preceding chunks programmed.
    pub fn program_with<P>(&mut self, offset: u32, data: &[u8], progress: &mut P) -> Result<Outcome, Error<T::Error>>
    where
        P: Progress + ?Sized,
    {
        self.check_region(Region::new(offset, data.len()))?;

        self.note(format_args!("Programming {} bytes at 0x{:08x}", data.len(), offset));

        let chunks = Chunks::bytes(offset, data.len(), self.transfer_size());
        let result = chunks.run(progress, |chunk| {
            let at = (chunk.start - offset) as usize;
            let part = &data[at..at + chunk.len];

            let reply = self.request(&Request::program(chunk.start, part))?;
            if !reply.is_ack() {
                return Ok(Step::Stop(StopReason::Rejected(reply.status)));
            }

            let reply = self.request(&Request::read(chunk.start, chunk.len as u16))?;
            if !reply.is_ack() {
                return Ok(Step::Stop(StopReason::Rejected(reply.status)));
            }

            if reply.payload[..] != part[..] {
                debug!("Read-back mismatch at 0x{:08x}: wrote {:02x?} read {:02x?}", chunk.start, part, reply.payload);
                return Ok(Step::Stop(StopReason::Mismatch));
            }

            Ok(Step::Continue)
        });

        self.finish("Program", result)
    }

    /// Compare flash at `offset` with `data`
    pub fn verify(&mut self, offset: u32, data: &[u8]) -> Result<bool, Error<T::Error>> {
        self.verify_with(offset, data, &mut NoProgress)
    }

    pub fn verify_with<P>(&mut self, offset: u32, data: &[u8], progress: &mut P) -> Result<bool, Error<T::Error>>
    where
        P: Progress + ?Sized,
    {
        self.note(format_args!("Verifying {} bytes at 0x{:08x}", data.len(), offset));

        let read = self.read_region(Region::new(offset, data.len()), progress)?;

        match read.iter().zip(data).position(|(a, b)| a != b) {
            None => {
                self.note(format_args!("Verify passed"));
                Ok(true)
            }
            Some(i) => {
                warn!(
                    "Verify failed at 0x{:08x}: expected 0x{:02x} read 0x{:02x}",
                    offset as usize + i,
                    data[i],
                    read[i]
                );
                Ok(false)
            }
        }
    }

    /// Check that `len` bytes at `offset` are all erased
    pub fn verify_blank(&mut self, offset: u32, len: usize) -> Result<bool, Error<T::Error>> {
        self.verify_blank_with(offset, len, &mut NoProgress)
    }

    pub fn verify_blank_with<P>(&mut self, offset: u32, len: usize, progress: &mut P) -> Result<bool, Error<T::Error>>
    where
        P: Progress + ?Sized,
    {
        self.note(format_args!("Blank checking {} bytes at 0x{:08x}", len, offset));

        let erased = self.options.erased_value;
        let read = self.read_region(Region::new(offset, len), progress)?;

        match read.iter().position(|b| *b != erased) {
            None => {
                self.note(format_args!("Blank check passed"));
                Ok(true)
            }
            Some(i) => {
                warn!("Blank check failed at 0x{:08x}: read 0x{:02x}", offset as usize + i, read[i]);
                Ok(false)
            }
        }
    }

    /// Read `len` bytes at `offset`, optionally logging a hex dump
    pub fn dump(&mut self, offset: u32, len: usize, show_dump: bool) -> Result<Vec<u8>, Error<T::Error>> {
        self.dump_with(offset, len, show_dump, &mut NoProgress)
    }

    pub fn dump_with<P>(&mut self, offset: u32, len: usize, show_dump: bool, progress: &mut P) -> Result<Vec<u8>, Error<T::Error>>
    where
        P: Progress + ?Sized,
    {
        let data = self.read_region(Region::new(offset, len), progress)?;

        if show_dump {
            for (i, row) in data.chunks(16).enumerate() {
                info!("{:08x}: {}", offset as usize + i * 16, hex::encode(row));
            }
        }

        Ok(data)
    }

    /// Leave the bootloader and start the application.
    ///
    /// The session returns to `Closed`; the link stays open.
    pub fn go_to_appcode(&mut self) -> Result<(), Error<T::Error>> {
        self.check_activated()?;

        self.note(format_args!("Jumping to application code"));
        self.query(&Request::go_to_appcode())?;

        self.state = State::Closed;
        self.version = None;
        self.flash_size = None;

        Ok(())
    }

    fn transfer_size(&self) -> usize {
        self.options.transfer_size as usize
    }

    fn note(&self, args: fmt::Arguments<'_>) {
        if self.options.verbose {
            info!("{}", args);
        } else {
            debug!("{}", args);
        }
    }

    fn check_activated(&self) -> Result<(), Error<T::Error>> {
        match self.state {
            State::Faulted => Err(Error::Faulted),
            State::Closed if !self.linked => Err(PreconditionError::NotOpen.into()),
            State::Closed => Err(PreconditionError::NotActivated.into()),
            State::Activated | State::Ready => Ok(()),
        }
    }

    /// Validate a byte region, fetching the flash size if not yet known
    fn check_region(&mut self, region: Region) -> Result<(), Error<T::Error>> {
        self.check_activated()?;

        if region.len == 0 {
            return Err(PreconditionError::EmptyRegion.into());
        }
        if region.offset < self.options.appcode_offset {
            return Err(PreconditionError::Protected {
                start: region.offset,
                appcode_offset: self.options.appcode_offset,
            }
            .into());
        }

        let flash_size = self.flash_size_command()?;
        if region.end() > flash_size as u64 {
            return Err(PreconditionError::OutOfBounds { end: region.end(), flash_size }.into());
        }

        Ok(())
    }

    fn read_region<P>(&mut self, region: Region, progress: &mut P) -> Result<Vec<u8>, Error<T::Error>>
    where
        P: Progress + ?Sized,
    {
        self.check_region(region)?;

        let mut data = Vec::with_capacity(region.len);

        let chunks = Chunks::bytes(region.offset, region.len, self.transfer_size());
        let result = chunks.run(progress, |chunk| {
            let reply = self.request(&Request::read(chunk.start, chunk.len as u16))?;
            if !reply.is_ack() {
                return Err(ExchangeError::Rejected(reply.status));
            }

            data.extend_from_slice(&reply.payload);
            Ok(Step::Continue)
        });

        match result {
            Ok(()) => Ok(data),
            Err(Halt::Stopped(s)) => Err(Error::Cancelled { completed: s.completed }),
            Err(Halt::Failed { chunk, error, .. }) => {
                error!("Read failed at chunk {} (0x{:08x}): {}", chunk.index, chunk.start, error);
                Err(Error::Chunk { index: chunk.index, start: chunk.start, cause: error })
            }
        }
    }

    /// Map the end of a chunked flash operation to its outcome
    fn finish(&self, what: &str, result: Result<(), Halt<ExchangeError<T::Error>>>) -> Result<Outcome, Error<T::Error>> {
        match result {
            Ok(()) => {
                self.note(format_args!("{} complete", what));
                Ok(Outcome::Complete)
            }
            Err(Halt::Stopped(s)) => {
                warn!(
                    "{} stopped at chunk {} (0x{:x}) after {} units: {:?}",
                    what, s.chunk, s.start, s.completed, s.reason
                );
                Ok(Outcome::Incomplete(s))
            }
            Err(Halt::Failed { chunk, completed, error }) => {
                error!(
                    "{} failed at chunk {} (0x{:x}) after {} units: {}",
                    what, chunk.index, chunk.start, completed, error
                );
                Err(Error::Chunk { index: chunk.index, start: chunk.start, cause: error })
            }
        }
    }

    /// Single exchange without touching session state
    fn transact(&mut self, request: &Request) -> Result<Reply, ExchangeError<T::Error>> {
        let envelope = self.transport.envelope();
        let frame = request.encode(envelope);
        let mut buff = vec![0u8; envelope.reply_len(request.reply_len())];

        trace!("TX {:?}: {:02x?}", request.command(), frame);

        self.transport.exchange(&frame, &mut buff).map_err(ExchangeError::Transport)?;

        trace!("RX: {:02x?}", buff);

        protocol::decode(envelope, request, &buff).map_err(ExchangeError::Protocol)
    }

    /// Single exchange, faulting the session on a protocol error
    fn request(&mut self, request: &Request) -> Result<Reply, ExchangeError<T::Error>> {
        match self.transact(request) {
            Err(ExchangeError::Protocol(e)) => {
                error!("Protocol error on {:?}: {}", request.command(), e);
                self.state = State::Faulted;
                Err(ExchangeError::Protocol(e))
            }
            other => other,
        }
    }

    /// Exchange for commands where anything but an ack is an error
    fn query(&mut self, request: &Request) -> Result<Reply, Error<T::Error>> {
        let reply = self.request(request)?;
        if !reply.is_ack() {
            return Err(Error::Rejected(reply.status));
        }
        Ok(reply)
    }
}
