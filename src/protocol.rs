//! picoboot3 wire protocol: opcodes, status codes and frame encoding.
//!
//! A request is an opcode plus parameter bytes, a reply is a status plus a
//! payload whose length is fixed by the request. Both are wrapped in an
//! [`Envelope`] that depends on the physical link: UART frames carry a sync
//! byte and a trailing checksum, I2C/SPI frames put the checksum in the
//! header and start replies with a ready marker the bus bindings poll for.

use thiserror::Error;

/// Sync byte starting every UART frame
pub const UART_SYNC: u8 = 0x70;

/// First byte of an I2C/SPI reply once the device has a reply ready
pub const BUS_READY: u8 = 0x5A;

/// Filler clocked out on SPI while reading a reply
pub const SPI_FILL: u8 = 0x00;

/// Payload the bootloader answers an activation request with
pub const ACTIVATION_MAGIC: [u8; 4] = *b"pbt3";

/// Length of the UART envelope around the payload (sync, status, length, crc)
pub const STREAM_OVERHEAD: usize = 5;

/// Length of the I2C/SPI reply envelope (ready, status, length, crc)
pub const BUS_REPLY_OVERHEAD: usize = 5;

/// Length of the I2C/SPI request envelope (opcode, length, crc)
pub const BUS_REQUEST_OVERHEAD: usize = 4;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Confirm the device is running picoboot3 and enable flash commands
    Activate = 0xA5,

    /// Fetch the bootloader version as major, minor, patch
    Version = 0x02,

    /// Read up to one transfer of flash starting at an offset
    Read = 0x10,

    /// Program up to one transfer of flash starting at an offset
    Program = 0x20,

    /// Erase a list of flash sectors
    Erase = 0x30,

    /// Leave the bootloader and jump to the application code
    GoToAppcode = 0x40,

    /// Fetch the total flash size in bytes
    FlashSize = 0x50,
}

/// Reply status codes
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Status {
    Ack = 0x79,
    Nack = 0x1F,
    /// The request targeted the bootloader's own region
    Protected = 0x3F,
}

impl Status {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x79 => Some(Status::Ack),
            0x1F => Some(Status::Nack),
            0x3F => Some(Status::Protected),
            _ => None,
        }
    }
}

/// Link-dependent framing around requests and replies
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Envelope {
    /// UART: `[sync][kind][len lo][len hi][payload..][crc]`
    Stream,
    /// I2C/SPI: `[kind][len lo][len hi][crc][payload..]`, replies prefixed with [`BUS_READY`]
    Bus,
}

impl Envelope {
    /// Total reply frame length for a payload of `payload_len` bytes
    pub fn reply_len(&self, payload_len: usize) -> usize {
        match self {
            Envelope::Stream => payload_len + STREAM_OVERHEAD,
            Envelope::Bus => payload_len + BUS_REPLY_OVERHEAD,
        }
    }

    /// Total request frame length for `params_len` parameter bytes
    pub fn request_len(&self, params_len: usize) -> usize {
        match self {
            Envelope::Stream => params_len + STREAM_OVERHEAD,
            Envelope::Bus => params_len + BUS_REQUEST_OVERHEAD,
        }
    }
}

/// Ways a reply frame can fail validation
#[derive(Debug, PartialEq, Clone, Error)]
pub enum Corruption {
    #[error("frame is {found} bytes, expected {expected}")]
    FrameLength { expected: usize, found: usize },

    #[error("bad marker 0x{found:02x}, expected 0x{expected:02x}")]
    Marker { expected: u8, found: u8 },

    #[error("length field {found}, command implies {expected}")]
    PayloadLength { expected: usize, found: usize },

    #[error("checksum 0x{found:02x}, computed 0x{expected:02x}")]
    Checksum { expected: u8, found: u8 },
}

#[derive(Debug, PartialEq, Clone, Error)]
pub enum ProtocolError {
    #[error("corrupt reply: {0}")]
    Corrupt(#[from] Corruption),

    #[error("unexpected status 0x{0:02x}")]
    UnexpectedStatus(u8),
}

/// A single command frame, immutable once built
#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    command: Command,
    params: Vec<u8>,
    reply_len: usize,
}

impl Request {
    fn new(command: Command, params: Vec<u8>, reply_len: usize) -> Self {
        Self { command, params, reply_len }
    }

    pub fn activate() -> Self {
        Self::new(Command::Activate, vec![], ACTIVATION_MAGIC.len())
    }

    pub fn version() -> Self {
        Self::new(Command::Version, vec![], 3)
    }

    pub fn flash_size() -> Self {
        Self::new(Command::FlashSize, vec![], 4)
    }

    pub fn go_to_appcode() -> Self {
        Self::new(Command::GoToAppcode, vec![], 0)
    }

    /// Read `len` bytes at `offset`
    pub fn read(offset: u32, len: u16) -> Self {
        let mut params = Vec::with_capacity(6);
        params.extend_from_slice(&offset.to_le_bytes());
        params.extend_from_slice(&len.to_le_bytes());
        Self::new(Command::Read, params, len as usize)
    }

    /// Program `data` at `offset`
    pub fn program(offset: u32, data: &[u8]) -> Self {
        let mut params = Vec::with_capacity(4 + data.len());
        params.extend_from_slice(&offset.to_le_bytes());
        params.extend_from_slice(data);
        Self::new(Command::Program, params, 0)
    }

    /// Erase each listed sector
    pub fn erase(sectors: &[u32]) -> Self {
        let params = sectors.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(Command::Erase, params, 0)
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Payload length the reply to this request must carry
    pub fn reply_len(&self) -> usize {
        self.reply_len
    }

    /// Encode into a wire frame
    pub fn encode(&self, envelope: Envelope) -> Vec<u8> {
        wrap(envelope, self.command as u8, &self.params, None)
    }
}

/// A decoded reply frame
#[derive(Debug, PartialEq, Clone)]
pub struct Reply {
    pub status: Status,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn is_ack(&self) -> bool {
        self.status == Status::Ack
    }

    /// Encode a reply; used by device simulators
    pub fn encode(&self, envelope: Envelope) -> Vec<u8> {
        wrap(envelope, self.status as u8, &self.payload, Some(BUS_READY))
    }
}

fn wrap(envelope: Envelope, kind: u8, body: &[u8], bus_prefix: Option<u8>) -> Vec<u8> {
    let len = (body.len() as u16).to_le_bytes();
    let crc = crc8(&[&[kind], &len[..], body]);

    let mut frame = Vec::with_capacity(body.len() + STREAM_OVERHEAD);
    match envelope {
        Envelope::Stream => {
            frame.push(UART_SYNC);
            frame.push(kind);
            frame.extend_from_slice(&len);
            frame.extend_from_slice(body);
            frame.push(crc);
        }
        Envelope::Bus => {
            if let Some(p) = bus_prefix {
                frame.push(p);
            }
            frame.push(kind);
            frame.extend_from_slice(&len);
            frame.push(crc);
            frame.extend_from_slice(body);
        }
    }
    frame
}

/// Decode a reply frame for `request`
pub fn decode(envelope: Envelope, request: &Request, frame: &[u8]) -> Result<Reply, ProtocolError> {
    let expected = request.reply_len();
    if frame.len() != envelope.reply_len(expected) {
        return Err(Corruption::FrameLength {
            expected: envelope.reply_len(expected),
            found: frame.len(),
        }
        .into());
    }

    let marker = match envelope {
        Envelope::Stream => UART_SYNC,
        Envelope::Bus => BUS_READY,
    };
    if frame[0] != marker {
        return Err(Corruption::Marker { expected: marker, found: frame[0] }.into());
    }

    let status = frame[1];
    let len = [frame[2], frame[3]];
    let found_len = u16::from_le_bytes(len) as usize;
    if found_len != expected {
        return Err(Corruption::PayloadLength { expected, found: found_len }.into());
    }

    let (payload, found_crc) = match envelope {
        Envelope::Stream => (&frame[4..4 + expected], frame[4 + expected]),
        Envelope::Bus => (&frame[5..], frame[4]),
    };

    let crc = crc8(&[&[status], &len[..], payload]);
    if crc != found_crc {
        return Err(Corruption::Checksum { expected: crc, found: found_crc }.into());
    }

    let status = Status::from_byte(status).ok_or(ProtocolError::UnexpectedStatus(status))?;

    Ok(Reply { status, payload: payload.to_vec() })
}

/// CRC-8 (poly 0x07, init 0x00) over a sequence of slices
pub fn crc8(parts: &[&[u8]]) -> u8 {
    let mut crc: u8 = 0;
    for b in parts.iter().flat_map(|p| p.iter()) {
        crc ^= *b;
        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
