//! Simulated picoboot3 device backed by an in-memory flash.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use picoboot3::protocol::{self, Command, Envelope, Reply, Status, ACTIVATION_MAGIC, UART_SYNC};
use picoboot3::{Options, Programmer, Transport, TransportError};

pub const FLASH_SIZE: u32 = 1024;
pub const SECTOR_SIZE: u32 = 256;
pub const APPCODE_OFFSET: u32 = 256;

/// One request as seen by the device
#[derive(Clone, Debug, PartialEq)]
pub struct Seen {
    pub opcode: u8,
    pub params: Vec<u8>,
}

impl Seen {
    pub fn is(&self, c: Command) -> bool {
        self.opcode == c as u8
    }

    pub fn offset(&self) -> u32 {
        u32::from_le_bytes([self.params[0], self.params[1], self.params[2], self.params[3]])
    }

    pub fn sectors(&self) -> Vec<u32> {
        self.params
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

pub struct SimState {
    pub flash: Vec<u8>,
    pub sector_size: u32,
    pub appcode_offset: u32,
    pub version: [u8; 3],
    pub seen: Vec<Seen>,
    pub open: bool,
    /// Never answer activation
    pub silent: bool,
    /// Answer activation with this payload
    pub magic: [u8; 4],
    /// NACK erase requests listing this sector
    pub nack_sector: Option<u32>,
    /// Flip bit 0 of this byte whenever it is programmed
    pub flip_at: Option<u32>,
    /// Reply to exchange `n` with a payload one byte short
    pub short_reply_at: Option<usize>,
    /// Time out exchange `n`
    pub timeout_at: Option<usize>,
    /// Damage the checksum of the reply to exchange `n`
    pub bad_checksum_at: Option<usize>,
    /// Replace the status byte of the reply to exchange `n`, keeping the checksum valid
    pub status_at: Option<(usize, u8)>,
}

impl SimState {
    pub fn exchanges(&self) -> usize {
        self.seen.len()
    }

    pub fn count(&self, c: Command) -> usize {
        self.seen.iter().filter(|s| s.is(c)).count()
    }

    pub fn requests(&self, c: Command) -> Vec<Seen> {
        self.seen.iter().filter(|s| s.is(c)).cloned().collect()
    }

    fn handle(&mut self, opcode: u8, params: &[u8]) -> Reply {
        let ack = |payload: Vec<u8>| Reply { status: Status::Ack, payload };

        match opcode {
            x if x == Command::Activate as u8 => ack(self.magic.to_vec()),
            x if x == Command::Version as u8 => ack(self.version.to_vec()),
            x if x == Command::FlashSize as u8 => ack((self.flash.len() as u32).to_le_bytes().to_vec()),
            x if x == Command::Read as u8 => {
                let offset = u32::from_le_bytes([params[0], params[1], params[2], params[3]]) as usize;
                let len = u16::from_le_bytes([params[4], params[5]]) as usize;
                ack(self.flash[offset..offset + len].to_vec())
            }
            x if x == Command::Program as u8 => {
                let offset = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
                if offset < self.appcode_offset {
                    return Reply { status: Status::Protected, payload: vec![] };
                }
                for (i, b) in params[4..].iter().enumerate() {
                    let at = offset + i as u32;
                    let mut v = *b;
                    if self.flip_at == Some(at) {
                        v ^= 0x01;
                    }
                    // NOR flash programming only clears bits
                    self.flash[at as usize] &= v;
                }
                ack(vec![])
            }
            x if x == Command::Erase as u8 => {
                let sectors: Vec<u32> = params
                    .chunks(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                if sectors.iter().any(|s| Some(*s) == self.nack_sector) {
                    return Reply { status: Status::Nack, payload: vec![] };
                }
                for s in sectors {
                    let start = (s * self.sector_size) as usize;
                    let end = start + self.sector_size as usize;
                    for b in &mut self.flash[start..end] {
                        *b = 0xFF;
                    }
                }
                ack(vec![])
            }
            x if x == Command::GoToAppcode as u8 => ack(vec![]),
            _ => Reply { status: Status::Nack, payload: vec![] },
        }
    }
}

/// Transport handle onto a shared simulated device
pub struct SimDevice {
    pub envelope: Envelope,
    pub state: Rc<RefCell<SimState>>,
}

impl SimDevice {
    pub fn new(envelope: Envelope) -> (Self, Rc<RefCell<SimState>>) {
        Self::with_geometry(envelope, FLASH_SIZE, SECTOR_SIZE, APPCODE_OFFSET)
    }

    pub fn with_geometry(
        envelope: Envelope,
        flash_size: u32,
        sector_size: u32,
        appcode_offset: u32,
    ) -> (Self, Rc<RefCell<SimState>>) {
        // Application area starts out programmed so erases are observable
        let mut flash = vec![0xFF; flash_size as usize];
        for (i, b) in flash.iter_mut().enumerate().skip(appcode_offset as usize) {
            *b = (i % 251) as u8;
        }

        let state = Rc::new(RefCell::new(SimState {
            flash,
            sector_size,
            appcode_offset,
            version: [1, 2, 3],
            seen: vec![],
            open: false,
            silent: false,
            magic: ACTIVATION_MAGIC,
            nack_sector: None,
            flip_at: None,
            short_reply_at: None,
            timeout_at: None,
            bad_checksum_at: None,
            status_at: None,
        }));

        (Self { envelope, state: state.clone() }, state)
    }
}

fn split_request(envelope: Envelope, frame: &[u8]) -> (u8, Vec<u8>) {
    match envelope {
        Envelope::Stream => {
            assert_eq!(frame[0], UART_SYNC);
            let len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
            assert_eq!(frame.len(), len + 5);
            let crc = protocol::crc8(&[&frame[1..4 + len]]);
            assert_eq!(crc, frame[4 + len], "request checksum");
            (frame[1], frame[4..4 + len].to_vec())
        }
        Envelope::Bus => {
            let len = u16::from_le_bytes([frame[1], frame[2]]) as usize;
            assert_eq!(frame.len(), len + 4);
            let crc = protocol::crc8(&[&frame[..3], &frame[4..]]);
            assert_eq!(crc, frame[3], "request checksum");
            (frame[0], frame[4..].to_vec())
        }
    }
}

fn crc_index(envelope: Envelope, frame: &[u8]) -> usize {
    match envelope {
        Envelope::Stream => frame.len() - 1,
        Envelope::Bus => 4,
    }
}

/// Rewrite the status byte of an encoded reply and fix up its checksum
fn restatus(envelope: Envelope, frame: &mut [u8], status: u8) {
    frame[1] = status;
    let at = crc_index(envelope, frame);
    let payload = match envelope {
        Envelope::Stream => &frame[4..at],
        Envelope::Bus => &frame[5..],
    };
    let crc = protocol::crc8(&[&frame[1..4], payload]);
    frame[at] = crc;
}

impl Transport for SimDevice {
    type Error = ();

    fn envelope(&self) -> Envelope {
        self.envelope
    }

    fn open(&mut self) -> Result<(), TransportError<()>> {
        self.state.borrow_mut().open = true;
        Ok(())
    }

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<(), TransportError<()>> {
        let mut s = self.state.borrow_mut();
        if !s.open {
            return Err(TransportError::Closed);
        }

        let (opcode, params) = split_request(self.envelope, request);
        let n = s.seen.len();
        s.seen.push(Seen { opcode, params: params.clone() });

        if s.timeout_at == Some(n) || (s.silent && opcode == Command::Activate as u8) {
            return Err(TransportError::Timeout);
        }

        let mut reply = s.handle(opcode, &params);
        if s.short_reply_at == Some(n) {
            reply.payload.pop();
        }

        let mut frame = reply.encode(self.envelope);
        if let Some((_, status)) = s.status_at.filter(|(at, _)| *at == n) {
            restatus(self.envelope, &mut frame, status);
        }
        if s.bad_checksum_at == Some(n) {
            let idx = crc_index(self.envelope, &frame);
            frame[idx] ^= 0xFF;
        }

        for b in response.iter_mut() {
            *b = 0;
        }
        let n = frame.len().min(response.len());
        response[..n].copy_from_slice(&frame[..n]);

        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError<()>> {
        self.state.borrow_mut().open = false;
        Ok(())
    }
}

pub fn options(transfer_size: u8) -> Options {
    Options {
        transfer_size,
        sector_size: SECTOR_SIZE,
        appcode_offset: APPCODE_OFFSET,
        ..Default::default()
    }
}

/// Opened and activated programmer over a fresh simulated device
pub fn session(envelope: Envelope, transfer_size: u8) -> (Programmer<SimDevice>, Rc<RefCell<SimState>>) {
    let (dev, state) = SimDevice::new(envelope);
    let mut p = Programmer::new(dev, options(transfer_size)).unwrap();

    p.open().unwrap();
    assert!(p.activate().unwrap());

    (p, state)
}

/// Deterministic test pattern
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(37).wrapping_add(seed)).collect()
}
