//! Physical links to the bootloader.
//!
//! A [`Transport`] moves one request frame to the device and one reply
//! frame back. Bindings are provided for any embedded-hal serial port, I2C
//! bus or SPI bus; none of them retry, a failed exchange is reported as is.

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::{i2c, spi};
use embedded_hal::serial::{Read, Write};

use thiserror::Error;

use crate::protocol::{Envelope, BUS_READY, SPI_FILL};

/// Serial port with modem control lines, used to reset the target
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum TransportError<E: Debug> {
    #[error("no reply before timeout")]
    Timeout,

    #[error("I/O failure: {0:?}")]
    Io(E),

    #[error("link is not open")]
    Closed,
}

impl<E: Debug> TransportError<E> {
    /// Convert the underlying I/O error
    pub fn map<F: Debug>(self, f: impl FnOnce(E) -> F) -> TransportError<F> {
        match self {
            TransportError::Timeout => TransportError::Timeout,
            TransportError::Io(e) => TransportError::Io(f(e)),
            TransportError::Closed => TransportError::Closed,
        }
    }
}

/// Request/reply link to a bootloader
pub trait Transport {
    type Error: Debug;

    /// Framing used on this link
    fn envelope(&self) -> Envelope;

    /// Bring the link up
    fn open(&mut self) -> Result<(), TransportError<Self::Error>>;

    /// Send `request` and block until `response` is filled or the link times out
    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<(), TransportError<Self::Error>>;

    /// Release the link, calling this on a closed link is a no-op
    fn close(&mut self) -> Result<(), TransportError<Self::Error>>;
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct LinkOptions {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Pulse DTR/RTS to reset the device when opening a UART link
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub reset: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            reset: false,
        }
    }
}

/// Shared wait loop: call `poll` until it yields or the timeout passes
fn poll_until<T, E, D, F>(delay: &mut D, options: &LinkOptions, mut poll: F) -> Result<T, TransportError<E>>
where
    E: Debug,
    D: DelayMs<u32>,
    F: FnMut() -> Result<Option<T>, TransportError<E>>,
{
    let mut t = 0;

    loop {
        if let Some(v) = poll()? {
            return Ok(v);
        }

        // Wait for delay period
        delay.delay_ms(options.poll_delay_ms);
        t += options.poll_delay_ms.max(1);

        if t > options.response_timeout_ms {
            debug!("Receive timeout after {} ms", t);
            return Err(TransportError::Timeout);
        }
    }
}

/// UART binding
pub struct UartTransport<P, D, E> {
    port: P,
    delay: D,
    options: LinkOptions,
    open: bool,
    _err: PhantomData<E>,
}

impl<P, D, E> UartTransport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(port: P, delay: D, options: LinkOptions) -> Self {
        Self { port, delay, options, open: false, _err: PhantomData }
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    fn reset(&mut self) -> Result<(), TransportError<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true).map_err(TransportError::Io)?;
        self.port.set_rts(true).map_err(TransportError::Io)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false).map_err(TransportError::Io)?;
        self.port.set_rts(false).map_err(TransportError::Io)?;

        self.delay.delay_ms(100u32);

        Ok(())
    }

    fn drain(&mut self) -> Result<usize, TransportError<E>> {
        let mut n = 0;
        loop {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => return Ok(n),
                Err(nb::Error::Other(e)) => return Err(TransportError::Io(e)),
            }
        }
    }
}

impl<P, D, E> Transport for UartTransport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = E;

    fn envelope(&self) -> Envelope {
        Envelope::Stream
    }

    fn open(&mut self) -> Result<(), TransportError<E>> {
        if self.options.reset {
            self.reset()?;
        }

        let stale = self.drain()?;
        if stale > 0 {
            debug!("Discarded {} stale bytes", stale);
        }

        self.open = true;
        Ok(())
    }

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<(), TransportError<E>> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        for b in request {
            block!(self.port.write(*b)).map_err(TransportError::Io)?;
        }
        block!(self.port.flush()).map_err(TransportError::Io)?;

        // One timeout budget covers the whole reply
        let Self { port, delay, options, .. } = self;
        let mut filled = 0;
        poll_until(&mut *delay, options, || {
            while filled < response.len() {
                match port.read() {
                    Ok(v) => {
                        response[filled] = v;
                        filled += 1;
                    }
                    Err(nb::Error::WouldBlock) => return Ok(None),
                    Err(nb::Error::Other(e)) => return Err(TransportError::Io(e)),
                }
            }
            Ok(Some(()))
        })
    }

    fn close(&mut self) -> Result<(), TransportError<E>> {
        self.open = false;
        Ok(())
    }
}

/// I2C binding, the device answers at `address`
pub struct I2cTransport<B, D> {
    bus: B,
    address: u8,
    delay: D,
    options: LinkOptions,
    open: bool,
}

impl<B, D, E> I2cTransport<B, D>
where
    B: i2c::Write<Error = E> + i2c::Read<Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(bus: B, address: u8, delay: D, options: LinkOptions) -> Self {
        Self { bus, address, delay, options, open: false }
    }

    pub fn free(self) -> (B, D) {
        (self.bus, self.delay)
    }
}

impl<B, D, E> Transport for I2cTransport<B, D>
where
    B: i2c::Write<Error = E> + i2c::Read<Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = E;

    fn envelope(&self) -> Envelope {
        Envelope::Bus
    }

    fn open(&mut self) -> Result<(), TransportError<E>> {
        self.open = true;
        Ok(())
    }

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<(), TransportError<E>> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        let address = self.address;
        i2c::Write::write(&mut self.bus, address, request).map_err(TransportError::Io)?;

        if response.is_empty() {
            return Ok(());
        }

        let Self { bus, delay, options, .. } = self;
        poll_until(&mut *delay, options, || {
            i2c::Read::read(&mut *bus, address, &mut *response).map_err(TransportError::Io)?;
            Ok(if response[0] == BUS_READY { Some(()) } else { None })
        })
    }

    fn close(&mut self) -> Result<(), TransportError<E>> {
        self.open = false;
        Ok(())
    }
}

/// SPI binding, chip select is handled by the bus
pub struct SpiTransport<B, D> {
    bus: B,
    delay: D,
    options: LinkOptions,
    open: bool,
}

impl<B, D, E> SpiTransport<B, D>
where
    B: spi::Write<u8, Error = E> + spi::Transfer<u8, Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(bus: B, delay: D, options: LinkOptions) -> Self {
        Self { bus, delay, options, open: false }
    }

    pub fn free(self) -> (B, D) {
        (self.bus, self.delay)
    }
}

impl<B, D, E> Transport for SpiTransport<B, D>
where
    B: spi::Write<u8, Error = E> + spi::Transfer<u8, Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = E;

    fn envelope(&self) -> Envelope {
        Envelope::Bus
    }

    fn open(&mut self) -> Result<(), TransportError<E>> {
        self.open = true;
        Ok(())
    }

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<(), TransportError<E>> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        spi::Write::write(&mut self.bus, request).map_err(TransportError::Io)?;

        if response.is_empty() {
            return Ok(());
        }

        let Self { bus, delay, options, .. } = self;
        poll_until(&mut *delay, options, || {
            for b in response.iter_mut() {
                *b = SPI_FILL;
            }
            spi::Transfer::transfer(&mut *bus, &mut *response).map_err(TransportError::Io)?;
            Ok(if response[0] == BUS_READY { Some(()) } else { None })
        })
    }

    fn close(&mut self) -> Result<(), TransportError<E>> {
        self.open = false;
        Ok(())
    }
}
