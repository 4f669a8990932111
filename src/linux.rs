use std::io::{self, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};

use thiserror::Error;

use linux_embedded_hal::i2cdev::linux::LinuxI2CError;
use linux_embedded_hal::serial_core::{
    self, BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::{Delay, I2cdev, Serial, Spidev};

use crate::protocol::Envelope;
use crate::transport::{I2cTransport, LinkOptions, SerialPort, SpiTransport, Transport, TransportError, UartTransport};
use crate::{ConfigError, Options, Programmer};

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(|e| io::Error::from(e).kind())
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(|e| io::Error::from(e).kind())
    }
}

/// Physical interface to reach the bootloader over
#[derive(Clone, PartialEq, Debug)]
pub enum Interface {
    Uart { port: PathBuf, baud: usize },
    /// `/dev/i2c-<bus>`, device at `address`
    I2c { bus: u8, address: u8 },
    /// `/dev/spidev<bus>.<device>`
    Spi { bus: u8, device: u8, clock_baud: u32 },
}

impl Interface {
    /// Device node backing this interface
    pub fn path(&self) -> PathBuf {
        match self {
            Interface::Uart { port, .. } => port.clone(),
            Interface::I2c { bus, .. } => PathBuf::from(format!("/dev/i2c-{}", bus)),
            Interface::Spi { bus, device, .. } => PathBuf::from(format!("/dev/spidev{}.{}", bus, device)),
        }
    }
}

/// Errors from the Linux drivers behind a [`LinuxTransport`]
#[derive(Debug, Error)]
pub enum LinuxError {
    #[error("opening {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("serial: {0:?}")]
    Serial(IoErrorKind),

    #[error("i2c: {0}")]
    I2c(LinuxI2CError),

    #[error("spi: {0}")]
    Spi(io::Error),
}

impl LinuxError {
    fn open(path: &Path, source: impl Into<io::Error>) -> Self {
        LinuxError::Open { path: path.display().to_string(), source: source.into() }
    }
}

/// Driver for an open link
enum Binding {
    Uart(UartTransport<Serial, Delay, IoErrorKind>),
    I2c(I2cTransport<I2cdev, Delay>),
    Spi(SpiTransport<Spidev, Delay>),
}

impl Binding {
    fn connect(interface: &Interface, link: &LinkOptions) -> Result<Self, LinuxError> {
        let path = interface.path();

        match interface {
            Interface::Uart { baud, .. } => {
                let port = open_serial(&path, *baud)?;
                Ok(Binding::Uart(UartTransport::new(port, Delay {}, link.clone())))
            }
            Interface::I2c { address, .. } => {
                let dev = I2cdev::new(&path).map_err(LinuxError::I2c)?;
                Ok(Binding::I2c(I2cTransport::new(dev, *address, Delay {}, link.clone())))
            }
            Interface::Spi { clock_baud, .. } => {
                let mut dev = Spidev::open(&path).map_err(|e| LinuxError::open(&path, e))?;

                let options = SpidevOptions::new()
                    .bits_per_word(8)
                    .max_speed_hz(*clock_baud)
                    .mode(SpiModeFlags::SPI_MODE_0)
                    .build();
                dev.0.configure(&options).map_err(|e| LinuxError::open(&path, e))?;

                Ok(Binding::Spi(SpiTransport::new(dev, Delay {}, link.clone())))
            }
        }
    }

    fn open(&mut self) -> Result<(), TransportError<LinuxError>> {
        match self {
            Binding::Uart(t) => t.open().map_err(|e| e.map(LinuxError::Serial)),
            Binding::I2c(t) => t.open().map_err(|e| e.map(LinuxError::I2c)),
            Binding::Spi(t) => t.open().map_err(|e| e.map(LinuxError::Spi)),
        }
    }

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<(), TransportError<LinuxError>> {
        match self {
            Binding::Uart(t) => t.exchange(request, response).map_err(|e| e.map(LinuxError::Serial)),
            Binding::I2c(t) => t.exchange(request, response).map_err(|e| e.map(LinuxError::I2c)),
            Binding::Spi(t) => t.exchange(request, response).map_err(|e| e.map(LinuxError::Spi)),
        }
    }

    fn close(&mut self) -> Result<(), TransportError<LinuxError>> {
        match self {
            Binding::Uart(t) => t.close().map_err(|e| e.map(LinuxError::Serial)),
            Binding::I2c(t) => t.close().map_err(|e| e.map(LinuxError::I2c)),
            Binding::Spi(t) => t.close().map_err(|e| e.map(LinuxError::Spi)),
        }
    }
}

/// Open a serial port as 8N1 at `baud`
fn open_serial(path: &Path, baud: usize) -> Result<Serial, LinuxError> {
    let fail = |e: serial_core::Error| LinuxError::open(path, e);

    // Open port
    let mut port = Serial::open(path).map_err(fail)?;

    // Apply settings
    let mut settings = port.0.read_settings().map_err(fail)?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud)).map_err(fail)?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings).map_err(fail)?;

    Ok(port)
}

/// Linux transport. The device node is opened by `open` and released by `close`.
pub struct LinuxTransport {
    interface: Interface,
    link: LinkOptions,
    binding: Option<Binding>,
}

impl LinuxTransport {
    /// Serial port at `baud`, 8N1
    pub fn uart<P: AsRef<Path>>(port: P, baud: usize, link: LinkOptions) -> Self {
        Self::from_interface(Interface::Uart { port: port.as_ref().to_path_buf(), baud }, link)
    }

    /// I2C bus `bus` talking to the device at `address`
    pub fn i2c(bus: u8, address: u8, link: LinkOptions) -> Self {
        Self::from_interface(Interface::I2c { bus, address }, link)
    }

    /// SPI device `device` on bus `bus` in mode 0 at `clock_baud` Hz
    pub fn spi(bus: u8, device: u8, clock_baud: u32, link: LinkOptions) -> Self {
        Self::from_interface(Interface::Spi { bus, device, clock_baud }, link)
    }

    pub fn from_interface(interface: Interface, link: LinkOptions) -> Self {
        Self { interface, link, binding: None }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// True while the device node is held open
    pub fn is_open(&self) -> bool {
        self.binding.is_some()
    }
}

impl Transport for LinuxTransport {
    type Error = LinuxError;

    fn envelope(&self) -> Envelope {
        match self.interface {
            Interface::Uart { .. } => Envelope::Stream,
            Interface::I2c { .. } | Interface::Spi { .. } => Envelope::Bus,
        }
    }

    fn open(&mut self) -> Result<(), TransportError<LinuxError>> {
        let binding = match self.binding.take() {
            Some(b) => b,
            None => {
                debug!("Opening {}", self.interface.path().display());
                Binding::connect(&self.interface, &self.link).map_err(TransportError::Io)?
            }
        };

        let result = self.binding.insert(binding).open();
        if result.is_err() {
            self.binding = None;
        }
        result
    }

    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<(), TransportError<LinuxError>> {
        match self.binding.as_mut() {
            Some(b) => b.exchange(request, response),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&mut self) -> Result<(), TransportError<LinuxError>> {
        // Dropping the binding releases the device node
        match self.binding.take() {
            Some(mut b) => b.close(),
            None => Ok(()),
        }
    }
}

impl Programmer<LinuxTransport> {
    /// Create a new linux programmer instance on the given interface, the link is opened by `open`
    pub fn linux(interface: &Interface, link: LinkOptions, options: Options) -> Result<Self, ConfigError> {
        Programmer::new(LinuxTransport::from_interface(interface.clone(), link), options)
    }
}
