//! Transports the bootloaders talk over, and the sessions that own them while flashing
//!
//! A session exclusively owns its link from the moment it is opened until it is closed. Closing
//! happens exactly once: explicitly through `close`/`finish`, or as a fallback when the session is
//! dropped on an early return or while unwinding.

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::{trace, warn};
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::protocol::{Command, Response};
use crate::{Error, ResponseError};

#[cfg(test)]
pub mod mock;
pub mod serial;
pub mod usb;

pub use self::serial::SerialPort;
pub use self::usb::NusbDevice;

/// Default time to wait for a serial read to complete
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Line parameters a serial port is opened with
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// How long a read may block before it fails with a timeout
    pub timeout: Duration,
}

impl LineSettings {
    /// 8-N-1 without flow control at the given `baud_rate`
    pub fn new(baud_rate: u32) -> LineSettings {
        LineSettings {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> LineSettings {
        self.timeout = timeout;
        self
    }
}

/// An open serial connection
pub trait SerialLink: Read + Write {
    /// The name of the underlying port, e.g. `/dev/ttyACM0`
    fn name(&self) -> String;

    /// Drives the DTR line to `level`
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;

    /// Releases the port
    fn close(&mut self) -> Result<(), Error>;
}

/// Descriptor fields of one alternate setting of a USB interface
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InterfaceInfo {
    /// `bConfigurationValue` of the configuration the interface belongs to
    pub configuration: u8,
    pub number: u8,
    pub alternate: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// An open USB device
///
/// Control transfers are class requests addressed to the claimed interface.
pub trait UsbLink {
    /// A human readable identification of the device, used in logs
    fn description(&self) -> String;

    /// Lists every alternate setting of every interface in every configuration
    fn interfaces(&self) -> Vec<InterfaceInfo>;

    fn set_configuration(&mut self, configuration: u8) -> Result<(), Error>;

    fn claim_interface(&mut self, number: u8) -> Result<(), Error>;

    fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<(), Error>;

    fn control_in(&mut self, request: u8, value: u16, length: u16) -> Result<Vec<u8>, Error>;

    /// Issues a USB port reset
    fn reset(&mut self) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port is closed")
}

/// A serial session that owns its link until it is closed
pub struct SerialSession {
    link: Option<Box<dyn SerialLink>>,
}

impl fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSession")
            .field("port", &self.link.as_ref().map(|link| link.name()))
            .finish()
    }
}

impl SerialSession {
    pub fn new(link: Box<dyn SerialLink>) -> SerialSession {
        SerialSession { link: Some(link) }
    }

    fn link(&mut self) -> io::Result<&mut Box<dyn SerialLink>> {
        self.link.as_mut().ok_or_else(not_connected)
    }

    /// Serializes `command` and writes it to the port in a single write
    pub fn send<C: Command>(&mut self, command: &C) -> io::Result<()> {
        let mut buf = Vec::new();
        command.to_writer(&mut buf)?;

        trace!("-> {:02x?}", buf);

        let link = self.link()?;
        link.write_all(&buf)?;
        link.flush()
    }

    /// Reads and decodes a response of type `R`
    pub fn receive<R: Response>(&mut self) -> Result<R::T, ResponseError> {
        R::from_reader(self)
    }

    /// Sends `command` and reads back its response
    pub fn exchange<C: Command, R: Response>(
        &mut self,
        command: &C,
    ) -> Result<R::T, ResponseError> {
        self.send(command)?;
        self.receive::<R>()
    }

    pub fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        match self.link.as_mut() {
            Some(link) => link.set_dtr(level),
            None => Err(Error::SetSignals(not_connected())),
        }
    }

    /// Closes the port
    pub fn close(mut self) -> Result<(), Error> {
        match self.link.take() {
            Some(mut link) => link.close(),
            None => Ok(()),
        }
    }

    /// Closes the port and passes `result` through; a failure to close is only logged
    pub fn finish<T>(self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = self.close() {
            warn!("{}", err);
        }

        result
    }
}

impl Read for SerialSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.link()?.read(buf)?;

        trace!("<- {:02x?}", &buf[..n]);

        Ok(n)
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.close() {
                warn!("{}", err);
            }
        }
    }
}

/// A USB session that owns its device until it is closed
pub struct UsbSession {
    link: Option<Box<dyn UsbLink>>,
}

impl fmt::Debug for UsbSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbSession")
            .field("device", &self.link.as_ref().map(|link| link.description()))
            .finish()
    }
}

impl UsbSession {
    pub fn new(link: Box<dyn UsbLink>) -> UsbSession {
        UsbSession { link: Some(link) }
    }

    /// Returns the open device
    pub fn link(&mut self) -> Result<&mut dyn UsbLink, Error> {
        match self.link.as_mut() {
            Some(link) => Ok(&mut **link),
            None => Err(Error::OpenDevice("the device has been closed".to_string())),
        }
    }

    /// Closes the device
    pub fn close(mut self) -> Result<(), Error> {
        match self.link.take() {
            Some(mut link) => link.close(),
            None => Ok(()),
        }
    }

    /// Closes the device and passes `result` through; a failure to close is only logged
    pub fn finish<T>(self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = self.close() {
            warn!("{}", err);
        }

        result
    }
}

impl Drop for UsbSession {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.close() {
                warn!("{}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockSerial, MockUsb};
    use super::*;

    struct Ping;

    impl Command for Ping {
        fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
            writer.write_all(&[0x30, 0x20])
        }
    }

    struct Pong;

    impl Response for Pong {
        type T = [u8; 2];

        fn from_reader<R: Read>(mut reader: R) -> Result<Self::T, ResponseError> {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;

            Ok(buf)
        }
    }

    #[test]
    fn it_should_exchange_frames() {
        let (serial, log) = MockSerial::new(|_frame| Some(vec![0x14, 0x10]));
        let mut session = SerialSession::new(Box::new(serial));

        let reply = session.exchange::<_, Pong>(&Ping).unwrap();
        session.close().unwrap();

        assert_eq!(reply, [0x14, 0x10]);
        assert_eq!(log.borrow().writes, vec![vec![0x30, 0x20]]);
        assert_eq!(log.borrow().closes, 1);
    }

    #[test]
    fn it_should_close_a_serial_port_exactly_once() {
        let (serial, log) = MockSerial::new(|_frame| None);

        {
            let session = SerialSession::new(Box::new(serial));
            let _ = session.finish::<()>(Err(Error::Cancelled));
        }

        assert_eq!(log.borrow().closes, 1);
    }

    #[test]
    fn it_should_close_on_drop() {
        let (serial, log) = MockSerial::new(|_frame| None);

        {
            let mut session = SerialSession::new(Box::new(serial));
            assert!(session.receive::<Pong>().is_err());
        }

        assert_eq!(log.borrow().closes, 1);
    }

    #[test]
    fn it_should_close_a_usb_device_exactly_once() {
        let closed = MockUsb::new();
        let closed_log = closed.log();
        let dropped = MockUsb::new();
        let dropped_log = dropped.log();

        {
            let session = UsbSession::new(Box::new(closed));
            session.close().unwrap();
        }

        {
            let _session = UsbSession::new(Box::new(dropped));
        }

        assert_eq!(closed_log.borrow().closes, 1);
        assert_eq!(dropped_log.borrow().closes, 1);
    }
}
