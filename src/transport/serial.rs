use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};

use log::debug;

use super::{LineSettings, SerialLink};
use crate::Error;

/// Serial connection with an open serial port.
pub struct SerialPort {
    name: String,
    inner_port: Box<dyn serialport::SerialPort>,
}

impl fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("name", &self.name)
            .field("baud_rate", &self.inner_port.baud_rate().ok())
            .field("timeout", &self.inner_port.timeout())
            .finish()
    }
}

impl Deref for SerialPort {
    type Target = Box<dyn serialport::SerialPort>;

    fn deref(&self) -> &Self::Target {
        &self.inner_port
    }
}

impl DerefMut for SerialPort {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner_port
    }
}

impl SerialPort {
    /// Opens the given `port` with the given line `settings`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sketchflash::transport::{LineSettings, SerialPort};
    ///
    /// let port = SerialPort::open("/dev/ttyACM0", &LineSettings::new(115_200))?;
    ///
    /// # Ok::<(), sketchflash::Error>(())
    /// ```
    pub fn open(port: &str, settings: &LineSettings) -> Result<SerialPort, Error> {
        debug!("Opening serial port {} with {:?}", port, settings);

        let serial_port = serialport::new(port, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(settings.flow_control)
            .timeout(settings.timeout)
            .open()
            .map_err(|err| Error::OpenPort(port.to_string(), err))?;

        Ok(SerialPort {
            name: port.to_string(),
            inner_port: serial_port,
        })
    }

    /// Consumes `self` and returns the inner serial port.
    pub fn into_port(self) -> Box<dyn serialport::SerialPort> {
        self.inner_port
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_port.read(buf)
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner_port.flush()
    }
}

impl SerialLink for SerialPort {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.inner_port
            .write_data_terminal_ready(level)
            .map_err(|err| Error::SetSignals(err.into()))
    }

    fn close(&mut self) -> Result<(), Error> {
        debug!("Closing serial port {}", self.name);

        // The OS handle itself is released when the port is dropped
        self.inner_port.flush().map_err(Error::ClosePort)
    }
}
