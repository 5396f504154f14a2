//! The environment a flash session runs in: which port, device and directory to use

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info};

use crate::transport::usb::{self, UsbId};
use crate::transport::{LineSettings, NusbDevice, SerialLink, SerialPort, UsbLink};
use crate::Error;

/// Selection of the resources a bootloader needs.
///
/// Every method may fail with the matching "nothing selected" error when the user declines.
pub trait Host {
    /// Selects a serial port and opens it with `settings`
    fn open_serial(&mut self, settings: &LineSettings) -> Result<Box<dyn SerialLink>, Error>;

    /// Selects a USB device and opens it
    fn open_usb(&mut self) -> Result<Box<dyn UsbLink>, Error>;

    /// Selects the directory the bootloader's mass storage volume is mounted at
    fn choose_directory(&mut self) -> Result<PathBuf, Error>;
}

/// Configuration of the `SystemHost`
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub serial_port: Option<String>,
    pub usb_device: Option<UsbId>,
    pub volume: Option<PathBuf>,
    /// Overrides the read timeout of every serial port that is opened
    pub read_timeout: Option<Duration>,
    /// Ask on stdin for anything that was not configured
    pub interactive: bool,
}

/// A host backed by the real serial ports, USB devices and filesystem
#[derive(Debug)]
pub struct SystemHost {
    config: HostConfig,
    /// A serial port chosen interactively is remembered for later opens in the same session
    chosen_port: Option<String>,
}

impl SystemHost {
    pub fn new(config: HostConfig) -> SystemHost {
        SystemHost {
            config,
            chosen_port: None,
        }
    }

    fn select_port(&mut self) -> Result<String, Error> {
        if let Some(port) = self.config.serial_port.as_ref().or(self.chosen_port.as_ref()) {
            return Ok(port.clone());
        }

        if !self.config.interactive {
            return Err(Error::NoPortSelected);
        }

        let ports = serialport::available_ports()
            .map_err(|err| Error::OpenPort("<enumeration>".to_string(), err))?;
        let names: Vec<String> = ports.into_iter().map(|port| port.port_name).collect();

        let port = prompt_choice("Select a serial port", &names)?
            .map(|index| names[index].clone())
            .ok_or(Error::NoPortSelected)?;

        self.chosen_port = Some(port.clone());

        Ok(port)
    }
}

impl Host for SystemHost {
    fn open_serial(&mut self, settings: &LineSettings) -> Result<Box<dyn SerialLink>, Error> {
        let port = self.select_port()?;
        let settings = match self.config.read_timeout {
            Some(timeout) => settings.with_timeout(timeout),
            None => *settings,
        };

        Ok(Box::new(SerialPort::open(&port, &settings)?))
    }

    fn open_usb(&mut self) -> Result<Box<dyn UsbLink>, Error> {
        let devices = usb::list_devices(self.config.usb_device.as_ref())?;

        debug!("Found {} candidate USB device(s)", devices.len());

        let index = match (devices.len(), self.config.usb_device.is_some()) {
            (0, _) => return Err(Error::NoDeviceSelected),
            (1, true) => 0,
            _ if self.config.interactive => {
                let labels: Vec<String> = devices.iter().map(usb::describe).collect();

                prompt_choice("Select a USB device", &labels)?.ok_or(Error::NoDeviceSelected)?
            }
            (_, true) => 0,
            _ => return Err(Error::NoDeviceSelected),
        };

        Ok(Box::new(NusbDevice::open(&devices[index])?))
    }

    fn choose_directory(&mut self) -> Result<PathBuf, Error> {
        if let Some(volume) = &self.config.volume {
            return Ok(volume.clone());
        }

        if !self.config.interactive {
            return Err(Error::NoDirectorySelected);
        }

        let answer = prompt("Path of the mounted bootloader volume: ")?;

        if answer.is_empty() {
            return Err(Error::NoDirectorySelected);
        }

        Ok(PathBuf::from(answer))
    }
}

/// Prints `message` and reads one trimmed line from stdin
fn prompt(message: &str) -> Result<String, Error> {
    let mut stdout = io::stdout();
    stdout.write_all(message.as_bytes())?;
    stdout.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    Ok(line.trim().to_string())
}

/// Lists `choices` and asks for one of them; an empty answer selects nothing
fn prompt_choice(title: &str, choices: &[String]) -> Result<Option<usize>, Error> {
    if choices.is_empty() {
        info!("{}: nothing available", title);
        return Ok(None);
    }

    println!("{}:", title);
    for (index, choice) in choices.iter().enumerate() {
        println!("  [{}] {}", index + 1, choice);
    }

    let answer = prompt("> ")?;

    Ok(parse_choice(&answer, choices.len()))
}

/// Parses a 1-based menu selection
fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    answer
        .parse::<usize>()
        .ok()
        .filter(|&n| n >= 1 && n <= count)
        .map(|n| n - 1)
}
