//! Scripted transports for exercising the bootloaders without hardware

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;

use super::{InterfaceInfo, LineSettings, SerialLink, UsbLink};
use crate::host::Host;
use crate::Error;

/// Everything a `MockSerial` observed
#[derive(Debug, Default)]
pub struct SerialLog {
    pub writes: Vec<Vec<u8>>,
    pub dtr: Vec<bool>,
    pub closes: usize,
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>>;

/// A serial link whose replies are produced by a responder closure.
///
/// Each write is recorded as one frame and handed to the responder; the bytes it returns are
/// queued for reading. Reading from an empty queue fails like a timed out serial read.
pub struct MockSerial {
    responder: Responder,
    pending: VecDeque<u8>,
    log: Rc<RefCell<SerialLog>>,
}

impl MockSerial {
    pub fn new<F>(responder: F) -> (MockSerial, Rc<RefCell<SerialLog>>)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + 'static,
    {
        let log = Rc::new(RefCell::new(SerialLog::default()));

        let serial = MockSerial {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            log: log.clone(),
        };

        (serial, log)
    }
}

impl Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
        }

        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }

        Ok(n)
    }
}

impl Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.borrow_mut().writes.push(buf.to_vec());

        if let Some(reply) = (self.responder)(buf) {
            self.pending.extend(reply);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockSerial {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.log.borrow_mut().dtr.push(level);

        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.log.borrow_mut().closes += 1;

        Ok(())
    }
}

/// A control request observed by `MockUsb`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ControlRecord {
    pub request: u8,
    pub value: u16,
    pub data: Vec<u8>,
}

/// Everything a `MockUsb` observed
#[derive(Debug, Default)]
pub struct UsbLog {
    pub requests: Vec<ControlRecord>,
    pub configurations: Vec<u8>,
    pub claims: Vec<u8>,
    pub resets: usize,
    pub closes: usize,
}

impl UsbLog {
    /// The requests with the given request code, in order
    pub fn requests_of(&self, request: u8) -> Vec<&ControlRecord> {
        self.requests
            .iter()
            .filter(|record| record.request == request)
            .collect()
    }
}

/// A USB device that answers GETSTATUS (`0x03`) from a script.
///
/// Scripted replies are consumed in order; once the script runs out every further GETSTATUS is
/// answered with the fallback reply. Every other control transfer succeeds unless the request code
/// was marked as failing.
pub struct MockUsb {
    interfaces: Vec<InterfaceInfo>,
    statuses: VecDeque<Result<Vec<u8>, ()>>,
    fallback: Vec<u8>,
    failing: Vec<u8>,
    log: Rc<RefCell<UsbLog>>,
}

/// GETSTATUS reply with the given status, state and a zero poll timeout
pub fn status_reply(status: u8, state: u8) -> Vec<u8> {
    vec![status, 0x00, 0x00, 0x00, state, 0x00]
}

const GETSTATUS: u8 = 0x03;

impl MockUsb {
    /// A DFU device that is idle with status OK
    pub fn new() -> MockUsb {
        MockUsb {
            interfaces: vec![InterfaceInfo {
                configuration: 1,
                number: 0,
                alternate: 0,
                class: 0xFE,
                subclass: 0x01,
                protocol: 0x02,
            }],
            statuses: VecDeque::new(),
            fallback: status_reply(0x00, 2),
            failing: Vec::new(),
            log: Rc::new(RefCell::new(UsbLog::default())),
        }
    }

    pub fn log(&self) -> Rc<RefCell<UsbLog>> {
        self.log.clone()
    }

    pub fn with_interfaces(mut self, interfaces: Vec<InterfaceInfo>) -> MockUsb {
        self.interfaces = interfaces;
        self
    }

    /// Queues a GETSTATUS reply
    pub fn then_status(mut self, status: u8, state: u8) -> MockUsb {
        self.statuses.push_back(Ok(status_reply(status, state)));
        self
    }

    /// Queues a failing GETSTATUS
    pub fn then_stall(mut self) -> MockUsb {
        self.statuses.push_back(Err(()));
        self
    }

    /// Replaces the reply given once the script has run out
    pub fn otherwise_status(mut self, status: u8, state: u8) -> MockUsb {
        self.fallback = status_reply(status, state);
        self
    }

    /// Makes every control transfer with `request` fail
    pub fn failing(mut self, request: u8) -> MockUsb {
        self.failing.push(request);
        self
    }

    fn stall(request: u8, value: u16) -> Error {
        Error::ControlTransfer {
            direction: "mock",
            request,
            value,
            source: nusb::transfer::TransferError::Stall,
        }
    }
}

impl UsbLink for MockUsb {
    fn description(&self) -> String {
        "mock".to_string()
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.clone()
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), Error> {
        self.log.borrow_mut().configurations.push(configuration);

        Ok(())
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), Error> {
        self.log.borrow_mut().claims.push(number);

        Ok(())
    }

    fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<(), Error> {
        self.log.borrow_mut().requests.push(ControlRecord {
            request,
            value,
            data: data.to_vec(),
        });

        if self.failing.contains(&request) {
            return Err(MockUsb::stall(request, value));
        }

        Ok(())
    }

    fn control_in(&mut self, request: u8, value: u16, _length: u16) -> Result<Vec<u8>, Error> {
        self.log.borrow_mut().requests.push(ControlRecord {
            request,
            value,
            data: Vec::new(),
        });

        if self.failing.contains(&request) {
            return Err(MockUsb::stall(request, value));
        }

        if request != GETSTATUS {
            return Ok(Vec::new());
        }

        match self.statuses.pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(())) => Err(MockUsb::stall(request, value)),
            None => Ok(self.fallback.clone()),
        }
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.log.borrow_mut().resets += 1;

        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.log.borrow_mut().closes += 1;

        Ok(())
    }
}

/// A host whose selections are fixed up front
pub struct MockHost {
    pub serial: Option<MockSerial>,
    pub serial_error: Option<Error>,
    pub usb: Option<MockUsb>,
    pub directory: Option<PathBuf>,
    /// Line settings of every serial open that was attempted
    pub opened: Vec<LineSettings>,
}

impl MockHost {
    pub fn new() -> MockHost {
        MockHost {
            serial: None,
            serial_error: None,
            usb: None,
            directory: None,
            opened: Vec::new(),
        }
    }

    pub fn with_serial(mut self, serial: MockSerial) -> MockHost {
        self.serial = Some(serial);
        self
    }

    pub fn with_serial_error(mut self, err: Error) -> MockHost {
        self.serial_error = Some(err);
        self
    }

    pub fn with_usb(mut self, usb: MockUsb) -> MockHost {
        self.usb = Some(usb);
        self
    }

    pub fn with_directory<P: Into<PathBuf>>(mut self, directory: P) -> MockHost {
        self.directory = Some(directory.into());
        self
    }
}

impl Host for MockHost {
    fn open_serial(&mut self, settings: &LineSettings) -> Result<Box<dyn SerialLink>, Error> {
        self.opened.push(*settings);

        if let Some(err) = self.serial_error.take() {
            return Err(err);
        }

        match self.serial.take() {
            Some(serial) => Ok(Box::new(serial)),
            None => Err(Error::NoPortSelected),
        }
    }

    fn open_usb(&mut self) -> Result<Box<dyn UsbLink>, Error> {
        match self.usb.take() {
            Some(usb) => Ok(Box::new(usb)),
            None => Err(Error::NoDeviceSelected),
        }
    }

    fn choose_directory(&mut self) -> Result<PathBuf, Error> {
        self.directory.clone().ok_or(Error::NoDirectorySelected)
    }
}
