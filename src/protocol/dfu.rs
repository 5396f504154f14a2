//! USB Device Firmware Upgrade (DFU 1.1) programmer
//!
//! All requests are class requests addressed to the DFU interface. Every request that can change
//! the device's state is followed by a `DFU_GETSTATUS` to observe the result.

use std::convert::TryFrom;
use std::fmt;
use std::io::{Cursor, Read};
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use super::{ProtocolKind, Response};
use crate::binary::{Binary, BinaryKind};
use crate::bootloader::{Bootloader, FlashOutcome};
use crate::host::Host;
use crate::progress::Progress;
use crate::transport::{InterfaceInfo, UsbLink, UsbSession};
use crate::{Error, ResponseError};

pub const DFU_DETACH: u8 = 0x00;
pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_ABORT: u8 = 0x06;

/// Interface class and subclass of a DFU interface
pub const USB_CLASS_APP_SPECIFIC: u8 = 0xFE;
pub const USB_SUBCLASS_DFU: u8 = 0x01;

/// `wTimeout` sent with a `DFU_DETACH` issued while in `appIDLE`, in milliseconds
pub const DETACH_TIMEOUT: u16 = 1000;

/// Size of every non-empty `DFU_DNLOAD` block
pub const TRANSFER_SIZE: usize = 64;

/// How many times the initialization may start over after resetting the device
pub const INIT_RETRIES: u32 = 4;

/// How many status polls `make_idle` spends trying to reach `dfuIDLE`
const IDLE_ATTEMPTS: usize = 4;

/// Upper bound of the `bwPollTimeout` wait
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Length of a `DFU_GETSTATUS` reply
const STATUS_LENGTH: u16 = 6;

/// The state of a DFU device, as reported in `bState`
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    DfuError,
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DnBusy => "dfuDNBUSY",
            DfuState::DnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::DfuError => "dfuERROR",
        })
    }
}

/// The result of the most recent request, as reported in `bStatus`
#[repr(u8)]
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum DfuStatusCode {
    #[error("OK")]
    NoError = 0x00,
    #[error("errTARGET: file is not targeted for use by this device")]
    ErrTarget,
    #[error("errFILE: file fails a vendor-specific verification test")]
    ErrFile,
    #[error("errWRITE: device is unable to write memory")]
    ErrWrite,
    #[error("errERASE: memory erase function failed")]
    ErrErase,
    #[error("errCHECK_ERASED: memory erase check failed")]
    ErrCheckErased,
    #[error("errPROG: program memory function failed")]
    ErrProg,
    #[error("errVERIFY: programmed memory failed verification")]
    ErrVerify,
    #[error("errADDRESS: received address is out of range")]
    ErrAddress,
    #[error("errNOTDONE: received a zero-length download before all data")]
    ErrNotDone,
    #[error("errFIRMWARE: device firmware is corrupt")]
    ErrFirmware,
    #[error("errVENDOR: vendor-specific error")]
    ErrVendor,
    #[error("errUSBR: unexpected USB reset signaling")]
    ErrUsbr,
    #[error("errPOR: unexpected power on reset")]
    ErrPor,
    #[error("errUNKNOWN: something went wrong")]
    ErrUnknown,
    #[error("errSTALLEDPKT: device stalled an unexpected request")]
    ErrStalledPkt,
}

/// The decoded reply to `DFU_GETSTATUS`
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    /// Minimum time to wait before the next `DFU_GETSTATUS`
    pub poll_timeout: Duration,
    pub state: DfuState,
}

impl DfuStatus {
    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::NoError
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in state {}", self.status, self.state)
    }
}

impl Response for DfuStatus {
    type T = Self;

    fn from_reader<R: Read>(mut reader: R) -> Result<Self, ResponseError> {
        let mut buf = [0u8; STATUS_LENGTH as usize];
        reader.read_exact(&mut buf)?;

        let mut cursor = Cursor::new(buf);
        let status = cursor.read_u8()?;
        let poll_timeout = cursor.read_u24::<LittleEndian>()?;
        let state = cursor.read_u8()?;
        // iString
        let _ = cursor.read_u8()?;

        let unexpected = || ResponseError::Unexpected(buf.to_vec());

        Ok(DfuStatus {
            status: DfuStatusCode::try_from(status).map_err(|_| unexpected())?,
            poll_timeout: Duration::from_millis(u64::from(poll_timeout)),
            state: DfuState::try_from(state).map_err(|_| unexpected())?,
        })
    }
}

/// The interface a DFU session talks to, located once per initialization attempt
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DfuInterface {
    pub configuration: u8,
    pub number: u8,
    pub alternate: u8,
}

impl DfuInterface {
    /// Picks the first DFU interface, or simply the first interface when class codes are ignored
    pub fn find(interfaces: &[InterfaceInfo], honor_class: bool) -> Result<DfuInterface, Error> {
        interfaces
            .iter()
            .find(|iface| {
                !honor_class
                    || (iface.class == USB_CLASS_APP_SPECIFIC && iface.subclass == USB_SUBCLASS_DFU)
            })
            .map(|iface| DfuInterface {
                configuration: iface.configuration,
                number: iface.number,
                alternate: iface.alternate,
            })
            .ok_or(Error::DfuInterfaceNotFound)
    }
}

/// Outcome of one `make_idle` run
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Idle {
    Ready,
    /// The device was reset and has to be set up again
    RetryNeeded,
}

/// DFU programmer
#[derive(Debug, Clone)]
pub struct UsbDfu {
    /// Block number of the next `DFU_DNLOAD`
    transaction: u16,
    honor_interface_class: bool,
    initial_abort: bool,
}

impl Default for UsbDfu {
    fn default() -> Self {
        UsbDfu::new()
    }
}

impl UsbDfu {
    pub fn new() -> UsbDfu {
        UsbDfu {
            transaction: 0,
            honor_interface_class: false,
            initial_abort: true,
        }
    }

    /// Only accept interfaces that announce the DFU class and subclass
    pub fn with_honor_interface_class(mut self, honor: bool) -> UsbDfu {
        self.honor_interface_class = honor;
        self
    }

    fn request(link: &mut dyn UsbLink, request: u8, value: u16) -> Result<(), Error> {
        link.control_out(request, value, &[])
    }

    /// Issues `request` and only logs a failure
    fn request_best_effort(link: &mut dyn UsbLink, request: u8, value: u16) {
        if let Err(err) = UsbDfu::request(link, request, value) {
            warn!("Ignoring failed DFU request {:#04x}: {}", request, err);
        }
    }

    /// Reads the device status, then waits out the poll timeout it asks for
    fn get_status(link: &mut dyn UsbLink) -> Result<DfuStatus, Error> {
        let reply = link.control_in(DFU_GETSTATUS, 0, STATUS_LENGTH)?;
        let status = DfuStatus::from_reader(Cursor::new(reply)).map_err(|cause| {
            Error::protocol("dfu_get_status_failed", "Failed to read the DFU status", cause)
        })?;

        debug!("DFU status: {}", status);

        if status.poll_timeout > Duration::from_millis(0) {
            thread::sleep(status.poll_timeout.min(MAX_POLL_TIMEOUT));
        }

        Ok(status)
    }

    fn expect_ok(link: &mut dyn UsbLink) -> Result<(), Error> {
        let status = UsbDfu::get_status(link)?;

        if !status.is_ok() {
            return Err(Error::DfuDownloadFailed(status));
        }

        Ok(())
    }

    fn download(&mut self, link: &mut dyn UsbLink, block: &[u8]) -> Result<(), Error> {
        let transaction = self.transaction;
        self.transaction = self.transaction.wrapping_add(1);

        link.control_out(DFU_DNLOAD, transaction, block)
    }

    /// Drives the device into `dfuIDLE` with status OK
    fn make_idle(&self, link: &mut dyn UsbLink) -> Result<Idle, Error> {
        if self.initial_abort {
            UsbDfu::request(link, DFU_ABORT, 0)?;
        }

        for _ in 0..IDLE_ATTEMPTS {
            let status = match UsbDfu::get_status(link) {
                Ok(status) => status,
                Err(err) => {
                    warn!("DFU status unavailable: {}", err);
                    UsbDfu::request_best_effort(link, DFU_CLRSTATUS, 0);
                    continue;
                }
            };

            match status.state {
                DfuState::DfuIdle if status.is_ok() => return Ok(Idle::Ready),
                DfuState::DfuIdle | DfuState::DfuError => {
                    UsbDfu::request_best_effort(link, DFU_CLRSTATUS, 0)
                }
                DfuState::DnloadSync
                | DfuState::DnloadIdle
                | DfuState::ManifestSync
                | DfuState::UploadIdle
                | DfuState::DnBusy
                | DfuState::Manifest => UsbDfu::request_best_effort(link, DFU_ABORT, 0),
                DfuState::AppIdle => UsbDfu::request_best_effort(link, DFU_DETACH, DETACH_TIMEOUT),
                DfuState::AppDetach | DfuState::ManifestWaitReset => {
                    if let Err(err) = link.reset() {
                        warn!("Resetting the device failed: {}", err);
                    }

                    return Ok(Idle::RetryNeeded);
                }
            }
        }

        Err(Error::DfuInitFailed(
            "not able to transition the device into the dfuIDLE state",
        ))
    }

    /// Locates and claims the DFU interface and brings the device to `dfuIDLE`, starting over
    /// after every reset the device needs
    fn initialize(&self, link: &mut dyn UsbLink) -> Result<DfuInterface, Error> {
        let mut retries = INIT_RETRIES;

        loop {
            let interface = DfuInterface::find(&link.interfaces(), self.honor_interface_class)?;

            debug!("Using DFU interface {:?}", interface);

            link.set_configuration(interface.configuration)?;
            link.claim_interface(interface.number)?;

            match self.make_idle(link)? {
                Idle::Ready => return Ok(interface),
                Idle::RetryNeeded if retries > 0 => retries -= 1,
                Idle::RetryNeeded => {
                    return Err(Error::DfuInitFailed(
                        "the device did not settle after repeated resets",
                    ))
                }
            }
        }
    }

    fn program(
        &mut self,
        link: &mut dyn UsbLink,
        data: &[u8],
        progress: &mut Progress<'_>,
    ) -> Result<(), Error> {
        progress.step(0, "Initializing the device...")?;
        let interface = self.initialize(link)?;

        info!(
            "DFU interface {} ready, downloading {} bytes",
            interface.number,
            data.len()
        );

        progress.step(0, "Writing firmware...")?;
        let mut sent = 0;
        for block in data.chunks(TRANSFER_SIZE) {
            progress.check_cancelled()?;

            self.download(link, block)?;
            for _ in 0..2 {
                UsbDfu::expect_ok(link)?;
            }

            sent += block.len();
            progress.report((sent * 100 / data.len()) as u8, "Writing firmware...");
        }

        progress.step(100, "Sending completion signal...")?;
        self.download(link, &[])?;
        for _ in 0..2 {
            UsbDfu::expect_ok(link)?;
        }

        progress.step(100, "Clearing status...")?;
        UsbDfu::request(link, DFU_CLRSTATUS, 0)?;

        progress.step(100, "Detaching the DFU mode...")?;
        UsbDfu::request(link, DFU_DETACH, 0)?;
        UsbDfu::expect_ok(link)?;

        progress.step(100, "Resetting the device...")?;
        UsbDfu::request(link, DFU_ABORT, 0)?;
        UsbDfu::expect_ok(link)?;

        progress.step(100, "Closing the device...")?;
        if let Err(err) = link.reset() {
            warn!("Resetting the device failed: {}", err);
        }

        Ok(())
    }
}

impl Bootloader for UsbDfu {
    fn name(&self) -> &'static str {
        ProtocolKind::UsbDfu.name()
    }

    fn encoding(&self) -> BinaryKind {
        BinaryKind::Bin
    }

    fn init(&mut self) {
        self.transaction = 0;
    }

    fn flash(
        &mut self,
        host: &mut dyn Host,
        binary: &Binary,
        progress: &mut Progress<'_>,
    ) -> Result<FlashOutcome, Error> {
        let data = binary.expect_bin();

        progress.step(0, "Opening port...")?;
        let mut session = UsbSession::new(host.open_usb()?);

        let result = match session.link() {
            Ok(link) => self.program(link, data, progress),
            Err(err) => Err(err),
        };
        session.finish(result)?;

        progress.report(100, "Flashing completed");

        Ok(FlashOutcome::Programmed)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::progress::{CancelToken, ProgressEvent};
    use crate::transport::mock::{MockHost, MockUsb};

    const OK: u8 = 0x00;
    const ERR_WRITE: u8 = 0x03;

    fn state(state: DfuState) -> u8 {
        state.into()
    }

    fn run(usb: MockUsb, data: &[u8]) -> (Result<FlashOutcome, Error>, Vec<ProgressEvent>) {
        let mut host = MockHost::new().with_usb(usb);
        let mut events = Vec::new();
        let mut callback = |event: ProgressEvent| events.push(event);
        let mut dfu = UsbDfu::new();

        let result = {
            let mut progress = Progress::new(&mut callback, CancelToken::new());
            dfu.init();
            dfu.flash(&mut host, &Binary::Bin(data.to_vec()), &mut progress)
        };

        (result, events)
    }

    #[test]
    fn it_should_deserialize_status() {
        let status = DfuStatus::from_reader(Cursor::new(hex!("00 10 27 00 05 00"))).unwrap();

        assert_eq!(status.status, DfuStatusCode::NoError);
        assert_eq!(status.poll_timeout, Duration::from_millis(10_000));
        assert_eq!(status.state, DfuState::DnloadIdle);

        let status = DfuStatus::from_reader(Cursor::new(hex!("03 00 00 00 0A 00"))).unwrap();
        assert_eq!(status.status, DfuStatusCode::ErrWrite);
        assert_eq!(status.state, DfuState::DfuError);
        assert!(!status.is_ok());

        assert!(matches!(
            DfuStatus::from_reader(Cursor::new(hex!("00 00 00 00 0B 00"))),
            Err(ResponseError::Unexpected(_))
        ));
        assert!(matches!(
            DfuStatus::from_reader(Cursor::new(hex!("00 00 00"))),
            Err(ResponseError::Io(_))
        ));
    }

    #[test]
    fn it_should_find_the_dfu_interface() {
        let interfaces = [
            InterfaceInfo {
                configuration: 1,
                number: 0,
                alternate: 0,
                class: 0x02,
                subclass: 0x02,
                protocol: 0x01,
            },
            InterfaceInfo {
                configuration: 1,
                number: 2,
                alternate: 1,
                class: USB_CLASS_APP_SPECIFIC,
                subclass: USB_SUBCLASS_DFU,
                protocol: 0x02,
            },
        ];

        assert_eq!(DfuInterface::find(&interfaces, false).unwrap().number, 0);
        assert_eq!(
            DfuInterface::find(&interfaces, true).unwrap(),
            DfuInterface {
                configuration: 1,
                number: 2,
                alternate: 1
            }
        );
        assert!(matches!(
            DfuInterface::find(&interfaces[..1], true),
            Err(Error::DfuInterfaceNotFound)
        ));
        assert!(matches!(DfuInterface::find(&[], false), Err(Error::DfuInterfaceNotFound)));
    }

    #[test]
    fn it_should_converge_from_the_application_to_dfu_idle() {
        let mut usb = MockUsb::new()
            .then_status(OK, state(DfuState::AppIdle))
            .then_status(OK, state(DfuState::AppDetach))
            .then_status(OK, state(DfuState::DfuIdle));
        let log = usb.log();

        UsbDfu::new().initialize(&mut usb).unwrap();

        let log = log.borrow();
        assert_eq!(log.resets, 1);
        assert_eq!(log.claims, vec![0, 0]);

        let detaches = log.requests_of(DFU_DETACH);
        assert_eq!(detaches.len(), 1);
        assert_eq!(detaches[0].value, DETACH_TIMEOUT);
        // One initial abort per attempt
        assert_eq!(log.requests_of(DFU_ABORT).len(), 2);
    }

    #[test]
    fn it_should_give_up_on_a_device_that_never_idles() {
        let mut usb = MockUsb::new().otherwise_status(OK, state(DfuState::AppDetach));
        let log = usb.log();

        let err = UsbDfu::new().initialize(&mut usb).unwrap_err();

        assert_eq!(err.code(), "dfu_initialization_failed");
        assert!(err.to_string().starts_with("DFU Device Initialization failed"));
        assert_eq!(log.borrow().resets, 1 + INIT_RETRIES as usize);
    }

    #[test]
    fn it_should_bound_make_idle_when_status_keeps_failing() {
        let mut usb = MockUsb::new().failing(DFU_GETSTATUS);
        let log = usb.log();

        let err = UsbDfu::new().initialize(&mut usb).unwrap_err();

        assert_eq!(err.code(), "dfu_initialization_failed");
        let log = log.borrow();
        assert_eq!(log.requests_of(DFU_GETSTATUS).len(), IDLE_ATTEMPTS);
        assert_eq!(log.requests_of(DFU_CLRSTATUS).len(), IDLE_ATTEMPTS);
    }

    #[test]
    fn it_should_recover_from_error_and_busy_states() {
        let mut usb = MockUsb::new()
            .then_status(ERR_WRITE, state(DfuState::DfuError))
            .then_status(OK, state(DfuState::DnloadIdle))
            .then_stall()
            .then_status(OK, state(DfuState::DfuIdle));
        let log = usb.log();

        UsbDfu::new().initialize(&mut usb).unwrap();

        let log = log.borrow();
        assert_eq!(log.resets, 0);
        // One after dfuERROR, one after the failed status read
        assert_eq!(log.requests_of(DFU_CLRSTATUS).len(), 2);
        // The initial abort and the one after dfuDNLOAD-IDLE
        assert_eq!(log.requests_of(DFU_ABORT).len(), 2);
    }

    #[test]
    fn it_should_download_in_64_byte_blocks() {
        let usb = MockUsb::new();
        let log = usb.log();
        let data: Vec<u8> = (0..130u8).collect();

        let (result, events) = run(usb, &data);

        assert_eq!(result.unwrap(), FlashOutcome::Programmed);

        let log = log.borrow();
        let downloads = log.requests_of(DFU_DNLOAD);
        assert_eq!(downloads.len(), 4);
        assert_eq!(
            downloads.iter().map(|record| record.value).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            downloads.iter().map(|record| record.data.len()).collect::<Vec<_>>(),
            vec![64, 64, 2, 0]
        );
        assert_eq!(downloads[2].data, vec![128, 129]);

        // Two polls per block, two after the final empty block, one after detach and one after
        // abort, on top of the one poll of the initialization
        assert_eq!(log.requests_of(DFU_GETSTATUS).len(), 1 + 4 * 2 + 2);

        // The device was idle right away, so only the final reset happens
        assert_eq!(log.resets, 1);
        assert_eq!(log.closes, 1);

        let percents: Vec<u8> = events.iter().map(|event| event.percent).collect();
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(events.last().unwrap().message, "Flashing completed");
    }

    #[test]
    fn it_should_finalize_in_order() {
        let usb = MockUsb::new();
        let log = usb.log();

        let (result, _) = run(usb, &[0xAA; 10]);
        result.unwrap();

        let log = log.borrow();
        let tail: Vec<u8> = log
            .requests
            .iter()
            .map(|record| record.request)
            .skip_while(|&request| request != DFU_CLRSTATUS)
            .collect();

        assert_eq!(
            tail,
            vec![DFU_CLRSTATUS, DFU_DETACH, DFU_GETSTATUS, DFU_ABORT, DFU_GETSTATUS]
        );
    }

    #[test]
    fn it_should_fail_the_download_on_a_bad_status() {
        let usb = MockUsb::new()
            .then_status(OK, state(DfuState::DfuIdle))
            .then_status(OK, state(DfuState::DnloadIdle))
            .then_status(ERR_WRITE, state(DfuState::DfuError));
        let log = usb.log();

        let (result, _) = run(usb, &[0x55; 200]);
        let err = result.unwrap_err();

        assert_eq!(err.code(), "dfu_download_failed");
        assert!(err.to_string().starts_with("DFU download failed"));

        let log = log.borrow();
        assert_eq!(log.requests_of(DFU_DNLOAD).len(), 1);
        assert_eq!(log.closes, 1);
    }

    #[test]
    fn it_should_stop_when_a_download_transfer_fails() {
        let usb = MockUsb::new().failing(DFU_DNLOAD);
        let log = usb.log();

        let (result, events) = run(usb, &[0x55; 200]);

        assert_eq!(result.unwrap_err().code(), "control_transfer_failed");

        let log = log.borrow();
        assert_eq!(log.requests_of(DFU_DNLOAD).len(), 1);
        // Only the poll of the initialization, none after the failed block
        assert_eq!(log.requests_of(DFU_GETSTATUS).len(), 1);
        assert_eq!(log.resets, 0);
        assert_eq!(log.closes, 1);
        assert_ne!(events.last().unwrap().message, "Flashing completed");
    }

    #[test]
    fn it_should_release_the_device_when_claiming_fails() {
        let usb = MockUsb::new().with_interfaces(Vec::new());
        let log = usb.log();

        let (result, events) = run(usb, &[0x00; 4]);

        assert!(matches!(result, Err(Error::DfuInterfaceNotFound)));
        assert_eq!(log.borrow().closes, 1);
        assert_ne!(events.last().unwrap().message, "Flashing completed");
    }

    #[test]
    fn it_should_report_a_missing_device() {
        let mut host = MockHost::new();
        let mut callback = |_: ProgressEvent| {};
        let mut progress = Progress::new(&mut callback, CancelToken::new());

        let err = UsbDfu::new()
            .flash(&mut host, &Binary::Bin(vec![0x00]), &mut progress)
            .unwrap_err();

        assert_eq!(err.code(), "no_device_selected");
    }
}
