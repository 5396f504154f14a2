use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{DeviceInfo, MaybeFuture};

use super::{InterfaceInfo, UsbLink};
use crate::Error;

/// Timeout of every class control transfer
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// How often, and how long apart, to look for the device again after a port reset
const REENUMERATE_ATTEMPTS: usize = 10;
const REENUMERATE_INTERVAL: Duration = Duration::from_millis(200);

/// Identifies a USB device by its vendor id and, optionally, its product id
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: Option<u16>,
}

impl UsbId {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        info.vendor_id() == self.vendor_id
            && self.product_id.map_or(true, |pid| info.product_id() == pid)
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.product_id {
            Some(pid) => write!(f, "{:04x}:{:04x}", self.vendor_id, pid),
            None => write!(f, "{:04x}", self.vendor_id),
        }
    }
}

impl FromStr for UsbId {
    type Err = String;

    /// Parses `vvvv:pppp` or `vvvv`, both in hexadecimal
    fn from_str(s: &str) -> Result<UsbId, Self::Err> {
        let parse = |part: &str| {
            u16::from_str_radix(part.trim_start_matches("0x"), 16)
                .map_err(|err| format!("invalid USB id {:?}: {}", s, err))
        };

        let mut parts = s.splitn(2, ':');
        let vendor_id = parse(parts.next().unwrap_or_default())?;
        let product_id = parts.next().map(parse).transpose()?;

        Ok(UsbId {
            vendor_id,
            product_id,
        })
    }
}

/// Lists the connected USB devices, optionally restricted to those matching `filter`
pub fn list_devices(filter: Option<&UsbId>) -> Result<Vec<DeviceInfo>, Error> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|err| Error::OpenDevice(err.to_string()))?
        .filter(|info| filter.map_or(true, |id| id.matches(info)))
        .collect();

    Ok(devices)
}

/// Describes `info` as `vvvv:pppp (product) at bus X address Y`
pub fn describe(info: &DeviceInfo) -> String {
    format!(
        "{:04x}:{:04x} ({}) at bus {} address {}",
        info.vendor_id(),
        info.product_id(),
        info.product_string().unwrap_or("unknown"),
        info.bus_id(),
        info.device_address()
    )
}

/// A USB device opened through `nusb`
pub struct NusbDevice {
    id: UsbId,
    description: String,
    device: nusb::Device,
    interface: Option<nusb::Interface>,
}

impl fmt::Debug for NusbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NusbDevice")
            .field("device", &self.description)
            .field("claimed", &self.interface.as_ref().map(|iface| iface.interface_number()))
            .finish()
    }
}

impl NusbDevice {
    /// Opens the device described by `info`
    pub fn open(info: &DeviceInfo) -> Result<NusbDevice, Error> {
        let description = describe(info);

        info!("Opening USB device {}", description);

        let device = info
            .open()
            .wait()
            .map_err(|err| Error::OpenDevice(format!("{}: {}", description, err)))?;

        Ok(NusbDevice {
            id: UsbId {
                vendor_id: info.vendor_id(),
                product_id: Some(info.product_id()),
            },
            description,
            device,
            interface: None,
        })
    }

    fn interface(&self) -> Result<&nusb::Interface, Error> {
        self.interface.as_ref().ok_or(Error::InterfaceNotClaimed)
    }

    /// Looks the device up again after it dropped off the bus during a reset
    fn reopen(&mut self) -> Result<(), Error> {
        // The device may come back with another product id in its other mode
        let vendor_only = UsbId {
            vendor_id: self.id.vendor_id,
            product_id: None,
        };

        for _ in 0..REENUMERATE_ATTEMPTS {
            thread::sleep(REENUMERATE_INTERVAL);

            let mut candidates = list_devices(Some(&self.id))?;
            if candidates.is_empty() {
                candidates = list_devices(Some(&vendor_only))?;
            }

            if let Some(info) = candidates.first() {
                *self = NusbDevice::open(info)?;
                return Ok(());
            }
        }

        Err(Error::ResetDevice(format!(
            "{} did not come back after the reset",
            self.description
        )))
    }
}

impl UsbLink for NusbDevice {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.device
            .configurations()
            .flat_map(|config| {
                let configuration = config.configuration_value();

                config
                    .interface_alt_settings()
                    .map(move |alt| InterfaceInfo {
                        configuration,
                        number: alt.interface_number(),
                        alternate: alt.alternate_setting(),
                        class: alt.class(),
                        subclass: alt.subclass(),
                        protocol: alt.protocol(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), Error> {
        debug!("Selecting configuration {}", configuration);

        // A claimed interface would keep the kernel from switching configurations
        self.interface = None;

        self.device
            .set_configuration(configuration)
            .wait()
            .map_err(|err| Error::SetConfiguration(configuration, err.to_string()))
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), Error> {
        debug!("Claiming interface {}", number);

        let interface = self
            .device
            .detach_and_claim_interface(number)
            .wait()
            .map_err(|err| Error::ClaimInterface(number, err.to_string()))?;

        self.interface = Some(interface);

        Ok(())
    }

    fn control_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<(), Error> {
        let interface = self.interface()?;

        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: u16::from(interface.interface_number()),
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|source| Error::ControlTransfer {
                direction: "out",
                request,
                value,
                source,
            })
    }

    fn control_in(&mut self, request: u8, value: u16, length: u16) -> Result<Vec<u8>, Error> {
        let interface = self.interface()?;

        interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: u16::from(interface.interface_number()),
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|source| Error::ControlTransfer {
                direction: "in",
                request,
                value,
                source,
            })
    }

    fn reset(&mut self) -> Result<(), Error> {
        info!("Resetting USB device {}", self.description);

        self.interface = None;

        if let Err(err) = self.device.reset().wait() {
            // Devices that re-enumerate right away tend to fail the reset request itself
            warn!("USB reset of {} reported: {}", self.description, err);
        }

        self.reopen()
    }

    fn close(&mut self) -> Result<(), Error> {
        debug!("Closing USB device {}", self.description);

        self.interface = None;

        Ok(())
    }
}
