//! Wire protocols of the supported bootloaders

use std::fmt;
use std::io::{self, Read, Write};

use crate::binary::{Binary, BinaryKind};
use crate::bootloader::{Bootloader, FlashOutcome};
use crate::host::Host;
use crate::progress::Progress;
use crate::{Error, ResponseError};

pub mod dfu;
pub mod renesas;
pub mod samba;
pub mod stk500;
pub mod uf2;

/// An interface for serializing commands to a writer in the binary protocol a bootloader speaks.
pub trait Command {
    fn to_writer<W: Write>(&self, writer: W) -> io::Result<()>;
}

/// An interface for deserializing responses from a reader.
pub trait Response
where
    Self: Sized,
{
    /// The type to return on successful read from a reader.
    type T;

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError>;
}

/// The bootloader protocols that can be resolved for a board
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ProtocolKind {
    Stk500Optiboot,
    UsbDfu,
    SamBaExtended,
    RenesasBoot,
    Uf2FileCopy,
}

impl ProtocolKind {
    /// The binary encoding the protocol consumes
    pub fn encoding(self) -> BinaryKind {
        match self {
            ProtocolKind::Stk500Optiboot => BinaryKind::Hex,
            ProtocolKind::UsbDfu | ProtocolKind::SamBaExtended | ProtocolKind::RenesasBoot => {
                BinaryKind::Bin
            }
            ProtocolKind::Uf2FileCopy => BinaryKind::Uf2,
        }
    }

    /// Creates a fresh bootloader speaking this protocol
    pub fn bootloader(self) -> Protocol {
        match self {
            ProtocolKind::Stk500Optiboot => Protocol::Stk500Optiboot(stk500::Stk500::new()),
            ProtocolKind::UsbDfu => Protocol::UsbDfu(dfu::UsbDfu::new()),
            ProtocolKind::SamBaExtended => Protocol::SamBaExtended(samba::SamBa::new()),
            ProtocolKind::RenesasBoot => Protocol::RenesasBoot(renesas::RenesasBoot::new()),
            ProtocolKind::Uf2FileCopy => Protocol::Uf2FileCopy(uf2::Uf2FileCopy::new()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Stk500Optiboot => "stk500-optiboot",
            ProtocolKind::UsbDfu => "usb-dfu",
            ProtocolKind::SamBaExtended => "samba-extended",
            ProtocolKind::RenesasBoot => "renesas-boot",
            ProtocolKind::Uf2FileCopy => "uf2-file-copy",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// A bootloader of one of the supported protocols
#[derive(Debug)]
pub enum Protocol {
    Stk500Optiboot(stk500::Stk500),
    UsbDfu(dfu::UsbDfu),
    SamBaExtended(samba::SamBa),
    RenesasBoot(renesas::RenesasBoot),
    Uf2FileCopy(uf2::Uf2FileCopy),
}

impl Protocol {
    fn inner(&mut self) -> &mut dyn Bootloader {
        match self {
            Protocol::Stk500Optiboot(bootloader) => bootloader,
            Protocol::UsbDfu(bootloader) => bootloader,
            Protocol::SamBaExtended(bootloader) => bootloader,
            Protocol::RenesasBoot(bootloader) => bootloader,
            Protocol::Uf2FileCopy(bootloader) => bootloader,
        }
    }

    fn inner_ref(&self) -> &dyn Bootloader {
        match self {
            Protocol::Stk500Optiboot(bootloader) => bootloader,
            Protocol::UsbDfu(bootloader) => bootloader,
            Protocol::SamBaExtended(bootloader) => bootloader,
            Protocol::RenesasBoot(bootloader) => bootloader,
            Protocol::Uf2FileCopy(bootloader) => bootloader,
        }
    }
}

impl Bootloader for Protocol {
    fn name(&self) -> &'static str {
        self.inner_ref().name()
    }

    fn encoding(&self) -> BinaryKind {
        self.inner_ref().encoding()
    }

    fn init(&mut self) {
        self.inner().init()
    }

    /// Runs the session and, when it fails, emits one final `[Error] …` progress event
    fn flash(
        &mut self,
        host: &mut dyn Host,
        binary: &Binary,
        progress: &mut Progress<'_>,
    ) -> Result<FlashOutcome, Error> {
        let result = self.inner().flash(host, binary, progress);

        if let Err(err) = &result {
            log::error!("{} failed: {}", self.name(), err);
            progress.fail(err);
        }

        result
    }
}

/// Reads exactly `N` bytes
pub(crate) fn read_array<R: Read, const N: usize>(mut reader: R) -> Result<[u8; N], ResponseError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;

    Ok(buf)
}
