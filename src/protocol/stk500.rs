//! STK500 version 1 as spoken by the Optiboot bootloader on AVR boards
//!
//! Every command is terminated with `CRC_EOP` and every answer is framed by `STK_INSYNC` and
//! `STK_OK`.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use log::{debug, info};

use super::{read_array, Command, ProtocolKind, Response};
use crate::binary::{Binary, BinaryKind};
use crate::bootloader::{Bootloader, FlashOutcome};
use crate::host::Host;
use crate::ihex::{self, Page};
use crate::progress::Progress;
use crate::transport::{LineSettings, SerialSession};
use crate::{Error, ResponseError};

pub const STK_OK: u8 = 0x10;
pub const STK_INSYNC: u8 = 0x14;
pub const CRC_EOP: u8 = 0x20;

pub const STK_GET_SYNC: u8 = 0x30;
pub const STK_GET_PARAMETER: u8 = 0x41;
pub const STK_ENTER_PROGMODE: u8 = 0x50;
pub const STK_LEAVE_PROGMODE: u8 = 0x51;
pub const STK_LOAD_ADDRESS: u8 = 0x55;
pub const STK_PROG_PAGE: u8 = 0x64;
pub const STK_READ_SIGN: u8 = 0x75;

/// Parameter id of the major software version
pub const PARAM_SW_MAJOR: u8 = 0x81;
/// Parameter id of the minor software version
pub const PARAM_SW_MINOR: u8 = 0x82;

/// Memory type `'F'` (flash) of a `PROG_PAGE` command
const MEMTYPE_FLASH: u8 = 0x46;

pub const BAUD_RATE: u32 = 115_200;
pub const PAGE_SIZE: usize = 128;
/// Value unprogrammed flash reads as
const ERASED: u8 = 0xFF;

/// How long the target is given to reset into the bootloader after the port is opened
pub const RESET_DELAY: Duration = Duration::from_millis(100);

/// Highest byte address reachable with a 16-bit word address
const ADDRESS_LIMIT: usize = 0x2_0000;

/// STK500 commands used while programming
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Stk500Command<'a> {
    GetSync,
    GetParameter(u8),
    ReadSignature,
    EnterProgMode,
    LeaveProgMode,
    /// Sets the word address of the next page
    LoadAddress(u16),
    /// Programs one flash page at the loaded address
    ProgramPage(&'a [u8]),
}

impl Command for Stk500Command<'_> {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match *self {
            Stk500Command::GetSync => writer.write_all(&[STK_GET_SYNC])?,
            Stk500Command::GetParameter(param) => writer.write_all(&[STK_GET_PARAMETER, param])?,
            Stk500Command::ReadSignature => writer.write_all(&[STK_READ_SIGN])?,
            Stk500Command::EnterProgMode => writer.write_all(&[STK_ENTER_PROGMODE])?,
            Stk500Command::LeaveProgMode => writer.write_all(&[STK_LEAVE_PROGMODE])?,
            Stk500Command::LoadAddress(address) => {
                writer.write_u8(STK_LOAD_ADDRESS)?;
                writer.write_u16::<LittleEndian>(address)?;
            }
            Stk500Command::ProgramPage(data) => {
                writer.write_u8(STK_PROG_PAGE)?;
                // The page length is big-endian, unlike the address
                writer.write_u16::<BigEndian>(data.len() as u16)?;
                writer.write_u8(MEMTYPE_FLASH)?;
                writer.write_all(data)?;
            }
        }

        writer.write_u8(CRC_EOP)
    }
}

fn check_framing(buf: &[u8]) -> Result<(), ResponseError> {
    match (buf.first(), buf.last()) {
        (Some(&STK_INSYNC), Some(&STK_OK)) => Ok(()),
        _ => Err(ResponseError::Unexpected(buf.to_vec())),
    }
}

/// The empty `INSYNC OK` answer
pub struct Ack;

impl Response for Ack {
    type T = ();

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError> {
        let buf: [u8; 2] = read_array(reader)?;

        check_framing(&buf)
    }
}

/// A single parameter byte, `INSYNC value OK`
pub struct Parameter;

impl Response for Parameter {
    type T = u8;

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError> {
        let buf: [u8; 3] = read_array(reader)?;
        check_framing(&buf)?;

        Ok(buf[1])
    }
}

/// The three device signature bytes, `INSYNC s0 s1 s2 OK`
pub struct Signature;

impl Response for Signature {
    type T = [u8; 3];

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError> {
        let buf: [u8; 5] = read_array(reader)?;
        check_framing(&buf)?;

        Ok([buf[1], buf[2], buf[3]])
    }
}

/// Optiboot programmer
#[derive(Debug, Clone)]
pub struct Stk500 {
    reset_delay: Duration,
    /// Details read from the bootloader during the last session
    pub version: Option<(u8, u8)>,
    pub signature: Option<[u8; 3]>,
}

impl Default for Stk500 {
    fn default() -> Self {
        Stk500::new()
    }
}

impl Stk500 {
    pub fn new() -> Stk500 {
        Stk500 {
            reset_delay: RESET_DELAY,
            version: None,
            signature: None,
        }
    }

    /// Overrides the delay between opening the port and talking to the bootloader
    pub fn with_reset_delay(mut self, reset_delay: Duration) -> Stk500 {
        self.reset_delay = reset_delay;
        self
    }

    /// Decodes the HEX image into padded pages, rejecting images beyond the word address range
    fn paginate(text: &str) -> Result<Vec<Page>, Error> {
        let image = ihex::decode(text)?;
        let size = image.end_address() as usize;

        if size > ADDRESS_LIMIT {
            return Err(Error::ImageTooLarge {
                size,
                limit: ADDRESS_LIMIT,
            });
        }

        Ok(image.pages(PAGE_SIZE, ERASED))
    }

    fn program(
        &mut self,
        session: &mut SerialSession,
        pages: &[Page],
        progress: &mut Progress<'_>,
    ) -> Result<(), Error> {
        session.set_dtr(false)?;
        thread::sleep(self.reset_delay);

        progress.step(0, "Synchronizing...")?;
        session
            .exchange::<_, Ack>(&Stk500Command::GetSync)
            .map_err(|cause| {
                Error::protocol("sync_failed", "Failed to synchronize with the bootloader", cause)
            })?;

        progress.step(0, "Get major version...")?;
        let major = session
            .exchange::<_, Parameter>(&Stk500Command::GetParameter(PARAM_SW_MAJOR))
            .map_err(|cause| {
                Error::protocol("get_major_version_failed", "Failed to get major version", cause)
            })?;

        progress.step(0, "Get minor version...")?;
        let minor = session
            .exchange::<_, Parameter>(&Stk500Command::GetParameter(PARAM_SW_MINOR))
            .map_err(|cause| {
                Error::protocol("get_minor_version_failed", "Failed to get minor version", cause)
            })?;
        self.version = Some((major, minor));

        progress.step(0, "Reading signature...")?;
        let signature = session
            .exchange::<_, Signature>(&Stk500Command::ReadSignature)
            .map_err(|cause| {
                Error::protocol("read_signature_failed", "Failed to read signature", cause)
            })?;
        self.signature = Some(signature);

        info!("Optiboot {}.{}, device signature {:02x?}", major, minor, signature);

        progress.step(0, "Entering programming mode...")?;
        session
            .exchange::<_, Ack>(&Stk500Command::EnterProgMode)
            .map_err(|cause| {
                Error::protocol(
                    "enter_programming_mode_failed",
                    "Failed to enter programming mode",
                    cause,
                )
            })?;

        progress.step(0, "Writing firmware...")?;
        for (index, page) in pages.iter().enumerate() {
            progress.check_cancelled()?;

            let word_address = (page.address / 2) as u16;
            debug!("Writing page at {:#06x} (word {:#06x})", page.address, word_address);

            session
                .exchange::<_, Ack>(&Stk500Command::LoadAddress(word_address))
                .map_err(|cause| {
                    Error::protocol("load_address_failed", "Failed to load address", cause)
                })?;
            session
                .exchange::<_, Ack>(&Stk500Command::ProgramPage(&page.data))
                .map_err(|cause| {
                    Error::protocol("write_page_failed", "Failed to write page", cause)
                })?;

            let percent = ((index + 1) * 100 / pages.len()) as u8;
            progress.report(percent, "Writing firmware...");
        }

        progress.step(100, "Leaving programming mode...")?;
        session
            .exchange::<_, Ack>(&Stk500Command::LeaveProgMode)
            .map_err(|cause| {
                Error::protocol(
                    "leave_programming_mode_failed",
                    "Failed to leave programming mode",
                    cause,
                )
            })?;

        Ok(())
    }
}

impl Bootloader for Stk500 {
    fn name(&self) -> &'static str {
        ProtocolKind::Stk500Optiboot.name()
    }

    fn encoding(&self) -> BinaryKind {
        BinaryKind::Hex
    }

    fn init(&mut self) {
        self.version = None;
        self.signature = None;
    }

    fn flash(
        &mut self,
        host: &mut dyn Host,
        binary: &Binary,
        progress: &mut Progress<'_>,
    ) -> Result<FlashOutcome, Error> {
        let pages = Stk500::paginate(binary.expect_hex())?;

        progress.step(0, "Opening port...")?;
        let mut session = SerialSession::new(host.open_serial(&LineSettings::new(BAUD_RATE))?);

        let result = self.program(&mut session, &pages, progress);

        if result.is_ok() {
            progress.report(100, "Closing port...");
        }
        session.finish(result)?;

        progress.report(100, "Flashing completed");

        Ok(FlashOutcome::Programmed)
    }
}
