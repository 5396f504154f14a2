//! Extended SAM-BA monitor protocol
//!
//! Only the session handshake is driven; page programming is not part of this protocol's
//! implementation, so a successful session ends with `FlashOutcome::HandshakeOnly`.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use log::info;

use super::{read_array, Command, ProtocolKind, Response};
use crate::binary::{Binary, BinaryKind};
use crate::bootloader::{Bootloader, FlashOutcome};
use crate::host::Host;
use crate::progress::Progress;
use crate::transport::{LineSettings, SerialSession};
use crate::{Error, ResponseError};

pub const BAUD_RATE: u32 = 921_600;

/// Final progress message of a session that stopped after the handshake
pub const HANDSHAKE_ONLY_MESSAGE: &str = "Handshake completed, firmware was not written";

/// SAM-BA monitor commands
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SamBaCommand {
    /// Queries the NVM controller, used as the handshake
    NvmInfo,
    /// Switches the monitor to binary replies
    SetBinaryMode,
    /// Reads the 32-bit word at the given address
    ReadWord(u32),
}

impl Command for SamBaCommand {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match *self {
            SamBaCommand::NvmInfo => writer.write_all(b"I:NVM\n"),
            SamBaCommand::SetBinaryMode => writer.write_all(b"N#"),
            SamBaCommand::ReadWord(address) => write!(writer, "w{:08x},4#\n\r", address),
        }
    }
}

/// Reply to `I:NVM`, five bytes of which the first must be zero
pub struct NvmInfo;

impl Response for NvmInfo {
    type T = [u8; 5];

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError> {
        let buf: [u8; 5] = read_array(reader)?;

        if buf[0] != 0x00 {
            return Err(ResponseError::Unexpected(buf.to_vec()));
        }

        Ok(buf)
    }
}

/// Reply to `N#`, two bytes that are not inspected
pub struct BinaryModeAck;

impl Response for BinaryModeAck {
    type T = ();

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError> {
        let _: [u8; 2] = read_array(reader)?;

        Ok(())
    }
}

/// A little-endian 32-bit word
pub struct Word;

impl Response for Word {
    type T = u32;

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError> {
        let buf: [u8; 4] = read_array(reader)?;

        Ok(Cursor::new(buf).read_u32::<LittleEndian>()?)
    }
}

/// SAM-BA programmer
#[derive(Debug, Clone, Default)]
pub struct SamBa {
    /// Reply to the handshake of the last session
    pub nvm_info: Option<[u8; 5]>,
}

impl SamBa {
    pub fn new() -> SamBa {
        SamBa::default()
    }

    /// Reads the word at `address` from the target's memory
    pub fn read_word(session: &mut SerialSession, address: u32) -> Result<u32, Error> {
        session
            .exchange::<_, Word>(&SamBaCommand::ReadWord(address))
            .map_err(|cause| Error::protocol("read_word_failed", "Failed to read word", cause))
    }

    fn handshake(
        &mut self,
        session: &mut SerialSession,
        progress: &mut Progress<'_>,
    ) -> Result<(), Error> {
        session.set_dtr(false)?;

        progress.step(0, "Handshaking...")?;
        let nvm_info = session
            .exchange::<_, NvmInfo>(&SamBaCommand::NvmInfo)
            .map_err(|cause| {
                Error::protocol("start_boot_mode_failed", "Failed to start boot mode", cause)
            })?;
        self.nvm_info = Some(nvm_info);

        progress.step(0, "Setting binary mode...")?;
        session
            .exchange::<_, BinaryModeAck>(&SamBaCommand::SetBinaryMode)
            .map_err(|cause| {
                Error::protocol("set_binary_mode_failed", "Failed to set binary mode", cause)
            })?;

        info!("SAM-BA monitor answered the handshake: {:02x?}", nvm_info);

        Ok(())
    }
}

impl Bootloader for SamBa {
    fn name(&self) -> &'static str {
        ProtocolKind::SamBaExtended.name()
    }

    fn encoding(&self) -> BinaryKind {
        BinaryKind::Bin
    }

    fn init(&mut self) {
        self.nvm_info = None;
    }

    fn flash(
        &mut self,
        host: &mut dyn Host,
        binary: &Binary,
        progress: &mut Progress<'_>,
    ) -> Result<FlashOutcome, Error> {
        let data = binary.expect_bin();

        info!("{} bytes staged; SAM-BA sessions stop after the handshake", data.len());

        progress.step(0, "Opening port...")?;
        let mut session = SerialSession::new(host.open_serial(&LineSettings::new(BAUD_RATE))?);

        let result = self.handshake(&mut session, progress);
        if result.is_ok() {
            progress.report(100, "Closing port...");
        }
        session.finish(result)?;

        progress.report(100, HANDSHAKE_ONLY_MESSAGE);

        Ok(FlashOutcome::HandshakeOnly)
    }
}

#[cfg(test)]
mod tests {
    use assert_hex::*;
    use hex_literal::hex;

    use super::*;
    use crate::progress::{CancelToken, ProgressEvent};
    use crate::transport::mock::{MockHost, MockSerial};

    fn command_to_vec(command: SamBaCommand) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();

        command.to_writer(&mut buf).unwrap();

        buf
    }

    #[test]
    fn it_should_serialize_commands() {
        assert_eq!(command_to_vec(SamBaCommand::NvmInfo), b"I:NVM\n".to_vec());
        assert_eq!(command_to_vec(SamBaCommand::SetBinaryMode), b"N#".to_vec());
        assert_eq!(
            command_to_vec(SamBaCommand::ReadWord(0x0000_2000)),
            b"w00002000,4#\n\r".to_vec()
        );
    }

    #[test]
    fn it_should_read_little_endian_words() {
        let (serial, log) = MockSerial::new(|_| Some(hex!("78 56 34 12").to_vec()));
        let mut session = SerialSession::new(Box::new(serial));

        assert_eq_hex!(SamBa::read_word(&mut session, 0x4000).unwrap(), 0x1234_5678);
        assert_eq!(log.borrow().writes[0], b"w00004000,4#\n\r".to_vec());
    }

    #[test]
    fn it_should_complete_the_handshake_only() {
        let (serial, log) = MockSerial::new(|frame| match frame {
            b"I:NVM\n" => Some(vec![0x00, 0x01, 0x02, 0x03, 0x04]),
            b"N#" => Some(vec![0x0A, 0x0D]),
            _ => None,
        });
        let mut host = MockHost::new().with_serial(serial);
        let mut events = Vec::new();
        let mut callback = |event: ProgressEvent| events.push(event);
        let mut samba = SamBa::new();

        let outcome = {
            let mut progress = Progress::new(&mut callback, CancelToken::new());
            samba.flash(&mut host, &Binary::Bin(vec![0x00; 64]), &mut progress)
        };

        assert_eq!(outcome.unwrap(), FlashOutcome::HandshakeOnly);
        assert_eq!(host.opened[0].baud_rate, BAUD_RATE);

        let log = log.borrow();
        assert_eq!(log.writes, vec![b"I:NVM\n".to_vec(), b"N#".to_vec()]);
        assert_eq!(log.dtr, vec![false]);
        assert_eq!(log.closes, 1);
        assert_eq!(events.last().unwrap().message, HANDSHAKE_ONLY_MESSAGE);
    }

    #[test]
    fn it_should_reject_a_non_zero_handshake_reply() {
        let (serial, log) = MockSerial::new(|_| Some(vec![0x01, 0x00, 0x00, 0x00, 0x00]));
        let mut host = MockHost::new().with_serial(serial);
        let mut callback = |_: ProgressEvent| {};
        let mut progress = Progress::new(&mut callback, CancelToken::new());

        let err = SamBa::new()
            .flash(&mut host, &Binary::Bin(vec![0x00]), &mut progress)
            .unwrap_err();

        assert_eq!(err.code(), "start_boot_mode_failed");
        assert_eq!(log.borrow().writes.len(), 1);
        assert_eq!(log.borrow().closes, 1);
    }

    #[test]
    fn it_should_fail_binary_mode_only_when_nothing_arrives() {
        let (serial, log) = MockSerial::new(|frame| match frame {
            b"I:NVM\n" => Some(vec![0x00; 5]),
            _ => Some(vec![0x42]),
        });
        let mut host = MockHost::new().with_serial(serial);
        let mut callback = |_: ProgressEvent| {};
        let mut progress = Progress::new(&mut callback, CancelToken::new());

        let err = SamBa::new()
            .flash(&mut host, &Binary::Bin(vec![0x00]), &mut progress)
            .unwrap_err();

        assert_eq!(err.code(), "set_binary_mode_failed");
        assert_eq!(log.borrow().closes, 1);
    }
}
