//! Renesas RA serial boot mode handshake

use std::io::{self, Read, Write};

use log::info;

use super::samba::HANDSHAKE_ONLY_MESSAGE;
use super::{read_array, Command, ProtocolKind, Response};
use crate::binary::{Binary, BinaryKind};
use crate::bootloader::{Bootloader, FlashOutcome};
use crate::host::Host;
use crate::progress::Progress;
use crate::transport::{LineSettings, SerialSession};
use crate::{Error, ResponseError};

pub const BAUD_RATE: u32 = 921_600;

/// Request that starts the boot mode session
const START_BOOT_MODE: [u8; 5] = [0x80, 0x71, 0x00, 0x00, 0x00];

/// Starts the boot mode session
pub struct StartBootMode;

impl Command for StartBootMode {
    fn to_writer<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&START_BOOT_MODE)
    }
}

/// Four byte reply whose first byte must be zero
pub struct BootModeAck;

impl Response for BootModeAck {
    type T = [u8; 4];

    fn from_reader<R: Read>(reader: R) -> Result<Self::T, ResponseError> {
        let buf: [u8; 4] = read_array(reader)?;

        match buf[0] {
            0x00 => Ok(buf),
            _ => Err(ResponseError::Unexpected(buf.to_vec())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenesasBoot;

impl RenesasBoot {
    pub fn new() -> RenesasBoot {
        RenesasBoot
    }
}

impl Bootloader for RenesasBoot {
    fn name(&self) -> &'static str {
        ProtocolKind::RenesasBoot.name()
    }

    fn encoding(&self) -> BinaryKind {
        BinaryKind::Bin
    }

    fn init(&mut self) {}

    fn flash(
        &mut self,
        host: &mut dyn Host,
        binary: &Binary,
        progress: &mut Progress<'_>,
    ) -> Result<FlashOutcome, Error> {
        let data = binary.expect_bin();

        progress.step(0, "Opening port...")?;
        let mut session = SerialSession::new(host.open_serial(&LineSettings::new(BAUD_RATE))?);

        let result = progress.step(0, "Handshaking...").and_then(|_| {
            session
                .exchange::<_, BootModeAck>(&StartBootMode)
                .map_err(|cause| {
                    Error::protocol("start_boot_mode_failed", "Failed to start boot mode", cause)
                })
        });

        if let Ok(reply) = &result {
            info!(
                "Renesas boot mode answered {:02x?}; {} bytes were not written",
                reply,
                data.len()
            );
            progress.report(100, "Closing port...");
        }
        session.finish(result)?;

        progress.report(100, HANDSHAKE_ONLY_MESSAGE);

        Ok(FlashOutcome::HandshakeOnly)
    }
}
