//! UF2 images copied onto the mass storage volume of a UF2 bootloader
//!
//! The board is kicked into its bootloader with the 1200 baud touch, after which the image is
//! written to the mounted volume in a single write.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use super::ProtocolKind;
use crate::binary::{Binary, BinaryKind};
use crate::bootloader::{Bootloader, FlashOutcome};
use crate::host::Host;
use crate::progress::Progress;
use crate::transport::{LineSettings, SerialSession};
use crate::Error;

pub const UF2_MAGIC_START0: u32 = 0x0A32_4655;
pub const UF2_MAGIC_START1: u32 = 0x9E5D_5157;
pub const UF2_MAGIC_END: u32 = 0x0AB1_6F30;
pub const UF2_BLOCK_SIZE: usize = 512;

/// Opening and closing the port at this rate resets the board into its bootloader
pub const TOUCH_BAUD_RATE: u32 = 1200;

/// Name of the file the image is written to
pub const FIRMWARE_FILE_NAME: &str = "firmware.uf2";

/// How long to wait for the volume to show up after the touch
const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Checks the image length and the magic numbers of every block, returning the block count
pub fn validate(data: &[u8]) -> Result<usize, Error> {
    if data.is_empty() || data.len() % UF2_BLOCK_SIZE != 0 {
        return Err(Error::InvalidUf2("length is not a multiple of 512 bytes"));
    }

    for block in data.chunks(UF2_BLOCK_SIZE) {
        let start0 = LittleEndian::read_u32(&block[0..4]);
        let start1 = LittleEndian::read_u32(&block[4..8]);
        let end = LittleEndian::read_u32(&block[UF2_BLOCK_SIZE - 4..]);

        if start0 != UF2_MAGIC_START0 || start1 != UF2_MAGIC_START1 || end != UF2_MAGIC_END {
            return Err(Error::InvalidUf2("block with bad magic numbers"));
        }
    }

    Ok(data.len() / UF2_BLOCK_SIZE)
}

/// UF2 copy "bootloader"
#[derive(Debug, Clone)]
pub struct Uf2FileCopy {
    mount_timeout: Duration,
    /// Where the image was written by the last session
    pub written_to: Option<PathBuf>,
}

impl Default for Uf2FileCopy {
    fn default() -> Self {
        Uf2FileCopy::new()
    }
}

impl Uf2FileCopy {
    pub fn new() -> Uf2FileCopy {
        Uf2FileCopy {
            mount_timeout: MOUNT_TIMEOUT,
            written_to: None,
        }
    }

    /// Overrides how long to wait for the bootloader volume to appear
    pub fn with_mount_timeout(mut self, mount_timeout: Duration) -> Uf2FileCopy {
        self.mount_timeout = mount_timeout;
        self
    }

    /// Opens and closes the port at 1200 baud. A port that vanishes on open means the board is
    /// already rebooting.
    fn touch(host: &mut dyn Host) -> Result<(), Error> {
        match host.open_serial(&LineSettings::new(TOUCH_BAUD_RATE)) {
            Ok(link) => {
                if let Err(err) = SerialSession::new(link).close() {
                    warn!("{}", err);
                }

                Ok(())
            }
            Err(err) if err.is_device_gone() => {
                debug!("Port disappeared during the touch: {}", err);

                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn wait_for_volume(&self, directory: &Path) -> Result<(), Error> {
        let deadline = Instant::now() + self.mount_timeout;

        while !directory.is_dir() {
            if Instant::now() >= deadline {
                return Err(Error::WriteFirmware(
                    directory.to_path_buf(),
                    io::Error::new(io::ErrorKind::NotFound, "volume is not mounted"),
                ));
            }

            thread::sleep(MOUNT_POLL_INTERVAL);
        }

        Ok(())
    }
}

impl Bootloader for Uf2FileCopy {
    fn name(&self) -> &'static str {
        ProtocolKind::Uf2FileCopy.name()
    }

    fn encoding(&self) -> BinaryKind {
        BinaryKind::Uf2
    }

    fn init(&mut self) {
        self.written_to = None;
    }

    fn flash(
        &mut self,
        host: &mut dyn Host,
        binary: &Binary,
        progress: &mut Progress<'_>,
    ) -> Result<FlashOutcome, Error> {
        let data = binary.expect_uf2();
        let blocks = validate(data)?;

        progress.step(0, "Switching to program mode...")?;
        Uf2FileCopy::touch(host)?;

        progress.step(33, "Opening directory...")?;
        let directory = host.choose_directory()?;
        self.wait_for_volume(&directory)?;

        progress.step(66, "Writing firmware...")?;
        let path = directory.join(FIRMWARE_FILE_NAME);
        fs::write(&path, data).map_err(|err| Error::WriteFirmware(path.clone(), err))?;

        info!("Wrote {} UF2 blocks to {}", blocks, path.display());
        self.written_to = Some(path);

        progress.report(100, "Flashing completed.");

        Ok(FlashOutcome::Programmed)
    }
}
