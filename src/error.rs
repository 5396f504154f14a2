use std::io;
use std::path::PathBuf;

use nusb::transfer::TransferError;
use thiserror::Error;

use crate::binary::BinaryKind;
use crate::ihex::HexError;
use crate::protocol::dfu::DfuStatus;

/// The reason a response read from the bootloader was rejected
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
    #[error("Unexpected response {:02x?}", _0)]
    Unexpected(Vec<u8>),
}

/// Error code and human-readable message of a failed flash session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    // Selection errors - the user declined or nothing was chosen
    #[error("No port selected")]
    NoPortSelected,
    #[error("No USB device selected")]
    NoDeviceSelected,
    #[error("No directory selected")]
    NoDirectorySelected,

    // Transport errors
    #[error("Error when opening serial port {}: {}", _0, _1)]
    OpenPort(String, #[source] serialport::Error),
    #[error("Error when closing serial port: {}", _0)]
    ClosePort(#[source] io::Error),
    #[error("Error when setting the DTR signal: {}", _0)]
    SetSignals(#[source] io::Error),
    #[error("Error when opening USB device: {}", _0)]
    OpenDevice(String),
    #[error("Error when selecting USB configuration {}: {}", _0, _1)]
    SetConfiguration(u8, String),
    #[error("Error when claiming USB interface {}: {}", _0, _1)]
    ClaimInterface(u8, String),
    #[error("Error when resetting the USB device: {}", _0)]
    ResetDevice(String),
    #[error("USB interface has not been claimed")]
    InterfaceNotClaimed,
    #[error(
        "Control Transfer {direction} (request={request:#04x}, value={value}) failed: {source}"
    )]
    ControlTransfer {
        direction: &'static str,
        request: u8,
        value: u16,
        #[source]
        source: TransferError,
    },

    // Protocol errors
    #[error("{message}")]
    Protocol {
        code: &'static str,
        message: &'static str,
        #[source]
        cause: ResponseError,
    },
    #[error("The DFU interface not found")]
    DfuInterfaceNotFound,
    #[error("DFU Device Initialization failed: {}", _0)]
    DfuInitFailed(&'static str),
    #[error("DFU download failed: {}", _0)]
    DfuDownloadFailed(DfuStatus),

    // Image errors
    #[error("Invalid Intel HEX image: {}", _0)]
    InvalidHex(#[from] HexError),
    #[error("Invalid UF2 image: {}", _0)]
    InvalidUf2(&'static str),
    #[error("Image of {size} bytes exceeds the addressable limit of {limit} bytes")]
    ImageTooLarge { size: usize, limit: usize },

    // Write errors
    #[error("Writing firmware to {} failed: {}", .0.display(), .1)]
    WriteFirmware(PathBuf, #[source] io::Error),

    // Resolution of boards and artifacts
    #[error("Unknown board {:?}", _0)]
    UnknownBoard(String),
    #[error("Error when reading artifact {}: {}", .0.display(), .1)]
    Artifact(PathBuf, #[source] io::Error),
    #[error("Artifact {} is not a {} binary", .path.display(), .expected)]
    EncodingMismatch { path: PathBuf, expected: BinaryKind },

    #[error("Flashing was cancelled")]
    Cancelled,
    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
}

impl Error {
    /// Creates a protocol error for a step that did not observe the expected response
    pub fn protocol(code: &'static str, message: &'static str, cause: ResponseError) -> Error {
        Error::Protocol {
            code,
            message,
            cause,
        }
    }

    /// Returns the stable, machine-readable code of this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoPortSelected => "no_port_selected",
            Error::NoDeviceSelected => "no_device_selected",
            Error::NoDirectorySelected => "no_directory_selected",
            Error::OpenPort(..) => "open_port_error",
            Error::ClosePort(_) => "close_port_error",
            Error::SetSignals(_) => "set_signals_error",
            Error::OpenDevice(_) => "open_device_error",
            Error::SetConfiguration(..) => "set_configuration_error",
            Error::ClaimInterface(..) => "claim_interface_error",
            Error::ResetDevice(_) => "reset_device_error",
            Error::InterfaceNotClaimed => "interface_not_claimed",
            Error::ControlTransfer { .. } => "control_transfer_failed",
            Error::Protocol { code, .. } => *code,
            Error::DfuInterfaceNotFound => "dfu_interface_not_found",
            Error::DfuInitFailed(_) => "dfu_initialization_failed",
            Error::DfuDownloadFailed(_) => "dfu_download_failed",
            Error::InvalidHex(_) => "invalid_hex",
            Error::InvalidUf2(_) => "invalid_uf2",
            Error::ImageTooLarge { .. } => "image_too_large",
            Error::WriteFirmware(..) => "write_failed",
            Error::UnknownBoard(_) => "unknown_board",
            Error::Artifact(..) => "artifact_unavailable",
            Error::EncodingMismatch { .. } => "encoding_mismatch",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io_error",
        }
    }

    /// Returns the code and message pair surfaced to the caller
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }

    /// Returns true if the error means the serial device vanished while being opened
    pub fn is_device_gone(&self) -> bool {
        match self {
            Error::OpenPort(_, err) => matches!(
                err.kind(),
                serialport::ErrorKind::NoDevice
                    | serialport::ErrorKind::Io(io::ErrorKind::NotFound)
            ),
            _ => false,
        }
    }
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> ErrorInfo {
        err.info()
    }
}
