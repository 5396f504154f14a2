//! Boards the flasher knows, and the bootloader each of them runs

use crate::binary::BinaryKind;
use crate::protocol::ProtocolKind;
use crate::Error;

/// A supported board
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BoardEntry {
    /// Fully qualified board name, `vendor:architecture:board`
    pub board: &'static str,
    /// Human readable board name
    pub name: &'static str,
    pub protocol: ProtocolKind,
    /// Encoding of the artifact the bootloader consumes
    pub encoding: BinaryKind,
}

const fn entry(
    board: &'static str,
    name: &'static str,
    protocol: ProtocolKind,
    encoding: BinaryKind,
) -> BoardEntry {
    BoardEntry {
        board,
        name,
        protocol,
        encoding,
    }
}

pub static BOARDS: &[BoardEntry] = &[
    entry(
        "arduino:avr:uno",
        "Arduino Uno",
        ProtocolKind::Stk500Optiboot,
        BinaryKind::Hex,
    ),
    entry(
        "arduino:avr:nano",
        "Arduino Nano",
        ProtocolKind::Stk500Optiboot,
        BinaryKind::Hex,
    ),
    entry(
        "arduino:renesas_uno:minima",
        "Arduino UNO R4 Minima",
        ProtocolKind::UsbDfu,
        BinaryKind::Bin,
    ),
    entry(
        "arduino:renesas_uno:unor4wifi",
        "Arduino UNO R4 WiFi",
        ProtocolKind::SamBaExtended,
        BinaryKind::Bin,
    ),
    entry(
        "renesas:ra4m1:rom_boot",
        "Renesas RA4M1 (ROM boot mode)",
        ProtocolKind::RenesasBoot,
        BinaryKind::Bin,
    ),
    entry(
        "rp2040:rp2040:rpipico",
        "Raspberry Pi Pico",
        ProtocolKind::Uf2FileCopy,
        BinaryKind::Uf2,
    ),
];

/// Looks up `board`, which may carry menu options after the board name
/// (`arduino:avr:nano:cpu=atmega328`)
pub fn lookup(board: &str) -> Result<&'static BoardEntry, Error> {
    let key = board.splitn(4, ':').take(3).collect::<Vec<_>>().join(":");

    BOARDS
        .iter()
        .find(|entry| entry.board == key)
        .ok_or_else(|| Error::UnknownBoard(board.to_string()))
}
