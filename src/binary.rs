//! Compiled firmware artifacts in the encodings the bootloaders consume

use std::fmt;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::Error;

/// The encoding of a compiled artifact
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum BinaryKind {
    /// Intel HEX text
    Hex,
    /// Raw flat binary
    Bin,
    /// USB Flashing Format image
    Uf2,
}

impl BinaryKind {
    /// Returns the file extension artifacts of this kind are stored with
    pub fn extension(self) -> &'static str {
        match self {
            BinaryKind::Hex => "hex",
            BinaryKind::Bin => "bin",
            BinaryKind::Uf2 => "uf2",
        }
    }

    /// Maps a file extension (case-insensitive) to the kind of artifact it holds
    pub fn from_extension(extension: &str) -> Option<BinaryKind> {
        match extension.to_ascii_lowercase().as_str() {
            "hex" | "ihex" => Some(BinaryKind::Hex),
            "bin" => Some(BinaryKind::Bin),
            "uf2" => Some(BinaryKind::Uf2),
            _ => None,
        }
    }
}

impl fmt::Display for BinaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.extension())
    }
}

/// A compiled firmware artifact, tagged by its encoding
#[derive(Clone, Eq, PartialEq)]
pub enum Binary {
    Hex(String),
    Bin(Vec<u8>),
    Uf2(Vec<u8>),
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binary")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

impl Binary {
    /// Reads the artifact at `path`, decoding it as `kind`
    pub fn read_from<P: AsRef<Path>>(path: P, kind: BinaryKind) -> Result<Binary, Error> {
        let path = path.as_ref();
        let artifact_err = |err| Error::Artifact(path.to_path_buf(), err);

        Ok(match kind {
            BinaryKind::Hex => Binary::Hex(fs::read_to_string(path).map_err(artifact_err)?),
            BinaryKind::Bin => Binary::Bin(fs::read(path).map_err(artifact_err)?),
            BinaryKind::Uf2 => Binary::Uf2(fs::read(path).map_err(artifact_err)?),
        })
    }

    pub fn kind(&self) -> BinaryKind {
        match self {
            Binary::Hex(_) => BinaryKind::Hex,
            Binary::Bin(_) => BinaryKind::Bin,
            Binary::Uf2(_) => BinaryKind::Uf2,
        }
    }

    /// The payload as stored, i.e. the HEX text bytes for `Binary::Hex`
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Binary::Hex(text) => text.as_bytes(),
            Binary::Bin(data) | Binary::Uf2(data) => data.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Returns the lowercase hex SHA-256 digest of the payload
    pub fn sha256(&self) -> String {
        format!("{:x}", Sha256::digest(self.as_bytes()))
    }

    /// Returns the HEX text.
    ///
    /// # Panics
    ///
    /// Panics if the binary is not `Binary::Hex`. Handing a bootloader the wrong encoding is a
    /// programming error.
    pub fn expect_hex(&self) -> &str {
        match self {
            Binary::Hex(text) => text.as_str(),
            other => panic!("expected a hex binary, got {}", other.kind()),
        }
    }

    /// Returns the raw flat binary.
    ///
    /// # Panics
    ///
    /// Panics if the binary is not `Binary::Bin`.
    pub fn expect_bin(&self) -> &[u8] {
        match self {
            Binary::Bin(data) => data.as_slice(),
            other => panic!("expected a bin binary, got {}", other.kind()),
        }
    }

    /// Returns the UF2 image.
    ///
    /// # Panics
    ///
    /// Panics if the binary is not `Binary::Uf2`.
    pub fn expect_uf2(&self) -> &[u8] {
        match self {
            Binary::Uf2(data) => data.as_slice(),
            other => panic!("expected a uf2 binary, got {}", other.kind()),
        }
    }
}
