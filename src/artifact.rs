//! Where compiled artifacts are fetched from

use std::path::{Path, PathBuf};

use log::debug;

use crate::binary::{Binary, BinaryKind};
use crate::Error;

/// A store of compiled artifacts
pub trait ArtifactSource {
    /// Fetches the artifact built for `board` in the `encoding` its bootloader consumes
    fn fetch(&self, board: &str, encoding: BinaryKind) -> Result<Binary, Error>;
}

/// A single artifact file; its extension has to name the encoding the board needs
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    path: PathBuf,
}

impl ArtifactFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> ArtifactFile {
        ArtifactFile { path: path.into() }
    }
}

impl ArtifactSource for ArtifactFile {
    fn fetch(&self, board: &str, encoding: BinaryKind) -> Result<Binary, Error> {
        let kind = self
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(BinaryKind::from_extension);

        if kind != Some(encoding) {
            return Err(Error::EncodingMismatch {
                path: self.path.clone(),
                expected: encoding,
            });
        }

        debug!("Reading {} artifact for {} from {}", encoding, board, self.path.display());

        Binary::read_from(&self.path, encoding)
    }
}

/// A build output directory holding `<sketch>.<ext>` for every encoding it was built for
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    dir: PathBuf,
    sketch: String,
}

impl ArtifactDir {
    pub fn new<P: AsRef<Path>, S: Into<String>>(dir: P, sketch: S) -> ArtifactDir {
        ArtifactDir {
            dir: dir.as_ref().to_path_buf(),
            sketch: sketch.into(),
        }
    }

    /// Path of the artifact in the given encoding
    pub fn path_for(&self, encoding: BinaryKind) -> PathBuf {
        self.dir.join(format!("{}.{}", self.sketch, encoding.extension()))
    }
}

impl ArtifactSource for ArtifactDir {
    fn fetch(&self, board: &str, encoding: BinaryKind) -> Result<Binary, Error> {
        let path = self.path_for(encoding);

        debug!("Reading {} artifact for {} from {}", encoding, board, path.display());

        Binary::read_from(&path, encoding)
    }
}
