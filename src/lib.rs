pub mod artifact;
pub mod binary;
pub mod bootloader;
mod error;
pub mod host;
pub mod ihex;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use error::{Error, ErrorInfo, ResponseError};

pub use artifact::{ArtifactDir, ArtifactFile, ArtifactSource};
pub use binary::{Binary, BinaryKind};
pub use bootloader::{flash_binary, flash_board, Bootloader, FlashOutcome};
pub use host::{Host, HostConfig, SystemHost};
pub use progress::{CancelToken, Progress, ProgressEvent};

pub use nusb;
pub use serialport;
