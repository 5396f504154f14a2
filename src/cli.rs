use std::path::PathBuf;

use structopt::StructOpt;

use sketchflash::transport::usb::UsbId;

#[derive(StructOpt, Debug)]
pub enum Command {
    /// List the supported boards and the bootloader each of them runs
    Boards,
    /// Flash a compiled sketch onto a board
    Flash(FlashOpts),
    /// Convert an Intel HEX file to a flat binary
    Convert(ConvertOpts),
}

#[derive(StructOpt, Debug)]
pub struct FlashOpts {
    /// The board to flash, as `vendor:architecture:board`
    #[structopt(env = "SKETCH_BOARD", short = "B", long = "board")]
    pub board: String,
    /// An artifact file whose extension matches the board's encoding
    #[structopt(short = "f", long = "file")]
    pub file: Option<PathBuf>,
    /// A build directory holding `<sketch>.hex`, `<sketch>.bin` or `<sketch>.uf2`
    #[structopt(short = "d", long = "build-dir", requires = "sketch")]
    pub build_dir: Option<PathBuf>,
    /// Name of the sketch inside the build directory
    #[structopt(short = "s", long = "sketch")]
    pub sketch: Option<String>,
}

#[derive(StructOpt, Debug)]
pub struct ConvertOpts {
    /// The Intel HEX file to read
    pub input: PathBuf,
    /// The flat binary to write
    pub output: PathBuf,
    /// Value of the bytes between records
    #[structopt(long = "fill", default_value = "255")]
    pub fill: u8,
}

#[derive(StructOpt, Debug)]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The serial device to connect to
    #[structopt(env = "SERIAL_PORT", short = "p", long = "port")]
    pub serial_port: Option<String>,
    /// The USB DFU device to use, as `vid:pid` or `vid`
    #[structopt(env = "DFU_DEVICE", long = "dfu-device")]
    pub dfu_device: Option<UsbId>,
    /// Mount point of the UF2 bootloader volume
    #[structopt(env = "UF2_VOLUME", long = "volume")]
    pub volume: Option<PathBuf>,
    /// Serial read timeout in milliseconds
    #[structopt(
        env = "SERIAL_TIMEOUT_MS",
        long = "timeout",
        default_value = "5000"
    )]
    pub timeout_ms: u64,
    /// Ask for the port, device or volume when it was not given
    #[structopt(short = "i", long = "interactive")]
    pub interactive: bool,
}
