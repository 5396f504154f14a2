use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use structopt::StructOpt;

use sketchflash::artifact::{ArtifactDir, ArtifactFile, ArtifactSource};
use sketchflash::host::{HostConfig, SystemHost};
use sketchflash::{ihex, registry};
use sketchflash::{flash_binary, CancelToken, FlashOutcome, ProgressEvent};

mod cli;

/// Largest address range `convert` flattens
const MAX_CONVERT_SPAN: u64 = 256 * 1024 * 1024;

fn list_boards() {
    println!("{:<32} {:<32} {:<16} {}", "BOARD", "NAME", "PROTOCOL", "ENCODING");

    for entry in registry::BOARDS {
        println!(
            "{:<32} {:<32} {:<16} {}",
            entry.board, entry.name, entry.protocol, entry.encoding
        );
    }
}

fn artifact_source(opts: &cli::FlashOpts) -> Result<Box<dyn ArtifactSource>, anyhow::Error> {
    match (&opts.file, &opts.build_dir, &opts.sketch) {
        (Some(file), _, _) => Ok(Box::new(ArtifactFile::new(file))),
        (None, Some(dir), Some(sketch)) => Ok(Box::new(ArtifactDir::new(dir, sketch.as_str()))),
        _ => Err(anyhow::anyhow!("Either --file or both --build-dir and --sketch are required")),
    }
}

fn flash(opts: &cli::Opts, flash_opts: &cli::FlashOpts) -> Result<(), anyhow::Error> {
    let board = flash_opts.board.as_str();
    let entry = registry::lookup(board)?;
    let source = artifact_source(flash_opts)?;

    let binary = source
        .fetch(board, entry.encoding)
        .with_context(|| format!("Failed to fetch the artifact for {}", board))?;

    println!("Board: {} ({})", entry.name, entry.board);
    println!("Bootloader: {}", entry.protocol);
    println!(
        "Artifact: {} bytes of {}, sha256 {}",
        binary.len(),
        binary.kind(),
        binary.sha256()
    );

    let mut host = SystemHost::new(HostConfig {
        serial_port: opts.serial_port.clone(),
        usb_device: opts.dfu_device,
        volume: opts.volume.clone(),
        read_timeout: Some(Duration::from_millis(opts.timeout_ms)),
        interactive: opts.interactive,
    });

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );

    let mut on_progress = |event: ProgressEvent| {
        pb.set_position(u64::from(event.percent));
        pb.set_message(event.message);
    };

    let outcome = flash_binary(
        entry,
        &binary,
        &mut host,
        &mut on_progress,
        CancelToken::new(),
    );

    match &outcome {
        Ok(FlashOutcome::Programmed) => pb.finish(),
        Ok(FlashOutcome::HandshakeOnly) => {
            pb.abandon();
            println!("The bootloader answered, but this protocol does not write firmware yet");
        }
        Err(err) => {
            pb.abandon();
            eprintln!("Flashing failed ({})", err.code());
        }
    }

    outcome.with_context(|| format!("Failed to flash {}", board))?;

    Ok(())
}

fn convert<P: AsRef<Path>>(input: P, output: P, fill: u8) -> Result<(), anyhow::Error> {
    let (input, output) = (input.as_ref(), output.as_ref());

    let text = fs::read_to_string(input)
        .with_context(|| format!("Failed to read '{}'", input.display()))?;
    let image = ihex::decode(&text)
        .with_context(|| format!("Failed to decode Intel HEX file '{}'", input.display()))?;
    if image.span() > MAX_CONVERT_SPAN {
        anyhow::bail!(
            "'{}' spans {} bytes, more than the {} bytes a flat binary may hold",
            input.display(),
            image.span(),
            MAX_CONVERT_SPAN
        );
    }

    let flat = image.to_flat(fill);

    fs::write(output, &flat).with_context(|| format!("Failed to write '{}'", output.display()))?;

    println!(
        "Wrote {} bytes ({} from records) starting at {:#010x} to {}",
        flat.len(),
        image.len(),
        image.start_address(),
        output.display()
    );

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    use cli::{Command, ConvertOpts};

    // Create a logger with a timestamp that logs everything at Info level or above
    pretty_env_logger::init_timed();

    // Parse the command-line arguments
    let opts = cli::Opts::from_args();

    match &opts.command {
        Command::Boards => list_boards(),
        Command::Flash(flash_opts) => flash(&opts, flash_opts)?,
        Command::Convert(ConvertOpts {
            input,
            output,
            fill,
        }) => {
            println!("Converting {} to a flat binary", input.as_path().display());

            convert(input, output, *fill)?;
        }
    }

    Ok(())
}
