//! The common interface of every bootloader, and the flow that drives one for a board

use log::info;

use crate::artifact::ArtifactSource;
use crate::binary::{Binary, BinaryKind};
use crate::host::Host;
use crate::progress::{CancelToken, Progress, ProgressEvent};
use crate::registry::{self, BoardEntry};
use crate::Error;

/// How a successful flash session ended
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashOutcome {
    /// The firmware was written to the target
    Programmed,
    /// The bootloader answered its handshake but nothing was written
    HandshakeOnly,
}

/// A resident bootloader that can be driven to program a target.
pub trait Bootloader {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// The one binary encoding `flash` accepts
    fn encoding(&self) -> BinaryKind;

    /// Forgets everything a previous session left behind
    fn init(&mut self);

    /// Programs `binary` into the target.
    ///
    /// The transport is acquired through `host` and released again before this returns, whatever
    /// the outcome.
    ///
    /// # Panics
    ///
    /// Panics if `binary` is not of the kind returned by `encoding`.
    fn flash(
        &mut self,
        host: &mut dyn Host,
        binary: &Binary,
        progress: &mut Progress<'_>,
    ) -> Result<FlashOutcome, Error>;
}

/// Resolves `board`, fetches its artifact from `source` and flashes it.
///
/// Every step is reported to `on_progress`. On failure the last event carries the error message.
pub fn flash_board(
    board: &str,
    source: &dyn ArtifactSource,
    host: &mut dyn Host,
    on_progress: &mut dyn FnMut(ProgressEvent),
    cancel: CancelToken,
) -> Result<FlashOutcome, Error> {
    let mut progress = Progress::new(on_progress, cancel);

    let (entry, binary) = match resolve(board, source, &progress) {
        Ok(resolved) => resolved,
        Err(err) => {
            progress.fail(&err);
            return Err(err);
        }
    };

    run(entry, &binary, host, &mut progress)
}

/// Flashes an artifact that was already fetched for `entry`.
///
/// # Panics
///
/// Panics if `binary` is not in the encoding `entry` names.
pub fn flash_binary(
    entry: &BoardEntry,
    binary: &Binary,
    host: &mut dyn Host,
    on_progress: &mut dyn FnMut(ProgressEvent),
    cancel: CancelToken,
) -> Result<FlashOutcome, Error> {
    let mut progress = Progress::new(on_progress, cancel);

    run(entry, binary, host, &mut progress)
}

fn resolve(
    board: &str,
    source: &dyn ArtifactSource,
    progress: &Progress<'_>,
) -> Result<(&'static BoardEntry, Binary), Error> {
    let entry = registry::lookup(board)?;

    progress.check_cancelled()?;

    let binary = source.fetch(board, entry.encoding)?;

    Ok((entry, binary))
}

fn run(
    entry: &BoardEntry,
    binary: &Binary,
    host: &mut dyn Host,
    progress: &mut Progress<'_>,
) -> Result<FlashOutcome, Error> {
    info!(
        "Flashing {} ({}) with {}: {} bytes, sha256 {}",
        entry.name,
        entry.board,
        entry.protocol,
        binary.len(),
        binary.sha256()
    );

    let mut bootloader = entry.protocol.bootloader();
    bootloader.init();
    bootloader.flash(host, binary, progress)
}
