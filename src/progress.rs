//! Progress reporting and cooperative cancellation of a flash session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::Error;

/// A single progress update emitted during a flash session
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProgressEvent {
    /// Completion in percent, `0..=100`
    pub percent: u8,
    pub message: String,
}

/// A cloneable flag used to request that a running session stops at its next step
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Forwards progress events to a caller-provided callback.
///
/// The reported percentage never decreases and never exceeds 100 within one session.
pub struct Progress<'a> {
    callback: &'a mut dyn FnMut(ProgressEvent),
    cancel: CancelToken,
    percent: u8,
}

impl<'a> Progress<'a> {
    pub fn new(callback: &'a mut dyn FnMut(ProgressEvent), cancel: CancelToken) -> Progress<'a> {
        Progress {
            callback,
            cancel,
            percent: 0,
        }
    }

    /// The last percentage that was reported
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Reports `message` at `percent`, clamped so the sequence stays monotonic
    pub fn report<S: Into<String>>(&mut self, percent: u8, message: S) {
        self.percent = percent.min(100).max(self.percent);

        let event = ProgressEvent {
            percent: self.percent,
            message: message.into(),
        };

        debug!("[{:3}%] {}", event.percent, event.message);

        (self.callback)(event);
    }

    /// Returns `Error::Cancelled` if cancellation was requested
    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(())
    }

    /// Starts a new protocol step: checks for cancellation and then reports the step
    pub fn step<S: Into<String>>(&mut self, percent: u8, message: S) -> Result<(), Error> {
        self.check_cancelled()?;
        self.report(percent, message);

        Ok(())
    }

    /// Emits the final error message of a failed session
    pub fn fail(&mut self, err: &Error) {
        let percent = self.percent;

        self.report(percent, format!("[Error] {}", err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_keep_percentages_monotonic() {
        let mut events = Vec::new();
        let mut callback = |event: ProgressEvent| events.push(event.percent);

        {
            let mut progress = Progress::new(&mut callback, CancelToken::new());
            progress.report(10, "a");
            progress.report(5, "b");
            progress.report(250, "c");
            progress.report(50, "d");
        }

        assert_eq!(events, vec![10, 10, 100, 100]);
    }

    #[test]
    fn it_should_stop_steps_once_cancelled() {
        let mut messages = Vec::new();
        let mut callback = |event: ProgressEvent| messages.push(event.message);
        let token = CancelToken::new();

        {
            let mut progress = Progress::new(&mut callback, token.clone());
            progress.step(0, "first").unwrap();

            token.cancel();

            assert!(matches!(progress.step(50, "second"), Err(Error::Cancelled)));
            progress.fail(&Error::Cancelled);
        }

        assert_eq!(
            messages,
            vec!["first".to_string(), "[Error] Flashing was cancelled".to_string()]
        );
    }
}
