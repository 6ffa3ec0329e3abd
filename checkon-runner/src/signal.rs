// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling shutdown signals during a batch.

use crate::errors::ShutdownHandlerSetupError;

/// The kind of shutdown handling to set up for a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ShutdownHandlerKind {
    /// The standard handler. Captures interrupt and termination signals depending on the platform.
    Standard,

    /// A no-op handler that never fires. Useful for tests.
    Noop,
}

impl ShutdownHandlerKind {
    /// Builds the handler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<ShutdownHandler, ShutdownHandlerSetupError> {
        match self {
            Self::Standard => ShutdownHandler::new(),
            Self::Noop => Ok(ShutdownHandler::noop()),
        }
    }
}

/// Receives shutdown requests for a running batch.
#[derive(Debug)]
pub struct ShutdownHandler {
    signals: Option<imp::Signals>,
}

impl ShutdownHandler {
    #[cfg(any(unix, windows))]
    fn new() -> Result<Self, ShutdownHandlerSetupError> {
        let signals = imp::Signals::new().map_err(ShutdownHandlerSetupError::new)?;
        Ok(Self {
            signals: Some(signals),
        })
    }

    fn noop() -> Self {
        Self { signals: None }
    }

    /// Waits for the next shutdown request.
    ///
    /// Returns `None` once no further requests can arrive.
    pub async fn recv(&mut self) -> Option<ShutdownEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => None,
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    /// Signals for SIGINT, SIGTERM and SIGHUP on Unix.
    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: SignalWithDone,
        sighup: SignalWithDone,
        sigterm: SignalWithDone,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self {
                sigint: SignalWithDone::new(SignalKind::interrupt())?,
                sighup: SignalWithDone::new(SignalKind::hangup())?,
                sigterm: SignalWithDone::new(SignalKind::terminate())?,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            loop {
                tokio::select! {
                    recv = self.sigint.signal.recv(), if !self.sigint.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Interrupt),
                            None => self.sigint.done = true,
                        }
                    }
                    recv = self.sighup.signal.recv(), if !self.sighup.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Hangup),
                            None => self.sighup.done = true,
                        }
                    }
                    recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Term),
                            None => self.sigterm.done = true,
                        }
                    }
                    else => {
                        break None
                    }
                }
            }
        }
    }

    #[derive(Debug)]
    struct SignalWithDone {
        signal: Signal,
        done: bool,
    }

    impl SignalWithDone {
        fn new(kind: SignalKind) -> std::io::Result<Self> {
            let signal = signal(kind)?;
            Ok(Self {
                signal,
                done: false,
            })
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
        ctrl_c_done: bool,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let ctrl_c = ctrl_c()?;
            Ok(Self {
                ctrl_c,
                ctrl_c_done: false,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            if self.ctrl_c_done {
                return None;
            }

            match self.ctrl_c.recv().await {
                Some(()) => Some(ShutdownEvent::Interrupt),
                None => {
                    self.ctrl_c_done = true;
                    None
                }
            }
        }
    }
}

/// A signal that asks the batch to stop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGHUP.
    #[cfg(unix)]
    Hangup,
    /// SIGTERM.
    #[cfg(unix)]
    Term,
    /// SIGINT, or Ctrl-C on Windows.
    Interrupt,
}

impl ShutdownEvent {
    /// A short name for the signal, for log messages.
    pub fn name(self) -> &'static str {
        match self {
            #[cfg(unix)]
            Self::Hangup => "SIGHUP",
            #[cfg(unix)]
            Self::Term => "SIGTERM",
            Self::Interrupt => "interrupt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_handler_never_fires() {
        let mut handler = ShutdownHandlerKind::Noop.build().expect("noop handler builds");
        assert_eq!(handler.recv().await, None);
    }
}
