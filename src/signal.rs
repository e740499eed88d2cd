//! Shutdown signals for the command-line interface.
//!
//! * Unix: Ctrl-C (SIGINT) and SIGTERM
//! * Windows: Ctrl-C only
//!
//! The binary turns the first signal into cancellation of all in-flight
//! acquisitions, so that running tools are killed and scratch files removed
//! before the process exits.
//!
//! # Example
//!
//! ```no_run
//! use songbot::signal::Handler;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example(cancel: CancellationToken) {
//!     let mut signals = Handler::new().unwrap();
//!     let signal = signals.recv().await;
//!     eprintln!("{signal} received, cancelling");
//!     cancel.cancel();
//! }
//! ```

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signal that requested the shutdown.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[expect(clippy::module_name_repetitions)]
pub enum ShutdownSignal {
    /// Interrupt signal (Ctrl-C/SIGINT)
    Interrupt,
    /// Termination signal (SIGTERM)
    Terminate,
}

pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
}

impl Handler {
    /// Registers the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns error if signal handlers cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next shutdown signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                _ = self.sigterm.recv() => ShutdownSignal::Terminate,
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            ShutdownSignal::Interrupt
        }
    }

    /// Cancels `cancel` when the first signal arrives.
    ///
    /// Returns once either a signal was received or `cancel` was cancelled
    /// elsewhere.
    pub async fn cancel_on_signal(mut self, cancel: CancellationToken) {
        tokio::select! {
            signal = self.recv() => {
                warn!("{signal} received, cancelling");
                cancel.cancel();
            }
            () = cancel.cancelled() => {}
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "Ctrl+C"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}
