//! # Operations
//!
//! Purpose: Carry one request through the writer queue, the reader queue and
//! back to the waiting caller.
//!
//! ## Design Principles
//! 1. **Move, Don't Share**: The `Operation` value owns the sending half of a
//!    oneshot channel and is moved from queue to queue, so it can only be
//!    resolved once.
//! 2. **Drop Means Canceled**: An operation dropped by a torn-down connection
//!    resolves its caller with `ClientError::Canceled`.
//! 3. **Caller Cancellation Is Local**: Abandoning a wait never pulls the
//!    operation out of the pipeline; the reader still consumes its response.

use memmeta_common::{ClientError, Command, Outcome};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A request bundled with its single-resolution result slot.
#[derive(Debug)]
pub struct Operation {
    command: Command,
    tx: oneshot::Sender<Outcome>,
}

/// The caller's side of an [`Operation`].
#[derive(Debug)]
pub struct Pending {
    rx: oneshot::Receiver<Outcome>,
}

impl Operation {
    /// Creates an operation and the handle its caller awaits.
    pub fn new(command: Command) -> (Operation, Pending) {
        let (tx, rx) = oneshot::channel();
        (Operation { command, tx }, Pending { rx })
    }

    /// Returns the command this operation carries.
    #[inline]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Resolves the operation.
    ///
    /// A caller that stopped waiting is not an error; the outcome is dropped.
    pub fn complete(self, outcome: Outcome) {
        let _ = self.tx.send(outcome);
    }

    /// Resolves the operation as canceled.
    pub fn cancel(self) {
        self.complete(Err(ClientError::Canceled));
    }

    /// Returns true once the caller has stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Pending {
    /// Waits for the outcome or for `cancel` to fire.
    ///
    /// A connection that drops the operation without resolving it reads as
    /// `ClientError::Canceled`.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Outcome {
        tokio::select! {
            biased;
            outcome = &mut self.rx => outcome.unwrap_or(Err(ClientError::Canceled)),
            _ = cancel.cancelled() => Err(ClientError::Canceled),
        }
    }
}
