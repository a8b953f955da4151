//! ## Farm Pool Status Reporting
//!
//! Background components report failures through a channel as a [`Status`],
//! tagged with a [`Sender`] so the main loop knows where it came from and can
//! decide whether to keep running.

use crate::error::FarmPoolError;

/// Each sending side of the status channel is wrapped with this enum so the
/// main loop knows which component sent the message.
#[derive(Debug, Clone)]
pub enum Sender {
    BlockMonitor(async_channel::Sender<Status>),
    HarvestScheduler(async_channel::Sender<Status>),
    ExitOrchestrator(async_channel::Sender<Status>),
}

impl Sender {
    pub async fn send(&self, status: Status) -> Result<(), async_channel::SendError<Status>> {
        match self {
            Self::BlockMonitor(inner) => inner.send(status).await,
            Self::HarvestScheduler(inner) => inner.send(status).await,
            Self::ExitOrchestrator(inner) => inner.send(status).await,
        }
    }
}

#[derive(Debug)]
pub enum State {
    /// The block monitor stopped and no more blocks will be discovered.
    BlockMonitorShutdown(FarmPoolError),
    /// A read or write against the ledger failed.
    LedgerUnavailable(FarmPoolError),
    /// Recoverable condition, reported for visibility only.
    Healthy(String),
}

/// Status message sent to the main status loop.
#[derive(Debug)]
pub struct Status {
    pub state: State,
}

/// Whether the reporting component keeps going after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorBranch {
    Break,
    Continue,
}

async fn send_status(sender: &Sender, state: State, outcome: ErrorBranch) -> ErrorBranch {
    sender.send(Status { state }).await.unwrap_or(());
    outcome
}

/// Reports `e` on the status channel and tells the caller whether to stop.
pub async fn handle_error(sender: &Sender, e: FarmPoolError) -> ErrorBranch {
    tracing::debug!("Error: {:?}", &e);
    match (sender, e) {
        (_, e @ FarmPoolError::Ledger(_)) => {
            send_status(sender, State::LedgerUnavailable(e), ErrorBranch::Continue).await
        }
        (Sender::BlockMonitor(_), FarmPoolError::Rpc(e)) => {
            send_status(
                sender,
                State::Healthy(format!("Chain node unreachable: {e}")),
                ErrorBranch::Continue,
            )
            .await
        }
        (Sender::BlockMonitor(_), e) => {
            send_status(sender, State::BlockMonitorShutdown(e), ErrorBranch::Break).await
        }
        (_, e) => send_status(sender, State::Healthy(e.to_string()), ErrorBranch::Continue).await,
    }
}
