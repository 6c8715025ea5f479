//! Cancellation signal shared by a run controller and the engine
//!
//! Resolves the race between a cancel request and the controller committing a
//! natural terminal status: whichever moves the phase away from `Running`
//! first wins, and the loser observes the winner.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    CancelRequested,
    Committed,
}

/// Answer to a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    Accepted,
    AlreadyTerminal,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    phase: Arc<watch::Sender<Phase>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Phase::Running);
        Self { phase: Arc::new(tx) }
    }

    /// Requests cancellation; repeated requests are accepted
    pub fn request(&self) -> CancelRequest {
        let mut answer = CancelRequest::Accepted;
        self.phase.send_if_modified(|phase| match *phase {
            Phase::Running => {
                *phase = Phase::CancelRequested;
                true
            }
            Phase::CancelRequested => false,
            Phase::Committed => {
                answer = CancelRequest::AlreadyTerminal;
                false
            }
        });
        answer
    }

    /// Commits a natural terminal status
    ///
    /// Returns false when a cancel request got there first; the caller must
    /// then take the cancellation path instead.
    pub fn commit(&self) -> bool {
        let mut committed = false;
        self.phase.send_if_modified(|phase| match *phase {
            Phase::Running => {
                *phase = Phase::Committed;
                committed = true;
                true
            }
            Phase::CancelRequested => false,
            Phase::Committed => {
                committed = true;
                false
            }
        });
        committed
    }

    /// Marks a cancelled run as finished so later requests see it as terminal
    pub fn seal(&self) {
        self.phase.send_replace(Phase::Committed);
    }

    /// Resolves once cancellation has been requested, never if the run commits
    pub async fn requested(&self) {
        let mut rx = self.phase.subscribe();
        let closed = rx
            .wait_for(|phase| *phase == Phase::CancelRequested)
            .await
            .is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
