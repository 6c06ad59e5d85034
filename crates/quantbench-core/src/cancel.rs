//! Run-wide cancellation scope with two-stage confirmation. The console
//! layer owns the interrupt prompt; this controller only tracks confirmed
//! state and fans it out through a `CancellationToken` that every remote
//! call derives its deadline from.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStage {
    Running,
    /// First confirmed interrupt: stop work, save partial state, exit 2.
    Confirmed,
    /// Second confirmed interrupt: force-save-then-exit.
    Force,
}

#[derive(Clone)]
pub struct CancelController {
    token: CancellationToken,
    stage: Arc<AtomicU8>,
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            stage: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stage(&self) -> CancelStage {
        match self.stage.load(Ordering::SeqCst) {
            0 => CancelStage::Running,
            1 => CancelStage::Confirmed,
            _ => CancelStage::Force,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.stage() != CancelStage::Running
    }

    pub fn is_force(&self) -> bool {
        self.stage() == CancelStage::Force
    }

    /// Record a confirmed interrupt and return the stage it advanced to.
    pub fn confirm(&self) -> CancelStage {
        let prev = self
            .stage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                Some(s.saturating_add(1).min(2))
            })
            .unwrap_or(2);
        self.token.cancel();
        match prev {
            0 => CancelStage::Confirmed,
            _ => CancelStage::Force,
        }
    }
}
