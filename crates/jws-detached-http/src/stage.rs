//! Orchestrator state machine
//!
//! ```text
//! Idle ─▶ RequestBuffering ─▶ Verifying ─┬▶ VerifiedOk ─▶ HandlerRunning
//!  │                                     └▶ VerificationFailed
//!  └──────────────────────────────────────────────────▶ HandlerRunning
//!
//! HandlerRunning ─▶ ResponseBuffering ─▶ Signing ─▶ Done
//!        └───────────────────────────────────────▶ Done
//! ```
//!
//! `Faulted` is reachable from every non-terminal stage.

use std::fmt;

use jws_detached::JwsDetachedError;

/// Where a request is in the verify / handle / sign sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Nothing happened yet
    Idle,
    /// Request body made replayable
    RequestBuffering,
    /// Request body streaming through the verifier
    Verifying,
    /// Signature valid, body rewound
    VerifiedOk,
    /// Request rejected; the handler never runs
    VerificationFailed,
    /// Handler invoked
    HandlerRunning,
    /// Response body being captured
    ResponseBuffering,
    /// Captured response streaming through the signer
    Signing,
    /// Finished normally
    Done,
    /// Buffer limit or unexpected I/O failure
    Faulted,
}

impl Stage {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::VerificationFailed | Self::Done | Self::Faulted)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;

        if next == Faulted {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Idle, RequestBuffering | HandlerRunning)
                | (RequestBuffering, Verifying)
                | (Verifying, VerifiedOk | VerificationFailed)
                | (VerifiedOk, HandlerRunning)
                | (HandlerRunning, ResponseBuffering | Done)
                | (ResponseBuffering, Signing)
                | (Signing, Done)
        )
    }

    /// Stage name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestBuffering => "request_buffering",
            Self::Verifying => "verifying",
            Self::VerifiedOk => "verified_ok",
            Self::VerificationFailed => "verification_failed",
            Self::HandlerRunning => "handler_running",
            Self::ResponseBuffering => "response_buffering",
            Self::Signing => "signing",
            Self::Done => "done",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current stage of one request
#[derive(Debug, Clone)]
pub struct StageTracker {
    stage: Stage,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    /// Tracker in [`Stage::Idle`]
    pub fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `next`; illegal transitions are refused and reported
    pub fn advance(&mut self, next: Stage) -> bool {
        if !self.stage.can_transition_to(next) {
            tracing::warn!(from = %self.stage, to = %next, "Illegal stage transition");
            return false;
        }
        tracing::trace!(from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
        true
    }

    /// Leave the current stage because of `err`.
    ///
    /// Peer-caused rejections during verification end in
    /// [`Stage::VerificationFailed`]; everything else faults.
    pub fn fail(&mut self, err: &JwsDetachedError) {
        let next = if self.stage == Stage::Verifying && err.is_verification_failure() {
            Stage::VerificationFailed
        } else {
            Stage::Faulted
        };
        if !self.stage.is_terminal() {
            self.advance(next);
        }
    }
}
