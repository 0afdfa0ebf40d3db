//! Execution guards wrapped around the handler
//!
//! A guard decides, before the handler runs, whether the message may execute
//! at all, and gets the last word on routing once the outcome is known. The
//! consumer applies its default routing (dead-letter on failure) unless the
//! guard reports the outcome as [`Disposition::Handled`].

use crate::error::{ConsumerError, JobError, ParseError};
use crate::lifecycle::JobContext;
use async_trait::async_trait;
use strum::AsRefStr;

/// Why a parsed message was acknowledged without running
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    /// The job already completed
    Complete,
    /// Another worker holds the job lock
    Locked,
}

/// Verdict of [`ExecutionGuard::check_and_prepare`]
#[derive(Debug)]
pub enum Decision {
    Proceed,
    Skip(SkipReason),
    /// Treat the message as unparseable (logged and dead-lettered)
    Unparseable(ParseError),
}

/// What happened to one parsed message
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    Failed(JobError),
    Skipped(SkipReason),
    Unparsed(ParseError),
}

/// Who routes a finished message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The consumer applies its default routing
    Default,
    /// The guard already routed the message
    Handled,
}

/// Hook pair run around every parsed message.
#[async_trait]
pub trait ExecutionGuard: Send + Sync {
    /// State carried from `check_and_prepare` to `finalize`
    type Ticket: Send;

    async fn check_and_prepare(
        &self,
        ctx: &mut JobContext<'_>,
    ) -> Result<(Decision, Self::Ticket), ConsumerError>;

    /// Runs for every message that passed `check_and_prepare`, whatever the
    /// outcome. Must release anything the ticket holds.
    async fn finalize(
        &self,
        ctx: &mut JobContext<'_>,
        ticket: Self::Ticket,
        outcome: &Outcome,
    ) -> Result<Disposition, ConsumerError>;
}

/// Guard that always runs the handler and never claims routing
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl ExecutionGuard for PassThrough {
    type Ticket = ();

    async fn check_and_prepare(
        &self,
        _ctx: &mut JobContext<'_>,
    ) -> Result<(Decision, ()), ConsumerError> {
        Ok((Decision::Proceed, ()))
    }

    async fn finalize(
        &self,
        _ctx: &mut JobContext<'_>,
        _ticket: (),
        _outcome: &Outcome,
    ) -> Result<Disposition, ConsumerError> {
        Ok(Disposition::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_labels() {
        assert_eq!(SkipReason::Complete.as_ref(), "complete");
        assert_eq!(SkipReason::Locked.as_ref(), "locked");
    }
}
