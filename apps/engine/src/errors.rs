use crate::types::ResolutionState;

/// A requested state change that is not an edge of the transition table.
/// Never retried: retrying cannot make an illegal edge legal.
#[derive(Debug, thiserror::Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ResolutionState,
    pub to: ResolutionState,
}

/// An edge guard evaluated false. The state has legitimately moved under us
/// (e.g. a dispute landed), so the scheduler must not retry.
#[derive(Debug, thiserror::Error)]
#[error("guard failed: {0}")]
pub struct GuardFailed(pub String);

/// A timing race: the world has not caught up yet (liveness not expired,
/// record not visible). The job retry budget absorbs these.
#[derive(Debug, thiserror::Error)]
#[error("precondition not met: {0}")]
pub struct PreconditionNotMet(pub String);

/// A chain write that will never succeed as submitted (revert, insufficient
/// bond). Surfaced for operator intervention.
#[derive(Debug, thiserror::Error)]
#[error("permanent chain failure: {0}")]
pub struct PermanentChainError(pub String);

/// Retry classification for failed jobs. Anything not explicitly marked
/// non-retriable is assumed transient (RPC hiccups, peer HTTP failures).
pub fn retriable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<InvalidTransition>().is_none()
        && err.downcast_ref::<GuardFailed>().is_none()
        && err.downcast_ref::<PermanentChainError>().is_none()
}

#[cfg(test)]
mod tests {
    use super::{GuardFailed, InvalidTransition, PermanentChainError, PreconditionNotMet, retriable};
    use crate::types::ResolutionState;
    use anyhow::Context;

    fn failing(err: impl std::error::Error + Send + Sync + 'static) -> anyhow::Error {
        anyhow::Error::from(err).context("while processing job")
    }

    #[test]
    fn invalid_transition_and_guard_failures_are_not_retriable() {
        assert!(!retriable(&failing(InvalidTransition {
            from: ResolutionState::Resolved,
            to: ResolutionState::Disputed,
        })));
        assert!(!retriable(&failing(GuardFailed("dispute open".into()))));
        assert!(!retriable(&failing(PermanentChainError("execution reverted".into()))));
    }

    #[test]
    fn races_and_plain_failures_are_retriable() {
        assert!(retriable(&failing(PreconditionNotMet(
            "liveness not expired".into()
        ))));
        assert!(retriable(
            &anyhow::anyhow!("connection reset by peer").context("GET /proposals")
        ));
    }
}
