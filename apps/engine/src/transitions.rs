use crate::errors::InvalidTransition;
use crate::types::{ProposalStatus, ResolutionState, TransitionContext};
use anyhow::Result;

/// The resolution lifecycle as a static table. `settled` is terminal: it
/// appears in no source list. `evidence_gathering` and `monitoring` are
/// holding states whose exits are driven by external subsystems.
pub fn allowed_previous_states(next: ResolutionState) -> Result<&'static [ResolutionState]> {
    use ResolutionState::*;
    match next {
        Detecting => Ok(&[Created]),
        EvidenceGathering => Ok(&[Created, Detecting]),
        Proposing => Ok(&[Detecting]),
        Liveness => Ok(&[Proposing, Disputed, Arbitration]),
        Disputed => Ok(&[Liveness]),
        Monitoring => Ok(&[Liveness]),
        Arbitration => Ok(&[Disputed]),
        Resolved => Ok(&[Liveness, Arbitration]),
        Settled => Ok(&[Resolved]),
        Created => anyhow::bail!("no transition enters state: created"),
    }
}

pub fn transition_allowed(from: ResolutionState, to: ResolutionState) -> bool {
    allowed_previous_states(to)
        .map(|expected| expected.contains(&from))
        .unwrap_or(false)
}

pub fn check(from: ResolutionState, to: ResolutionState) -> Result<()> {
    if transition_allowed(from, to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to }.into())
    }
}

pub type Guard = fn(&TransitionContext) -> bool;

/// Pure guard hooks attached to edges. Actions (the side-effecting half)
/// live in the orchestrator so they can suspend on I/O.
pub fn edge_guard(from: ResolutionState, to: ResolutionState) -> Option<Guard> {
    use ResolutionState::*;
    match (from, to) {
        (Liveness, Resolved) | (Arbitration, Resolved) => Some(guard_finalization),
        (Resolved, Settled) => Some(guard_not_settled),
        _ => None,
    }
}

/// The finalization gate: the proposal is still in its liveness window
/// state, the window has strictly elapsed, and nobody disputed.
pub fn finalization_eligible(
    status: ProposalStatus,
    now: i64,
    liveness_expiry: i64,
    open_disputes: u64,
) -> bool {
    status == ProposalStatus::Liveness && now > liveness_expiry && open_disputes == 0
}

fn guard_finalization(ctx: &TransitionContext) -> bool {
    match ctx.proposal() {
        // An already-finalized proposal re-enters RESOLVED during replay and
        // indexer repair; a live one must pass the full gate.
        Some(p) => {
            p.status == ProposalStatus::Finalized
                || finalization_eligible(p.status, ctx.now, p.liveness_expiry, ctx.open_disputes)
        }
        None => false,
    }
}

fn guard_not_settled(ctx: &TransitionContext) -> bool {
    !ctx.event().settled
}
