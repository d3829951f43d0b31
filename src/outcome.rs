//! Step outcomes shared by the reconciliation components
//!
//! Components never signal "stop here" or "keep the finalizer" through side
//! channels. Each step returns an [`Outcome`] and the controller maps it onto a
//! `kube::runtime::controller::Action` plus finalizer handling.

use std::time::Duration;

use kube::runtime::controller::Action;

/// Requeue interval used when a step keeps a finalizer without a deadline
pub const KEEP_FINALIZER_REQUEUE: Duration = Duration::from_secs(30);

/// Result of one reconciliation step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The step converged; later steps may run
    Continue,
    /// Nothing more to do in this pass (benign wait or already handled)
    Cancel,
    /// Run this pass again after the given delay, keeping any finalizer
    Requeue(Duration),
    /// Deletion is not finished; the finalizer must stay in place
    KeepFinalizer,
}

impl Outcome {
    /// True when later steps of the same pass should run
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    /// True when a deletion finalizer must not be removed yet
    pub fn keeps_finalizer(&self) -> bool {
        matches!(self, Self::KeepFinalizer | Self::Requeue(_))
    }

    /// Controller action for this outcome given the steady-state resync interval
    pub fn into_action(self, resync: Duration) -> Action {
        match self {
            Self::Continue | Self::Cancel => Action::requeue(resync),
            Self::Requeue(after) => Action::requeue(after),
            Self::KeepFinalizer => Action::requeue(KEEP_FINALIZER_REQUEUE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::cont(Outcome::Continue, true, false)]
    #[case::cancel(Outcome::Cancel, false, false)]
    #[case::requeue(Outcome::Requeue(Duration::from_secs(1)), false, true)]
    #[case::keep(Outcome::KeepFinalizer, false, true)]
    fn outcome_flags(#[case] outcome: Outcome, #[case] cont: bool, #[case] keep: bool) {
        assert_eq!(outcome.should_continue(), cont);
        assert_eq!(outcome.keeps_finalizer(), keep);
    }

    #[test]
    fn actions_respect_requeue_delays() {
        let resync = Duration::from_secs(60);
        assert_eq!(
            Outcome::Continue.into_action(resync),
            Action::requeue(resync)
        );
        assert_eq!(
            Outcome::Requeue(Duration::from_secs(2)).into_action(resync),
            Action::requeue(Duration::from_secs(2))
        );
        assert_eq!(
            Outcome::KeepFinalizer.into_action(resync),
            Action::requeue(KEEP_FINALIZER_REQUEUE)
        );
    }
}
