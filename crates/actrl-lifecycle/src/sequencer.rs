//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Bookkeeping for multi-step transition sequences."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::state::ActivityState;
use crate::transition::Transition;

/// What the caller should do after feeding an observed state to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Nothing to do.
    Idle,
    /// Attempt this transition next.
    Attempt(Transition),
    /// The last step reached its outcome; the sequence is gone.
    Completed,
    /// A failure state was observed; the sequence is gone.
    Abandoned(ActivityState),
}

#[derive(Debug, Default)]
struct Sequence {
    pending: VecDeque<Transition>,
    in_flight: Option<Transition>,
}

/// At most one active transition sequence per activity.
///
/// The sequencer never runs operations itself. Callers feed it observed
/// states and perform whatever [`Advance::Attempt`] it hands back.
#[derive(Debug, Default)]
pub struct TransitionSequencer {
    sequences: Mutex<HashMap<String, Sequence>>,
}

impl TransitionSequencer {
    /// Empty sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `steps` for `uuid`, replacing any active sequence.
    pub fn register(&self, uuid: &str, steps: Vec<Transition>) {
        let sequence = Sequence {
            pending: steps.into_iter().collect(),
            in_flight: None,
        };
        let steps = sequence.pending.len();
        if self
            .sequences
            .lock()
            .insert(uuid.to_owned(), sequence)
            .is_some()
        {
            debug!(activity = %uuid, "replaced active transition sequence");
        }
        debug!(activity = %uuid, steps, "registered transition sequence");
    }

    /// Feed an observed state for `uuid`.
    pub fn advance(&self, uuid: &str, observed: ActivityState) -> Advance {
        let mut sequences = self.sequences.lock();
        let Some(sequence) = sequences.get_mut(uuid) else {
            return Advance::Idle;
        };

        let in_flight = sequence.in_flight;
        match in_flight {
            Some(step) if observed == step.expected_outcome() => {
                match sequence.pending.pop_front() {
                    Some(next) => {
                        sequence.in_flight = Some(next);
                        debug!(activity = %uuid, completed = %step, %next, "transition sequence advanced");
                        Advance::Attempt(next)
                    }
                    None => {
                        sequences.remove(uuid);
                        info!(activity = %uuid, state = %observed, "transition sequence completed");
                        Advance::Completed
                    }
                }
            }
            Some(step) if observed.is_failure() => {
                sequences.remove(uuid);
                warn!(activity = %uuid, step = %step, state = %observed, "transition sequence abandoned");
                Advance::Abandoned(observed)
            }
            Some(_) => Advance::Idle,
            None => match sequence.pending.pop_front() {
                Some(first) => {
                    sequence.in_flight = Some(first);
                    Advance::Attempt(first)
                }
                None => {
                    sequences.remove(uuid);
                    Advance::Completed
                }
            },
        }
    }

    /// Drop the sequence for `uuid`. Returns whether one was active.
    pub fn abandon(&self, uuid: &str) -> bool {
        self.sequences.lock().remove(uuid).is_some()
    }

    /// Drop every sequence.
    pub fn clear(&self) {
        self.sequences.lock().clear();
    }

    /// Whether `uuid` has an active sequence.
    pub fn is_active(&self, uuid: &str) -> bool {
        self.sequences.lock().contains_key(uuid)
    }

    /// Steps not yet attempted for `uuid`.
    pub fn pending(&self, uuid: &str) -> Vec<Transition> {
        self.sequences
            .lock()
            .get(uuid)
            .map(|sequence| sequence.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of active sequences.
    pub fn len(&self) -> usize {
        self.sequences.lock().len()
    }

    /// Whether no sequence is active.
    pub fn is_empty(&self) -> bool {
        self.sequences.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActivityState as S;

    fn startup_then_activate(sequencer: &TransitionSequencer) {
        sequencer.register("u1", vec![Transition::Startup, Transition::Activate]);
    }

    #[test]
    fn sequence_completes_through_attempt_states() {
        let sequencer = TransitionSequencer::new();
        startup_then_activate(&sequencer);

        assert_eq!(sequencer.advance("u1", S::Ready), Advance::Attempt(Transition::Startup));
        assert_eq!(sequencer.advance("u1", S::StartupAttempt), Advance::Idle);
        assert_eq!(
            sequencer.advance("u1", S::Running),
            Advance::Attempt(Transition::Activate)
        );
        assert_eq!(sequencer.advance("u1", S::ActivateAttempt), Advance::Idle);
        assert_eq!(sequencer.advance("u1", S::Active), Advance::Completed);
        assert!(sequencer.is_empty());
        assert_eq!(sequencer.advance("u1", S::Active), Advance::Idle);
    }

    #[test]
    fn failure_abandons_without_attempting_remaining_steps() {
        let sequencer = TransitionSequencer::new();
        startup_then_activate(&sequencer);

        assert_eq!(sequencer.advance("u1", S::Ready), Advance::Attempt(Transition::Startup));
        assert_eq!(sequencer.advance("u1", S::StartupAttempt), Advance::Idle);
        assert_eq!(
            sequencer.advance("u1", S::StartupFailure),
            Advance::Abandoned(S::StartupFailure)
        );
        assert!(!sequencer.is_active("u1"));
        assert_eq!(sequencer.advance("u1", S::Running), Advance::Idle);
    }

    #[test]
    fn registering_replaces_previous_sequence() {
        let sequencer = TransitionSequencer::new();
        startup_then_activate(&sequencer);
        sequencer.advance("u1", S::Ready);

        sequencer.register("u1", vec![Transition::Shutdown]);
        assert_eq!(sequencer.pending("u1"), vec![Transition::Shutdown]);
        assert_eq!(
            sequencer.advance("u1", S::Active),
            Advance::Attempt(Transition::Shutdown)
        );
        assert_eq!(sequencer.advance("u1", S::Ready), Advance::Completed);
    }

    #[test]
    fn sequences_are_independent_per_activity() {
        let sequencer = TransitionSequencer::new();
        startup_then_activate(&sequencer);
        sequencer.register("u2", vec![Transition::Startup]);
        sequencer.advance("u1", S::Ready);
        sequencer.advance("u2", S::Ready);

        assert_eq!(
            sequencer.advance("u2", S::StartupFailure),
            Advance::Abandoned(S::StartupFailure)
        );
        assert!(sequencer.is_active("u1"));
        assert_eq!(sequencer.pending("u1"), vec![Transition::Activate]);
        assert!(sequencer.abandon("u1"));
        assert_eq!(sequencer.len(), 0);
    }
}
