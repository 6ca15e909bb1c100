use uuid::Uuid;

use crate::handles::ResourceHandle;

/// Lifecycle of one render slot. A slot is only ever driven forward:
/// `NotAttempted -> Pending -> Succeeded | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    NotAttempted,
    Pending,
    Succeeded(ResourceHandle),
    Failed,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAttempted => "not_attempted",
            Self::Pending => "pending",
            Self::Succeeded(_) => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        match self {
            Self::Succeeded(handle) => Some(*handle),
            _ => None,
        }
    }
}

/// Result of asking the pipeline for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { slots: usize },
    FailedAt { slot: usize },
    AlreadyRunning,
}

/// One generation run: a fixed number of slots filled strictly in order.
///
/// `begin_slot` refuses to start a slot unless every earlier slot already
/// succeeded, which is how the fail-fast contract is enforced rather than
/// merely observed. Earlier successes survive a later failure.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    job_id: String,
    slots: Vec<SlotState>,
}

impl GenerationJob {
    pub fn new(slot_count: usize) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            slots: vec![SlotState::NotAttempted; slot_count],
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[SlotState] {
        &self.slots
    }

    pub fn slot(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).copied()
    }

    pub fn begin_slot(&mut self, slot: usize) -> bool {
        if !matches!(self.slots.get(slot), Some(SlotState::NotAttempted)) {
            return false;
        }
        let earlier_succeeded = self.slots[..slot]
            .iter()
            .all(|state| matches!(state, SlotState::Succeeded(_)));
        if !earlier_succeeded {
            return false;
        }
        self.slots[slot] = SlotState::Pending;
        true
    }

    pub fn succeed_slot(&mut self, slot: usize, handle: ResourceHandle) -> bool {
        if !matches!(self.slots.get(slot), Some(SlotState::Pending)) {
            return false;
        }
        self.slots[slot] = SlotState::Succeeded(handle);
        true
    }

    pub fn fail_slot(&mut self, slot: usize) -> bool {
        if !matches!(self.slots.get(slot), Some(SlotState::Pending)) {
            return false;
        }
        self.slots[slot] = SlotState::Failed;
        true
    }

    pub fn first_failure(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|state| matches!(state, SlotState::Failed))
    }

    pub fn succeeded_handles(&self) -> Vec<ResourceHandle> {
        self.slots.iter().filter_map(SlotState::handle).collect()
    }

    pub fn is_terminal(&self) -> bool {
        if self
            .slots
            .iter()
            .any(|state| matches!(state, SlotState::Pending))
        {
            return false;
        }
        self.first_failure().is_some()
            || self
                .slots
                .iter()
                .all(|state| matches!(state, SlotState::Succeeded(_)))
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        if let Some(slot) = self.first_failure() {
            return Some(RunOutcome::FailedAt { slot });
        }
        if self
            .slots
            .iter()
            .all(|state| matches!(state, SlotState::Succeeded(_)))
        {
            return Some(RunOutcome::Completed {
                slots: self.slots.len(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::handles::{HandleOrigin, HandleRegistry, ResourceHandle};

    use super::{GenerationJob, RunOutcome, SlotState};

    fn handles(count: usize) -> Vec<ResourceHandle> {
        let mut registry = HandleRegistry::new();
        (0..count)
            .map(|_| registry.create(vec![0], HandleOrigin::ResultArtifact))
            .collect()
    }

    #[test]
    fn fresh_job_is_untouched() {
        let job = GenerationJob::new(3);
        assert_eq!(job.slot_count(), 3);
        assert!(job
            .slots()
            .iter()
            .all(|state| *state == SlotState::NotAttempted));
        assert!(!job.is_terminal());
        assert_eq!(job.outcome(), None);
        assert!(!job.job_id().is_empty());
    }

    #[test]
    fn full_run_completes_in_order() {
        let artifacts = handles(3);
        let mut job = GenerationJob::new(3);

        for (slot, handle) in artifacts.iter().enumerate() {
            assert!(job.begin_slot(slot));
            assert!(job.succeed_slot(slot, *handle));
        }

        assert!(job.is_terminal());
        assert_eq!(job.outcome(), Some(RunOutcome::Completed { slots: 3 }));
        assert_eq!(job.succeeded_handles(), artifacts);
    }

    #[test]
    fn failure_keeps_earlier_successes_and_blocks_later_slots() {
        let artifacts = handles(1);
        let mut job = GenerationJob::new(3);

        assert!(job.begin_slot(0));
        assert!(job.succeed_slot(0, artifacts[0]));
        assert!(job.begin_slot(1));
        assert!(job.fail_slot(1));

        assert_eq!(job.first_failure(), Some(1));
        assert!(job.is_terminal());
        assert_eq!(job.outcome(), Some(RunOutcome::FailedAt { slot: 1 }));
        assert_eq!(job.slot(2), Some(SlotState::NotAttempted));
        assert_eq!(job.succeeded_handles(), artifacts);

        // Fail-fast: the run is over, slot 2 cannot start.
        assert!(!job.begin_slot(2));
    }

    #[test]
    fn slots_cannot_start_out_of_order() {
        let mut job = GenerationJob::new(3);
        assert!(!job.begin_slot(1));
        assert!(job.begin_slot(0));
        assert!(!job.begin_slot(1));
    }

    #[test]
    fn transitions_require_a_pending_slot() {
        let artifacts = handles(1);
        let mut job = GenerationJob::new(2);

        assert!(!job.succeed_slot(0, artifacts[0]));
        assert!(!job.fail_slot(0));
        assert!(job.begin_slot(0));
        assert!(!job.begin_slot(0));
        assert!(job.succeed_slot(0, artifacts[0]));
        assert!(!job.fail_slot(0));
    }

    #[test]
    fn out_of_range_slots_are_rejected() {
        let mut job = GenerationJob::new(2);
        assert!(!job.begin_slot(5));
        assert_eq!(job.slot(5), None);
    }
}
