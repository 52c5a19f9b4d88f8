//! Resume marker for a build.
//!
//! Every phase is a deterministic sequence of units (one plan, one unit per
//! module, one per lesson plus a closing unit per module, ...). A checkpoint
//! records how many units of the current phase are committed, so a resumed run
//! skips exactly those.

use serde::{Deserialize, Serialize};

use studyforge_core::ProgramId;

use crate::phase::BuildPhase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Last phase that finished entirely.
    pub completed_phase: Option<BuildPhase>,
    /// Phase a resumed run continues in.
    pub phase: BuildPhase,
    /// Units of `phase` already committed.
    pub step: u32,
    /// Module of the last committed unit.
    pub module_index: Option<u32>,
    /// Lesson of the last committed unit.
    pub lesson_index: Option<u32>,
    pub program_id: Option<ProgramId>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::initial()
    }
}

impl Checkpoint {
    /// Nothing committed yet: start at the plan phase.
    pub fn initial() -> Self {
        Self {
            completed_phase: None,
            phase: BuildPhase::Plan,
            step: 0,
            module_index: None,
            lesson_index: None,
            program_id: None,
        }
    }

    /// Whether unit `step` (0-based) of `phase` was already committed.
    pub fn unit_done(&self, phase: BuildPhase, step: u32) -> bool {
        if phase < self.phase {
            true
        } else if phase > self.phase {
            false
        } else {
            step < self.step
        }
    }

    /// Whether every unit of `phase` is committed.
    pub fn phase_done(&self, phase: BuildPhase) -> bool {
        self.completed_phase.is_some_and(|done| phase <= done)
    }

    /// Checkpoint after committing unit `step` of `phase`.
    pub fn after_unit(
        &self,
        phase: BuildPhase,
        step: u32,
        module_index: Option<u32>,
        lesson_index: Option<u32>,
    ) -> Self {
        Self {
            completed_phase: self.completed_phase,
            phase,
            step: step + 1,
            module_index,
            lesson_index,
            program_id: self.program_id,
        }
    }

    /// Checkpoint after the last unit of `phase`.
    pub fn after_phase(&self, phase: BuildPhase) -> Self {
        Self {
            completed_phase: Some(phase),
            phase: phase.next(),
            step: 0,
            module_index: None,
            lesson_index: None,
            program_id: self.program_id,
        }
    }

    pub fn with_program(mut self, program_id: ProgramId) -> Self {
        self.program_id = Some(program_id);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.phase == BuildPhase::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_checkpoint_has_nothing_done() {
        let cp = Checkpoint::initial();
        assert!(!cp.unit_done(BuildPhase::Plan, 0));
        assert!(!cp.phase_done(BuildPhase::Plan));
        assert!(!cp.is_finished());
    }

    #[test]
    fn unit_progress_is_tracked_within_the_phase() {
        let cp = Checkpoint::initial()
            .after_phase(BuildPhase::Plan)
            .after_phase(BuildPhase::Modules)
            .after_unit(BuildPhase::Lessons, 2, Some(1), Some(0));

        assert_eq!(cp.step, 3);
        assert!(cp.unit_done(BuildPhase::Modules, 40));
        assert!(cp.unit_done(BuildPhase::Lessons, 2));
        assert!(!cp.unit_done(BuildPhase::Lessons, 3));
        assert!(!cp.unit_done(BuildPhase::Resources, 0));
        assert!(cp.phase_done(BuildPhase::Modules));
        assert!(!cp.phase_done(BuildPhase::Lessons));
    }

    #[test]
    fn finishing_a_phase_resets_the_unit_cursor() {
        let program_id = ProgramId::new();
        let cp = Checkpoint::initial()
            .with_program(program_id)
            .after_unit(BuildPhase::Schedule, 0, None, None)
            .after_phase(BuildPhase::Schedule);

        assert!(cp.is_finished());
        assert_eq!(cp.step, 0);
        assert_eq!(cp.program_id, Some(program_id));
    }
}
