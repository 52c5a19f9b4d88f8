use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use studyforge_ai::{
    ExerciseSet, LessonContent, PlannedProgram, ProgramContext, Resource, Schedule,
};
use studyforge_core::{ProgramId, UserId};

use super::store::ProgramStoreError;

/// A program as stored: the plan it was built from plus every committed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub id: ProgramId,
    pub user_id: UserId,
    pub title: String,
    pub summary: String,
    pub context: ProgramContext,
    pub plan: PlannedProgram,
    pub modules: Vec<ProgramModule>,
    pub schedule: Option<Schedule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramModule {
    pub index: u32,
    pub title: String,
    pub objective: String,
    pub lessons: Vec<ProgramLesson>,
    pub exercises: Option<ExerciseSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramLesson {
    pub index: u32,
    pub title: String,
    pub body: String,
    pub notes: Vec<String>,
    pub resources: Option<Vec<Resource>>,
}

impl ProgramLesson {
    pub fn content(&self) -> LessonContent {
        LessonContent {
            title: self.title.clone(),
            body: self.body.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// One committed unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramUnit {
    /// Creates (or replaces) the program shell. Replacing keeps committed modules.
    Plan {
        user_id: UserId,
        context: ProgramContext,
        plan: PlannedProgram,
    },
    Module {
        module_index: u32,
    },
    Lesson {
        module_index: u32,
        lesson_index: u32,
        content: LessonContent,
    },
    Resources {
        module_index: u32,
        lesson_index: u32,
        resources: Vec<Resource>,
    },
    Exercises {
        module_index: u32,
        exercises: ExerciseSet,
    },
    Schedule(Schedule),
}

impl ProgramUnit {
    pub fn name(&self) -> &'static str {
        match self {
            ProgramUnit::Plan { .. } => "plan",
            ProgramUnit::Module { .. } => "module",
            ProgramUnit::Lesson { .. } => "lesson",
            ProgramUnit::Resources { .. } => "resources",
            ProgramUnit::Exercises { .. } => "exercises",
            ProgramUnit::Schedule(_) => "schedule",
        }
    }
}

impl Program {
    pub fn from_plan(
        id: ProgramId,
        user_id: UserId,
        context: ProgramContext,
        plan: PlannedProgram,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            title: plan.title.clone(),
            summary: plan.summary.clone(),
            context,
            plan,
            modules: Vec::new(),
            schedule: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn module(&self, index: u32) -> Option<&ProgramModule> {
        self.modules.get(index as usize)
    }

    pub fn lesson(&self, module_index: u32, lesson_index: u32) -> Option<&ProgramLesson> {
        self.module(module_index)
            .and_then(|m| m.lessons.get(lesson_index as usize))
    }

    /// Apply a unit in place, overwriting whatever sits at its position.
    pub fn apply(
        &mut self,
        unit: ProgramUnit,
        now: DateTime<Utc>,
    ) -> Result<(), ProgramStoreError> {
        let id = self.id;
        match unit {
            ProgramUnit::Plan { context, plan, .. } => {
                self.title = plan.title.clone();
                self.summary = plan.summary.clone();
                self.context = context;
                self.plan = plan;
            }
            ProgramUnit::Module { module_index } => {
                let planned = self
                    .plan
                    .modules
                    .get(module_index as usize)
                    .ok_or_else(|| {
                        ProgramStoreError::invalid(
                            id,
                            format!("module {module_index} is not planned"),
                        )
                    })?;
                let module = ProgramModule {
                    index: module_index,
                    title: planned.title.clone(),
                    objective: planned.objective.clone(),
                    lessons: Vec::new(),
                    exercises: None,
                };
                let slot = module_index as usize;
                if slot < self.modules.len() {
                    let existing = &mut self.modules[slot];
                    existing.title = module.title;
                    existing.objective = module.objective;
                } else if slot == self.modules.len() {
                    self.modules.push(module);
                } else {
                    return Err(ProgramStoreError::invalid(
                        id,
                        format!(
                            "module {module_index} committed before module {}",
                            self.modules.len()
                        ),
                    ));
                }
            }
            ProgramUnit::Lesson {
                module_index,
                lesson_index,
                content,
            } => {
                let module = self.module_mut(module_index)?;
                let lesson = ProgramLesson {
                    index: lesson_index,
                    title: content.title,
                    body: content.body,
                    notes: content.notes,
                    resources: None,
                };
                let slot = lesson_index as usize;
                if slot < module.lessons.len() {
                    let resources = module.lessons[slot].resources.take();
                    module.lessons[slot] = ProgramLesson { resources, ..lesson };
                } else if slot == module.lessons.len() {
                    module.lessons.push(lesson);
                } else {
                    return Err(ProgramStoreError::invalid(
                        id,
                        format!(
                            "lesson {module_index}.{lesson_index} committed before lesson \
                             {module_index}.{}",
                            module.lessons.len()
                        ),
                    ));
                }
            }
            ProgramUnit::Resources {
                module_index,
                lesson_index,
                resources,
            } => {
                let module = self.module_mut(module_index)?;
                let lesson = module.lessons.get_mut(lesson_index as usize).ok_or_else(|| {
                    ProgramStoreError::invalid(
                        id,
                        format!("lesson {module_index}.{lesson_index} does not exist"),
                    )
                })?;
                lesson.resources = Some(resources);
            }
            ProgramUnit::Exercises {
                module_index,
                exercises,
            } => {
                self.module_mut(module_index)?.exercises = Some(exercises);
            }
            ProgramUnit::Schedule(schedule) => {
                self.schedule = Some(schedule);
            }
        }
        self.updated_at = now;
        Ok(())
    }

    fn module_mut(&mut self, module_index: u32) -> Result<&mut ProgramModule, ProgramStoreError> {
        let id = self.id;
        self.modules
            .get_mut(module_index as usize)
            .ok_or_else(|| {
                ProgramStoreError::invalid(id, format!("module {module_index} does not exist"))
            })
    }
}

/// Read view of a program: only committed units, no plan internals.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSnapshot {
    pub id: Option<ProgramId>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub modules: Vec<ProgramModule>,
    pub schedule: Option<Schedule>,
}

impl ProgramSnapshot {
    /// Shape returned before the plan phase has produced a program.
    pub fn empty() -> Self {
        Self::default()
    }
}

impl From<&Program> for ProgramSnapshot {
    fn from(program: &Program) -> Self {
        Self {
            id: Some(program.id),
            title: Some(program.title.clone()),
            summary: Some(program.summary.clone()),
            modules: program.modules.clone(),
            schedule: program.schedule.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyforge_ai::{GoalLevel, PlannedLesson, PlannedModule};

    fn program() -> Program {
        let plan = PlannedProgram {
            title: "Rust".into(),
            summary: "two modules".into(),
            modules: (0..2)
                .map(|m| PlannedModule {
                    title: format!("M{m}"),
                    objective: "learn".into(),
                    lessons: vec![PlannedLesson {
                        title: format!("L{m}.0"),
                        minutes: 60,
                    }],
                })
                .collect(),
        };
        let context = ProgramContext {
            goal: "Rust".into(),
            level: GoalLevel::Beginner,
            hours_per_day: 1.0,
            weeks: 2,
            language: "en".into(),
        };
        Program::from_plan(ProgramId::new(), UserId::new(), context, plan, Utc::now())
    }

    fn lesson(title: &str) -> LessonContent {
        LessonContent {
            title: title.into(),
            body: "body".into(),
            notes: vec![],
        }
    }

    #[test]
    fn redoing_a_unit_overwrites_in_place() {
        let mut p = program();
        let now = Utc::now();
        p.apply(ProgramUnit::Module { module_index: 0 }, now).unwrap();
        p.apply(ProgramUnit::Module { module_index: 0 }, now).unwrap();
        assert_eq!(p.modules.len(), 1);

        let unit = ProgramUnit::Lesson {
            module_index: 0,
            lesson_index: 0,
            content: lesson("first"),
        };
        p.apply(unit.clone(), now).unwrap();
        p.apply(
            ProgramUnit::Resources {
                module_index: 0,
                lesson_index: 0,
                resources: vec![],
            },
            now,
        )
        .unwrap();
        p.apply(unit, now).unwrap();

        let module = p.module(0).unwrap();
        assert_eq!(module.lessons.len(), 1);
        assert_eq!(module.lessons[0].resources, Some(vec![]));
    }

    #[test]
    fn units_cannot_skip_positions() {
        let mut p = program();
        let now = Utc::now();
        assert!(p.apply(ProgramUnit::Module { module_index: 1 }, now).is_err());
        assert!(p.apply(ProgramUnit::Module { module_index: 7 }, now).is_err());
        assert!(
            p.apply(
                ProgramUnit::Lesson {
                    module_index: 0,
                    lesson_index: 0,
                    content: lesson("orphan"),
                },
                now,
            )
            .is_err()
        );
    }

    #[test]
    fn snapshot_hides_the_plan() {
        let p = program();
        let snapshot = ProgramSnapshot::from(&p);
        assert_eq!(snapshot.id, Some(p.id));
        assert!(snapshot.modules.is_empty());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("plan").is_none());
        assert!(ProgramSnapshot::empty().id.is_none());
    }
}
