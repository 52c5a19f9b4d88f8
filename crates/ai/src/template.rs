use async_trait::async_trait;

use crate::content::{
    ExerciseSet, LessonContent, LessonRef, PlannedLesson, PlannedModule, PlannedProgram, Question,
    Resource, Schedule, ScheduleWeek,
};
use crate::context::{GoalLevel, ProgramContext};
use crate::generator::{Grader, LessonWriter, PlanGenerator, ResourceCurator, SchedulePlanner};
use crate::result::{GenerationError, GenerationResult};

/// Deterministic generator backing every collaborator.
///
/// Same context in, same program out. Used by the dev server and tests.
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    max_modules: u32,
    max_lessons_per_module: u32,
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self {
            max_modules: 8,
            max_lessons_per_module: 6,
        }
    }
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_modules: u32, max_lessons_per_module: u32) -> Self {
        Self {
            max_modules: max_modules.max(1),
            max_lessons_per_module: max_lessons_per_module.max(1),
        }
    }

    fn shape(&self, ctx: &ProgramContext) -> (u32, u32) {
        let modules = ctx.weeks.div_ceil(2).clamp(1, self.max_modules);
        let lessons = (ctx.weeks * ctx.lessons_per_week() / modules)
            .clamp(1, self.max_lessons_per_module);
        (modules, lessons)
    }
}

fn level_word(level: GoalLevel) -> &'static str {
    match level {
        GoalLevel::Beginner => "Foundations",
        GoalLevel::Intermediate => "Practice",
        GoalLevel::Advanced => "Mastery",
    }
}

#[async_trait]
impl PlanGenerator for TemplateGenerator {
    async fn plan(&self, ctx: &ProgramContext) -> GenerationResult<PlannedProgram> {
        if ctx.goal.is_empty() {
            return Err(GenerationError::InvalidInput("empty goal".to_string()));
        }

        let (module_count, lesson_count) = self.shape(ctx);
        let modules = (1..=module_count)
            .map(|m| PlannedModule {
                title: format!("{} {}: part {m}", ctx.goal, level_word(ctx.level)),
                objective: format!("Work through part {m} of {}", ctx.goal),
                lessons: (1..=lesson_count)
                    .map(|l| PlannedLesson {
                        title: format!("Lesson {m}.{l}"),
                        minutes: 60,
                    })
                    .collect(),
            })
            .collect();

        Ok(PlannedProgram {
            title: format!("{} in {} weeks", ctx.goal, ctx.weeks),
            summary: format!(
                "{} modules, {} lessons per module, {} h/day",
                module_count, lesson_count, ctx.hours_per_day
            ),
            modules,
        })
    }
}

#[async_trait]
impl LessonWriter for TemplateGenerator {
    async fn write_lesson(
        &self,
        ctx: &ProgramContext,
        module: &PlannedModule,
        lesson: &PlannedLesson,
    ) -> GenerationResult<LessonContent> {
        Ok(LessonContent {
            title: lesson.title.clone(),
            body: format!(
                "[{}] {} ({}): {} minutes of guided study.",
                ctx.language, lesson.title, module.title, lesson.minutes
            ),
            notes: vec![
                format!("Objective: {}", module.objective),
                format!("Review {} before moving on", lesson.title),
            ],
        })
    }
}

#[async_trait]
impl ResourceCurator for TemplateGenerator {
    async fn curate(
        &self,
        _ctx: &ProgramContext,
        lesson: &LessonContent,
    ) -> GenerationResult<Vec<Resource>> {
        let slug: String = lesson
            .title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        Ok(vec![
            Resource {
                title: format!("{} reading", lesson.title),
                url: format!("https://library.example/{slug}"),
                kind: "article".to_string(),
            },
            Resource {
                title: format!("{} walkthrough", lesson.title),
                url: format!("https://video.example/{slug}"),
                kind: "video".to_string(),
            },
        ])
    }
}

#[async_trait]
impl Grader for TemplateGenerator {
    async fn exercises(
        &self,
        _ctx: &ProgramContext,
        module: &PlannedModule,
        lessons: &[LessonContent],
    ) -> GenerationResult<ExerciseSet> {
        if lessons.is_empty() {
            return Err(GenerationError::InvalidInput(format!(
                "module '{}' has no lessons to grade",
                module.title
            )));
        }
        Ok(ExerciseSet {
            title: format!("{} check", module.title),
            questions: lessons
                .iter()
                .map(|lesson| Question {
                    prompt: format!("Summarize {}", lesson.title),
                    answer: lesson.notes.first().cloned().unwrap_or_default(),
                })
                .collect(),
        })
    }
}

#[async_trait]
impl SchedulePlanner for TemplateGenerator {
    async fn schedule(
        &self,
        ctx: &ProgramContext,
        plan: &PlannedProgram,
    ) -> GenerationResult<Schedule> {
        let per_week = ctx.lessons_per_week() as usize;
        let refs: Vec<LessonRef> = plan
            .modules
            .iter()
            .enumerate()
            .flat_map(|(m, module)| {
                (0..module.lessons.len()).map(move |l| LessonRef {
                    module_index: m as u32,
                    lesson_index: l as u32,
                })
            })
            .collect();

        let mut weeks: Vec<ScheduleWeek> = Vec::with_capacity(ctx.weeks as usize);
        for (i, chunk) in refs.chunks(per_week).enumerate() {
            let week = (i as u32 + 1).min(ctx.weeks);
            match weeks.last_mut() {
                Some(last) if last.week == week => last.lessons.extend_from_slice(chunk),
                _ => weeks.push(ScheduleWeek {
                    week,
                    lessons: chunk.to_vec(),
                }),
            }
        }
        Ok(Schedule { weeks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(weeks: u32, hours: f32) -> ProgramContext {
        ProgramContext {
            goal: "Rust".into(),
            level: GoalLevel::Beginner,
            hours_per_day: hours,
            weeks,
            language: "en".into(),
        }
    }

    #[tokio::test]
    async fn plan_is_deterministic() {
        let generator = TemplateGenerator::new();
        let a = generator.plan(&ctx(4, 1.0)).await.unwrap();
        let b = generator.plan(&ctx(4, 1.0)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.modules.len(), 2);
        assert_eq!(a.total_lessons(), 12);
    }

    #[tokio::test]
    async fn limits_bound_the_plan_shape() {
        let generator = TemplateGenerator::with_limits(1, 2);
        let plan = generator.plan(&ctx(12, 3.0)).await.unwrap();
        assert_eq!(plan.modules.len(), 1);
        assert_eq!(plan.total_lessons(), 2);
    }

    #[tokio::test]
    async fn schedule_places_every_lesson_within_the_program_weeks() {
        let generator = TemplateGenerator::new();
        let context = ctx(2, 0.25);
        let plan = generator.plan(&context).await.unwrap();
        let schedule = generator.schedule(&context, &plan).await.unwrap();

        let placed: usize = schedule.weeks.iter().map(|w| w.lessons.len()).sum();
        assert_eq!(placed as u32, plan.total_lessons());
        assert!(schedule.weeks.iter().all(|w| w.week >= 1 && w.week <= 2));
    }

    #[tokio::test]
    async fn grading_needs_lessons() {
        let generator = TemplateGenerator::new();
        let plan = generator.plan(&ctx(1, 1.0)).await.unwrap();
        let err = generator.exercises(&ctx(1, 1.0), &plan.modules[0], &[]).await;
        assert!(matches!(err, Err(GenerationError::InvalidInput(_))));
    }
}
