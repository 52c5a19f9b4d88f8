use serde::{Deserialize, Serialize};

use studyforge_core::{DomainError, DomainResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalLevel {
    Beginner,
    Intermediate,
    Advanced,
}

/// What the learner asked for. Persisted with the job so a resumed build
/// never has to ask again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerProfile {
    pub goal: String,
    pub level: GoalLevel,
    pub hours_per_day: f32,
    pub weeks: u32,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl LearnerProfile {
    pub fn validate(&self) -> DomainResult<()> {
        if self.goal.trim().is_empty() {
            return Err(DomainError::validation("goal must not be empty"));
        }
        if !(1..=52).contains(&self.weeks) {
            return Err(DomainError::validation("weeks must be between 1 and 52"));
        }
        if !(0.25..=12.0).contains(&self.hours_per_day) {
            return Err(DomainError::validation(
                "hoursPerDay must be between 0.25 and 12",
            ));
        }
        if self.language.trim().is_empty() {
            return Err(DomainError::validation("language must not be empty"));
        }
        Ok(())
    }
}

/// Generation constraints for one program, fixed at plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramContext {
    pub goal: String,
    pub level: GoalLevel,
    pub hours_per_day: f32,
    pub weeks: u32,
    /// Language every generated text must be written in.
    pub language: String,
}

impl From<&LearnerProfile> for ProgramContext {
    fn from(profile: &LearnerProfile) -> Self {
        Self {
            goal: profile.goal.trim().to_string(),
            level: profile.level,
            hours_per_day: profile.hours_per_day,
            weeks: profile.weeks,
            language: profile.language.clone(),
        }
    }
}

impl ProgramContext {
    /// Lessons that fit into one week at the requested pace (one hour each).
    pub fn lessons_per_week(&self) -> u32 {
        let hours = (self.hours_per_day * 5.0).floor() as u32;
        hours.clamp(1, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> LearnerProfile {
        LearnerProfile {
            goal: "Learn Rust".into(),
            level: GoalLevel::Beginner,
            hours_per_day: 1.0,
            weeks: 4,
            language: "en".into(),
        }
    }

    #[test]
    fn valid_profile_passes() {
        assert!(profile().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut p = profile();
        p.weeks = 0;
        assert!(p.validate().is_err());

        let mut p = profile();
        p.hours_per_day = 20.0;
        assert!(p.validate().is_err());

        let mut p = profile();
        p.goal = "   ".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn profile_language_defaults_to_english() {
        let p: LearnerProfile = serde_json::from_value(serde_json::json!({
            "goal": "Rust",
            "level": "advanced",
            "hoursPerDay": 2.0,
            "weeks": 6
        }))
        .unwrap();
        assert_eq!(p.language, "en");
        assert_eq!(ProgramContext::from(&p).lessons_per_week(), 10);
    }
}
