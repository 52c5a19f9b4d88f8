use serde::{Deserialize, Serialize};

/// Fixed phase sequence of a program build.
///
/// Variant order is execution order; `PartialOrd` relies on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Plan,
    Modules,
    Lessons,
    Resources,
    Assessments,
    Schedule,
    Done,
}

impl BuildPhase {
    /// Phases that do work, in order (excludes `Done`).
    pub const WORK: [BuildPhase; 6] = [
        BuildPhase::Plan,
        BuildPhase::Modules,
        BuildPhase::Lessons,
        BuildPhase::Resources,
        BuildPhase::Assessments,
        BuildPhase::Schedule,
    ];

    pub fn next(self) -> BuildPhase {
        match self {
            BuildPhase::Plan => BuildPhase::Modules,
            BuildPhase::Modules => BuildPhase::Lessons,
            BuildPhase::Lessons => BuildPhase::Resources,
            BuildPhase::Resources => BuildPhase::Assessments,
            BuildPhase::Assessments => BuildPhase::Schedule,
            BuildPhase::Schedule | BuildPhase::Done => BuildPhase::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::Plan => "plan",
            BuildPhase::Modules => "modules",
            BuildPhase::Lessons => "lessons",
            BuildPhase::Resources => "resources",
            BuildPhase::Assessments => "assessments",
            BuildPhase::Schedule => "schedule",
            BuildPhase::Done => "done",
        }
    }

    /// Human label used as the event `step`.
    pub fn label(self) -> &'static str {
        match self {
            BuildPhase::Plan => "Planning curriculum",
            BuildPhase::Modules => "Creating modules",
            BuildPhase::Lessons => "Writing lessons",
            BuildPhase::Resources => "Curating resources",
            BuildPhase::Assessments => "Preparing assessments",
            BuildPhase::Schedule => "Building schedule",
            BuildPhase::Done => "Done",
        }
    }

    pub fn parse(s: &str) -> Option<BuildPhase> {
        match s {
            "plan" => Some(BuildPhase::Plan),
            "modules" => Some(BuildPhase::Modules),
            "lessons" => Some(BuildPhase::Lessons),
            "resources" => Some(BuildPhase::Resources),
            "assessments" => Some(BuildPhase::Assessments),
            "schedule" => Some(BuildPhase::Schedule),
            "done" => Some(BuildPhase::Done),
            _ => None,
        }
    }
}

impl core::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
