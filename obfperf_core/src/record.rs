use crate::variant::StageFailure;
use serde::Serialize;
use std::fmt;

/// Numeric quantities measured per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    WallSeconds,
    ReportedWallSeconds,
    UserSeconds,
    SystemSeconds,
    MaxRssKb,
    MajorFaults,
    MinorFaults,
    PageFaults,
    VoluntarySwitches,
    InvoluntarySwitches,
}

impl Metric {
    pub const ALL: [Metric; 10] = [
        Metric::WallSeconds,
        Metric::ReportedWallSeconds,
        Metric::UserSeconds,
        Metric::SystemSeconds,
        Metric::MaxRssKb,
        Metric::MajorFaults,
        Metric::MinorFaults,
        Metric::PageFaults,
        Metric::VoluntarySwitches,
        Metric::InvoluntarySwitches,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::WallSeconds => "wall-seconds",
            Metric::ReportedWallSeconds => "reported-wall-seconds",
            Metric::UserSeconds => "user-seconds",
            Metric::SystemSeconds => "system-seconds",
            Metric::MaxRssKb => "max-rss-kb",
            Metric::MajorFaults => "major-faults",
            Metric::MinorFaults => "minor-faults",
            Metric::PageFaults => "page-faults",
            Metric::VoluntarySwitches => "voluntary-switches",
            Metric::InvoluntarySwitches => "involuntary-switches",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resource usage of one clean execution.
///
/// `wall_seconds` is timed on the host around the wrapper. Everything else,
/// including `reported_wall_seconds`, comes from the wrapper report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Measurements {
    pub wall_seconds: f64,
    pub reported_wall_seconds: f64,
    pub user_seconds: f64,
    pub system_seconds: f64,
    pub max_rss_kb: u64,
    pub major_faults: u64,
    pub minor_faults: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
}

impl Measurements {
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::WallSeconds => self.wall_seconds,
            Metric::ReportedWallSeconds => self.reported_wall_seconds,
            Metric::UserSeconds => self.user_seconds,
            Metric::SystemSeconds => self.system_seconds,
            Metric::MaxRssKb => self.max_rss_kb as f64,
            Metric::MajorFaults => self.major_faults as f64,
            Metric::MinorFaults => self.minor_faults as f64,
            Metric::PageFaults => (self.major_faults + self.minor_faults) as f64,
            Metric::VoluntarySwitches => self.voluntary_switches as f64,
            Metric::InvoluntarySwitches => self.involuntary_switches as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum RunOutcome {
    Measured { measurements: Measurements },
    Failed { reason: StageFailure },
}

/// One measured (non-warm-up) execution. `index` is 1-based within the series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub index: u32,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl RunRecord {
    pub fn measured(index: u32, measurements: Measurements) -> Self {
        Self {
            index,
            outcome: RunOutcome::Measured { measurements },
        }
    }

    pub fn failed(index: u32, reason: StageFailure) -> Self {
        Self {
            index,
            outcome: RunOutcome::Failed { reason },
        }
    }

    pub fn measurements(&self) -> Option<&Measurements> {
        match &self.outcome {
            RunOutcome::Measured { measurements } => Some(measurements),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RunOutcome::Failed { .. })
    }
}
