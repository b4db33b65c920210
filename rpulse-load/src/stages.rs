//! Ramping stage profile for virtual users.
//!
//! The profile starts at zero virtual users. Within each stage the target moves linearly from the
//! previous stage's target to this stage's target; a zero-length stage jumps straight to its
//! target. Once the last stage has elapsed the schedule is over.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    /// How long the ramp towards `target` takes
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Number of concurrent virtual users at the end of the stage
    pub target: u32,
}

impl Stage {
    pub const fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone)]
pub struct LoadProfile {
    stages: Vec<Stage>,
}

impl LoadProfile {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// Highest number of virtual users the profile ever asks for.
    pub fn max_target(&self) -> u32 {
        self.stages.iter().map(|stage| stage.target).max().unwrap_or(0)
    }

    /// Target number of virtual users `elapsed` into the run, or `None` once the schedule is over.
    pub fn target_at(&self, elapsed: Duration) -> Option<u32> {
        let mut from = 0u32;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let from_f = f64::from(from);
                let target = from_f + (f64::from(stage.target) - from_f) * progress;
                return Some(target.round() as u32);
            }
            from = stage.target;
            stage_start = stage_end;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_profile() -> LoadProfile {
        LoadProfile::new(vec![
            Stage::new(Duration::from_secs(30), 15),
            Stage::new(Duration::from_secs(200), 15),
            Stage::new(Duration::from_secs(20), 0),
        ])
    }

    #[test]
    fn test_total_duration_and_max_target() {
        let profile = reference_profile();
        assert_eq!(profile.total_duration(), Duration::from_secs(250));
        assert_eq!(profile.max_target(), 15);
        assert_eq!(profile.stages().len(), 3);
    }

    #[test]
    fn test_ramp_up_interpolates_from_zero() {
        let profile = reference_profile();
        assert_eq!(profile.target_at(Duration::ZERO), Some(0));
        assert_eq!(profile.target_at(Duration::from_secs(2)), Some(1));
        assert_eq!(profile.target_at(Duration::from_secs(10)), Some(5));
        assert_eq!(profile.target_at(Duration::from_secs(20)), Some(10));
        assert_eq!(profile.target_at(Duration::from_millis(29_999)), Some(15));
    }

    #[test]
    fn test_hold_and_ramp_down() {
        let profile = reference_profile();
        assert_eq!(profile.target_at(Duration::from_secs(30)), Some(15));
        assert_eq!(profile.target_at(Duration::from_secs(150)), Some(15));
        assert_eq!(profile.target_at(Duration::from_secs(230)), Some(15));
        assert_eq!(profile.target_at(Duration::from_secs(234)), Some(12));
        assert_eq!(profile.target_at(Duration::from_secs(246)), Some(3));
    }

    #[test]
    fn test_schedule_ends_after_last_stage() {
        let profile = reference_profile();
        assert_eq!(profile.target_at(Duration::from_secs(250)), None);
        assert_eq!(profile.target_at(Duration::from_secs(3600)), None);
    }

    #[test]
    fn test_zero_length_stage_jumps_to_target() {
        let profile = LoadProfile::new(vec![Stage::new(Duration::ZERO, 8), Stage::new(Duration::from_secs(10), 8)]);
        assert_eq!(profile.target_at(Duration::ZERO), Some(8));
        assert_eq!(profile.target_at(Duration::from_secs(5)), Some(8));
    }

    #[test]
    fn test_stage_deserializes_humantime_durations() {
        let stages: Vec<Stage> = serde_json::from_str(r#"[{"duration":"1m 30s","target":4}]"#).unwrap();
        assert_eq!(stages, vec![Stage::new(Duration::from_secs(90), 4)]);
    }
}
