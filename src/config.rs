//! Loop-closing configuration, loadable from YAML.
//!
//! Every field has a default, so a file only needs the values it changes:
//!
//! ```yaml
//! detector:
//!   cooldown_keyframes: 20
//! sim3:
//!   fix_scale: true
//! ```

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::loop_closing::corrector::CorrectorConfig;
use crate::loop_closing::detector::LoopDetectorConfig;
use crate::loop_closing::loop_closer::ThreadConfig;
use crate::loop_closing::sim3_solver::Sim3SolverConfig;
use crate::matcher::MatcherConfig;
use crate::optimizer::{PoseGraphConfig, Sim3RefineConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoopClosingConfig {
    pub detector: LoopDetectorConfig,
    pub sim3: Sim3SolverConfig,
    pub refine: Sim3RefineConfig,
    pub corrector: CorrectorConfig,
    pub pose_graph: PoseGraphConfig,
    pub matcher: MatcherConfig,
    pub thread: ThreadConfig,
}

impl LoopClosingConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse loop closing config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LoopClosingConfig::default();
        assert_eq!(config.detector.cooldown_keyframes, 10);
        assert_eq!(config.detector.consistency_threshold, 3);
        assert_eq!(config.sim3.min_inliers, 15);
        assert_eq!(config.sim3.min_refined_inliers, 20);
        assert_eq!(config.sim3.max_iterations, 300);
        assert_eq!(config.corrector.pause_timeout_ms, 5000);
        assert_eq!(config.matcher.fuse_radius, 4.0);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = "detector:\n  cooldown_keyframes: 25\nsim3:\n  fix_scale: true\n  seed: 7\n";
        let config = LoopClosingConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.detector.cooldown_keyframes, 25);
        assert_eq!(config.detector.consistency_threshold, 3);
        assert!(config.sim3.fix_scale);
        assert_eq!(config.sim3.seed, 7);
        assert_eq!(config.sim3.probability, 0.98);
        assert_eq!(config.thread.idle_interval_ms, 5);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = LoopClosingConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.sim3.min_total_matches, 20);
    }

    #[test]
    fn test_rejects_wrong_types() {
        assert!(LoopClosingConfig::from_yaml_str("detector:\n  cooldown_keyframes: soon\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("loop_closing_{}.yaml", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "corrector:\n  pause_timeout_ms: 250").unwrap();
        drop(file);

        let config = LoopClosingConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.corrector.pause_timeout_ms, 250);
        std::fs::remove_file(&path).unwrap();

        let err = LoopClosingConfig::from_yaml_file(&path).unwrap_err();
        assert!(format!("{err}").contains("Failed to open"));
    }
}
