use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::image::{BoundingBox, Codec, OutputFormat, Planner, RetryPolicy};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_width: u32,
    pub max_height: u32,
    // Byte budget for a single decoded or rotated image, None = whatever the allocator gives
    pub max_alloc: Option<u64>,
    // None retries non-memory faults forever
    pub fault_retry_limit: Option<u32>,
    pub output: OutputFormat,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_width: 1080,
            max_height: 1920,
            max_alloc: Some(256 * 1024 * 1024),
            fault_retry_limit: Some(3),
            output: OutputFormat::default(),
        }
    }
}

impl PlannerConfig {
    pub fn load() -> Option<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Option<Self> {
        fs::read_to_string(path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
    }

    pub fn save(&self) -> Option<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Option<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok()?;
        }

        serde_json::to_string_pretty(self)
            .ok()
            .and_then(|json| fs::write(path, json).ok())
    }

    pub fn config_path() -> Option<PathBuf> {
        let home = std::env::home_dir()?;
        Some(home.join(".config").join("imgplan").join("config.json"))
    }

    pub fn bounds(&self) -> Result<BoundingBox> {
        BoundingBox::new(self.max_width, self.max_height)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            fault_retry_limit: self.fault_retry_limit,
        }
    }

    pub fn codec(&self) -> Codec {
        Codec {
            max_alloc: self.max_alloc,
        }
    }

    pub fn planner(&self) -> Planner {
        Planner::new(self.codec(), Default::default()).with_policy(self.retry_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PngCompression;

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = PlannerConfig {
            max_width: 640,
            max_height: 480,
            max_alloc: None,
            fault_retry_limit: None,
            output: OutputFormat::Jpeg { quality: 70 },
        };
        config.save_to(&path).unwrap();

        assert_eq!(PlannerConfig::load_from(&path), Some(config));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: PlannerConfig = serde_json::from_str(r#"{ "max_width": 100 }"#).unwrap();
        assert_eq!(config.max_width, 100);
        assert_eq!(config.max_height, 1920);
        assert_eq!(
            config.output,
            OutputFormat::Png {
                compression: PngCompression::Default
            }
        );
    }

    #[test]
    fn unreadable_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PlannerConfig::load_from(&dir.path().join("absent.json")), None);

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "not json").unwrap();
        assert_eq!(PlannerConfig::load_from(&garbage), None);
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let config = PlannerConfig {
            max_width: 0,
            ..Default::default()
        };
        assert!(config.bounds().is_err());
    }
}
