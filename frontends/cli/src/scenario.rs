use anyhow::Result;
use ranksync_api::{SortDirection, SortKey, Track};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// A scripted playlist session
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_playlist")]
    pub playlist: String,
    #[serde(default)]
    pub tracks: Vec<ScenarioTrack>,
    pub steps: Vec<Step>,
}

fn default_playlist() -> String {
    "playlist".to_string()
}

/// Initial or remotely inserted track; a missing id gets a generated one
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioTrack {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub track: Track,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Local drag to a 0-based index
    Move { id: String, index: usize },
    /// Local delete
    Delete(String),
    RemoteInsert {
        #[serde(flatten)]
        track: ScenarioTrack,
        index: usize,
    },
    RemoteMove { id: String, index: usize },
    RemoteDelete(String),
    /// Make the next backend write fail with a transient error
    FailNextWrite(String),
    /// Make the next backend write fail with a conflict
    ConflictNextWrite(String),
    Sort {
        key: SortKey,
        #[serde(default)]
        direction: SortDirection,
    },
    Search(String),
    Resync,
    Print,
}

impl Scenario {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read scenario file {}: {}", path.display(), e)
        })?;

        let scenario: Scenario = serde_yaml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse scenario YAML {}: {}", path.display(), e)
        })?;

        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let yaml = r#"
playlist: road-trip
tracks:
  - id: t1
    title: Heroes
    artist: David Bowie
    release_date: 1977-09-23
  - title: Blue Monday
steps:
  - print
  - move: { id: t1, index: 1 }
  - delete: t1
  - remote_insert: { title: Low, index: 0 }
  - fail_next_write: offline
  - sort: { key: release_date, direction: descending }
  - search: bowie
"#;
        let scenario: Scenario = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scenario.playlist, "road-trip");
        assert_eq!(scenario.tracks.len(), 2);
        assert_eq!(scenario.tracks[0].id.as_deref(), Some("t1"));
        assert!(scenario.tracks[1].id.is_none());
        assert_eq!(scenario.steps.len(), 7);
        assert!(matches!(scenario.steps[0], Step::Print));
        assert!(matches!(
            &scenario.steps[3],
            Step::RemoteInsert { track, index: 0 } if track.track.title == "Low"
        ));
        assert!(matches!(
            scenario.steps[5],
            Step::Sort {
                key: SortKey::ReleaseDate,
                direction: SortDirection::Descending
            }
        ));
    }
}
