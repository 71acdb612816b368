//! Playlist track payload

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::sort::{SearchFields, SortFields, SortKey, SortValue};

/// A track entry of a shared playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl Track {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: None,
            album: None,
            release_date: None,
            duration_ms: None,
        }
    }

    pub fn by(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn on_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    pub fn released(mut self, date: NaiveDate) -> Self {
        self.release_date = Some(date);
        self
    }

    pub fn lasting(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

impl SortFields for Track {
    fn sort_value(&self, key: SortKey) -> Option<SortValue> {
        match key {
            SortKey::Title => Some(SortValue::text(&self.title)),
            SortKey::Artist => self.artist.as_deref().map(SortValue::text),
            SortKey::Album => self.album.as_deref().map(SortValue::text),
            SortKey::ReleaseDate => self.release_date.map(SortValue::Date),
            SortKey::Duration => self
                .duration_ms
                .map(|ms| SortValue::Number(i64::try_from(ms).unwrap_or(i64::MAX))),
            // Item-level keys, not read from the payload
            SortKey::Rank | SortKey::DateAdded => None,
        }
    }
}

impl SearchFields for Track {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.title.as_str()];
        fields.extend(self.artist.as_deref());
        fields.extend(self.album.as_deref());
        fields
    }
}
