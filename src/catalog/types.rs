//! Catalog record types.
//!
//! Field names follow the catalog's JSON so responses deserialize directly;
//! the same shapes are what the record sink persists.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimpleArtist {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Followers {
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullArtist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub popularity: u32,
    #[serde(default)]
    pub followers: Followers,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimpleAlbum {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub album_type: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub total_tracks: u32,
}

/// Track as listed inside an album.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimpleTrack {
    /// Empty for local files, which cannot be looked up.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<SimpleArtist>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullTrack {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub popularity: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub track_number: u32,
    #[serde(default)]
    pub disc_number: u32,
    #[serde(default)]
    pub artists: Vec<SimpleArtist>,
    #[serde(default)]
    pub album: SimpleAlbum,
    #[serde(default)]
    pub external_ids: HashMap<String, String>,
    #[serde(default)]
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub id: String,
    pub acousticness: f32,
    pub danceability: f32,
    pub energy: f32,
    pub instrumentalness: f32,
    pub liveness: f32,
    pub loudness: f32,
    pub speechiness: f32,
    pub tempo: f32,
    pub valence: f32,
    #[serde(default)]
    pub key: i32,
    #[serde(default)]
    pub mode: i32,
    #[serde(default)]
    pub time_signature: i32,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Everything persisted for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track: FullTrack,
    /// Some tracks have no audio analysis.
    pub features: Option<AudioFeatures>,
    /// Full profiles of the track's artists, in credit order.
    pub artists: Vec<FullArtist>,
    pub fetched_at: DateTime<Utc>,
}

impl TrackRecord {
    pub fn new(track: FullTrack, features: Option<AudioFeatures>, artists: Vec<FullArtist>) -> Self {
        Self {
            track,
            features,
            artists,
            fetched_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.track.id
    }

    /// Ids of the credited artists, in credit order.
    pub fn artist_ids(&self) -> impl Iterator<Item = &str> {
        self.track
            .artists
            .iter()
            .map(|a| a.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Paging<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub total: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_track_from_catalog_json() {
        let json = r#"{
            "id": "0VjIjW4GlUZAMYd2vXMi3b",
            "name": "Blinding Lights",
            "popularity": 91,
            "duration_ms": 200040,
            "explicit": false,
            "track_number": 9,
            "disc_number": 1,
            "artists": [{"id": "1Xyo4u8uXC1ZmMpatF05PJ", "name": "The Weeknd", "type": "artist"}],
            "album": {"id": "4yP0hdKOZPNshxUOjY0cZj", "name": "After Hours", "album_type": "album", "release_date": "2020-03-20", "total_tracks": 14},
            "external_ids": {"isrc": "USUG11904206"},
            "preview_url": null,
            "is_local": false
        }"#;

        let track: FullTrack = serde_json::from_str(json).expect("track should parse");
        assert_eq!(track.id, "0VjIjW4GlUZAMYd2vXMi3b");
        assert_eq!(track.popularity, 91);
        assert_eq!(track.artists.len(), 1);
        assert_eq!(track.album.release_date, "2020-03-20");
        assert_eq!(track.external_ids.get("isrc").map(String::as_str), Some("USUG11904206"));
        assert!(track.preview_url.is_none());
    }

    #[test]
    fn test_paging_without_next() {
        let json = r#"{"items": [{"id": "a", "name": "A"}], "next": null, "total": 1, "limit": 50}"#;
        let page: Paging<SimpleTrack> = serde_json::from_str(json).expect("page should parse");
        assert_eq!(page.items.len(), 1);
        assert!(page.next.is_none());
    }

    #[test]
    fn test_record_artist_ids_skip_local() {
        let track = FullTrack {
            id: "t1".to_string(),
            name: "Track".to_string(),
            artists: vec![
                SimpleArtist {
                    id: "a1".to_string(),
                    name: "One".to_string(),
                },
                SimpleArtist {
                    id: String::new(),
                    name: "Local".to_string(),
                },
            ],
            ..Default::default()
        };
        let record = TrackRecord::new(track, None, Vec::new());

        assert_eq!(record.id(), "t1");
        assert_eq!(record.artist_ids().collect::<Vec<_>>(), vec!["a1"]);
    }
}
