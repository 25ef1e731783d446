//! Response DTOs for the handful of Subsonic REST endpoints the bridge
//! consumes (`getIndexes`, `getMusicDirectory`, `getArtist`, `getPlaylists`,
//! `getPlaylist`), plus the normalized `RemoteSong` leaf the synchronizer
//! actually reads.

use serde::Deserialize;

use super::serde_helpers::{single_or_seq, tolerant_id, tolerant_id_opt};

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "subsonic-response")]
    pub subsonic_response: ResponseBody,
}

#[derive(Debug, Deserialize)]
pub struct ResponseBody {
    pub status: String,
    #[serde(default)]
    pub error: Option<ErrorBody>,
    #[serde(flatten)]
    pub rest: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct IndexesResponse {
    pub indexes: IndexesBody,
}

#[derive(Debug, Deserialize)]
pub struct IndexesBody {
    #[serde(rename = "lastModified", default)]
    pub last_modified: Option<String>,
    #[serde(default, deserialize_with = "single_or_seq")]
    pub index: Vec<IndexGroup>,
    #[serde(default, deserialize_with = "single_or_seq")]
    pub child: Vec<RemoteChild>,
}

#[derive(Debug, Deserialize)]
pub struct IndexGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "single_or_seq")]
    pub artist: Vec<IndexArtist>,
}

#[derive(Debug, Deserialize)]
pub struct IndexArtist {
    #[serde(deserialize_with = "tolerant_id")]
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectoryResponse {
    pub directory: DirectoryBody,
}

#[derive(Debug, Deserialize)]
pub struct DirectoryBody {
    #[serde(deserialize_with = "tolerant_id")]
    pub id: u64,
    #[serde(default, deserialize_with = "single_or_seq")]
    pub child: Vec<RemoteChild>,
}

#[derive(Debug, Deserialize)]
pub struct ArtistResponse {
    pub artist: ArtistBody,
}

#[derive(Debug, Deserialize)]
pub struct ArtistBody {
    #[serde(deserialize_with = "tolerant_id")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "single_or_seq")]
    pub album: Vec<RemoteAlbum>,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistsResponse {
    pub playlists: PlaylistsBody,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistsBody {
    #[serde(default, deserialize_with = "single_or_seq")]
    pub playlist: Vec<RemotePlaylist>,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistResponse {
    pub playlist: PlaylistBody,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistBody {
    #[serde(deserialize_with = "tolerant_id")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "single_or_seq")]
    pub entry: Vec<RemotePlaylistEntry>,
}

/// A `getArtist` album summary, enough to key and checksum an album row
/// without walking its contents.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAlbum {
    #[serde(deserialize_with = "tolerant_id")]
    pub id: u64,
    pub name: String,
    #[serde(rename = "artistId", default, deserialize_with = "tolerant_id_opt")]
    pub artist_id: Option<u64>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(rename = "coverArt", default)]
    pub cover_art: Option<String>,
}

/// A raw `<child>` entry as returned by `getIndexes`/`getMusicDirectory`,
/// either a subdirectory (`is_dir = true`) or a leaf song.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteChild {
    #[serde(deserialize_with = "tolerant_id")]
    pub id: u64,
    #[serde(rename = "isDir", default)]
    pub is_dir: Option<bool>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(rename = "artistId", default, deserialize_with = "tolerant_id_opt")]
    pub artist_id: Option<u64>,
    #[serde(rename = "albumId", default, deserialize_with = "tolerant_id_opt")]
    pub album_id: Option<u64>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub track: Option<i64>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(rename = "bitRate", default)]
    pub bit_rate: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
    #[serde(rename = "coverArt", default)]
    pub cover_art: Option<String>,
}

impl RemoteChild {
    /// Normalizes a leaf `child` into the song shape the synchronizer reads,
    /// filling in the handful of fields Subsonic may omit for untagged files.
    pub fn into_song(self) -> RemoteSong {
        RemoteSong {
            id: self.id,
            title: self.title.unwrap_or_default(),
            album: self.album,
            artist: self.artist,
            artist_id: self.artist_id,
            album_id: self.album_id,
            genre: self.genre,
            year: self.year,
            track: self.track,
            duration: self.duration.unwrap_or(0),
            bit_rate: self.bit_rate,
            size: self.size.unwrap_or(0),
            suffix: self.suffix.unwrap_or_default(),
            path: self.path.unwrap_or_default(),
            content_type: self.content_type,
            cover_art: self.cover_art,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePlaylist {
    #[serde(deserialize_with = "tolerant_id")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Server-reported last-modified stamp; the cheap per-playlist checksum
    /// input used for the containers-version probe.
    #[serde(default)]
    pub changed: Option<String>,
}

/// A `getPlaylist` entry. `order` is not part of the wire payload; it's
/// injected by `Client::walk_playlist` as each entry is enumerated.
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePlaylistEntry {
    #[serde(flatten)]
    pub song: RemoteChild,
    #[serde(default, skip_deserializing)]
    pub order: i64,
}

impl RemotePlaylistEntry {
    pub fn into_song(self) -> (RemoteSong, i64) {
        (self.song.into_song(), self.order)
    }
}

/// The normalized leaf song the synchronizer actually reads, common across
/// `getIndexes`, `getMusicDirectory`, and playlist entries.
#[derive(Debug, Clone)]
pub struct RemoteSong {
    pub id: u64,
    pub title: String,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub artist_id: Option<u64>,
    pub album_id: Option<u64>,
    pub genre: Option<String>,
    pub year: Option<i64>,
    pub track: Option<i64>,
    /// Seconds, as reported by Subsonic.
    pub duration: i64,
    pub bit_rate: Option<i64>,
    pub size: i64,
    pub suffix: String,
    pub path: String,
    pub content_type: Option<String>,
    pub cover_art: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_group_parses_single_and_array_artist() {
        let json = r#"{"name": "A", "artist": {"id": 1, "name": "Artist"}}"#;
        let group: IndexGroup = serde_json::from_str(json).unwrap();
        assert_eq!(group.artist.len(), 1);
        assert_eq!(group.artist[0].id, 1);
    }

    #[test]
    fn remote_child_into_song_fills_defaults() {
        let json = r#"{"id": "7", "title": "Track"}"#;
        let child: RemoteChild = serde_json::from_str(json).unwrap();
        let song = child.into_song();
        assert_eq!(song.id, 7);
        assert_eq!(song.title, "Track");
        assert_eq!(song.duration, 0);
        assert_eq!(song.suffix, "");
    }

    #[test]
    fn playlist_entry_flattens_song_fields() {
        let json = r#"{"id": 3, "title": "Entry"}"#;
        let entry: RemotePlaylistEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.song.id, 3);
        assert_eq!(entry.order, 0);
    }
}
