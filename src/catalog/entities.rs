//! Domain entities mirrored from a Subsonic origin.

/// A mirrored Subsonic server; one row per configured origin.
#[derive(Clone, Debug, PartialEq)]
pub struct Database {
    pub id: i64,
    pub persistent_id: i64,
    pub name: String,
    pub exclude: bool,
    pub checksum: u32,
    pub remote_id: Option<i64>,
}

impl Database {
    pub fn canonical_checksum_fields(name: &str, remote_id: Option<i64>) -> Vec<String> {
        vec![
            name.to_string(),
            remote_id.map(|v| v.to_string()).unwrap_or_default(),
        ]
    }
}

/// An artist; either mirrored from a remote `artistId` or synthesized from a
/// song's free-text `artist` field when the origin did not supply one.
#[derive(Clone, Debug, PartialEq)]
pub struct Artist {
    pub id: i64,
    pub database_id: i64,
    pub name: String,
    pub exclude: bool,
    pub checksum: u32,
    /// `None` only for synthetic artists, keyed by `(database_id, name)`.
    pub remote_id: Option<i64>,
}

impl Artist {
    pub fn is_synthetic(&self) -> bool {
        self.remote_id.is_none()
    }

    pub fn canonical_checksum_fields(name: &str, remote_id: Option<i64>) -> Vec<String> {
        vec![
            name.to_string(),
            remote_id.map(|v| v.to_string()).unwrap_or_default(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Album {
    pub id: i64,
    pub database_id: i64,
    pub artist_id: i64,
    pub name: String,
    pub art: bool,
    pub checksum: u32,
    pub remote_id: i64,
}

impl Album {
    pub fn canonical_checksum_fields(name: &str, art: bool, remote_id: i64) -> Vec<String> {
        vec![name.to_string(), art.to_string(), remote_id.to_string()]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: i64,
    pub persistent_id: i64,
    pub database_id: i64,
    pub artist_id: Option<i64>,
    pub album_artist_id: Option<i64>,
    pub album_id: Option<i64>,
    pub name: String,
    pub genre: Option<String>,
    pub year: Option<i64>,
    pub track: Option<i64>,
    pub duration: i64,
    pub bitrate: Option<i64>,
    pub file_name: String,
    pub file_type: String,
    pub file_suffix: String,
    pub file_size: i64,
    pub exclude: bool,
    pub cache: bool,
    pub checksum: u32,
    pub remote_id: i64,
}

/// Best-effort MIME type inferred from a file suffix; shared by `Item::mime_type`
/// and the synchronizer's `file_type` column population.
pub fn mime_type_for_suffix(suffix: &str) -> &'static str {
    match suffix.to_ascii_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "m4a" | "aac" => "audio/mp4",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

impl Item {
    /// Best-effort MIME type inferred from the file suffix; used when the
    /// Provider serves a cached (non-transcoded) entry.
    pub fn mime_type(&self) -> &'static str {
        mime_type_for_suffix(&self.file_suffix)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn canonical_checksum_fields(
        name: &str,
        genre: Option<&str>,
        year: Option<i64>,
        track: Option<i64>,
        duration: i64,
        bitrate: Option<i64>,
        file_name: &str,
        file_size: i64,
        remote_id: i64,
    ) -> Vec<String> {
        vec![
            name.to_string(),
            genre.unwrap_or_default().to_string(),
            year.map(|v| v.to_string()).unwrap_or_default(),
            track.map(|v| v.to_string()).unwrap_or_default(),
            duration.to_string(),
            bitrate.map(|v| v.to_string()).unwrap_or_default(),
            file_name.to_string(),
            file_size.to_string(),
            remote_id.to_string(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Container {
    pub id: i64,
    pub persistent_id: i64,
    pub database_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub is_base: bool,
    pub is_smart: bool,
    pub exclude: bool,
    pub cache: bool,
    pub checksum: u32,
    /// `None` for the synthetic base container.
    pub remote_id: Option<i64>,
}

impl Container {
    pub fn canonical_base_checksum_fields(name: &str) -> Vec<String> {
        vec!["1".to_string(), "0".to_string(), name.to_string()]
    }

    pub fn canonical_checksum_fields(name: &str, changed: Option<&str>) -> Vec<String> {
        vec![name.to_string(), changed.unwrap_or_default().to_string()]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContainerItem {
    pub id: i64,
    pub database_id: i64,
    pub container_id: i64,
    pub item_id: i64,
    pub order: Option<i64>,
}

/// A stable 64-bit identifier assigned once at row creation and never
/// mutated afterward. Truncates `uuid::Uuid::new_v4` to its high 64 bits
/// and clears the sign bit, keeping the value representable in SQLite's
/// signed `INTEGER` columns without colliding with a prior id across
/// restarts.
pub fn generate_persistent_id() -> i64 {
    let (high, _low) = uuid::Uuid::new_v4().as_u64_pair();
    (high & 0x7FFF_FFFF_FFFF_FFFF) as i64
}
