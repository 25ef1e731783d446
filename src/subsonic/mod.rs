//! Listing walkers and binary fetchers over a remote Subsonic origin.

pub mod models;
mod serde_helpers;

use std::collections::HashSet;

use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Client as HttpClient;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::config::{OriginConfig, TranscodeMode};
pub use models::{RemoteAlbum, RemoteChild, RemotePlaylist, RemotePlaylistEntry, RemoteSong};

#[derive(Debug, thiserror::Error)]
pub enum SubsonicError {
    #[error("remote origin unavailable: {0}")]
    RemoteUnavailable(#[from] reqwest::Error),

    #[error("unparseable response from remote origin: {0}")]
    RemoteProtocol(String),

    #[error("remote origin returned a subsonic error: code {code}, message {message}")]
    SubsonicFault { code: i64, message: String },
}

/// Pinned client API version; sent on every request as `v`.
const API_VERSION: &str = "1.16.1";
const CLIENT_NAME: &str = "subdaap-bridge";

/// Per-origin transcode policy.
#[derive(Debug, Clone)]
pub struct TranscodePolicy {
    pub mode: TranscodeMode,
    pub unsupported_suffixes: HashSet<String>,
}

impl TranscodePolicy {
    pub fn from_origin(origin: &OriginConfig) -> Self {
        Self {
            mode: origin.transcode,
            unsupported_suffixes: origin
                .transcode_unsupported
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        }
    }

    /// `None` means "serve untranscoded"; `Some(format)` names the transcode
    /// target format to request from the origin.
    pub fn decide(&self, file_suffix: &str) -> Option<&'static str> {
        match self.mode {
            TranscodeMode::No => None,
            TranscodeMode::All => Some("mp3"),
            TranscodeMode::Unsupported => {
                if self.unsupported_suffixes.contains(&file_suffix.to_ascii_lowercase()) {
                    Some("mp3")
                } else {
                    None
                }
            }
        }
    }
}

/// Result of `walk_index`: the remote index's `lastModified` stamp (if any)
/// plus every leaf song discovered by walking the artist/directory tree.
pub struct IndexWalk {
    pub last_modified: Option<String>,
    pub songs: Vec<RemoteSong>,
}

/// Thin adapter over a Subsonic server's REST API. Safe to call from multiple
/// tasks concurrently: `reqwest::Client` shares no mutable state across calls.
pub struct Client {
    http: HttpClient,
    base_url: String,
    username: String,
    password: String,
}

impl Client {
    pub fn new(origin: &OriginConfig) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: origin.url.trim_end_matches('/').to_string(),
            username: origin.username.clone(),
            password: origin.password.clone(),
        }
    }

    fn endpoint(&self, method: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/rest/{method}", self.base_url);
        self.http
            .get(url)
            .query(&[
                ("u", self.username.as_str()),
                ("p", self.password.as_str()),
                ("v", API_VERSION),
                ("c", CLIENT_NAME),
                ("f", "json"),
            ])
    }

    async fn get_json(
        &self,
        method: &str,
        extra: &[(&str, String)],
    ) -> Result<serde_json::Value, SubsonicError> {
        let response = self
            .endpoint(method)
            .query(extra)
            .send()
            .await?
            .error_for_status()?;

        let body: models::Envelope = response
            .json()
            .await
            .map_err(|err| SubsonicError::RemoteProtocol(err.to_string()))?;

        if body.subsonic_response.status != "ok" {
            let error = body.subsonic_response.error.unwrap_or_default();
            return Err(SubsonicError::SubsonicFault {
                code: error.code,
                message: error.message,
            });
        }

        Ok(body.subsonic_response.rest)
    }

    async fn get_binary(
        &self,
        method: &str,
        extra: &[(&str, String)],
    ) -> Result<impl AsyncRead + Unpin + Send + use<>, SubsonicError> {
        let response = self
            .endpoint(method)
            .query(extra)
            .send()
            .await?
            .error_for_status()?;

        let byte_stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));

        Ok(StreamReader::new(byte_stream))
    }

    /// Depth-first walk of the artist/directory tree; leaves are songs.
    /// Recurses into `getMusicDirectory` for every non-leaf child.
    pub async fn walk_index(
        &self,
        if_modified_since: Option<&str>,
    ) -> Result<IndexWalk, SubsonicError> {
        let mut extra = Vec::new();
        if let Some(since) = if_modified_since {
            extra.push(("ifModifiedSince", since.to_string()));
        }

        let raw = self.get_json("getIndexes", &extra).await?;
        let indexes: models::IndexesResponse = serde_json::from_value(raw)
            .map_err(|err| SubsonicError::RemoteProtocol(err.to_string()))?;

        let mut songs = Vec::new();
        for index in &indexes.indexes.index {
            for artist in &index.artist {
                let dir_songs = self.walk_directory(artist.id).await?;
                songs.extend(dir_songs);
            }
        }
        for child in indexes.indexes.child {
            if child.is_dir.unwrap_or(false) {
                songs.extend(self.walk_directory(child.id).await?);
            } else {
                songs.push(child.into_song());
            }
        }

        Ok(IndexWalk {
            last_modified: indexes.indexes.last_modified,
            songs,
        })
    }

    /// Recursive directory walk used internally by `walk_index`.
    pub async fn walk_directory(&self, dir_id: u64) -> Result<Vec<RemoteSong>, SubsonicError> {
        let raw = self
            .get_json("getMusicDirectory", &[("id", dir_id.to_string())])
            .await?;
        let directory: models::DirectoryResponse = serde_json::from_value(raw)
            .map_err(|err| SubsonicError::RemoteProtocol(err.to_string()))?;

        let mut songs = Vec::new();
        for child in directory.directory.child {
            if child.is_dir.unwrap_or(false) {
                songs.extend(Box::pin(self.walk_directory(child.id)).await?);
            } else {
                songs.push(child.into_song());
            }
        }
        Ok(songs)
    }

    pub async fn walk_artist(&self, artist_id: u64) -> Result<Vec<RemoteAlbum>, SubsonicError> {
        let raw = self
            .get_json("getArtist", &[("id", artist_id.to_string())])
            .await?;
        let response: models::ArtistResponse = serde_json::from_value(raw)
            .map_err(|err| SubsonicError::RemoteProtocol(err.to_string()))?;

        Ok(response.artist.album)
    }

    pub async fn walk_playlists(&self) -> Result<Vec<RemotePlaylist>, SubsonicError> {
        let raw = self.get_json("getPlaylists", &[]).await?;
        let response: models::PlaylistsResponse = serde_json::from_value(raw)
            .map_err(|err| SubsonicError::RemoteProtocol(err.to_string()))?;

        Ok(response.playlists.playlist)
    }

    /// Fetches a playlist's entries, injecting a 1-based `order` as each
    /// entry is mapped from the response.
    pub async fn walk_playlist(
        &self,
        playlist_id: u64,
    ) -> Result<Vec<RemotePlaylistEntry>, SubsonicError> {
        let raw = self
            .get_json("getPlaylist", &[("id", playlist_id.to_string())])
            .await?;
        let response: models::PlaylistResponse = serde_json::from_value(raw)
            .map_err(|err| SubsonicError::RemoteProtocol(err.to_string()))?;

        Ok(response
            .playlist
            .entry
            .into_iter()
            .enumerate()
            .map(|(idx, mut entry)| {
                entry.order = (idx + 1) as i64;
                entry
            })
            .collect())
    }

    pub async fn cover_art(
        &self,
        remote_id: u64,
    ) -> Result<impl AsyncRead + Unpin + Send + use<>, SubsonicError> {
        self.get_binary("getCoverArt", &[("id", remote_id.to_string())])
            .await
    }

    pub async fn download(
        &self,
        remote_id: u64,
    ) -> Result<impl AsyncRead + Unpin + Send + use<>, SubsonicError> {
        self.get_binary("download", &[("id", remote_id.to_string())])
            .await
    }

    pub async fn stream(
        &self,
        remote_id: u64,
        format: &str,
    ) -> Result<impl AsyncRead + Unpin + Send + use<>, SubsonicError> {
        self.get_binary(
            "stream",
            &[("id", remote_id.to_string()), ("format", format.to_string())],
        )
        .await
    }
}

/// Used by the Cache Manager/Provider when no `impl AsyncRead` distinction
/// between fetchers is needed: a small owned byte buffer already in memory
/// (e.g. in tests, fed by `httpmock`).
pub fn bytes_reader(bytes: Bytes) -> impl AsyncRead + Unpin + Send {
    std::io::Cursor::new(bytes)
}
