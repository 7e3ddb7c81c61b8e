//! Audio and user file storage on top of Supabase Storage.
//!
//! Two buckets are used: one for turn audio (`conversations/{cid}/{tid}.mp3`)
//! and one for user uploads, namespaced under `{user_id}/`. Both are public
//! buckets so that stored objects can be served by URL.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::supabase::SupabaseClient;
use crate::types::FileInfo;
use crate::validation::sanitize_filename;

/// Extensions accepted as-is for audio uploads; anything else gets `.mp3`.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a"];

/// Page size used when listing a prefix.
const LIST_LIMIT: u32 = 100;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type for a file name, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/m4a",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Storage path of the audio recording for a turn.
pub fn turn_audio_path(conversation_id: &str, turn_id: &str) -> String {
    format!("conversations/{conversation_id}/{turn_id}.mp3")
}

#[derive(Debug, Clone)]
pub struct StorageService {
    supabase: Arc<SupabaseClient>,
    audio_bucket: String,
    files_bucket: String,
}

impl StorageService {
    pub fn new(
        supabase: Arc<SupabaseClient>,
        audio_bucket: impl Into<String>,
        files_bucket: impl Into<String>,
    ) -> Self {
        Self {
            supabase,
            audio_bucket: audio_bucket.into(),
            files_bucket: files_bucket.into(),
        }
    }

    /// Creates the audio and files buckets if they don't exist yet.
    pub async fn ensure_buckets(&self) -> Result<()> {
        let existing = self.supabase.list_buckets().await?;

        for bucket in [&self.audio_bucket, &self.files_bucket] {
            if existing.iter().any(|b| &b.name == bucket) {
                debug!(bucket = %bucket, "Storage bucket exists");
                continue;
            }
            self.supabase.create_bucket(bucket, true).await?;
        }

        info!("Storage buckets verified");
        Ok(())
    }

    /// Uploads audio and returns its public URL.
    ///
    /// Paths without a known audio extension get `.mp3` appended.
    pub async fn upload_audio(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        let has_audio_ext = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));

        let path = if has_audio_ext {
            path.to_string()
        } else {
            format!("{path}.mp3")
        };

        let stored = self
            .supabase
            .upload(&self.audio_bucket, &path, bytes, content_type_for(&path), true)
            .await?;

        Ok(self.supabase.public_url(&self.audio_bucket, &stored))
    }

    pub async fn delete_audio(&self, path: &str) -> Result<()> {
        self.supabase
            .remove(&self.audio_bucket, &[path.to_string()])
            .await?;
        Ok(())
    }

    /// Maps a public audio URL back to its path inside the audio bucket.
    pub fn audio_path_from_url(&self, url: &str) -> Option<String> {
        let prefix = self.supabase.public_url(&self.audio_bucket, "");
        url.strip_prefix(&prefix)
            .filter(|path| !path.is_empty())
            .map(str::to_string)
    }

    /// Uploads a user file under `{user_id}/`.
    ///
    /// The file name is sanitized; the content type is inferred from the
    /// extension unless given.
    pub async fn upload_file(
        &self,
        user_id: &str,
        filename: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<FileInfo> {
        let name = sanitize_filename(filename)?;
        let path = format!("{user_id}/{name}");
        let size = bytes.len() as u64;
        let content_type = content_type.unwrap_or_else(|| content_type_for(&name));

        let stored = self
            .supabase
            .upload(&self.files_bucket, &path, bytes, content_type, true)
            .await?;

        debug!(size, content_type, "User file uploaded");

        Ok(FileInfo {
            url: self.supabase.public_url(&self.files_bucket, &stored),
            name,
            path: stored,
            size: Some(size),
            updated_at: None,
        })
    }

    /// Deletes a user file by name.
    pub async fn delete_file(&self, user_id: &str, filename: &str) -> Result<()> {
        let name = sanitize_filename(filename)?;
        self.supabase
            .remove(&self.files_bucket, &[format!("{user_id}/{name}")])
            .await?;
        Ok(())
    }

    /// Lists files stored under `prefix` in the files bucket.
    pub async fn list_files(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        let prefix = prefix.trim_end_matches('/');
        let objects = self
            .supabase
            .list(&self.files_bucket, prefix, LIST_LIMIT, 0)
            .await?;

        Ok(objects
            .into_iter()
            .map(|object| {
                let path = if prefix.is_empty() {
                    object.name.clone()
                } else {
                    format!("{prefix}/{}", object.name)
                };
                let size = object
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("size"))
                    .and_then(|s| s.as_u64());

                FileInfo {
                    url: self.supabase.public_url(&self.files_bucket, &path),
                    name: object.name,
                    path,
                    size,
                    updated_at: object.updated_at,
                }
            })
            .collect())
    }

    /// Lists the files a user has uploaded.
    pub async fn list_user_files(&self, user_id: &str) -> Result<Vec<FileInfo>> {
        self.list_files(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> StorageService {
        let client = SupabaseClient::new(server.uri(), "anon").unwrap();
        StorageService::new(Arc::new(client), "audio", "files")
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("a.PNG"), "image/png");
        assert_eq!(content_type_for("song.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("photo.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("noext"), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type_for("weird.xyz"), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn turn_audio_paths() {
        assert_eq!(turn_audio_path("c1", "t1"), "conversations/c1/t1.mp3");
    }

    #[tokio::test]
    async fn ensure_buckets_creates_only_missing_ones() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/bucket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "audio", "name": "audio", "public": true}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/bucket"))
            .and(body_json(json!({"id": "files", "name": "files", "public": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "files"})))
            .expect(1)
            .mount(&server)
            .await;

        service(&server).ensure_buckets().await.unwrap();
    }

    #[tokio::test]
    async fn upload_audio_appends_mp3_and_returns_public_url() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/storage/v1/object/audio/conversations/c1/t1.mp3"))
            .and(header("Content-Type", "audio/mpeg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Key": "x"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/audio/clip.wav"))
            .and(header("Content-Type", "audio/wav"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Key": "y"})))
            .expect(1)
            .mount(&server)
            .await;

        let storage = service(&server);
        let url = storage
            .upload_audio("conversations/c1/t1", vec![0xff, 0xfb])
            .await
            .unwrap();
        assert_eq!(
            url,
            format!(
                "{}/storage/v1/object/public/audio/conversations/c1/t1.mp3",
                server.uri()
            )
        );
        assert_eq!(
            storage.audio_path_from_url(&url).as_deref(),
            Some("conversations/c1/t1.mp3")
        );

        storage.upload_audio("clip.wav", vec![0]).await.unwrap();
    }

    #[tokio::test]
    async fn upload_file_is_namespaced_and_sanitized() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/storage/v1/object/files/user-1/my_notes.txt"))
            .and(header("Content-Type", "text/plain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Key": "k"})))
            .expect(1)
            .mount(&server)
            .await;

        let info = service(&server)
            .upload_file("user-1", "../my notes.txt", b"hi".to_vec(), None)
            .await
            .unwrap();

        assert_eq!(info.name, "my_notes.txt");
        assert_eq!(info.path, "user-1/my_notes.txt");
        assert_eq!(info.size, Some(2));
    }

    #[tokio::test]
    async fn delete_and_list_user_files() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/files"))
            .and(body_json(json!({"prefixes": ["user-1/a.txt"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/list/files"))
            .and(body_partial_json(json!({"prefix": "user-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "b.pdf", "updated_at": "2024-01-01T00:00:00Z", "metadata": {"size": 1024}}
            ])))
            .mount(&server)
            .await;

        let storage = service(&server);
        storage.delete_file("user-1", "a.txt").await.unwrap();

        let files = storage.list_user_files("user-1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "user-1/b.pdf");
        assert_eq!(files[0].size, Some(1024));
        assert!(files[0].url.ends_with("/storage/v1/object/public/files/user-1/b.pdf"));
    }
}
