use crate::report::Artifact;
use reqwest::multipart;
use reqwest::Client;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const FILE_FIELD: &str = "file";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("файл для загрузки не найден: {}", .0.display())]
    NotFound(PathBuf),
    #[error("не удалось прочитать файл {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось подготовить HTTP-запрос: {0}")]
    Build(reqwest::Error),
    #[error("ошибка передачи: {0}")]
    Transport(reqwest::Error),
}

impl UploadError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UploadError::Transport(err) if err.is_timeout())
    }
}

/// What the server answered. Any status, including 4xx/5xx, is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub status: u16,
    pub body: String,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct Uploader {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl Uploader {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let client = Client::builder()
            .user_agent(concat!("sysdump/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(UploadError::Build)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn upload(&self, artifact: &Artifact) -> Result<UploadOutcome, UploadError> {
        if !artifact.path.is_file() {
            return Err(UploadError::NotFound(artifact.path.clone()));
        }
        let data = tokio::fs::read(&artifact.path)
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => UploadError::NotFound(artifact.path.clone()),
                _ => UploadError::Read {
                    path: artifact.path.display().to_string(),
                    source,
                },
            })?;
        let size = data.len();

        let part = multipart::Part::bytes(data)
            .file_name(artifact.file_name())
            .mime_str("text/plain; charset=utf-8")
            .map_err(UploadError::Build)?;
        let form = multipart::Form::new().part(FILE_FIELD, part);

        let mut builder = self.client.post(&self.endpoint).multipart(form);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await.map_err(|err| {
            warn!(endpoint = %self.endpoint, error = %err, "загрузка не выполнена");
            UploadError::Transport(err)
        })?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(UploadError::Transport)?;
        info!(endpoint = %self.endpoint, status, bytes = size, "отчёт отправлен");

        Ok(UploadOutcome { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::fs;

    fn artifact_in(dir: &tempfile::TempDir) -> Artifact {
        let path = dir.path().join("HOST1_30-09-2025_22-53.txt");
        fs::write(&path, "=== System Info (JSON) ===\n{}\n").unwrap();
        Artifact { path }
    }

    #[tokio::test]
    async fn sends_file_field_with_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/upload")
                    .header("authorization", "Bearer s3cret")
                    .body_contains("name=\"file\"; filename=\"HOST1_30-09-2025_22-53.txt\"")
                    .body_contains("=== System Info (JSON) ===");
                then.status(200).body(r#"{"ok":true}"#);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let uploader = Uploader::new(
            server.url("/upload"),
            Some("s3cret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let outcome = uploader.upload(&artifact_in(&dir)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, r#"{"ok":true}"#);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn omits_authorization_without_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/upload").matches(|req| {
                    req.headers.as_ref().map_or(true, |headers| {
                        headers
                            .iter()
                            .all(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
                    })
                });
                then.status(200);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let uploader =
            Uploader::new(server.url("/upload"), None, Duration::from_secs(5)).unwrap();
        uploader.upload(&artifact_in(&dir)).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_a_normal_outcome() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/upload");
                then.status(500).body("error");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let uploader =
            Uploader::new(server.url("/upload"), None, Duration::from_secs(5)).unwrap();
        let outcome = uploader.upload(&artifact_in(&dir)).await.unwrap();
        assert_eq!(
            outcome,
            UploadOutcome {
                status: 500,
                body: "error".to_string()
            }
        );
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn slow_server_is_a_transport_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/upload");
                then.status(200).delay(Duration::from_secs(3));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let uploader =
            Uploader::new(server.url("/upload"), None, Duration::from_millis(200)).unwrap();
        let err = uploader.upload(&artifact_in(&dir)).await.unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let uploader = Uploader::new(
            format!("http://{addr}/upload"),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let err = uploader.upload(&artifact_in(&dir)).await.unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let uploader =
            Uploader::new("http://127.0.0.1:9/upload", None, Duration::from_secs(1)).unwrap();
        let artifact = Artifact {
            path: dir.path().join("gone.txt"),
        };
        let err = uploader.upload(&artifact).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
        assert!(err.to_string().contains("gone.txt"));
    }
}
