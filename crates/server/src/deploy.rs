//! Deployment target client.
//!
//! Projects are deployed by pushing their files to a remote service that
//! hosts them as named apps. The service speaks a small JSON API:
//!
//! | Method | Path | Body / result |
//! |---|---|---|
//! | `GET` | `/health` | 2xx when reachable |
//! | `GET` | `/apps` | `[{ "name", "createdAt" }]` |
//! | `GET` | `/apps/{name}` | app or 404 |
//! | `PUT` | `/apps/{name}/files` | `{ "files": [{ "path", "content" }] }`, content base64 |

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use protocol::messages::AppInfo;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::files::ExportedFile;

/// Errors reported by the deployment client.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The service has not been reached yet or was lost.
    #[error("deployment service is not connected")]
    NotConnected,

    /// The configured URL cannot be used.
    #[error("invalid deployment URL: {0}")]
    InvalidUrl(String),

    /// The service answered with an error status.
    #[error("deployment service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport failure.
    #[error("deployment request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Operations on the deployment service.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Whether the service was reachable at last contact.
    fn is_connected(&self) -> bool;

    async fn list_apps(&self) -> Result<Vec<AppInfo>, DeployError>;

    /// Creation timestamp of `app_name`, `None` if it has none or is unknown.
    async fn app_created_at(&self, app_name: &str) -> Result<Option<String>, DeployError>;

    async fn app_exists(&self, app_name: &str) -> Result<bool, DeployError>;

    /// Uploads `files` as the content of app `app_name`.
    async fn push_files(&self, app_name: &str, files: Vec<ExportedFile>) -> Result<(), DeployError>;
}

#[derive(Serialize)]
struct PushPayload<'a> {
    files: Vec<PushedFile<'a>>,
}

#[derive(Serialize)]
struct PushedFile<'a> {
    path: &'a str,
    content: String,
}

/// [`DeploymentClient`] over HTTP.
#[derive(Debug)]
pub struct HttpDeploymentClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    connected: AtomicBool,
}

impl HttpDeploymentClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, DeployError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| DeployError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DeployError::InvalidUrl(base_url.to_string()));
        }
        // Keep a trailing slash so joins append instead of replacing.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            token,
            connected: AtomicBool::new(false),
        })
    }

    /// Probes the service and updates the connectivity flag.
    pub async fn connect(&self) -> bool {
        let reachable = match self.endpoint(&["health"]) {
            Ok(url) => match self.authorized(self.http.get(url)).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    tracing::warn!(error = %e, "Deployment service unreachable");
                    false
                }
            },
            Err(_) => false,
        };
        self.connected.store(reachable, Ordering::SeqCst);
        tracing::info!(url = %self.base_url, connected = reachable, "Probed deployment service");
        reachable
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DeployError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| DeployError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Re-probes a service marked unreachable before giving up.
    async fn ensure_connected(&self) -> Result<(), DeployError> {
        if self.is_connected() || self.connect().await {
            Ok(())
        } else {
            Err(DeployError::NotConnected)
        }
    }

    /// Sends a request. Any response marks the service reachable; a
    /// transport failure marks it unreachable.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, DeployError> {
        match self.authorized(request).send().await {
            Ok(response) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(response)
            }
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e.into())
            }
        }
    }

    async fn fetch_app(&self, app_name: &str) -> Result<Option<AppInfo>, DeployError> {
        self.ensure_connected().await?;
        let response = self.send(self.http.get(self.endpoint(&["apps", app_name])?)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check_status(response).await?.json().await?))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DeployError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DeployError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl DeploymentClient for HttpDeploymentClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_apps(&self) -> Result<Vec<AppInfo>, DeployError> {
        self.ensure_connected().await?;
        let response = self.send(self.http.get(self.endpoint(&["apps"])?)).await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn app_created_at(&self, app_name: &str) -> Result<Option<String>, DeployError> {
        Ok(self.fetch_app(app_name).await?.and_then(|app| app.created_at))
    }

    async fn app_exists(&self, app_name: &str) -> Result<bool, DeployError> {
        Ok(self.fetch_app(app_name).await?.is_some())
    }

    async fn push_files(&self, app_name: &str, files: Vec<ExportedFile>) -> Result<(), DeployError> {
        self.ensure_connected().await?;
        let engine = base64::engine::general_purpose::STANDARD;
        let payload = PushPayload {
            files: files
                .iter()
                .map(|f| PushedFile {
                    path: &f.path,
                    content: engine.encode(&f.content),
                })
                .collect(),
        };
        let url = self.endpoint(&["apps", app_name, "files"])?;
        let response = self.send(self.http.put(url).json(&payload)).await?;
        check_status(response).await?;
        tracing::info!(app = %app_name, files = files.len(), "Pushed deployment");
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    //! Recording deployment client for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeDeploymentClient {
        pub connected: AtomicBool,
        pub apps: Mutex<HashMap<String, Option<String>>>,
        pub pushes: Mutex<Vec<(String, Vec<ExportedFile>)>>,
    }

    impl FakeDeploymentClient {
        pub fn connected() -> Self {
            let client = Self::default();
            client.connected.store(true, Ordering::SeqCst);
            client
        }
    }

    #[async_trait]
    impl DeploymentClient for FakeDeploymentClient {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn list_apps(&self) -> Result<Vec<AppInfo>, DeployError> {
            let apps = self.apps.lock().unwrap();
            let mut list: Vec<AppInfo> = apps
                .iter()
                .map(|(name, created_at)| AppInfo {
                    name: name.clone(),
                    created_at: created_at.clone(),
                })
                .collect();
            list.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(list)
        }

        async fn app_created_at(&self, app_name: &str) -> Result<Option<String>, DeployError> {
            Ok(self.apps.lock().unwrap().get(app_name).cloned().flatten())
        }

        async fn app_exists(&self, app_name: &str) -> Result<bool, DeployError> {
            if !self.is_connected() {
                return Err(DeployError::NotConnected);
            }
            Ok(self.apps.lock().unwrap().contains_key(app_name))
        }

        async fn push_files(&self, app_name: &str, files: Vec<ExportedFile>) -> Result<(), DeployError> {
            if !self.is_connected() {
                return Err(DeployError::NotConnected);
            }
            self.pushes
                .lock()
                .unwrap()
                .push((app_name.to_string(), files));
            Ok(())
        }
    }
}
