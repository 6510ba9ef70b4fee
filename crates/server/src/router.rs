//! Request router.
//!
//! [`Router::dispatch`] matches every [`Request`] variant and delegates to
//! the connection's [`ProjectSession`]. Failures stay scoped to the request
//! that caused them: [`Router::handle`] turns them into an error reply and
//! the connection carries on.

use std::sync::Arc;

use protocol::messages::{
    AppQuery, CreateEntry, FileTarget, MoveFile, RenameFile, ResizeTerminal, SaveFile,
    TerminalData, TerminalTarget,
};
use protocol::{Envelope, ErrorCode, ErrorMessage, Reply, Request, Response};
use tracing::{debug, warn};

use crate::admission::{AdmissionControl, AdmissionDenied};
use crate::deploy::DeployError;
use crate::files::FileError;
use crate::project::{ProjectSession, PushSender, SessionError};
use crate::sandbox::SandboxError;
use crate::store::StoreError;

/// Events that spend admission budget.
pub const RATE_LIMITED_EVENTS: [&str; 5] = [
    "saveFile",
    "createFile",
    "createFolder",
    "renameFile",
    "deleteFile",
];

/// Errors that can occur while handling a request.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The session or one of its collaborators failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The caller is over its rate limit.
    #[error(transparent)]
    AdmissionDenied(#[from] AdmissionDenied),

    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self, context: Option<String>) -> ErrorMessage {
        let (code, recoverable) = match self {
            RouterError::Session(e) => session_error_code(e),
            RouterError::AdmissionDenied(_) => (ErrorCode::RateLimited, true),
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
        };

        ErrorMessage {
            code,
            message: self.to_string(),
            context,
            recoverable,
        }
    }
}

fn session_error_code(error: &SessionError) -> (ErrorCode, bool) {
    match error {
        SessionError::Provisioning(_) => (ErrorCode::ProvisioningFailed, true),
        SessionError::CollaboratorUnavailable(_) => (ErrorCode::Unavailable, true),
        SessionError::Sandbox(e) => match e {
            SandboxError::NotFound(_) => (ErrorCode::NotFound, false),
            _ => (ErrorCode::InternalError, true),
        },
        SessionError::File(e) => match e {
            FileError::InvalidPath(_) | FileError::WrongKind { .. } | FileError::NotText(_) => {
                (ErrorCode::InvalidRequest, false)
            }
            FileError::NotFound(_) => (ErrorCode::NotFound, false),
            FileError::AlreadyExists(_) => (ErrorCode::AlreadyExists, false),
            FileError::Archive(_) | FileError::Watch(_) | FileError::Io(_) => {
                (ErrorCode::InternalError, true)
            }
        },
        SessionError::Deploy(e) => match e {
            DeployError::NotConnected => (ErrorCode::Unavailable, true),
            DeployError::InvalidUrl(_) => (ErrorCode::InvalidRequest, false),
            DeployError::Status { status: 404, .. } => (ErrorCode::NotFound, false),
            DeployError::Status { .. } | DeployError::Http(_) => (ErrorCode::InternalError, true),
        },
        SessionError::Store(e) => match e {
            StoreError::ProjectNotFound(_) => (ErrorCode::NotFound, false),
            StoreError::Persist(_) | StoreError::Poisoned => (ErrorCode::InternalError, true),
        },
    }
}

/// Who is asking, and where their pushes go.
#[derive(Clone)]
pub struct ConnectionContext {
    pub connection_id: u64,
    pub user_id: String,
    pub project_id: String,
    pub is_owner: bool,
    pub session: Arc<ProjectSession>,
    pub push: PushSender,
}

/// Dispatches requests of one connection to its project session.
pub struct Router {
    admission: Arc<dyn AdmissionControl>,
}

impl Router {
    pub fn new(admission: Arc<dyn AdmissionControl>) -> Self {
        Self { admission }
    }

    /// Handles one envelope and builds its reply.
    pub async fn handle(&self, ctx: &ConnectionContext, envelope: Envelope) -> Reply {
        let event = envelope.request.event_name();
        let context = request_context(&envelope.request);
        match self.dispatch(ctx, envelope.request).await {
            Ok(response) => Reply::ok(envelope.id, response),
            Err(e) => {
                warn!(
                    project_id = %ctx.project_id,
                    user_id = %ctx.user_id,
                    event,
                    error = %e,
                    "Request failed"
                );
                Reply::err(envelope.id, e.to_error_message(context))
            }
        }
    }

    /// Runs one request against the connection's session.
    pub async fn dispatch(&self, ctx: &ConnectionContext, request: Request) -> Result<Response, RouterError> {
        let event = request.event_name();
        debug!(project_id = %ctx.project_id, connection_id = ctx.connection_id, event, "Routing request");

        if RATE_LIMITED_EVENTS.contains(&event) {
            self.admission.check(&ctx.user_id, event)?;
        }

        let session = &ctx.session;
        match request {
            Request::Heartbeat => Ok(Response::Heartbeat {
                success: session.heartbeat(ctx.is_owner).await,
            }),

            // =================================================================
            // Files
            // =================================================================
            Request::GetFile(FileTarget { id }) => Ok(Response::File {
                content: session.get_file(&id).await?,
            }),
            Request::GetFolder(FileTarget { id }) => Ok(Response::Folder {
                entries: session.get_folder(&id).await?,
            }),
            Request::SaveFile(SaveFile { id, body }) => {
                session.save_file(&id, &body).await?;
                Ok(Response::Ack)
            }
            Request::MoveFile(MoveFile { id, folder_id }) => Ok(Response::Tree {
                tree: session.move_file(&id, &folder_id).await?,
            }),
            Request::CreateFile(CreateEntry { name }) => Ok(Response::Created {
                success: session.create_file(&name).await?,
            }),
            Request::CreateFolder(CreateEntry { name }) => Ok(Response::Created {
                success: session.create_folder(&name).await?,
            }),
            Request::RenameFile(RenameFile { id, new_name }) => {
                require_non_empty("newName", &new_name)?;
                session.rename_file(&id, &new_name).await?;
                Ok(Response::Ack)
            }
            Request::DeleteFile(FileTarget { id }) => Ok(Response::Tree {
                tree: session.delete_file(&id).await?,
            }),
            Request::DeleteFolder(FileTarget { id }) => Ok(Response::Tree {
                tree: session.delete_folder(&id).await?,
            }),
            Request::DownloadFiles => Ok(Response::Archive {
                data: session.download_files().await?,
            }),

            // =================================================================
            // Deployment
            // =================================================================
            Request::ListApps => Ok(Response::Apps {
                success: true,
                apps: session.list_apps().await?,
            }),
            Request::GetAppCreatedAt(AppQuery { app_name }) => Ok(Response::AppCreatedAt {
                success: true,
                created_at: session.get_app_created_at(&app_name).await?,
            }),
            Request::GetAppExists(AppQuery { app_name }) => {
                let existence = session.app_exists(&app_name).await?;
                Ok(Response::AppExists {
                    success: existence.success,
                    exists: existence.exists,
                })
            }
            Request::Deploy => {
                session.deploy().await?;
                Ok(Response::Deployed { success: true })
            }

            // =================================================================
            // Terminals
            // =================================================================
            Request::CreateTerminal(TerminalTarget { id }) => {
                require_non_empty("id", &id)?;
                session.create_terminal(&id, ctx.push.clone()).await?;
                Ok(Response::Ack)
            }
            Request::ResizeTerminal(ResizeTerminal { dimensions, id }) => {
                if dimensions.cols == 0 || dimensions.rows == 0 {
                    return Err(RouterError::InvalidRequest(
                        "terminal dimensions must be non-zero".to_string(),
                    ));
                }
                match id {
                    Some(id) => {
                        session.resize_terminal_by_id(&id, dimensions).await?;
                    }
                    None => {
                        session.resize_terminal(dimensions).await;
                    }
                }
                Ok(Response::Ack)
            }
            Request::TerminalData(TerminalData { id, data }) => Ok(Response::Target {
                found: session.send_terminal_data(&id, &data).await?,
            }),
            Request::CloseTerminal(TerminalTarget { id }) => Ok(Response::Target {
                found: session.close_terminal(&id).await?,
            }),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), RouterError> {
    if value.is_empty() {
        return Err(RouterError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

/// The id a request addresses, echoed in error replies.
fn request_context(request: &Request) -> Option<String> {
    match request {
        Request::GetFile(FileTarget { id })
        | Request::GetFolder(FileTarget { id })
        | Request::DeleteFile(FileTarget { id })
        | Request::DeleteFolder(FileTarget { id })
        | Request::SaveFile(SaveFile { id, .. })
        | Request::MoveFile(MoveFile { id, .. })
        | Request::RenameFile(RenameFile { id, .. })
        | Request::CreateTerminal(TerminalTarget { id })
        | Request::CloseTerminal(TerminalTarget { id })
        | Request::TerminalData(TerminalData { id, .. }) => Some(id.clone()),
        Request::CreateFile(CreateEntry { name }) | Request::CreateFolder(CreateEntry { name }) => {
            Some(name.clone())
        }
        Request::GetAppCreatedAt(AppQuery { app_name })
        | Request::GetAppExists(AppQuery { app_name }) => Some(app_name.clone()),
        Request::ResizeTerminal(ResizeTerminal { id, .. }) => id.clone(),
        Request::Heartbeat | Request::DownloadFiles | Request::ListApps | Request::Deploy => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Limit, RateLimiter};
    use crate::deploy::fake::FakeDeploymentClient;
    use crate::deploy::DeploymentClient;
    use crate::lock::KeyedMutex;
    use crate::project::{SessionDeps, SessionSettings};
    use crate::sandbox::fake::FakeProvider;
    use crate::store::{JsonProjectStore, ProjectRecord};
    use protocol::messages::ReplyResult;
    use protocol::{Dimensions, ServerEvent};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        provider: Arc<FakeProvider>,
        router: Router,
        ctx: ConnectionContext,
        pushes: mpsc::UnboundedReceiver<ServerEvent>,
    }

    async fn fixture_with(
        is_owner: bool,
        deploy: Option<Arc<dyn DeploymentClient>>,
        limiter: RateLimiter,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonProjectStore::new(dir.path().join("projects.json")));
        let record = ProjectRecord::new("p1", "vanillajs", "alice");
        store.upsert(record.clone()).unwrap();
        let provider = FakeProvider::new();
        let session = Arc::new(ProjectSession::new(
            &record,
            SessionDeps {
                provider: provider.clone(),
                records: store,
                locks: Arc::new(KeyedMutex::new()),
                deploy,
                settings: SessionSettings {
                    watch_files: false,
                    ..SessionSettings::default()
                },
            },
        ));
        session.initialize().await.unwrap();

        let (push, pushes) = mpsc::unbounded_channel();
        Fixture {
            _dir: dir,
            provider,
            router: Router::new(Arc::new(limiter)),
            ctx: ConnectionContext {
                connection_id: 1,
                user_id: (if is_owner { "alice" } else { "bob" }).to_string(),
                project_id: "p1".to_string(),
                is_owner,
                session,
                push,
            },
            pushes,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(true, None, RateLimiter::default()).await
    }

    async fn call(f: &Fixture, request: Request) -> ReplyResult {
        f.router.handle(&f.ctx, Envelope::new(9, request)).await.result
    }

    fn expect_err(result: ReplyResult) -> ErrorMessage {
        match result {
            ReplyResult::Err(e) => e,
            ReplyResult::Ok(r) => panic!("expected error, got {r:?}"),
        }
    }

    #[tokio::test]
    async fn test_reply_echoes_request_id() {
        let f = fixture().await;
        let reply = f.router.handle(&f.ctx, Envelope::new(42, Request::Heartbeat)).await;
        assert_eq!(reply.id, 42);
        assert_eq!(reply.result, ReplyResult::Ok(Response::Heartbeat { success: true }));
    }

    #[tokio::test]
    async fn test_collaborator_heartbeat_does_not_extend() {
        let f = fixture_with(false, None, RateLimiter::default()).await;
        let sandbox = f.provider.sandbox("sbx-1").unwrap();
        let before = sandbox.timeout_count();
        assert_eq!(
            call(&f, Request::Heartbeat).await,
            ReplyResult::Ok(Response::Heartbeat { success: true })
        );
        assert_eq!(sandbox.timeout_count(), before);
    }

    #[tokio::test]
    async fn test_file_round_trip_through_router() {
        let f = fixture().await;
        assert_eq!(
            call(&f, Request::CreateFile(CreateEntry { name: "a.txt".to_string() })).await,
            ReplyResult::Ok(Response::Created { success: true })
        );
        assert_eq!(
            call(&f, Request::CreateFile(CreateEntry { name: "a.txt".to_string() })).await,
            ReplyResult::Ok(Response::Created { success: false })
        );
        assert_eq!(
            call(
                &f,
                Request::SaveFile(SaveFile {
                    id: "a.txt".to_string(),
                    body: "hello".to_string()
                })
            )
            .await,
            ReplyResult::Ok(Response::Ack)
        );
        assert_eq!(
            call(&f, Request::GetFile(FileTarget { id: "a.txt".to_string() })).await,
            ReplyResult::Ok(Response::File {
                content: "hello".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_file_errors_map_to_codes() {
        let f = fixture().await;
        let err = expect_err(call(&f, Request::GetFile(FileTarget { id: "missing".to_string() })).await);
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.context.as_deref(), Some("missing"));
        assert!(!err.recoverable);

        let err = expect_err(
            call(&f, Request::GetFile(FileTarget { id: "../etc/passwd".to_string() })).await,
        );
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_delegation() {
        let limiter = RateLimiter::default().with_limit(
            "createFile",
            Limit {
                points: 1,
                window: Duration::from_secs(60),
            },
        );
        let f = fixture_with(true, None, limiter).await;
        call(&f, Request::CreateFile(CreateEntry { name: "one".to_string() })).await;

        let err = expect_err(call(&f, Request::CreateFile(CreateEntry { name: "two".to_string() })).await);
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert!(err.recoverable);
        assert!(matches!(
            call(&f, Request::GetFile(FileTarget { id: "two".to_string() })).await,
            ReplyResult::Err(ErrorMessage { code: ErrorCode::NotFound, .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_lifecycle_through_router() {
        let mut f = fixture().await;
        assert_eq!(
            call(&f, Request::CreateTerminal(TerminalTarget { id: "t1".to_string() })).await,
            ReplyResult::Ok(Response::Ack)
        );
        assert_eq!(
            call(
                &f,
                Request::TerminalData(TerminalData {
                    id: "t1".to_string(),
                    data: "echo".to_string()
                })
            )
            .await,
            ReplyResult::Ok(Response::Target { found: true })
        );
        assert_eq!(
            f.pushes.recv().await,
            Some(ServerEvent::TerminalResponse {
                id: "t1".to_string(),
                data: "echo".to_string()
            })
        );

        assert_eq!(
            call(
                &f,
                Request::ResizeTerminal(ResizeTerminal {
                    dimensions: Dimensions { cols: 120, rows: 40 },
                    id: None
                })
            )
            .await,
            ReplyResult::Ok(Response::Ack)
        );
        assert_eq!(
            call(&f, Request::CloseTerminal(TerminalTarget { id: "t1".to_string() })).await,
            ReplyResult::Ok(Response::Target { found: true })
        );
        assert_eq!(
            call(&f, Request::CloseTerminal(TerminalTarget { id: "t1".to_string() })).await,
            ReplyResult::Ok(Response::Target { found: false })
        );
    }

    #[tokio::test]
    async fn test_invalid_terminal_requests() {
        let f = fixture().await;
        let err = expect_err(call(&f, Request::CreateTerminal(TerminalTarget { id: String::new() })).await);
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err = expect_err(
            call(
                &f,
                Request::ResizeTerminal(ResizeTerminal {
                    dimensions: Dimensions { cols: 0, rows: 10 },
                    id: None,
                }),
            )
            .await,
        );
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_deploy_without_client_is_unavailable() {
        let f = fixture().await;
        let err = expect_err(call(&f, Request::Deploy).await);
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert_eq!(
            call(&f, Request::GetAppExists(AppQuery { app_name: "x".to_string() })).await,
            ReplyResult::Ok(Response::AppExists {
                success: false,
                exists: None
            })
        );
    }

    #[tokio::test]
    async fn test_deploy_and_app_queries() {
        let client = Arc::new(FakeDeploymentClient::connected());
        client
            .apps
            .lock()
            .unwrap()
            .insert("p1".to_string(), Some("2024-05-01T00:00:00Z".to_string()));
        let f = fixture_with(true, Some(client.clone()), RateLimiter::default()).await;

        assert_eq!(
            call(&f, Request::Deploy).await,
            ReplyResult::Ok(Response::Deployed { success: true })
        );
        assert_eq!(client.pushes.lock().unwrap().len(), 1);

        assert_eq!(
            call(&f, Request::GetAppCreatedAt(AppQuery { app_name: "p1".to_string() })).await,
            ReplyResult::Ok(Response::AppCreatedAt {
                success: true,
                created_at: Some("2024-05-01T00:00:00Z".to_string())
            })
        );
        match call(&f, Request::ListApps).await {
            ReplyResult::Ok(Response::Apps { success, apps }) => {
                assert!(success);
                assert_eq!(apps.len(), 1);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
