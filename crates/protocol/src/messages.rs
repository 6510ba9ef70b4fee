//! Protocol message definitions for Sandpit.
//!
//! Every inbound frame is an [`Envelope`] carrying one [`Request`] and a
//! correlation id. The server answers each request with exactly one
//! [`Reply`] and may push [`ServerEvent`]s at any time; both travel inside
//! [`Outbound`].

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for inbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id echoed back in the matching [`Reply`].
    pub id: u64,
    /// The request payload.
    pub request: Request,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(id: u64, request: Request) -> Self {
        Self { id, request }
    }
}

/// Every request a connected client may issue.
///
/// The variant set is closed: the router matches it exhaustively, so adding
/// an event is a compile error until it is handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Request {
    /// Keep-alive; extends the sandbox idle timeout for owners.
    Heartbeat,

    // File messages
    /// Read a file's content.
    GetFile(FileTarget),
    /// List a folder's direct children.
    GetFolder(FileTarget),
    /// Overwrite a file's content.
    SaveFile(SaveFile),
    /// Move a file into another folder.
    MoveFile(MoveFile),
    /// Create an empty file at the project root.
    CreateFile(CreateEntry),
    /// Create a folder at the project root.
    CreateFolder(CreateEntry),
    /// Rename a file in place.
    RenameFile(RenameFile),
    /// Delete a file.
    DeleteFile(FileTarget),
    /// Delete a folder and everything below it.
    DeleteFolder(FileTarget),
    /// Export the whole project tree as an archive.
    DownloadFiles,

    // Deployment messages
    /// List deployed apps.
    ListApps,
    /// Creation timestamp of a deployed app.
    GetAppCreatedAt(AppQuery),
    /// Whether an app with the given name exists.
    GetAppExists(AppQuery),
    /// Package the project tree and push it to the remote.
    Deploy,

    // Terminal messages
    /// Spawn a shell under a caller-chosen logical id.
    CreateTerminal(TerminalTarget),
    /// Resize one terminal, or all of them when no id is given.
    ResizeTerminal(ResizeTerminal),
    /// Forward input bytes to a terminal.
    TerminalData(TerminalData),
    /// Terminate a terminal.
    CloseTerminal(TerminalTarget),
}

impl Request {
    /// Wire name of the event, used for logging and rate-limit keys.
    pub fn event_name(&self) -> &'static str {
        match self {
            Request::Heartbeat => "heartbeat",
            Request::GetFile(_) => "getFile",
            Request::GetFolder(_) => "getFolder",
            Request::SaveFile(_) => "saveFile",
            Request::MoveFile(_) => "moveFile",
            Request::CreateFile(_) => "createFile",
            Request::CreateFolder(_) => "createFolder",
            Request::RenameFile(_) => "renameFile",
            Request::DeleteFile(_) => "deleteFile",
            Request::DeleteFolder(_) => "deleteFolder",
            Request::DownloadFiles => "downloadFiles",
            Request::ListApps => "listApps",
            Request::GetAppCreatedAt(_) => "getAppCreatedAt",
            Request::GetAppExists(_) => "getAppExists",
            Request::Deploy => "deploy",
            Request::CreateTerminal(_) => "createTerminal",
            Request::ResizeTerminal(_) => "resizeTerminal",
            Request::TerminalData(_) => "terminalData",
            Request::CloseTerminal(_) => "closeTerminal",
        }
    }
}

// ============================================================================
// Request payloads
// ============================================================================

/// A file or folder addressed by id (its path relative to the project root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTarget {
    pub id: String,
}

/// New content for an existing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFile {
    pub id: String,
    pub body: String,
}

/// Move `id` into the folder `folder_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveFile {
    pub id: String,
    pub folder_id: String,
}

/// Name of a file or folder to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntry {
    pub name: String,
}

/// Rename `id` to `new_name` within the same folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameFile {
    pub id: String,
    pub new_name: String,
}

/// App name for deployment inventory queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppQuery {
    pub app_name: String,
}

/// A logical terminal id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalTarget {
    pub id: String,
}

/// Terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Resize request. Without an id every terminal of the project is resized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeTerminal {
    pub dimensions: Dimensions,
    #[serde(default)]
    pub id: Option<String>,
}

/// Input for a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalData {
    pub id: String,
    pub data: String,
}

// ============================================================================
// Outbound messages
// ============================================================================

/// Everything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Outbound {
    /// Answer to a single request.
    Reply(Reply),
    /// Unsolicited server push.
    Push(ServerEvent),
}

/// Answer to the request carrying the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub result: ReplyResult,
}

impl Reply {
    /// Successful reply.
    pub fn ok(id: u64, response: Response) -> Self {
        Self {
            id,
            result: ReplyResult::Ok(response),
        }
    }

    /// Failed reply.
    pub fn err(id: u64, error: ErrorMessage) -> Self {
        Self {
            id,
            result: ReplyResult::Err(error),
        }
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyResult {
    Ok(Response),
    Err(ErrorMessage),
}

/// Successful response payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Response {
    /// Operation completed with nothing to report.
    Ack,
    /// Heartbeat outcome; `false` when the keep-alive could not be extended.
    Heartbeat { success: bool },
    /// File content.
    File { content: String },
    /// Names of a folder's direct children.
    Folder { entries: Vec<String> },
    /// Creation outcome.
    Created { success: bool },
    /// Refreshed file tree after a structural change.
    Tree { tree: Vec<FileNode> },
    /// Base64-encoded tar archive of the project.
    Archive { data: String },
    /// Deployed apps.
    Apps { success: bool, apps: Vec<AppInfo> },
    /// App creation timestamp.
    #[serde(rename_all = "camelCase")]
    AppCreatedAt {
        success: bool,
        created_at: Option<String>,
    },
    /// App existence; `success` is false when the deployment client is unavailable.
    AppExists { success: bool, exists: Option<bool> },
    /// Deployment outcome.
    Deployed { success: bool },
    /// Whether the addressed terminal existed.
    Target { found: bool },
}

/// Server-push events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Output of a terminal, tagged with its logical id.
    #[serde(rename = "terminalResponse")]
    TerminalResponse { id: String, data: String },
    /// Externally reachable URL for a dev server detected in terminal output.
    #[serde(rename = "previewURL")]
    PreviewUrl { url: String },
    /// The project file tree; sent after the handshake and on file changes.
    #[serde(rename = "loaded")]
    Loaded { tree: Vec<FileNode> },
    /// The connection is about to be closed by the server.
    #[serde(rename = "disableAccess")]
    DisableAccess { reason: String },
}

/// Kind of a file tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

/// Node of the project file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Path relative to the project root, `/`-separated.
    pub id: String,
    /// Final path component.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Children, sorted folders first then by name. Empty for files.
    #[serde(default)]
    pub children: Vec<FileNode>,
}

/// A deployed app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (e.g., terminal id, file id).
    pub context: Option<String>,
    /// Whether retrying the same request may succeed.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Authentication or authorization failure.
    Unauthorized,
    /// Resource not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// Rate limited.
    RateLimited,
    /// Resource already exists.
    AlreadyExists,
    /// No running sandbox could be obtained.
    ProvisioningFailed,
    /// A required collaborator is not configured or not ready.
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_request_json_shape() {
        let json = serde_json::to_string(&Envelope::new(7, Request::Heartbeat)).unwrap();
        assert_eq!(json, r#"{"id":7,"request":{"event":"heartbeat"}}"#);
    }

    #[test]
    fn test_request_from_browser_json() {
        let raw = r#"{"id":3,"request":{"event":"moveFile","data":{"id":"a.js","folderId":"src"}}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(
            envelope.request,
            Request::MoveFile(MoveFile {
                id: "a.js".to_string(),
                folder_id: "src".to_string(),
            })
        );
    }

    #[test]
    fn test_resize_without_id() {
        let raw = r#"{"event":"resizeTerminal","data":{"dimensions":{"cols":100,"rows":30}}}"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        match request {
            Request::ResizeTerminal(resize) => {
                assert_eq!(resize.dimensions, Dimensions { cols: 100, rows: 30 });
                assert!(resize.id.is_none());
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_server_event_names() {
        let event = ServerEvent::PreviewUrl {
            url: "https://3000-abc.example.dev".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "previewURL");

        let event = ServerEvent::TerminalResponse {
            id: "t1".to_string(),
            data: "ls\r\n".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "terminalResponse");
        assert_eq!(json["data"]["id"], "t1");
    }

    #[test]
    fn test_reply_shape() {
        let reply = Outbound::Reply(Reply::ok(9, Response::Target { found: false }));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["data"]["id"], 9);
        assert_eq!(json["data"]["result"]["ok"]["type"], "target");
        assert_eq!(json["data"]["result"]["ok"]["data"]["found"], false);
    }

    #[test]
    fn test_app_created_at_is_camel_case() {
        let response = Response::AppCreatedAt {
            success: true,
            created_at: Some("2024-05-01T00:00:00Z".to_string()),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["data"]["createdAt"], "2024-05-01T00:00:00Z");
    }

    #[test]
    fn test_event_names_match_wire_tags() {
        let requests = vec![
            Request::Heartbeat,
            Request::DownloadFiles,
            Request::GetAppExists(AppQuery {
                app_name: "demo".to_string(),
            }),
            Request::CloseTerminal(TerminalTarget {
                id: "1".to_string(),
            }),
        ];
        for request in requests {
            let json = serde_json::to_value(&request).unwrap();
            assert_eq!(json["event"], request.event_name());
        }
    }
}
