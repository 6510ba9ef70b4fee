//! WebSocket upgrade authorization.
//!
//! Clients connect to `/?userId=..&projectId=..`. The pair is checked
//! against the [`UserDirectory`] inside the upgrade callback, so a refused
//! client gets a plain HTTP 401 and never reaches a project session.

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use super::TransportError;
use crate::store::{ProjectRecord, UserDirectory};

/// Identity claimed in the upgrade query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeQuery {
    pub user_id: String,
    pub project_id: String,
}

/// An authorized connection.
#[derive(Debug, Clone)]
pub struct Admission {
    pub user_id: String,
    pub record: ProjectRecord,
    pub is_owner: bool,
}

/// Reads `userId` and `projectId` from a query string.
pub fn parse_query(query: Option<&str>) -> Result<HandshakeQuery, TransportError> {
    let mut user_id = None;
    let mut project_id = None;
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "userId" if !value.is_empty() => user_id = Some(value.into_owned()),
            "projectId" if !value.is_empty() => project_id = Some(value.into_owned()),
            _ => {}
        }
    }

    match (user_id, project_id) {
        (Some(user_id), Some(project_id)) => Ok(HandshakeQuery {
            user_id,
            project_id,
        }),
        _ => Err(TransportError::Authentication(
            "userId and projectId are required".to_string(),
        )),
    }
}

/// Checks the claimed identity against the directory.
pub fn authorize(directory: &dyn UserDirectory, query: HandshakeQuery) -> Result<Admission, TransportError> {
    let record = directory
        .authorize(&query.user_id, &query.project_id)
        .map_err(|e| TransportError::Authentication(e.to_string()))?
        .ok_or_else(|| {
            TransportError::Authentication(format!(
                "{} may not open project {}",
                query.user_id, query.project_id
            ))
        })?;
    let is_owner = record.is_owner(&query.user_id);
    Ok(Admission {
        user_id: query.user_id,
        record,
        is_owner,
    })
}

/// Upgrade callback body: admits the request or answers 401.
pub(crate) fn check_upgrade(
    directory: &dyn UserDirectory,
    request: &Request,
    response: Response,
    admitted: &mut Option<Admission>,
) -> Result<Response, ErrorResponse> {
    match parse_query(request.uri().query()).and_then(|query| authorize(directory, query)) {
        Ok(admission) => {
            *admitted = Some(admission);
            Ok(response)
        }
        Err(e) => {
            tracing::info!(uri = %request.uri(), error = %e, "Refusing WebSocket upgrade");
            let mut refusal = ErrorResponse::new(Some(e.to_string()));
            *refusal.status_mut() = StatusCode::UNAUTHORIZED;
            Err(refusal)
        }
    }
}
