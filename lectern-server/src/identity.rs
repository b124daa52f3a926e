//! Handshake parsing and identity resolution.
//!
//! Clients connect to `/ws/sessions/{session_id}?participant_id=..&user_id=..&name=..&role=..`.
//! The [`IdentityResolver`] turns the query into an [`Identity`] the hub
//! trusts as given.

use std::collections::HashMap;

use lectern_hub::protocol::{ParticipantId, Role, SessionId, UserId};

const SESSION_PATH_PREFIX: &str = "/ws/sessions/";

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub user_id: UserId,
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn is_teacher(&self) -> bool {
        self.role.is_teacher()
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("no session at {0}")]
    UnknownPath(String),
    #[error("missing query parameter {0}")]
    MissingParam(&'static str),
    #[error("invalid query parameter {name}={value:?}")]
    InvalidParam { name: &'static str, value: String },
    #[error("rejected: {0}")]
    Rejected(String),
}

impl HandshakeError {
    /// HTTP status for the handshake response.
    pub fn status(&self) -> u16 {
        match self {
            HandshakeError::UnknownPath(_) => 404,
            HandshakeError::MissingParam(_) | HandshakeError::InvalidParam { .. } => 400,
            HandshakeError::Rejected(_) => 403,
        }
    }
}

/// A parsed upgrade request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    pub query: HashMap<String, String>,
}

impl ConnectRequest {
    /// Parse `/ws/sessions/{id}?k=v&...`. Query values are URL-decoded.
    pub fn parse(target: &str) -> Result<Self, HandshakeError> {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let session_id = path
            .strip_prefix(SESSION_PATH_PREFIX)
            .map(|rest| rest.trim_end_matches('/'))
            .and_then(|id| id.parse::<SessionId>().ok())
            .ok_or_else(|| HandshakeError::UnknownPath(path.to_string()))?;

        let query = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Ok(Self { session_id, query })
    }

    fn param(&self, name: &'static str) -> Result<&str, HandshakeError> {
        self.query
            .get(name)
            .map(String::as_str)
            .ok_or(HandshakeError::MissingParam(name))
    }

    fn id_param(&self, name: &'static str) -> Result<u64, HandshakeError> {
        let raw = self.param(name)?;
        raw.trim()
            .parse()
            .map_err(|_| HandshakeError::InvalidParam {
                name,
                value: raw.to_string(),
            })
    }
}

/// Resolves a connecting caller to an identity. Implementations back onto
/// whatever auth and participant records the deployment has.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, request: &ConnectRequest) -> Result<Identity, HandshakeError>;
}

/// Trusts the handshake query as-is. Development default.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryIdentityResolver;

impl IdentityResolver for QueryIdentityResolver {
    fn resolve(&self, request: &ConnectRequest) -> Result<Identity, HandshakeError> {
        let participant_id = request.id_param("participant_id")?;
        let user_id = request.id_param("user_id")?;
        let name = request
            .query
            .get("name")
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map_or_else(|| format!("User {user_id}"), str::to_string);
        let role = request
            .query
            .get("role")
            .map_or(Role::Student, |r| Role::parse(r));

        Ok(Identity {
            participant_id,
            user_id,
            name,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let request =
            ConnectRequest::parse("/ws/sessions/42?participant_id=7&user_id=70&name=Ms%20Rivera+Lopez")
                .unwrap();
        assert_eq!(request.session_id, 42);
        assert_eq!(request.query["participant_id"], "7");
        assert_eq!(request.query["name"], "Ms Rivera Lopez");
    }

    #[test]
    fn test_parse_rejects_other_paths() {
        for target in ["/", "/ws/sessions/", "/ws/sessions/abc", "/ws/rooms/1"] {
            let err = ConnectRequest::parse(target).unwrap_err();
            assert_eq!(err.status(), 404, "{target}");
        }
        assert!(ConnectRequest::parse("/ws/sessions/5/").is_ok());
    }

    #[test]
    fn test_query_resolver() {
        let request =
            ConnectRequest::parse("/ws/sessions/1?participant_id=3&user_id=30&role=Teacher").unwrap();
        let identity = QueryIdentityResolver.resolve(&request).unwrap();
        assert_eq!(
            identity,
            Identity {
                participant_id: 3,
                user_id: 30,
                name: "User 30".into(),
                role: Role::Teacher,
            }
        );
        assert!(identity.is_teacher());
    }

    #[test]
    fn test_query_resolver_errors() {
        let missing = ConnectRequest::parse("/ws/sessions/1?user_id=30").unwrap();
        assert_eq!(
            QueryIdentityResolver.resolve(&missing).unwrap_err(),
            HandshakeError::MissingParam("participant_id")
        );

        let invalid = ConnectRequest::parse("/ws/sessions/1?participant_id=x&user_id=30").unwrap();
        let err = QueryIdentityResolver.resolve(&invalid).unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
