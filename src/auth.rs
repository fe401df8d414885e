use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::openai_error_response;

/// Caller credential as found in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    Missing,
    Malformed,
    Bearer(&'a str),
}

/// Accepts exactly `Bearer <token>`; anything else is malformed.
pub fn parse_credential(headers: &HeaderMap) -> Credential<'_> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Credential::Missing;
    };
    let Ok(raw) = value.to_str() else {
        return Credential::Malformed;
    };
    if raw.is_empty() {
        return Credential::Missing;
    }

    let mut parts = raw.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) => Credential::Bearer(token),
        _ => Credential::Malformed,
    }
}

/// Short, log-safe prefix of an API key.
pub(crate) fn mask_api_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{prefix}***")
}

#[derive(Debug, thiserror::Error)]
pub enum ApiKeysError {
    #[error("failed to read API key file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse API key file")]
    Parse(#[from] serde_yaml::Error),
}

/// The set of caller keys allowed through the proxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiKeys {
    #[serde(rename = "api_keys", default)]
    keys: HashSet<String>,
}

impl ApiKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ApiKeysError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ApiKeysError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ApiKeysError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub async fn require_api_key(
    State(keys): State<Arc<ApiKeys>>,
    request: Request,
    next: Next,
) -> Response {
    let rejection = match parse_credential(request.headers()) {
        Credential::Bearer(token) if keys.contains(token) => None,
        Credential::Bearer(token) => {
            tracing::debug!(api_key = %mask_api_key(token), "rejected unknown API key");
            Some("Invalid API key")
        }
        Credential::Missing => Some("Missing API key"),
        Credential::Malformed => Some("Invalid Authorization header format"),
    };

    match rejection {
        None => next.run(request).await,
        Some(message) => {
            openai_error_response(StatusCode::UNAUTHORIZED, "unauthorized", message, None, None)
        }
    }
}
