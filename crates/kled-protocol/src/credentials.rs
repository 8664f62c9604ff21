//! Credential exchange types.
//!
//! A credential exchange is one request and one response on a fresh
//! `credentials` channel, opened by the downstream hop.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Git credentials in the shape of the git credential-helper protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl GitCredentials {
    /// Parse `key=value` lines as written by git to a credential helper.
    pub fn parse(text: &str) -> Self {
        let mut creds = GitCredentials::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = Some(value.to_string());
            match key.trim() {
                "protocol" => creds.protocol = value,
                "host" => creds.host = value,
                "path" => creds.path = value,
                "username" => creds.username = value,
                "password" => creds.password = value,
                _ => {}
            }
        }
        creds
    }

    /// Format as `key=value` lines, terminated by a blank line.
    pub fn to_helper_format(&self) -> String {
        let mut out = String::new();
        let fields = [
            ("protocol", &self.protocol),
            ("host", &self.host),
            ("path", &self.path),
            ("username", &self.username),
            ("password", &self.password),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }

    /// Whether a username or password was resolved.
    pub fn is_resolved(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

/// Docker credentials in the credential-helper wire shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DockerCredentials {
    #[serde(rename = "ServerURL")]
    pub server_url: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Secret")]
    pub secret: String,
}

/// Request sent from an inner hop to its upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRequest {
    /// Resolve git credentials for a protocol/host/path.
    Git { query: GitCredentials },
    /// Resolve docker credentials for one registry.
    Docker { server_url: String },
    /// List registries with known credentials.
    DockerList,
    /// Sign a buffer with the user's SSH key (git commit signing).
    SshSignature {
        namespace: String,
        public_key: String,
        /// base64 encoded content to sign
        content: String,
    },
}

impl CredentialRequest {
    /// Build a signature request from raw bytes.
    pub fn ssh_signature(namespace: &str, public_key: &str, content: &[u8]) -> Self {
        CredentialRequest::SshSignature {
            namespace: namespace.to_string(),
            public_key: public_key.to_string(),
            content: encode_signature_content(content),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialRequest::Git { .. } => "git",
            CredentialRequest::Docker { .. } => "docker",
            CredentialRequest::DockerList => "docker-list",
            CredentialRequest::SshSignature { .. } => "ssh-signature",
        }
    }
}

/// Encode a buffer for [`CredentialRequest::SshSignature`].
pub fn encode_signature_content(content: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(content)
}

/// Decode the content of an [`CredentialRequest::SshSignature`].
pub fn decode_signature_content(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(content)
}

/// Response to a [`CredentialRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialResponse {
    Git { credentials: GitCredentials },
    Docker { credentials: DockerCredentials },
    DockerList { registries: BTreeMap<String, String> },
    Signature { signature: String },
    /// Nothing known for the query.
    NotFound,
    /// Forwarding of this type is switched off upstream.
    Disabled,
    Error { message: String },
}

/// What a git answer is cached under. Queries that differ in any of these
/// fields may resolve to different accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GitKey {
    protocol: Option<String>,
    host: String,
    path: Option<String>,
    username: Option<String>,
}

impl GitKey {
    fn of(query: &GitCredentials) -> Option<Self> {
        Some(Self {
            protocol: query.protocol.clone(),
            host: query.host.clone()?,
            path: query.path.clone(),
            username: query.username.clone(),
        })
    }
}

/// Credentials resolved during one session, held in memory only.
#[derive(Debug, Default)]
pub struct CredentialBundle {
    git: HashMap<GitKey, GitCredentials>,
    docker: HashMap<String, DockerCredentials>,
    /// Path of the forwarded SSH agent socket, if any.
    pub ssh_auth_sock: Option<String>,
    /// Managed-platform token, if the user is platform authenticated.
    pub platform_token: Option<String>,
}

impl CredentialBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The answer cached for `query`. Queries without a host are never
    /// cached.
    pub fn git(&self, query: &GitCredentials) -> Option<&GitCredentials> {
        self.git.get(&GitKey::of(query)?)
    }

    /// Cache `creds` as the answer to `query`.
    pub fn insert_git(&mut self, query: &GitCredentials, creds: GitCredentials) {
        if let Some(key) = GitKey::of(query) {
            self.git.insert(key, creds);
        }
    }

    pub fn docker(&self, server_url: &str) -> Option<&DockerCredentials> {
        self.docker.get(server_url)
    }

    pub fn insert_docker(&mut self, creds: DockerCredentials) {
        self.docker.insert(creds.server_url.clone(), creds);
    }

    /// Drop everything resolved so far.
    pub fn clear(&mut self) {
        self.git.clear();
        self.docker.clear();
        self.ssh_auth_sock = None;
        self.platform_token = None;
    }

    pub fn is_empty(&self) -> bool {
        self.git.is_empty()
            && self.docker.is_empty()
            && self.ssh_auth_sock.is_none()
            && self.platform_token.is_none()
    }
}
