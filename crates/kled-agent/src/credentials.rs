//! Credential forwarding inside the container.
//!
//! Tools in the container (git, docker) call small helper commands, which
//! POST to the credentials server on 127.0.0.1. The server turns each
//! request into a single exchange on a fresh `credentials` channel to the
//! upstream hop, which resolves it from the user's machine.
//!
//! Forwarding is gated per request type: a disabled type is answered with
//! [`CredentialResponse::Disabled`] without ever touching the transport.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use kled_protocol::{
    channels, credentials::encode_signature_content, CredentialBundle, CredentialRequest,
    CredentialResponse, ForwardingFeatures, GitCredentials, MessageChannel, Mux,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Upper bound for one forwarded request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends credential requests upstream over the multiplexed transport.
///
/// Resolved git and docker credentials are kept in memory for the rest of
/// the session and never written to disk.
pub struct CredentialForwarder {
    mux: Mux,
    features: ForwardingFeatures,
    cache: Mutex<CredentialBundle>,
}

impl CredentialForwarder {
    pub fn new(mux: Mux, features: ForwardingFeatures) -> Self {
        Self {
            mux,
            features,
            cache: Mutex::new(CredentialBundle::new()),
        }
    }

    /// Forget everything resolved during this session.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn cached(&self, request: &CredentialRequest) -> Option<CredentialResponse> {
        let cache = self.cache.lock();
        match request {
            CredentialRequest::Git { query } => {
                let credentials = cache.git(query)?.clone();
                Some(CredentialResponse::Git { credentials })
            }
            CredentialRequest::Docker { server_url } => {
                let credentials = cache.docker(server_url)?.clone();
                Some(CredentialResponse::Docker { credentials })
            }
            _ => None,
        }
    }

    fn remember(&self, request: &CredentialRequest, response: &CredentialResponse) {
        let mut cache = self.cache.lock();
        match (request, response) {
            (CredentialRequest::Git { query }, CredentialResponse::Git { credentials })
                if credentials.is_resolved() =>
            {
                cache.insert_git(query, credentials.clone())
            }
            (_, CredentialResponse::Docker { credentials }) => {
                cache.insert_docker(credentials.clone())
            }
            _ => {}
        }
    }

    pub fn features(&self) -> ForwardingFeatures {
        self.features
    }

    /// Forward one request and wait for the answer.
    pub async fn request(&self, request: &CredentialRequest) -> Result<CredentialResponse> {
        if !self.features.allows(request) {
            debug!(kind = request.kind(), "credential forwarding disabled");
            return Ok(CredentialResponse::Disabled);
        }
        if let Some(response) = self.cached(request) {
            return Ok(response);
        }

        let channel = self.mux.open(channels::CREDENTIALS).await?;
        let mut messages = MessageChannel::new(channel);
        messages.send(request).await?;
        let response = messages.recv::<CredentialResponse>().await?;
        messages.close().await;

        let response = response
            .ok_or_else(|| Error::Credentials("upstream closed without answering".into()))?;
        self.remember(request, &response);
        Ok(response)
    }

    async fn forward(&self, request: CredentialRequest) -> CredentialResponse {
        match self.request(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(kind = request.kind(), error = %e, "credential request failed");
                CredentialResponse::Error {
                    message: e.to_string(),
                }
            }
        }
    }
}

// =============================================================================
// HTTP server
// =============================================================================

/// Body of `POST /docker-credentials`. No server URL means "list".
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

/// Body of `POST /git-ssh-signature`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureQuery {
    pub namespace: String,
    pub public_key: String,
    /// base64 encoded buffer
    pub content: String,
}

/// Router for the credentials server.
pub fn credentials_router(forwarder: Arc<CredentialForwarder>) -> Router {
    Router::new()
        .route("/git-credentials", post(git_credentials))
        .route("/docker-credentials", post(docker_credentials))
        .route("/git-ssh-signature", post(git_ssh_signature))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(forwarder)
}

async fn git_credentials(
    State(forwarder): State<Arc<CredentialForwarder>>,
    Json(query): Json<GitCredentials>,
) -> Json<CredentialResponse> {
    Json(forwarder.forward(CredentialRequest::Git { query }).await)
}

async fn docker_credentials(
    State(forwarder): State<Arc<CredentialForwarder>>,
    Json(query): Json<DockerQuery>,
) -> Json<CredentialResponse> {
    let request = match query.server_url {
        Some(server_url) => CredentialRequest::Docker { server_url },
        None => CredentialRequest::DockerList,
    };
    Json(forwarder.forward(request).await)
}

async fn git_ssh_signature(
    State(forwarder): State<Arc<CredentialForwarder>>,
    Json(query): Json<SignatureQuery>,
) -> Json<CredentialResponse> {
    let request = CredentialRequest::SshSignature {
        namespace: query.namespace,
        public_key: query.public_key,
        content: query.content,
    };
    Json(forwarder.forward(request).await)
}

/// Serve the credentials API on `127.0.0.1:port` until `shutdown` resolves.
pub async fn serve<F>(forwarder: Arc<CredentialForwarder>, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "credentials server listening");
    axum::serve(listener, credentials_router(forwarder))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// =============================================================================
// Helper commands
// =============================================================================

/// Blocking client the helper commands use to reach the credentials server.
pub struct HelperClient {
    base: String,
    client: reqwest::blocking::Client,
}

impl HelperClient {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base: format!("http://127.0.0.1:{}", port),
            client,
        })
    }

    fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<CredentialResponse> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()?
            .error_for_status()?;
        Ok(response.json()?)
    }

    /// Git credential-helper operation. Returns what to print on stdout.
    ///
    /// Only `get` resolves anything; `store` and `erase` are accepted and
    /// ignored. Any failure yields `None` so git falls back to prompting.
    pub fn git(&self, operation: &str, input: &str) -> Option<String> {
        if operation != "get" {
            return None;
        }

        let query = GitCredentials::parse(input);
        match self.post("/git-credentials", &query) {
            Ok(CredentialResponse::Git { credentials }) if credentials.is_resolved() => {
                let merged = GitCredentials {
                    protocol: credentials.protocol.or(query.protocol),
                    host: credentials.host.or(query.host),
                    path: credentials.path.or(query.path),
                    username: credentials.username,
                    password: credentials.password,
                };
                Some(merged.to_helper_format())
            }
            Ok(other) => {
                debug!(response = ?other, "no git credentials");
                None
            }
            Err(e) => {
                debug!(error = %e, "git credential lookup failed");
                None
            }
        }
    }

    /// Docker credential-helper operation. Returns what to print on stdout.
    ///
    /// Failures yield `None`; docker then continues without credentials.
    pub fn docker(&self, operation: &str, input: &str) -> Option<String> {
        let query = match operation {
            "get" => DockerQuery {
                server_url: Some(input.trim().to_string()),
            },
            "list" => DockerQuery::default(),
            _ => return None,
        };

        let rendered = match self.post("/docker-credentials", &query) {
            Ok(CredentialResponse::Docker { credentials }) => serde_json::to_string(&credentials),
            Ok(CredentialResponse::DockerList { registries }) => serde_json::to_string(&registries),
            Ok(other) => {
                debug!(response = ?other, "no docker credentials");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "docker credential lookup failed");
                return None;
            }
        };
        rendered.ok()
    }

    /// Sign `buffer` with the key described by `public_key`.
    pub fn sign(&self, namespace: &str, public_key: &str, buffer: &[u8]) -> Result<String> {
        let query = SignatureQuery {
            namespace: namespace.to_string(),
            public_key: public_key.to_string(),
            content: encode_signature_content(buffer),
        };
        match self.post("/git-ssh-signature", &query)? {
            CredentialResponse::Signature { signature } => Ok(signature),
            CredentialResponse::Disabled => {
                Err(Error::Credentials("ssh signature forwarding is disabled".into()))
            }
            CredentialResponse::Error { message } => Err(Error::Credentials(message)),
            other => Err(Error::Credentials(format!("unexpected response: {:?}", other))),
        }
    }
}

/// Arguments of an `ssh-keygen -Y sign` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignArgs {
    pub namespace: String,
    pub key_file: String,
    pub buffer_file: String,
}

/// Parse the arguments git passes to `gpg.ssh.program`.
///
/// Returns `None` for anything other than `-Y sign`.
pub fn parse_sign_args(args: &[String]) -> Option<SignArgs> {
    let mut operation = None;
    let mut namespace = None;
    let mut key_file = None;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-Y" => operation = iter.next(),
            "-n" => namespace = iter.next(),
            "-f" => key_file = iter.next(),
            "-U" | "-q" => {}
            _ => rest.push(arg),
        }
    }

    if operation.map(String::as_str) != Some("sign") {
        return None;
    }
    Some(SignArgs {
        namespace: namespace.cloned().unwrap_or_else(|| "git".to_string()),
        key_file: key_file?.clone(),
        buffer_file: rest.last()?.to_string(),
    })
}

/// Handle a `-Y sign` request: read the key and buffer, write `<buffer>.sig`.
pub fn sign_file(client: &HelperClient, args: &SignArgs) -> Result<()> {
    let public_key = read_public_key(Path::new(&args.key_file))?;
    let buffer = std::fs::read(&args.buffer_file)?;
    let signature = client.sign(&args.namespace, &public_key, &buffer)?;
    std::fs::write(format!("{}.sig", args.buffer_file), signature)?;
    Ok(())
}

fn read_public_key(path: &Path) -> Result<String> {
    // git may pass the key itself instead of a path
    let raw = path.to_string_lossy();
    if raw.starts_with("ssh-") || raw.starts_with("key::") {
        return Ok(raw.trim_start_matches("key::").to_string());
    }
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}
