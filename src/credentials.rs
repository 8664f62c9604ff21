//! Credential resolution on the user's machine.
//!
//! Inner hops open a `credentials` channel per request; [`serve_credentials`]
//! answers each from a [`CredentialSource`]. Request types the user has not
//! enabled are refused here as well, so a misconfigured container cannot
//! pull credentials it was not granted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use kled_protocol::{
    channels, credentials::decode_signature_content, CredentialRequest, CredentialResponse,
    DockerCredentials, ForwardingFeatures, GitCredentials, MessageChannel, Mux,
};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Resolves credential requests.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self, request: &CredentialRequest) -> CredentialResponse;
}

/// Answer credential channels opened by the inner hops until the mux closes.
pub async fn serve_credentials(
    mux: Mux,
    features: ForwardingFeatures,
    source: Arc<dyn CredentialSource>,
) {
    while let Some(channel) = mux.accept().await {
        if channel.kind() != channels::CREDENTIALS {
            warn!(kind = channel.kind(), "unexpected channel from agent, closing");
            channel.close().await;
            continue;
        }
        let source = source.clone();
        tokio::spawn(async move {
            let mut exchange = MessageChannel::new(channel);
            if let Err(e) = answer(&mut exchange, features, source.as_ref()).await {
                debug!(error = %e, "credential exchange failed");
            }
            exchange.close().await;
        });
    }
}

async fn answer(
    exchange: &mut MessageChannel,
    features: ForwardingFeatures,
    source: &dyn CredentialSource,
) -> Result<()> {
    let Some(request) = exchange.recv::<CredentialRequest>().await? else {
        return Ok(());
    };
    let response = if features.allows(&request) {
        debug!(kind = request.kind(), "resolving credentials");
        source.resolve(&request).await
    } else {
        debug!(kind = request.kind(), "credential forwarding disabled");
        CredentialResponse::Disabled
    };
    exchange.send(&response).await?;
    Ok(())
}

// ============================================================================
// Local resolution
// ============================================================================

/// Resolves from the local git, docker and ssh tooling.
#[derive(Debug, Clone)]
pub struct LocalCredentials {
    docker_config_dir: PathBuf,
}

impl Default for LocalCredentials {
    fn default() -> Self {
        let docker_config_dir = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))
            .unwrap_or_else(|| PathBuf::from(".docker"));
        Self { docker_config_dir }
    }
}

impl LocalCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docker_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.docker_config_dir = dir.into();
        self
    }

    async fn git(&self, query: &GitCredentials) -> Result<CredentialResponse> {
        let argv = ["git".to_string(), "credential".into(), "fill".into()];
        let input = query.to_helper_format();
        let output = match pipe(&argv, input.as_bytes(), &[("GIT_TERMINAL_PROMPT", "0")]).await {
            Ok(output) => output,
            // fill exits non-zero when no helper knows the host
            Err(e) => {
                debug!(error = %e, "git credential fill returned nothing");
                return Ok(CredentialResponse::NotFound);
            }
        };
        let credentials = GitCredentials::parse(&output);
        Ok(if credentials.is_resolved() {
            CredentialResponse::Git { credentials }
        } else {
            CredentialResponse::NotFound
        })
    }

    fn docker_config(&self) -> Result<DockerConfig> {
        let path = self.docker_config_dir.join("config.json");
        Ok(crate::util::read_json::<DockerConfig>(&path)?.unwrap_or_default())
    }

    async fn docker(&self, server_url: &str) -> Result<CredentialResponse> {
        let config = self.docker_config()?;

        if let Some(helper) = config.cred_helpers.get(server_url) {
            return docker_helper_get(helper, server_url).await;
        }
        if let Some(credentials) = config
            .auths
            .get(server_url)
            .and_then(|entry| entry.decode(server_url))
        {
            return Ok(CredentialResponse::Docker { credentials });
        }
        match &config.creds_store {
            Some(store) => docker_helper_get(store, server_url).await,
            None => Ok(CredentialResponse::NotFound),
        }
    }

    async fn docker_list(&self) -> Result<CredentialResponse> {
        let config = self.docker_config()?;
        let mut registries = BTreeMap::new();

        if let Some(store) = &config.creds_store {
            let argv = [format!("docker-credential-{}", store), "list".to_string()];
            match pipe(&argv, b"", &[]).await {
                Ok(output) => {
                    let listed: BTreeMap<String, String> =
                        serde_json::from_str(&output).unwrap_or_default();
                    registries.extend(listed);
                }
                Err(e) => debug!(error = %e, "credential store list failed"),
            }
        }
        for (server, entry) in &config.auths {
            if let Some(credentials) = entry.decode(server) {
                registries.insert(server.clone(), credentials.username);
            }
        }
        Ok(CredentialResponse::DockerList { registries })
    }

    async fn sign(
        &self,
        namespace: &str,
        public_key: &str,
        content: &str,
    ) -> Result<CredentialResponse> {
        let content = decode_signature_content(content)
            .map_err(|e| Error::config(format!("invalid signature content: {}", e)))?;

        let dir = tempfile::tempdir()?;
        let key_file = dir.path().join("key.pub");
        let buffer_file = dir.path().join("buffer");
        std::fs::write(&key_file, public_key)?;
        std::fs::write(&buffer_file, &content)?;

        let argv = [
            "ssh-keygen".to_string(),
            "-Y".into(),
            "sign".into(),
            "-n".into(),
            namespace.to_string(),
            "-f".into(),
            key_file.display().to_string(),
            buffer_file.display().to_string(),
        ];
        pipe(&argv, b"", &[]).await?;

        let signature = std::fs::read_to_string(signature_path(&buffer_file))?;
        Ok(CredentialResponse::Signature { signature })
    }
}

#[async_trait]
impl CredentialSource for LocalCredentials {
    async fn resolve(&self, request: &CredentialRequest) -> CredentialResponse {
        let result = match request {
            CredentialRequest::Git { query } => self.git(query).await,
            CredentialRequest::Docker { server_url } => self.docker(server_url).await,
            CredentialRequest::DockerList => self.docker_list().await,
            CredentialRequest::SshSignature {
                namespace,
                public_key,
                content,
            } => self.sign(namespace, public_key, content).await,
        };
        result.unwrap_or_else(|e| {
            warn!(kind = request.kind(), error = %e, "credential lookup failed");
            CredentialResponse::Error {
                message: e.to_string(),
            }
        })
    }
}

fn signature_path(buffer: &Path) -> PathBuf {
    let mut name = buffer.as_os_str().to_owned();
    name.push(".sig");
    PathBuf::from(name)
}

/// The parts of `~/.docker/config.json` that hold credentials.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
    #[serde(default)]
    creds_store: Option<String>,
    #[serde(default)]
    cred_helpers: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
}

impl DockerAuth {
    fn decode(&self, server_url: &str) -> Option<DockerCredentials> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.auth.as_deref()?)
            .ok()?;
        let text = String::from_utf8(raw).ok()?;
        let (username, secret) = text.split_once(':')?;
        Some(DockerCredentials {
            server_url: server_url.to_string(),
            username: username.to_string(),
            secret: secret.to_string(),
        })
    }
}

async fn docker_helper_get(helper: &str, server_url: &str) -> Result<CredentialResponse> {
    let argv = [format!("docker-credential-{}", helper), "get".to_string()];
    match pipe(&argv, server_url.as_bytes(), &[]).await {
        Ok(output) => {
            let mut credentials: DockerCredentials = serde_json::from_str(&output)?;
            if credentials.server_url.is_empty() {
                credentials.server_url = server_url.to_string();
            }
            Ok(CredentialResponse::Docker { credentials })
        }
        // helpers exit non-zero for unknown registries
        Err(e) => {
            debug!(%helper, error = %e, "credential helper returned nothing");
            Ok(CredentialResponse::NotFound)
        }
    }
}

/// Run `argv` with `input` on stdin and return stdout.
async fn pipe(argv: &[String], input: &[u8], env: &[(&str, &str)]) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::config("empty command"))?;
    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter().copied())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::runtime(format!("failed to run {}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::runtime(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kled_protocol::Role;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl CredentialSource for Counting {
        async fn resolve(&self, request: &CredentialRequest) -> CredentialResponse {
            self.0.fetch_add(1, Ordering::SeqCst);
            match request {
                CredentialRequest::Git { query } => CredentialResponse::Git {
                    credentials: GitCredentials {
                        password: Some("token".into()),
                        ..query.clone()
                    },
                },
                _ => CredentialResponse::NotFound,
            }
        }
    }

    fn pair() -> (Mux, Mux) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let (client, _) = Mux::new(a_read, a_write, Role::Initiator);
        let (agent, _) = Mux::new(b_read, b_write, Role::Acceptor);
        (client, agent)
    }

    async fn ask(agent: &Mux, request: CredentialRequest) -> CredentialResponse {
        let channel = agent.open(channels::CREDENTIALS).await.unwrap();
        let mut exchange = MessageChannel::new(channel);
        exchange.send(&request).await.unwrap();
        exchange.recv().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_disabled_types_never_reach_source() {
        let (client, agent) = pair();
        let source = Arc::new(Counting::default());
        let features = ForwardingFeatures {
            git_credentials: true,
            ..Default::default()
        };
        tokio::spawn(serve_credentials(client, features, source.clone()));

        let response = ask(
            &agent,
            CredentialRequest::Docker {
                server_url: "ghcr.io".into(),
            },
        )
        .await;
        assert_eq!(response, CredentialResponse::Disabled);
        assert_eq!(source.0.load(Ordering::SeqCst), 0);

        let query = GitCredentials::parse("protocol=https\nhost=github.com\n");
        let response = ask(&agent, CredentialRequest::Git { query }).await;
        let CredentialResponse::Git { credentials } = response else {
            panic!("expected git credentials");
        };
        assert_eq!(credentials.password.as_deref(), Some("token"));
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_docker_auths_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let auth = base64::engine::general_purpose::STANDARD.encode("me:s3cret");
        std::fs::write(
            dir.path().join("config.json"),
            format!(r#"{{"auths": {{"ghcr.io": {{"auth": "{}"}}}}}}"#, auth),
        )
        .unwrap();
        let local = LocalCredentials::new().with_docker_config_dir(dir.path());

        let response = local
            .resolve(&CredentialRequest::Docker {
                server_url: "ghcr.io".into(),
            })
            .await;
        assert_eq!(
            response,
            CredentialResponse::Docker {
                credentials: DockerCredentials {
                    server_url: "ghcr.io".into(),
                    username: "me".into(),
                    secret: "s3cret".into(),
                }
            }
        );

        let response = local
            .resolve(&CredentialRequest::Docker {
                server_url: "quay.io".into(),
            })
            .await;
        assert_eq!(response, CredentialResponse::NotFound);

        let CredentialResponse::DockerList { registries } =
            local.resolve(&CredentialRequest::DockerList).await
        else {
            panic!("expected registry list");
        };
        assert_eq!(registries.get("ghcr.io").map(String::as_str), Some("me"));
    }

    #[test]
    fn test_signature_path() {
        assert_eq!(
            signature_path(Path::new("/tmp/x/buffer")),
            PathBuf::from("/tmp/x/buffer.sig")
        );
    }
}
