//! SSH remote session
//!
//! One russh client connection shared by every task. Each remote command
//! gets its own session channel with an `exec` request.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect, Sig};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::command::SafeMode;
use crate::config::{AuthMethod, ConnectionConfig};
use crate::error::{HarnessError, Result};
use crate::exec::{CommandRunner, ExitStatus, ProcessEvent, RemoteProcess};
use crate::paths;

/// Authenticated SSH connection able to run remote commands
pub struct RemoteSession {
    handle: Handle<ClientHandler>,
    addr: String,
    safe_mode: SafeMode,
}

/// Why a single connect attempt failed
enum AttemptError {
    /// Worth retrying (network, timeout, transport)
    Transient(String),
    /// Retrying will not help (auth or host key rejected)
    Fatal(HarnessError),
}

impl RemoteSession {
    /// Connect and authenticate, retrying transient failures with backoff
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let addr = config.addr();
        let mut backoff = Backoff::new(config.connect_attempts);

        loop {
            match Self::try_connect(config).await {
                Ok(session) => return Ok(session),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(reason)) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            addr = %addr,
                            attempt = backoff.attempts_made() - 1,
                            delay_ms = delay.as_millis() as u64,
                            "connect failed: {}, retrying",
                            reason
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(HarnessError::Connect {
                            addr,
                            attempts: backoff.attempts_made(),
                            reason,
                        })
                    }
                },
            }
        }
    }

    async fn try_connect(config: &ConnectionConfig) -> Result<Self, AttemptError> {
        let addr = config.addr();
        let rejected = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            accept_any: config.accept_any_host_key,
            pinned: config.host_key_fingerprints.clone(),
            rejected: rejected.clone(),
        };

        let russh_config = Arc::new(client::Config::default());
        let connecting = client::connect(russh_config, addr.as_str(), handler);
        let mut handle = match tokio::time::timeout(config.connect_timeout(), connecting).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let fingerprint = rejected.lock().ok().and_then(|mut slot| slot.take());
                return Err(match fingerprint {
                    Some(fingerprint) => {
                        AttemptError::Fatal(HarnessError::HostKeyRejected { fingerprint })
                    }
                    None => AttemptError::Transient(e.to_string()),
                });
            }
            Err(_) => {
                return Err(AttemptError::Transient(format!(
                    "timed out after {}ms",
                    config.connect_timeout_ms
                )))
            }
        };

        authenticate(&mut handle, config).await?;
        info!(addr = %addr, user = %config.user, auth = config.auth.as_str(), "session established");

        Ok(Self {
            handle,
            addr,
            safe_mode: SafeMode::default(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Let command lines through to the remote shell unescaped
    pub fn disable_safe_mode(&mut self) {
        debug!("safe mode disabled");
        self.safe_mode = SafeMode::Disabled;
    }

    pub fn enable_safe_mode(&mut self) {
        self.safe_mode = SafeMode::Enabled;
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "done", "en")
            .await?;
        info!(addr = %self.addr, "session closed");
        Ok(())
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &ConnectionConfig,
) -> Result<(), AttemptError> {
    fn transient(what: &str, e: &dyn std::fmt::Display) -> AttemptError {
        AttemptError::Transient(format!("{} authentication failed: {}", what, e))
    }

    let user = config.user.as_str();

    let accepted = match config.auth {
        AuthMethod::Agent => {
            let mut agent = AgentClient::connect_env()
                .await
                .map_err(|e| AttemptError::Fatal(HarnessError::AuthRejected {
                    user: user.to_string(),
                    method: format!("agent unavailable: {}", e),
                }))?;
            let identities = agent
                .request_identities()
                .await
                .map_err(|e| transient("agent", &e))?;

            let mut accepted = false;
            for pubkey in identities {
                let result = handle
                    .authenticate_publickey_with(user, pubkey, None, &mut agent)
                    .await
                    .map_err(|e| transient("agent", &e))?;
                if result.success() {
                    accepted = true;
                    break;
                }
            }
            accepted
        }
        AuthMethod::Key => {
            let key = load_private_key(&config.key_path).map_err(AttemptError::Fatal)?;
            let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(user, key_with_alg)
                .await
                .map_err(|e| transient("key", &e))?
                .success()
        }
        AuthMethod::Password => {
            let password = config.password.clone().unwrap_or_default();
            handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| transient("password", &e))?
                .success()
        }
        AuthMethod::None => handle
            .authenticate_none(user)
            .await
            .map_err(|e| transient("none", &e))?
            .success(),
    };

    if accepted {
        Ok(())
    } else {
        Err(AttemptError::Fatal(HarnessError::AuthRejected {
            user: user.to_string(),
            method: config.auth.as_str().to_string(),
        }))
    }
}

/// Load a private key from a file path
fn load_private_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    let expanded = paths::expand_tilde(path);
    let key_str = std::fs::read_to_string(&expanded).map_err(|source| HarnessError::Io {
        path: expanded.clone(),
        source,
    })?;

    russh::keys::decode_secret_key(&key_str, None).map_err(|e| {
        HarnessError::Config(format!("failed to decode {}: {}", expanded.display(), e))
    })
}

#[async_trait]
impl CommandRunner for RemoteSession {
    fn safe_mode(&self) -> SafeMode {
        self.safe_mode
    }

    async fn start(&self, command: &str) -> Result<Box<dyn RemoteProcess>> {
        let channel = self.handle.channel_open_session().await?;
        channel.exec(false, command).await?;
        debug!(addr = %self.addr, command, "exec sent");
        Ok(Box::new(SshProcess { channel }))
    }
}

/// A remote command running on its own session channel
struct SshProcess {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl RemoteProcess for SshProcess {
    async fn next_event(&mut self) -> Option<ProcessEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ProcessEvent::Stdout(data.to_vec())),
                // ext 1 is SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Some(ProcessEvent::Stderr(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ProcessEvent::Exit(ExitStatus::Code(exit_status)))
                }
                ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    ..
                } => {
                    return Some(ProcessEvent::Exit(ExitStatus::Signal {
                        name: signal_label(&signal_name),
                        core_dumped,
                    }))
                }
                ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        // Many sshd builds ignore signal requests; closing the channel is what counts
        if let Err(e) = self.channel.signal(Sig::TERM).await {
            debug!("signal request failed: {}", e);
        }
        self.channel.close().await?;
        Ok(())
    }
}

fn signal_label(sig: &Sig) -> String {
    match sig {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

/// Client handler that applies the host key policy
struct ClientHandler {
    accept_any: bool,
    pinned: Vec<String>,
    /// Fingerprint of a rejected key, so connect can report it
    rejected: Arc<Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let accepted = host_key_accepted(self.accept_any, &self.pinned, &fingerprint);
        if accepted {
            debug!(%fingerprint, "host key accepted");
        } else {
            warn!(%fingerprint, "host key not pinned, refusing");
            if let Ok(mut slot) = self.rejected.lock() {
                *slot = Some(fingerprint);
            }
        }
        async move { Ok(accepted) }
    }
}

fn host_key_accepted(accept_any: bool, pinned: &[String], fingerprint: &str) -> bool {
    accept_any || pinned.iter().any(|p| p.trim() == fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_any_ignores_pins() {
        assert!(host_key_accepted(true, &[], "SHA256:abc"));
    }

    #[test]
    fn test_pinned_fingerprint_matches() {
        let pinned = vec!["SHA256:abc".to_string(), " SHA256:def ".to_string()];
        assert!(host_key_accepted(false, &pinned, "SHA256:def"));
        assert!(!host_key_accepted(false, &pinned, "SHA256:zzz"));
    }

    #[test]
    fn test_signal_label() {
        assert_eq!(signal_label(&Sig::Custom("USR9".to_string())), "USR9");
        assert_eq!(signal_label(&Sig::TERM), "TERM");
    }

    #[test]
    fn test_missing_key_file_is_io_error() {
        let err = load_private_key(Path::new("/nonexistent/id_ed25519")).unwrap_err();
        assert!(matches!(err, HarnessError::Io { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_exhausts_attempts() {
        // Port 1 on loopback refuses connections immediately
        let config = ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_attempts: 2,
            connect_timeout_ms: 2_000,
            ..Default::default()
        };
        match RemoteSession::connect(&config).await {
            Err(HarnessError::Connect { attempts, .. }) => assert_eq!(attempts, 2),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
