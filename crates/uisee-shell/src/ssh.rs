//! Remote shell over an SSH session.
//!
//! One authenticated session is opened on first use and kept; each command
//! runs on its own exec channel. A cached session that can no longer open a
//! channel is replaced once, before the command is sent.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client};
use russh_keys::key;
use tokio::sync::Mutex;
use uisee_core::{CommandError, RemoteShell, ShellCredential, ShellOutput, ShellTarget};

/// Extended-data stream code for stderr.
const STDERR_STREAM: u32 = 1;

/// Client handler; host keys are accepted and logged.
struct DeviceHost;

#[async_trait]
impl client::Handler for DeviceHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(fingerprint = %server_public_key.fingerprint(), "Accepting host key");
        Ok(true)
    }
}

type Session = client::Handle<DeviceHost>;

/// Credential in the form the session authenticates with.
enum Auth {
    Password(String),
    Key(Arc<key::KeyPair>),
}

/// [`RemoteShell`] backed by a persistent SSH session.
///
/// No retry: a failed command is reported once.
pub struct SshShell {
    target: ShellTarget,
    connect_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for SshShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshShell")
            .field("target", &self.target)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl SshShell {
    #[must_use]
    pub fn new(target: ShellTarget) -> Self {
        Self {
            target,
            connect_timeout: Duration::from_secs(10),
            session: Mutex::new(None),
        }
    }

    /// Bound for TCP connect, key exchange and authentication together.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn target(&self) -> &ShellTarget {
        &self.target
    }

    /// Whether an authenticated session is cached.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    fn auth(&self) -> Result<Auth, CommandError> {
        match &self.target.credential {
            Some(ShellCredential::Password(password)) => Ok(Auth::Password(password.clone())),
            Some(ShellCredential::KeyFile(path)) => russh_keys::load_secret_key(path, None)
                .map(|pair| Auth::Key(Arc::new(pair)))
                .map_err(|e| {
                    CommandError::Credentials(format!("cannot load key {}: {e}", path.display()))
                }),
            None => Err(CommandError::Credentials("missing password or key".into())),
        }
    }

    /// Connect and authenticate a new session.
    async fn open(&self) -> Result<Session, CommandError> {
        let auth = self.auth()?;
        let destination = self.target.destination();
        tracing::info!(destination = %destination, port = self.target.port, "Opening SSH session");

        let handshake = async {
            let config = Arc::new(client::Config::default());
            let mut session = client::connect(
                config,
                (self.target.host.as_str(), self.target.port),
                DeviceHost,
            )
            .await
            .map_err(|e| CommandError::Transmission(format!("cannot connect to {destination}: {e}")))?;

            let user = self.target.user.as_str();
            let accepted = match auth {
                Auth::Password(password) => session.authenticate_password(user, password).await,
                Auth::Key(pair) => session.authenticate_publickey(user, pair).await,
            }
            .map_err(|e| {
                CommandError::Transmission(format!("authentication with {destination} failed: {e}"))
            })?;
            if !accepted {
                return Err(CommandError::Credentials(format!(
                    "{destination} rejected the credentials"
                )));
            }
            Ok::<_, CommandError>(session)
        };

        let session = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                CommandError::Transmission(format!(
                    "SSH handshake with {destination} timed out after {}s",
                    self.connect_timeout.as_secs_f64()
                ))
            })??;
        tracing::info!(destination = %destination, "SSH session established");
        Ok(session)
    }

    /// Disconnect the cached session, if any. Idempotent.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                tracing::debug!("SSH disconnect not delivered: {e}");
            }
            tracing::info!("SSH session closed");
        }
    }
}

/// Run `command` on an open channel and collect both streams until it closes.
async fn collect(
    mut channel: russh::Channel<client::Msg>,
    command: &str,
) -> Result<ShellOutput, russh::Error> {
    channel.exec(true, command).await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                stderr.extend_from_slice(data);
            }
            ChannelMsg::ExitStatus { exit_status } => exit_code = i32::try_from(exit_status).ok(),
            _ => {}
        }
    }
    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str) -> Result<ShellOutput, CommandError> {
        self.target.validate()?;

        let channel = {
            let mut slot = self.session.lock().await;
            let cached = match slot.take() {
                Some(session) => match session.channel_open_session().await {
                    Ok(channel) => Some((session, channel)),
                    Err(e) => {
                        tracing::warn!("Cached SSH session unusable ({e}); reconnecting");
                        None
                    }
                },
                None => None,
            };
            let (session, channel) = match cached {
                Some(pair) => pair,
                None => {
                    let session = self.open().await?;
                    let channel = session.channel_open_session().await.map_err(|e| {
                        CommandError::Transmission(format!("cannot open SSH channel: {e}"))
                    })?;
                    (session, channel)
                }
            };
            *slot = Some(session);
            channel
        };

        tracing::debug!(destination = %self.target.destination(), command, "Running remote command");
        let result = collect(channel, command)
            .await
            .map_err(|e| CommandError::RemoteExec(format!("SSH channel failed: {e}")))?;
        tracing::debug!(
            exit_code = ?result.exit_code,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "Remote command finished"
        );
        Ok(result)
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_fail_fast() {
        let shell = SshShell::new(ShellTarget::new("device", "pi"));
        let err = shell.run("uptime").await.unwrap_err();
        assert_eq!(
            err,
            CommandError::Credentials("missing password or key".into())
        );

        let shell = SshShell::new(
            ShellTarget::new("", "").with_credential(ShellCredential::Password(String::new())),
        );
        let err = shell.exec("uptime").await.unwrap_err();
        assert!(err.to_string().contains("host, user, password"));
        assert!(!shell.is_connected().await);
    }

    #[tokio::test]
    async fn test_unreadable_key_fails_before_connecting() {
        let target = ShellTarget::new("192.0.2.1", "pi")
            .with_credential(ShellCredential::KeyFile(PathBuf::from("/nonexistent/id_ed25519")));
        let err = SshShell::new(target).run("uptime").await.unwrap_err();
        assert!(matches!(err, CommandError::Credentials(ref m) if m.contains("/nonexistent/id_ed25519")));
    }

    #[tokio::test]
    async fn test_password_session_needs_no_external_program() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut target = ShellTarget::new("127.0.0.1", "root")
            .with_credential(ShellCredential::Password("hunter2".into()));
        target.port = port;
        let shell = SshShell::new(target).with_connect_timeout(Duration::from_secs(2));

        let message = match shell.run("uptime").await {
            Err(CommandError::Transmission(message)) => message,
            other => panic!("expected a connection error, got {other:?}"),
        };
        assert!(message.contains("root@127.0.0.1"), "{message}");
        assert!(!message.contains("hunter2"));
        assert!(!shell.is_connected().await);
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the socket without ever sending an SSH banner.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut target = ShellTarget::new("127.0.0.1", "pi")
            .with_credential(ShellCredential::Password("pw".into()));
        target.port = port;
        let shell = SshShell::new(target).with_connect_timeout(Duration::from_millis(300));

        let err = shell.run("uptime").await.unwrap_err();
        assert!(matches!(err, CommandError::Transmission(ref m) if m.contains("timed out")));
        server.abort();
    }

    #[test]
    fn test_debug_hides_password() {
        let shell = SshShell::new(
            ShellTarget::new("device", "root")
                .with_credential(ShellCredential::Password("hunter2".into())),
        );
        let text = format!("{shell:?}");
        assert!(text.contains("device"));
        assert!(!text.contains("hunter2"));
    }
}
