// SSH transport over russh. One pooled session per host, guarded by a
// mutex; the initial connection is retried with a fixed delay. Password
// and key authentication follow the host entry (the config layer enforces
// exactly-one). Host-key policy comes from ssh_settings.auto_add_hosts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use tokio::sync::Mutex;

use crate::config::{Host, SshSettings};
use crate::errors::TransportError;

use super::{CommandOutput, Transport};

struct ClientHandler {
    accept_unknown: bool,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // auto_add_hosts: accept unseen keys; otherwise reject anything
        // we cannot verify.
        Ok(self.accept_unknown)
    }
}

pub struct SshTransport {
    settings: SshSettings,
    sessions: Mutex<HashMap<String, client::Handle<ClientHandler>>>,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn connect(&self, host: &Host) -> Result<client::Handle<ClientHandler>, TransportError> {
        let hostname = host.hostname.clone().ok_or_else(|| TransportError::Connect {
            host: host.name.clone(),
            port: host.port,
            attempts: 0,
            reason: "host entry has no hostname".to_string(),
        })?;
        let user = host.username.clone().unwrap_or_else(|| "root".to_string());
        let config = Arc::new(client::Config::default());

        let mut last_error = String::new();
        for attempt in 1..=self.settings.max_retries.max(1) {
            let handler = ClientHandler {
                accept_unknown: self.settings.auto_add_hosts,
            };
            match client::connect(Arc::clone(&config), (hostname.as_str(), host.port), handler)
                .await
            {
                Ok(mut handle) => {
                    let authenticated = if let Some(password) = &host.password {
                        handle
                            .authenticate_password(&user, password)
                            .await
                            .map_err(|e| TransportError::Session(e.to_string()))?
                    } else if let Some(key_path) = &host.key_path {
                        let key = russh_keys::load_secret_key(key_path, None)
                            .map_err(|e| TransportError::Session(e.to_string()))?;
                        handle
                            .authenticate_publickey(&user, Arc::new(key))
                            .await
                            .map_err(|e| TransportError::Session(e.to_string()))?
                    } else {
                        false
                    };

                    if !authenticated {
                        return Err(TransportError::Auth {
                            user,
                            host: hostname,
                        });
                    }
                    tracing::info!(host = %host.name, attempt, "ssh session established");
                    return Ok(handle);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        host = %host.name,
                        attempt,
                        max = self.settings.max_retries,
                        error = %last_error,
                        "ssh connect failed"
                    );
                    if attempt < self.settings.max_retries {
                        tokio::time::sleep(Duration::from_secs(self.settings.retry_delay)).await;
                    }
                }
            }
        }

        Err(TransportError::Connect {
            host: hostname,
            port: host.port,
            attempts: self.settings.max_retries,
            reason: last_error,
        })
    }

    async fn run(
        handle: &mut client::Handle<ClientHandler>,
        command: &str,
    ) -> Result<(String, String, i32), TransportError> {
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Session(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Session(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = -1;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i32,
                _ => {}
            }
        }

        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        ))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute(&self, command: &str, host: &Host) -> Result<CommandOutput, TransportError> {
        tracing::debug!(host = %host.name, %command, "ssh exec");
        let started = Instant::now();
        let timeout = Duration::from_secs(self.settings.timeout);

        // The pool lock covers the whole exec; sessions are never shared
        // across concurrent callers.
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(&host.name) {
            let handle = self.connect(host).await?;
            sessions.insert(host.name.clone(), handle);
        }
        let handle = sessions.get_mut(&host.name).expect("session just inserted");

        let result = tokio::time::timeout(timeout, Self::run(handle, command)).await;
        match result {
            Ok(Ok((stdout, stderr, exit_code))) => Ok(CommandOutput {
                stdout,
                stderr,
                exit_code,
                duration: started.elapsed(),
            }),
            Ok(Err(e)) => {
                // A broken channel poisons the pooled session; drop it so
                // the next call reconnects.
                sessions.remove(&host.name);
                Err(e)
            }
            Err(_) => {
                sessions.remove(&host.name);
                Err(TransportError::Timeout {
                    seconds: self.settings.timeout,
                })
            }
        }
    }
}
