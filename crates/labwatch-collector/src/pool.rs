/// Warm SSH session pool.
///
/// Handshake plus key auth costs two orders of magnitude more than an exec
/// on an open session, so sessions are kept open between polls, keyed by
/// `"host:port@user"`. A dead entry found on acquire is evicted and
/// replaced with one fresh connect; the failure history itself belongs to
/// the scheduler, not the pool.
///
/// All map mutation happens under a single async mutex, including the
/// connect call. Sessions idle past the TTL are closed by
/// `cleanup_idle()`, driven from the control loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("sftp error: {0}")]
    Sftp(String),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("ssh protocol error: {0}")]
    Protocol(#[from] russh::Error),
}

/// Connection settings shared by every pooled session.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub key_path: PathBuf,
    pub port: u16,
    /// Applied separately to the TCP/banner exchange and to auth
    pub timeout: Duration,
}

/// Accept-any-key handler. Host keys are not pinned: lab images are
/// reprovisioned centrally and their keys rotate with each image.
struct ProbeHandler;

impl client::Handler for ProbeHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Output of a single remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_status: u32,
}

/// A live session checked out of the pool. Cloning the underlying handle
/// is cheap; the pool keeps its own copy for reuse.
#[derive(Clone)]
pub struct SshSession {
    key: String,
    handle: Arc<client::Handle<ProbeHandler>>,
}

impl SshSession {
    /// Pool map key, `"host:port@user"`.
    pub fn pool_key(&self) -> &str {
        &self.key
    }

    pub fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Run one command and capture stdout plus the exit status.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SshError> {
        let run = async {
            let mut channel = self.handle.channel_open_session().await?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| SshError::Channel(format!("exec: {}", e)))?;

            let mut stdout = Vec::new();
            let mut exit_status = 0u32;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status: status } => exit_status = status,
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }
            Ok::<_, SshError>(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                exit_status,
            })
        };
        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| SshError::Timeout("command"))?
    }

    /// Write a file on the remote side over an SFTP subsystem channel.
    pub async fn upload(&self, remote_path: &str, contents: &[u8], timeout: Duration) -> Result<(), SshError> {
        let run = async {
            let channel = self.handle.channel_open_session().await?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| SshError::Channel(format!("sftp subsystem: {}", e)))?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| SshError::Sftp(e.to_string()))?;
            let mut file = sftp
                .create(remote_path)
                .await
                .map_err(|e| SshError::Sftp(format!("create {}: {}", remote_path, e)))?;
            file.write_all(contents)
                .await
                .map_err(|e| SshError::Sftp(format!("write {}: {}", remote_path, e)))?;
            file.shutdown()
                .await
                .map_err(|e| SshError::Sftp(format!("close {}: {}", remote_path, e)))?;
            Ok::<_, SshError>(())
        };
        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| SshError::Timeout("upload"))?
    }

    /// Run several commands in one remote shell invocation, delimiting
    /// each command's output with sentinel markers. Cuts round-trips N:1.
    pub async fn exec_batch(
        &self,
        commands: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HashMap<String, String>, SshError> {
        let script = build_batch_script(commands);
        let output = self.exec(&script, timeout).await?;
        Ok(parse_batch_output(&output.stdout, commands))
    }

    async fn disconnect(self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

fn build_batch_script(commands: &[(&str, &str)]) -> String {
    let mut parts = Vec::with_capacity(commands.len() * 3);
    for (tag, cmd) in commands {
        parts.push(format!("echo \"===START_{}===\"", tag));
        parts.push((*cmd).to_string());
        parts.push(format!("echo \"===END_{}===\"", tag));
    }
    parts.join("; ")
}

fn parse_batch_output(output: &str, commands: &[(&str, &str)]) -> HashMap<String, String> {
    let mut results = HashMap::with_capacity(commands.len());
    for (tag, _) in commands {
        let start_marker = format!("===START_{}===", tag);
        let end_marker = format!("===END_{}===", tag);
        let captured = match (output.find(&start_marker), output.find(&end_marker)) {
            (Some(start), Some(end)) if start + start_marker.len() <= end => {
                output[start + start_marker.len()..end].trim().to_string()
            }
            _ => String::new(),
        };
        results.insert((*tag).to_string(), captured);
    }
    results
}

struct PooledEntry {
    session: SshSession,
    last_used: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub utilization_percent: f64,
}

pub struct SessionPool {
    settings: SshSettings,
    max_connections: usize,
    max_idle: Duration,
    pool: Mutex<HashMap<String, PooledEntry>>,
}

impl SessionPool {
    pub fn new(settings: SshSettings, max_connections: usize, max_idle: Duration) -> Self {
        info!(
            max = max_connections,
            idle_secs = max_idle.as_secs(),
            "session pool initialized"
        );
        Self {
            settings,
            max_connections,
            max_idle,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Defaults from the collector deployment: 100 sessions, 5 minute TTL.
    pub fn with_defaults(settings: SshSettings) -> Self {
        Self::new(settings, 100, Duration::from_secs(300))
    }

    /// Get a live session for `host`, reusing a pooled one when its
    /// transport is still up. A stale entry is evicted and one fresh
    /// connect is attempted in its place.
    pub async fn acquire(&self, host: &str) -> Result<SshSession, SshError> {
        let key = format!("{}:{}@{}", host, self.settings.port, self.settings.user);
        let mut pool = self.pool.lock().await;

        if let Some(entry) = pool.get_mut(&key) {
            if entry.session.is_alive() {
                entry.last_used = Instant::now();
                debug!(host = host, "reusing pooled session");
                return Ok(entry.session.clone());
            }
            warn!(host = host, "stale session in pool, reconnecting");
            if let Some(entry) = pool.remove(&key) {
                entry.session.disconnect().await;
            }
        }

        // Room for the new entry: evict the least-recently-used session
        if pool.len() >= self.max_connections {
            if let Some(oldest) = pool
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                if let Some(entry) = pool.remove(&oldest) {
                    debug!(key = %oldest, "pool full, evicting least-recently-used session");
                    entry.session.disconnect().await;
                }
            }
        }

        let session = self.connect(host, &key).await?;
        pool.insert(
            key,
            PooledEntry {
                session: session.clone(),
                last_used: Instant::now(),
            },
        );
        info!(host = host, pool_size = pool.len(), "opened new ssh session");
        Ok(session)
    }

    async fn connect(&self, host: &str, key: &str) -> Result<SshSession, SshError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            self.settings.timeout,
            client::connect(config, (host, self.settings.port), ProbeHandler),
        )
        .await
        .map_err(|_| SshError::Timeout("connect"))?
        .map_err(|e| SshError::Connect(format!("{}: {}", host, e)))?;

        let secret = russh::keys::load_secret_key(&self.settings.key_path, None)
            .map_err(|e| SshError::Key(format!("{}: {}", self.settings.key_path.display(), e)))?;

        let auth = tokio::time::timeout(
            self.settings.timeout,
            handle.authenticate_publickey(
                &self.settings.user,
                PrivateKeyWithHashAlg::new(Arc::new(secret), None),
            ),
        )
        .await
        .map_err(|_| SshError::Timeout("auth"))?
        .map_err(|e| SshError::Auth(format!("{}: {}", host, e)))?;

        if !auth.success() {
            return Err(SshError::Auth(format!("{}: rejected by server", host)));
        }

        Ok(SshSession {
            key: key.to_string(),
            handle: Arc::new(handle),
        })
    }

    /// Close sessions idle past the TTL.
    pub async fn cleanup_idle(&self) {
        let mut pool = self.pool.lock().await;
        let expired: Vec<String> = pool
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() > self.max_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = pool.remove(key) {
                entry.session.disconnect().await;
                debug!(key = %key, "closed idle session");
            }
        }
        if !expired.is_empty() {
            info!(closed = expired.len(), pool_size = pool.len(), "idle session cleanup");
        }
    }

    /// Close every pooled session.
    pub async fn close_all(&self) {
        let mut pool = self.pool.lock().await;
        let closed = pool.len();
        for (_, entry) in pool.drain() {
            entry.session.disconnect().await;
        }
        info!(closed = closed, "closed all ssh sessions");
    }

    pub async fn stats(&self) -> PoolStats {
        let pool = self.pool.lock().await;
        PoolStats {
            active_connections: pool.len(),
            max_connections: self.max_connections,
            utilization_percent: pool.len() as f64 / self.max_connections as f64 * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_script_wraps_each_command() {
        let script = build_batch_script(&[("cpu", "cat /proc/loadavg"), ("mem", "free -m")]);
        assert_eq!(
            script,
            "echo \"===START_cpu===\"; cat /proc/loadavg; echo \"===END_cpu===\"; \
             echo \"===START_mem===\"; free -m; echo \"===END_mem===\""
        );
    }

    #[test]
    fn batch_output_splits_by_markers() {
        let output = "===START_cpu===\n0.42 0.37 0.31\n===END_cpu===\n\
                      ===START_mem===\ntotal 15894\n===END_mem===\n";
        let results = parse_batch_output(output, &[("cpu", ""), ("mem", "")]);
        assert_eq!(results["cpu"], "0.42 0.37 0.31");
        assert_eq!(results["mem"], "total 15894");
    }

    #[test]
    fn missing_marker_yields_empty_capture() {
        let output = "===START_cpu===\n0.42\n===END_cpu===\n";
        let results = parse_batch_output(output, &[("cpu", ""), ("mem", "")]);
        assert_eq!(results["cpu"], "0.42");
        assert_eq!(results["mem"], "");
    }

    #[test]
    fn reversed_markers_yield_empty_capture() {
        let output = "===END_cpu===\ngarbage\n===START_cpu===";
        let results = parse_batch_output(output, &[("cpu", "")]);
        assert_eq!(results["cpu"], "");
    }
}
