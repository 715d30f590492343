use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{check_known_hosts, check_known_hosts_path, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelStream, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthMechanism;
use crate::config::{HostKeyPolicy, RemoteTarget, TunnelSpec};
use crate::error::SessionError;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX: usize = 3;
// russh 的 Handle 没有关闭通知，只能轮询
const CLOSED_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Opens one logical stream per forwarded connection.
///
/// Implementations must tolerate many concurrent callers: the accept loop
/// opens a channel for every client without waiting for earlier ones.
#[async_trait]
pub trait ChannelOpener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open_channel(
        &self,
        remote: &RemoteTarget,
        originator: SocketAddr,
    ) -> Result<Self::Stream, SessionError>;

    /// Resolves once no further channel can be opened.
    async fn closed(&self);
}

// SSH 客户端处理程序，只负责主机密钥校验
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    fn new(ssh_address: &str, policy: HostKeyPolicy) -> Self {
        let (host, port) = match ssh_address.parse::<RemoteTarget>() {
            Ok(target) => (target.host, target.port),
            Err(_) => (ssh_address.to_string(), 22),
        };
        Self { host, port, policy }
    }

    fn verify(&self, key: &PublicKey, path: Option<&PathBuf>) -> bool {
        let result = match path {
            Some(path) => check_known_hosts_path(&self.host, self.port, key, path),
            None => check_known_hosts(&self.host, self.port, key),
        };
        match result {
            Ok(true) => {
                debug!(host = %self.host, port = self.port, "主机密钥校验通过");
                true
            }
            Ok(false) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    fingerprint = %key.fingerprint(HashAlg::Sha256),
                    "主机密钥不在 known_hosts 中，拒绝连接"
                );
                false
            }
            Err(e) => {
                warn!(host = %self.host, port = self.port, error = %e, "主机密钥校验失败，拒绝连接");
                false
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::InsecureAcceptAny => {
                warn!(
                    host = %self.host,
                    fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
                    "未校验主机密钥 (host_key: insecure-accept-any)，存在中间人攻击风险"
                );
                Ok(true)
            }
            HostKeyPolicy::KnownHosts => Ok(self.verify(server_public_key, None)),
            HostKeyPolicy::KnownHostsFile(path) => Ok(self.verify(server_public_key, Some(path))),
        }
    }
}

/// One authenticated SSH transport shared by every relay of a tunnel.
pub struct TunnelSession {
    address: String,
    handle: Handle<ClientHandler>,
    closing: CancellationToken,
}

impl TunnelSession {
    /// Dial `spec.ssh_address`, run the handshake and authenticate with the
    /// given mechanisms, in order.
    pub async fn connect(spec: &TunnelSpec, mechanisms: &[AuthMechanism]) -> Result<Self, SessionError> {
        let address = spec.ssh_address.clone();

        info!(address = %address, user = %spec.ssh_user, "正在连接 SSH 服务器");
        let stream = TcpStream::connect(&address).await.map_err(|source| SessionError::Dial {
            address: address.clone(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "设置 TCP_NODELAY 失败");
        }

        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });
        let handler = ClientHandler::new(&address, spec.host_key.clone());

        let mut handle = client::connect_stream(config, stream, handler)
            .await
            .map_err(|e| match e {
                russh::Error::UnknownKey => SessionError::HostKeyRejected { address: address.clone() },
                source => SessionError::Handshake {
                    address: address.clone(),
                    source,
                },
            })?;

        authenticate(&mut handle, &address, &spec.ssh_user, mechanisms).await?;
        info!(address = %address, user = %spec.ssh_user, "身份验证成功");

        Ok(Self {
            address,
            handle,
            closing: CancellationToken::new(),
        })
    }

    /// True once the transport has gone away; no channel can be opened then.
    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled() || self.handle.is_closed()
    }

    /// Wait until the transport is gone: local [`Self::close`], server
    /// disconnect or keepalive expiry.
    pub async fn closed(&self) {
        let mut ticker = tokio::time::interval(CLOSED_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => return,
                _ = ticker.tick() => {
                    if self.handle.is_closed() {
                        debug!(address = %self.address, "SSH 传输已断开");
                        return;
                    }
                }
            }
        }
    }

    /// Request a `direct-tcpip` channel to `remote`.
    pub async fn open_channel(
        &self,
        remote: &RemoteTarget,
        originator: SocketAddr,
    ) -> Result<ChannelStream<client::Msg>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::ChannelOpen {
                remote: remote.to_string(),
                reason: "ssh transport is closed".to_string(),
            });
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(
                remote.host.clone(),
                remote.port as u32,
                originator.ip().to_string(),
                originator.port() as u32,
            )
            .await
            .map_err(|e| SessionError::ChannelOpen {
                remote: remote.to_string(),
                reason: e.to_string(),
            })?;

        debug!(remote = %remote, channel = ?channel.id(), "远程通道已打开");
        Ok(channel.into_stream())
    }

    /// Disconnect the transport. Channels opened from it see end-of-stream.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.closing.cancel();
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
            .await
        {
            debug!(address = %self.address, error = %e, "断开 SSH 连接失败");
        }
    }
}

#[async_trait]
impl ChannelOpener for TunnelSession {
    type Stream = ChannelStream<client::Msg>;

    async fn open_channel(
        &self,
        remote: &RemoteTarget,
        originator: SocketAddr,
    ) -> Result<Self::Stream, SessionError> {
        TunnelSession::open_channel(self, remote, originator).await
    }

    async fn closed(&self) {
        TunnelSession::closed(self).await
    }
}

// 依次尝试每种认证方式，第一个被接受的方式生效
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    address: &str,
    user: &str,
    mechanisms: &[AuthMechanism],
) -> Result<(), SessionError> {
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .and_then(|alg: Option<Option<HashAlg>>| alg.flatten());

    for mechanism in mechanisms {
        let result = match mechanism {
            AuthMechanism::Password(password) => handle.authenticate_password(user, password.as_str()).await,
            AuthMechanism::PublicKey(key) => {
                let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), hash_alg);
                handle.authenticate_publickey(user, key_with_hash).await
            }
        };

        match result {
            Ok(auth) if auth.success() => {
                debug!(method = mechanism.label(), "认证方式被接受");
                return Ok(());
            }
            Ok(_) => warn!(address = %address, method = mechanism.label(), "认证被服务器拒绝"),
            Err(source) => {
                return Err(SessionError::Handshake {
                    address: address.to_string(),
                    source,
                })
            }
        }
    }

    Err(SessionError::AuthRejected {
        address: address.to_string(),
        user: user.to_string(),
    })
}
