//! 隧道生命周期事件
//!
//! The engine never formats log lines itself; it hands [`TunnelEvent`]s to a
//! [`TunnelObserver`]. [`TracingObserver`] is the default and turns them into
//! structured `tracing` events.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

/// Which relay direction finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LocalToRemote => "local->remote",
            Direction::RemoteToLocal => "remote->local",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Started {
        tunnel: String,
        local: SocketAddr,
        remote: String,
        ssh: String,
    },
    ClientAccepted {
        tunnel: String,
        peer: SocketAddr,
    },
    ChannelOpenFailed {
        tunnel: String,
        peer: SocketAddr,
        error: String,
    },
    RelayClosed {
        tunnel: String,
        peer: SocketAddr,
        first_finished: Direction,
        sent: u64,
        received: u64,
    },
    /// The relay was cut short by shutdown; both endpoints are closed.
    RelayAborted {
        tunnel: String,
        peer: SocketAddr,
    },
    RelayError {
        tunnel: String,
        peer: SocketAddr,
        direction: Direction,
        error: String,
    },
    AcceptError {
        tunnel: String,
        error: String,
        retrying: bool,
    },
    Stopped {
        tunnel: String,
    },
    Failed {
        tunnel: String,
        error: String,
    },
}

/// Receives lifecycle events from every tunnel. Called from many tasks.
pub trait TunnelObserver: Send + Sync {
    fn on_event(&self, event: TunnelEvent);
}

pub type SharedObserver = Arc<dyn TunnelObserver>;

/// Writes events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TunnelObserver for TracingObserver {
    fn on_event(&self, event: TunnelEvent) {
        match event {
            TunnelEvent::Started { tunnel, local, remote, ssh } => {
                info!(tunnel = %tunnel, local = %local, remote = %remote, ssh = %ssh, "隧道已启动");
            }
            TunnelEvent::ClientAccepted { tunnel, peer } => {
                info!(tunnel = %tunnel, peer = %peer, "接受新的客户端连接");
            }
            TunnelEvent::ChannelOpenFailed { tunnel, peer, error } => {
                warn!(tunnel = %tunnel, peer = %peer, error = %error, "打开远程通道失败，放弃该连接");
            }
            TunnelEvent::RelayClosed { tunnel, peer, first_finished, sent, received } => {
                info!(
                    tunnel = %tunnel,
                    peer = %peer,
                    first_finished = first_finished.as_str(),
                    sent,
                    received,
                    "转发连接已关闭"
                );
            }
            TunnelEvent::RelayAborted { tunnel, peer } => {
                info!(tunnel = %tunnel, peer = %peer, "隧道关闭，转发连接已中止");
            }
            TunnelEvent::RelayError { tunnel, peer, direction, error } => {
                warn!(tunnel = %tunnel, peer = %peer, direction = direction.as_str(), error = %error, "转发数据时出错");
            }
            TunnelEvent::AcceptError { tunnel, error, retrying } => {
                if retrying {
                    warn!(tunnel = %tunnel, error = %error, "接受连接失败，稍后重试");
                } else {
                    error!(tunnel = %tunnel, error = %error, "接受连接失败");
                }
            }
            TunnelEvent::Stopped { tunnel } => {
                info!(tunnel = %tunnel, "隧道已停止");
            }
            TunnelEvent::Failed { tunnel, error } => {
                error!(tunnel = %tunnel, error = %error, "隧道因致命错误终止");
            }
        }
    }
}
