//! 本地监听与连接配对
//!
//! A [`TunnelListener`] accepts local clients and pairs each of them with a
//! fresh channel from its session. Every pair is relayed in its own task so
//! a slow or failing connection never holds up the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{AcceptErrorPolicy, RemoteTarget, TunnelSpec};
use crate::error::TunnelError;
use crate::events::{SharedObserver, TunnelEvent};
use crate::relay;
use crate::ssh_client::ChannelOpener;

/// Source of local client connections.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

// 每个转发连接共享的只读上下文
struct Forwarder<S> {
    tunnel: String,
    session: Arc<S>,
    remote: RemoteTarget,
    observer: SharedObserver,
}

impl<S: ChannelOpener> Forwarder<S> {
    async fn forward(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let channel = match self.session.open_channel(&self.remote, peer).await {
            Ok(channel) => channel,
            Err(e) => {
                // 仅放弃这一个连接，本地连接随 stream 一起被关闭
                self.observer.on_event(TunnelEvent::ChannelOpenFailed {
                    tunnel: self.tunnel.clone(),
                    peer,
                    error: e.to_string(),
                });
                return;
            }
        };

        // 关闭时丢弃 relay future，两端连接随之关闭
        let outcome = tokio::select! {
            outcome = relay::run(stream, channel) => outcome,
            _ = shutdown.cancelled() => {
                self.observer.on_event(TunnelEvent::RelayAborted {
                    tunnel: self.tunnel.clone(),
                    peer,
                });
                return;
            }
        };

        if let Some(error) = &outcome.error {
            self.observer.on_event(TunnelEvent::RelayError {
                tunnel: self.tunnel.clone(),
                peer,
                direction: outcome.first_finished,
                error: error.to_string(),
            });
        }
        self.observer.on_event(TunnelEvent::RelayClosed {
            tunnel: self.tunnel.clone(),
            peer,
            first_finished: outcome.first_finished,
            sent: outcome.sent,
            received: outcome.received,
        });
    }
}

/// A bound local listener for one tunnel.
pub struct TunnelListener<S, A = TcpListener> {
    acceptor: A,
    local_addr: SocketAddr,
    ssh_address: String,
    accept_errors: AcceptErrorPolicy,
    limit: Option<Arc<Semaphore>>,
    forwarder: Arc<Forwarder<S>>,
}

impl<S: ChannelOpener> TunnelListener<S, TcpListener> {
    /// Claim `spec.local_address`. Failing to bind is fatal to the tunnel.
    pub async fn bind(spec: &TunnelSpec, session: Arc<S>, observer: SharedObserver) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(&spec.local_address)
            .await
            .map_err(|source| TunnelError::ListenBind {
                address: spec.local_address.clone(),
                source,
            })?;
        Self::with_acceptor(spec, listener, session, observer)
    }
}

impl<S: ChannelOpener, A: Acceptor> TunnelListener<S, A> {
    /// Serve clients from an already bound `acceptor`.
    pub fn with_acceptor(
        spec: &TunnelSpec,
        acceptor: A,
        session: Arc<S>,
        observer: SharedObserver,
    ) -> Result<Self, TunnelError> {
        let local_addr = acceptor.local_addr().map_err(|source| TunnelError::ListenBind {
            address: spec.local_address.clone(),
            source,
        })?;

        Ok(Self {
            acceptor,
            local_addr,
            ssh_address: spec.ssh_address.clone(),
            accept_errors: spec.accept_errors,
            limit: spec.max_connections.map(|n| Arc::new(Semaphore::new(n))),
            forwarder: Arc::new(Forwarder {
                tunnel: spec.name.clone(),
                session,
                remote: spec.remote.clone(),
                observer,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` fires, the session's transport closes, or
    /// accepting fails under [`AcceptErrorPolicy::FailFast`].
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let forwarder = self.forwarder;
        forwarder.observer.on_event(TunnelEvent::Started {
            tunnel: forwarder.tunnel.clone(),
            local: self.local_addr,
            remote: forwarder.remote.to_string(),
            ssh: self.ssh_address.clone(),
        });

        let session = forwarder.session.clone();
        let closed = session.closed();
        tokio::pin!(closed);
        let transport_closed = || TunnelError::TransportClosed {
            address: self.ssh_address.clone(),
        };

        let result = loop {
            let permit: Option<OwnedSemaphorePermit> = match &self.limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = &mut closed => break Err(transport_closed()),
                    permit = limit.clone().acquire_owned() => permit.ok(),
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = &mut closed => break Err(transport_closed()),
                accepted = self.acceptor.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "设置 TCP_NODELAY 失败");
                    }
                    forwarder.observer.on_event(TunnelEvent::ClientAccepted {
                        tunnel: forwarder.tunnel.clone(),
                        peer,
                    });

                    let forwarder = forwarder.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        forwarder.forward(stream, peer, shutdown).await;
                        drop(permit);
                    });
                }
                Err(e) => match self.accept_errors {
                    AcceptErrorPolicy::FailFast => {
                        forwarder.observer.on_event(TunnelEvent::AcceptError {
                            tunnel: forwarder.tunnel.clone(),
                            error: e.to_string(),
                            retrying: false,
                        });
                        break Err(TunnelError::Accept {
                            address: self.local_addr.to_string(),
                            source: e,
                        });
                    }
                    AcceptErrorPolicy::Retry { backoff } => {
                        forwarder.observer.on_event(TunnelEvent::AcceptError {
                            tunnel: forwarder.tunnel.clone(),
                            error: e.to_string(),
                            retrying: true,
                        });
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break Ok(()),
                            _ = &mut closed => break Err(transport_closed()),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                },
            }
        };

        debug!(tunnel = %forwarder.tunnel, local = %self.local_addr, "监听已停止");
        result
    }
}
