//! 多隧道调度
//!
//! Every tunnel runs in its own task with its own session and listener.
//! A tunnel that fails stops alone; [`TunnelManager::run`] returns once every
//! tunnel has stopped, or after the shutdown token fires.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::auth;
use crate::config::TunnelSpec;
use crate::error::TunnelError;
use crate::events::{SharedObserver, TracingObserver, TunnelEvent};
use crate::listener::TunnelListener;
use crate::ssh_client::TunnelSession;

/// Terminal state of one tunnel.
#[derive(Debug)]
pub struct TunnelReport {
    pub name: String,
    pub result: Result<(), TunnelError>,
}

impl TunnelReport {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

pub struct TunnelManager {
    observer: SharedObserver,
    shutdown: CancellationToken,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new(Arc::new(TracingObserver))
    }
}

impl TunnelManager {
    pub fn new(observer: SharedObserver) -> Self {
        Self {
            observer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops every tunnel started by [`Self::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one tunnel per spec and wait for all of them.
    pub async fn run(&self, specs: Vec<TunnelSpec>) -> Vec<TunnelReport> {
        let names: Vec<String> = specs.iter().map(|spec| spec.name.clone()).collect();
        let tasks = specs.into_iter().map(|spec| {
            let observer = self.observer.clone();
            let shutdown = self.shutdown.child_token();
            tokio::spawn(run_tunnel(spec, observer, shutdown))
        });

        join_all(tasks)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, name)| {
                let result = joined.unwrap_or_else(|e| {
                    error!(tunnel = %name, error = %e, "隧道任务异常退出");
                    Err(TunnelError::Aborted(e.to_string()))
                });
                TunnelReport { name, result }
            })
            .collect()
    }
}

/// Resolve credentials, connect, bind and serve a single tunnel.
pub async fn run_tunnel(
    spec: TunnelSpec,
    observer: SharedObserver,
    shutdown: CancellationToken,
) -> Result<(), TunnelError> {
    let result = establish_and_serve(&spec, observer.clone(), shutdown).await;
    match &result {
        Ok(()) => observer.on_event(TunnelEvent::Stopped {
            tunnel: spec.name.clone(),
        }),
        Err(e) => observer.on_event(TunnelEvent::Failed {
            tunnel: spec.name.clone(),
            error: e.to_string(),
        }),
    }
    result
}

async fn establish_and_serve(
    spec: &TunnelSpec,
    observer: SharedObserver,
    shutdown: CancellationToken,
) -> Result<(), TunnelError> {
    let mechanisms = auth::resolve(spec.auth_method, spec.secret.as_deref())?;

    let session = tokio::select! {
        session = TunnelSession::connect(spec, &mechanisms) => Arc::new(session?),
        _ = shutdown.cancelled() => {
            debug!(tunnel = %spec.name, "连接建立前收到关闭信号");
            return Ok(());
        }
    };

    let result = match TunnelListener::bind(spec, session.clone(), observer).await {
        Ok(listener) => listener.serve(shutdown).await,
        Err(e) => Err(e),
    };

    session.close().await;
    result
}
