//! 隧道引擎的错误分类
//!
//! Errors are split by blast radius: [`AuthError`], the startup variants of
//! [`SessionError`] and [`TunnelError`] end one tunnel, while
//! [`SessionError::ChannelOpen`] and relay I/O errors only end one forwarded
//! connection.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading and validating `mole.yaml`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file mole.yaml not found in any of: {0}")]
    NotFound(String),
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid tunnel configuration: {0}")]
    Invalid(String),
}

/// Errors raised while turning an auth method and secret into mechanisms.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("failed to read private key {path}: {source}")]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse private key {path}: {source}")]
    KeyParse {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },
}

/// Errors raised by a [`crate::TunnelSession`].
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to dial ssh server {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        #[source]
        source: russh::Error,
    },
    #[error("ssh server {address} rejected every authentication method for user '{user}'")]
    AuthRejected { address: String, user: String },
    #[error("host key of {address} was rejected")]
    HostKeyRejected { address: String },
    #[error("failed to open channel to {remote}: {reason}")]
    ChannelOpen { remote: String, reason: String },
}

/// The terminal error of a single tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to bind local listener {address}: {source}")]
    ListenBind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept on {address}: {source}")]
    Accept {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh transport to {address} closed")]
    TransportClosed { address: String },
    #[error("tunnel task ended abnormally: {0}")]
    Aborted(String),
}
