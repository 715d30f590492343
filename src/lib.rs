pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod relay;
pub mod ssh_client;

// 导出主要结构和函数以便使用
pub use auth::AuthMechanism;
pub use config::{AcceptErrorPolicy, AuthMethod, Config, HostKeyPolicy, RemoteTarget, TunnelSpec};
pub use error::{AuthError, ConfigError, SessionError, TunnelError};
pub use events::{Direction, SharedObserver, TracingObserver, TunnelEvent, TunnelObserver};
pub use listener::{Acceptor, TunnelListener};
pub use logging::setup_logging;
pub use manager::{TunnelManager, TunnelReport};
pub use ssh_client::{ChannelOpener, TunnelSession};
