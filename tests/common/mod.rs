#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::server::{Auth, Msg, Session};
use russh::Channel;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mole::{TunnelEvent, TunnelObserver};

/// Host that the test server refuses to open channels to.
pub const REFUSED_HOST: &str = "refused.invalid";

pub fn random_key() -> PrivateKey {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
}

pub fn write_key(key: &PrivateKey, path: &Path) {
    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut pem).unwrap();
    std::fs::write(path, pem).unwrap();
}

/// 测试用 SSH 服务器，支持 direct-tcpip 转发
#[derive(Clone)]
struct ForwardingServer {
    authorized_key: PublicKey,
    password: String,
    seen_passwords: Arc<Mutex<Vec<String>>>,
}

impl russh::server::Handler for ForwardingServer {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, _user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if public_key.key_data() == self.authorized_key.key_data() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.seen_passwords.lock().unwrap().push(password.to_string());
        if password == self.password {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if host_to_connect == REFUSED_HOST {
            return Ok(false);
        }
        let target = format!("{}:{}", host_to_connect, port_to_connect);
        tokio::spawn(async move {
            match TcpStream::connect(target).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    let _ = copy_bidirectional(&mut stream, &mut channel_stream).await;
                }
                Err(_) => {
                    let _ = channel.close().await;
                }
            }
        });
        Ok(true)
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub host_key: PublicKey,
    pub client_key: PrivateKey,
    pub password: String,
    seen_passwords: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let host_key = random_key();
        let client_key = random_key();
        let password = "hunter2".to_string();
        let seen_passwords = Arc::new(Mutex::new(Vec::new()));

        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key.clone()],
            ..Default::default()
        });
        let handler = ForwardingServer {
            authorized_key: client_key.public_key().clone(),
            password: password.clone(),
            seen_passwords: seen_passwords.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                let config = config.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(session) = russh::server::run_stream(config, socket, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Self {
            addr,
            host_key: host_key.public_key().clone(),
            client_key,
            password,
            seen_passwords,
        }
    }

    pub fn seen_passwords(&self) -> Vec<String> {
        self.seen_passwords.lock().unwrap().clone()
    }

    /// Write the authorized client key to `dir` and return its path.
    pub fn write_client_key(&self, dir: &Path) -> PathBuf {
        let path = dir.join("id_rsa");
        write_key(&self.client_key, &path);
        path
    }
}

/// Target service: records what it receives and answers each read with
/// `reply`. Returns its address and a receiver of everything it saw per
/// connection once that connection hit EOF.
pub async fn reply_target(reply: &'static [u8]) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if socket.write_all(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = tx.send(seen);
            });
        }
    });
    (addr, rx)
}

/// Echoes everything back.
pub async fn echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// A free local port, released before returning.
pub async fn free_local_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

#[derive(Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<TunnelEvent>>,
}

impl CollectingObserver {
    pub fn events(&self) -> Vec<TunnelEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until an event matching `pred` arrives.
    pub async fn wait_for(&self, pred: impl Fn(&TunnelEvent) -> bool) -> TunnelEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(event) = self.events().into_iter().find(|e| pred(e)) {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for tunnel event")
    }
}

impl TunnelObserver for CollectingObserver {
    fn on_event(&self, event: TunnelEvent) {
        self.events.lock().unwrap().push(event);
    }
}
