//! 双向字节转发
//!
//! A relay owns one local connection and one remote channel. Both copy
//! directions run concurrently; the first one to end (EOF or error) ends the
//! pair, and both endpoints are shut down and dropped before [`run`] returns.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::events::Direction;

const BUFFER_SIZE: usize = 16384;

/// How a relay ended.
#[derive(Debug)]
pub struct RelayOutcome {
    pub first_finished: Direction,
    /// Bytes copied local -> remote.
    pub sent: u64,
    /// Bytes copied remote -> local.
    pub received: u64,
    /// The I/O error that ended the relay, if it did not end on EOF.
    pub error: Option<io::Error>,
}

// 从 reader 读取并写入 writer，直到 EOF 或出错
async fn pump<Rd, Wr>(reader: &mut Rd, writer: &mut Wr, copied: &mut u64) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
        trace!(bytes = n, "已转发数据");
    }
}

/// Copy bytes between `local` and `remote` until either direction ends.
pub async fn run<L, R>(local: L, remote: R) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let mut sent = 0u64;
    let mut received = 0u64;

    // 任一方向结束即结束整个转发，另一方向的 future 在此处被丢弃
    let (first_finished, result) = {
        let local_to_remote = pump(&mut local_read, &mut remote_write, &mut sent);
        let remote_to_local = pump(&mut remote_read, &mut local_write, &mut received);
        tokio::select! {
            r = local_to_remote => (Direction::LocalToRemote, r),
            r = remote_to_local => (Direction::RemoteToLocal, r),
        }
    };
    debug!(direction = first_finished.as_str(), "转发方向结束");

    // 关闭两端，使对端挂起的读写立即返回
    if let Err(e) = local_write.shutdown().await {
        trace!(error = %e, "关闭本地连接写端失败");
    }
    if let Err(e) = remote_write.shutdown().await {
        trace!(error = %e, "关闭远程通道写端失败");
    }
    drop(local_read.unsplit(local_write));
    drop(remote_read.unsplit(remote_write));

    RelayOutcome {
        first_finished,
        sent,
        received,
        error: result.err(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_both_directions_and_closes_remote_when_local_closes() {
        let (mut client, local) = duplex(64);
        let (remote, mut server) = duplex(64);
        let relay = tokio::spawn(run(local, remote));

        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        server.write_all(b"PONG").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        drop(client);
        let outcome = relay.await.unwrap();
        assert_eq!(outcome.first_finished, Direction::LocalToRemote);
        assert_eq!(outcome.sent, 4);
        assert_eq!(outcome.received, 4);
        assert!(outcome.error.is_none());

        // 远程端应观察到 EOF
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn remote_close_ends_relay_and_local_sees_eof() {
        let (mut client, local) = duplex(64);
        let (remote, server) = duplex(64);
        let relay = tokio::spawn(run(local, remote));

        drop(server);
        let outcome = relay.await.unwrap();
        assert_eq!(outcome.first_finished, Direction::RemoteToLocal);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn large_payload_keeps_order() {
        let (mut client, local) = duplex(1024);
        let (remote, mut server) = duplex(1024);
        let relay = tokio::spawn(run(local, remote));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        drop(writer.await.unwrap());
        let outcome = relay.await.unwrap();
        assert_eq!(outcome.sent, expected.len() as u64);
    }

    #[tokio::test]
    async fn local_eof_from_mock_is_forwarded() {
        let local = tokio_test::io::Builder::new().read(b"hello").build();
        let (remote, mut server) = duplex(64);

        let outcome = run(local, remote).await;
        assert_eq!(outcome.first_finished, Direction::LocalToRemote);
        assert_eq!(outcome.sent, 5);

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello");
    }
}
