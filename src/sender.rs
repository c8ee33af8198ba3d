//! Sender-side routing.
//!
//! Sender connections are never TLS-terminated here. The listener peeks at
//! the socket without consuming anything, pulls the SNI out of the
//! ClientHello, and resolves the first DNS label against the token
//! directory. On a match the connection is spliced to the parked receiver
//! and the handshake bytes travel on verbatim, so the sender's TLS session
//! ends at the receiver's own certificate.

use crate::directory::TokenDirectory;
use crate::sni;
use crate::splice;
use anyhow::{Context, Result, anyhow, bail};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// How long a sender gets to produce a complete ClientHello.
pub const PEEK_DEADLINE: Duration = Duration::from_secs(5);

/// How much of the ClientHello the listener is willing to inspect.
pub const PEEK_WINDOW: usize = 1024;

const PEEK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Routes one sender connection: peek, resolve, splice. Senders that do not
/// resolve to a live token are dropped without touching the directory.
pub async fn handle_connection<T>(
    stream: TcpStream,
    peer: SocketAddr,
    directory: Arc<TokenDirectory<T>>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let server_name = match timeout(PEEK_DEADLINE, peek_server_name(&stream)).await {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => {
            info!(%peer, error = %e, "Invalid TLS handshake, no SNI found");
            return Ok(());
        }
        Err(_) => {
            info!(%peer, "Timed out waiting for a complete ClientHello");
            return Ok(());
        }
    };

    // `<token>.<domain>`: the first DNS label names the parked receiver.
    let server_name = server_name.to_lowercase();
    let token = server_name.split('.').next().unwrap_or_default();

    let Some(receiver_stream) = directory.take(token) else {
        info!(%peer, token = %token, "No receiver found for token");
        return Ok(());
    };
    info!(%peer, token = %token, "Token matched, splicing sender to receiver");

    match splice::pipe(stream, receiver_stream).await {
        Ok((from_sender, from_receiver)) => {
            debug!(%peer, from_sender, from_receiver, "Splice finished");
        }
        Err(e) => debug!(%peer, error = %e, "Splice terminated"),
    }
    Ok(())
}

/// Peeks the leading TLS record off the socket without consuming it and
/// extracts the server name. Short reads are retried with a small delay;
/// the caller bounds the whole wait with [`PEEK_DEADLINE`].
async fn peek_server_name(stream: &TcpStream) -> Result<String> {
    let mut buf = [0u8; PEEK_WINDOW];
    loop {
        let peeked = stream
            .peek(&mut buf)
            .await
            .context("Failed to peek sender socket")?;
        if peeked == 0 {
            bail!("Sender closed the connection before completing a ClientHello");
        }
        match sni::classify(&buf[..peeked], PEEK_WINDOW) {
            sni::Peek::Ready => {
                return sni::extract_sni(&buf[..peeked])
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow!("ClientHello carries no server name"));
            }
            sni::Peek::NotTls => bail!("Leading bytes are not a TLS handshake record"),
            sni::Peek::NeedMore(_) => sleep(PEEK_RETRY_DELAY).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sni::test_client_hello;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::net::TcpListener;

    async fn spawn_listener(directory: Arc<TokenDirectory<DuplexStream>>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let directory = directory.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, peer, directory).await;
                });
            }
        });
        port
    }

    fn parked_directory(token: &str) -> (Arc<TokenDirectory<DuplexStream>>, DuplexStream) {
        let directory = Arc::new(TokenDirectory::new("01"));
        let (near, far) = duplex(64 * 1024);
        directory.publish(token, near).unwrap();
        (directory, far)
    }

    #[tokio::test]
    async fn sni_label_is_matched_case_insensitively() {
        let (directory, mut receiver) = parked_directory("01-testtoken");
        let port = spawn_listener(directory.clone()).await;

        let mut sender = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let hello = test_client_hello(Some("01-TestToken.Relay.TEST"));
        sender.write_all(&hello).await.unwrap();

        let mut seen = vec![0u8; hello.len()];
        receiver.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, hello);
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn fragmented_client_hello_is_reassembled() {
        let (directory, mut receiver) = parked_directory("01-fragmented");
        let port = spawn_listener(directory.clone()).await;

        let mut sender = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let hello = test_client_hello(Some("01-fragmented.relay.test"));

        // Trickle the hello out in three pieces; the peek loop has to wait
        // for the full record before it can route.
        for chunk in hello.chunks(hello.len() / 3 + 1) {
            sender.write_all(chunk).await.unwrap();
            sender.flush().await.unwrap();
            sleep(Duration::from_millis(30)).await;
        }

        let mut seen = vec![0u8; hello.len()];
        receiver.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, hello);
    }

    #[tokio::test]
    async fn non_tls_bytes_are_dropped_without_touching_the_directory() {
        let (directory, _receiver) = parked_directory("01-untouched");
        let port = spawn_listener(directory.clone()).await;

        let mut sender = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sender.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(sender.read(&mut buf).await.unwrap(), 0);
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn hello_without_sni_is_dropped() {
        let (directory, _receiver) = parked_directory("01-untouched");
        let port = spawn_listener(directory.clone()).await;

        let mut sender = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sender.write_all(&test_client_hello(None)).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(sender.read(&mut buf).await.unwrap(), 0);
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn unknown_token_is_dropped() {
        let (directory, _receiver) = parked_directory("01-parked");
        let port = spawn_listener(directory.clone()).await;

        let mut sender = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sender
            .write_all(&test_client_hello(Some("01-unknown.relay.test")))
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(sender.read(&mut buf).await.unwrap(), 0);
        assert!(directory.contains("01-parked"));
    }
}
