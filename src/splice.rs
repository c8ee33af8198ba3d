//! Opaque bidirectional byte pipe between a sender socket and a parked
//! receiver data stream.
//!
//! The splicer never interprets the bytes it moves. The sender's TLS
//! session rides through it end to end and terminates at the receiver, so
//! the relay has nothing to decrypt.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy_bidirectional};

/// Copies bytes in both directions until either side reaches EOF or fails,
/// then closes both ends. Returns (sender-to-receiver, receiver-to-sender)
/// byte counts on a clean finish.
pub async fn pipe<S, R>(mut sender: S, mut receiver: R) -> std::io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let result = copy_bidirectional(&mut sender, &mut receiver).await;
    // Both ends are torn down on every exit path, success or not.
    let _ = sender.shutdown().await;
    let _ = receiver.shutdown().await;
    result
}
