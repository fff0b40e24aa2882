//! Bidirectional byte pump between two duplex endpoints.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::is_connection_closed;

/// Copy bytes in both directions until each side has finished. Errors that
/// only signal a closed endpoint are normal termination. The caller closes
/// both endpoints afterwards; closing twice is harmless.
pub async fn pipe<A, B>(a: &mut A, b: &mut B, label: &str)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok((forward, backward)) => {
            debug!(label, forward, backward, "transfer finished");
        }
        Err(err) if is_connection_closed(&err) => {}
        Err(err) => {
            warn!(label, %err, "transfer ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_pass_through_unmodified_in_both_directions() {
        let (mut outer, mut pipe_a) = tokio::io::duplex(1024);
        let (mut pipe_b, mut inner) = tokio::io::duplex(1024);

        let pump = tokio::spawn(async move {
            pipe(&mut pipe_a, &mut pipe_b, "test").await;
        });

        outer.write_all(b"request payload").await.unwrap();
        let mut buf = [0u8; 15];
        inner.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request payload");

        inner.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        // Closing one outer endpoint lets the pump run to completion.
        drop(outer);
        drop(inner);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn large_transfer_preserves_order() {
        let (mut outer, mut pipe_a) = tokio::io::duplex(1024);
        let (mut pipe_b, mut inner) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            pipe(&mut pipe_a, &mut pipe_b, "test").await;
        });

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            outer.write_all(&payload).await.unwrap();
            outer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        inner.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }
}
