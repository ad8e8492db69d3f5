// Peer connections: one message per TCP connection

use crate::error::{Error, Result};
use crate::network::Message;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn unreachable(addr: &str, reason: impl ToString) -> Error {
    Error::PeerUnreachable {
        addr: addr.to_string(),
        reason: reason.to_string(),
    }
}

/// Connect to `addr`, write `message` and close the write half.
///
/// Connecting and writing are each bounded by `timeout`.
pub async fn send_message(addr: &str, message: &Message, timeout: Duration) -> Result<()> {
    let data = message.encode()?;

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| unreachable(addr, "connect timed out"))?
        .map_err(|e| unreachable(addr, e))?;

    tokio::time::timeout(timeout, async {
        stream.write_all(&data).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| unreachable(addr, "write timed out"))?
    .map_err(|e| unreachable(addr, e))?;

    log::debug!("Sent {} ({} bytes) to {}", message.command(), data.len(), addr);
    Ok(())
}

/// Read one whole message until the sender closes, refusing anything
/// larger than `max_size` bytes
pub async fn read_message<R: AsyncRead + Unpin>(reader: R, max_size: usize) -> Result<Message> {
    let mut data = Vec::new();
    reader
        .take(max_size as u64 + 1)
        .read_to_end(&mut data)
        .await?;

    if data.len() > max_size {
        return Err(Error::MessageTooLarge(data.len()));
    }
    Message::decode(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{AddrFromPayload, AddrPayload};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_and_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let message = Message::Addr(AddrPayload {
            addr_from: "localhost:3005".to_string(),
            addr_list: vec!["localhost:3000".to_string()],
        });
        let expected = message.clone();

        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_message(&mut stream, 1024).await.unwrap()
        });

        send_message(&addr, &message, Duration::from_secs(2)).await.unwrap();
        assert_eq!(reader.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let message = Message::GetBlocks(AddrFromPayload {
            addr_from: "x".repeat(100),
        });
        let bytes = message.encode().unwrap();

        let result = read_message(bytes.as_slice(), 50).await;
        assert!(matches!(result, Err(Error::MessageTooLarge(51))));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Grab a free port, then close it again
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let message = Message::GetBlocks(AddrFromPayload {
            addr_from: "localhost:3000".to_string(),
        });
        let result = send_message(&addr, &message, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(Error::PeerUnreachable { .. })));
    }
}
