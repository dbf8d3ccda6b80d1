use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::engine::events::GatewayEvent;

use super::connection::handle_ingest_connection;

/// Bind the ingest listener and serve it until `cancel` fires.
pub async fn start_ingest_listener(
    bind_addr: &str,
    events: mpsc::Sender<GatewayEvent>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Ingest listener started on {}", bind_addr);
    serve_ingest(listener, events, cancel).await;
    Ok(())
}

/// Accept connections and spawn a handler task for each. Every connection
/// feeds the same dispatcher queue. Stops accepting new connections when the
/// cancellation token is triggered.
pub async fn serve_ingest(
    listener: TcpListener,
    events: mpsc::Sender<GatewayEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Ingest listener shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let events = events.clone();
                        let cancel = cancel.clone();
                        let peer = addr.to_string();
                        tokio::spawn(async move {
                            handle_ingest_connection(stream, peer, events, cancel).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept ingest connection");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_frames_reach_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_ingest(listener, tx, cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"{\"t\": \"GUILD_CREATE\", \"d\": {\"id\": \"g1\", \"name\": \"Guild\"}}\n")
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "GUILD_CREATE");
        assert_eq!(event.guild_id(), Some("g1"));

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let result = start_ingest_listener("not-an-address", tx, CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
