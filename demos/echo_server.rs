//! Standalone echo server
//!
//! Echoes every text and binary message back to the sender, which is what
//! the Autobahn fuzzing client expects.
//!
//! Run with: `RUST_LOG=ws_wire=debug cargo run --example echo_server [addr]`

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use ws_wire::error::Result;
use ws_wire::{Config, Event, WebSocketServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9001".to_string());
    let listener = TcpListener::bind(&addr).await?;

    let server = WebSocketServer::new(Config::default());
    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown().await;
        }
    });

    server
        .serve(listener, |conn, mut events| async move {
            while let Some(event) = events.recv().await {
                match event {
                    Event::Message(msg) => {
                        if conn.send_message(&msg).await.is_err() {
                            break;
                        }
                    }
                    Event::Close(reason) => {
                        tracing::info!(id = conn.id(), %reason, "connection closed");
                    }
                    Event::Error(e) => tracing::warn!(id = conn.id(), error = %e, "transport error"),
                    Event::Pong(_) => {}
                }
            }
        })
        .await
}
