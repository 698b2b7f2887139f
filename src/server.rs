use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::codec::FrameCodec;
use crate::commands::{self, UNKNOWN_COMMAND};
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::snapshot::JsonSnapshot;
use crate::store::Store;
use crate::Error;

/// Sent to every client as soon as it connects.
pub const GREETING: &str = "Welcome to snapkv";

pub async fn run(config: Config) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let store = Store::open(JsonSnapshot::new(&config.snapshot));

    info!("Snapshot file is {}", config.snapshot.display());

    serve(listener, store, config.max_frame_size).await
}

/// Accepts connections on `listener` until the process exits, serving each on its own task.
pub async fn serve(
    listener: TcpListener,
    store: Store,
    max_frame_size: usize,
) -> Result<(), Error> {
    info!("Server listening on {}", listener.local_addr()?);

    loop {
        let (socket, client_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually file descriptor exhaustion; back off instead of spinning.
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let store = store.clone();
        info!("Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            let codec = FrameCodec::new(max_frame_size);
            if let Err(e) = handle_connection(socket, client_address, store, codec).await {
                warn!("Connection from {} terminated: {}", client_address, e);
            }
        });
    }
}

#[instrument(
    name = "connection",
    skip(stream, client_address, store, codec),
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    store: Store,
    codec: FrameCodec,
) -> Result<(), Error> {
    let mut conn = Connection::new(stream, client_address, codec);

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", conn.client_address.to_string());

    conn.write_frame(Frame::Simple(GREETING.to_string())).await?;

    while let Some(frame) = conn.read_frame().await? {
        let res = match frame {
            Ok(frame) => {
                info!("Received command from client: {}", frame);
                commands::dispatch(frame, &store)
            }
            Err(e) => {
                warn!("Malformed frame from client: {}", e);
                Frame::Error(UNKNOWN_COMMAND.to_string())
            }
        };
        debug!("Sending response to client: {}", res);

        conn.write_frame(res).await?;
    }

    info!("Connection closed");
    Ok(())
}
