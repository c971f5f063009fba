use std::error::Error;

use log::{debug, info};
use tokio::net::TcpListener;

use crate::config::RelayConfig;
use crate::relay_utils::serve;

/// Run the signaling relay until the process is stopped.
///
/// One manager task owns the peer registry and routes every message; each
/// client connection gets a reader task and a writer task. See
/// [`crate::relay_utils`].
pub async fn run(config: RelayConfig) -> Result<(), Box<dyn Error>> {
    debug!("Attempting to bind to {}", config.bind_addr);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    println!("Relay listening on {}", listener.local_addr()?);
    info!("Relay server started on {}", config.bind_addr);

    serve(listener).await?;
    Ok(())
}
