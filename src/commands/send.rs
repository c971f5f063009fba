use std::error::Error;
use std::path::Path;

use log::debug;

use crate::client::{Client, ClientEvent};
use crate::commands::{resolve_peer, transfer_bar};
use crate::config::ClientConfig;
use crate::session::SessionStatus;
use crate::transport::PeerConnector;

/// Offer `path` to `target` (display name or connection id) and stream it
/// once accepted. Returns when the transfer completed or failed.
pub async fn run<C: PeerConnector>(
    config: ClientConfig,
    connector: C,
    path: &Path,
    target: &str,
) -> Result<(), Box<dyn Error>> {
    if !path.is_file() {
        return Err(format!("Not a file: {}", path.display()).into());
    }

    debug!("Connecting to relay server at {}", config.relay_addr);
    let (client, mut events) = Client::connect(config, connector).await?;
    let to = resolve_peer(&client.peers().await?, client.id(), target)?;

    let file = client.send_path(to, path).await?;
    println!("Waiting for {} to accept {} ({} bytes)", target, file.name, file.size);

    let bar = transfer_bar(file.size);
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::StatusChanged { peer, status } if peer == to => {
                debug!("Session status: {}", status.name());
                if status == SessionStatus::Transferring {
                    bar.set_message("sending");
                }
            }
            ClientEvent::Progress { peer, transferred, .. } if peer == to => {
                bar.set_position(transferred);
            }
            ClientEvent::TransferCompleted { peer, .. } if peer == to => {
                bar.finish_with_message("done");
                println!("Transfer Complete!");
                return Ok(());
            }
            ClientEvent::TransferFailed { peer, reason } if peer == to => {
                bar.abandon();
                println!("Transfer failed: {}", reason);
                return Err(crate::Error::from(reason).into());
            }
            _ => {}
        }
    }
    Err("Lost connection to the relay".into())
}
