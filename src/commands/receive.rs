use std::collections::HashMap;
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::client::{Client, ClientEvent};
use crate::commands::transfer_bar;
use crate::config::ClientConfig;
use crate::messages::{ConnectionId, FileMeta};
use crate::transport::PeerConnector;

/// Stay online and receive files into `output_dir` until interrupted.
pub async fn run<C: PeerConnector>(
    config: ClientConfig,
    connector: C,
    output_dir: PathBuf,
    auto_accept: bool,
) -> Result<(), Box<dyn Error>> {
    tokio::fs::create_dir_all(&output_dir).await?;
    let display_name = config.display_name.clone();
    let (client, mut events) = Client::connect(config, connector).await?;
    println!(
        "Receiving as {} ({}), saving to {}",
        display_name,
        client.id(),
        output_dir.display()
    );

    let mut bars: HashMap<ConnectionId, ProgressBar> = HashMap::new();
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return Err("Lost connection to the relay".into()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving the relay");
                return Ok(());
            }
        };

        match event {
            ClientEvent::IncomingRequest {
                from,
                sender_identity,
                file,
            } => {
                let accepted = auto_accept || confirm(&sender_identity, &file).await?;
                if !respond(&client, from, accepted).await {
                    continue;
                }
                if accepted {
                    bars.insert(from, transfer_bar(file.size));
                } else {
                    println!("Declined {} from {}", file.name, sender_identity);
                }
            }
            ClientEvent::Progress {
                peer, transferred, ..
            } => {
                if let Some(bar) = bars.get(&peer) {
                    bar.set_position(transferred);
                }
            }
            ClientEvent::FileReceived { peer, file, data } => {
                let path = save(&output_dir, &file, &data).await?;
                if let Some(bar) = bars.remove(&peer) {
                    bar.finish_with_message("done");
                }
                println!("File saved: {}", path.display());
            }
            ClientEvent::TransferFailed { peer, reason } => {
                if let Some(bar) = bars.remove(&peer) {
                    bar.abandon();
                }
                warn!("Transfer from {} failed: {}", peer, reason);
                println!("Transfer failed: {}", reason);
            }
            other => debug!("{:?}", other),
        }
    }
}

/// Ask on the terminal whether to take `file`.
async fn confirm(sender_identity: &str, file: &FileMeta) -> Result<bool, Box<dyn Error>> {
    let question = format!(
        "{} wants to send {} ({} bytes, {}). Accept? [y/N] ",
        sender_identity, file.name, file.size, file.mime_type
    );
    let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
        print!("{}", question);
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Answer a pending request. Returns false when the request is gone, for
/// example because the sender left or cancelled while we were asking.
async fn respond(client: &Client, from: ConnectionId, accept: bool) -> bool {
    let result = if accept {
        client.accept(from).await
    } else {
        client.reject(from).await
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("Could not answer request from {}: {}", from, e);
            println!("Request from {} is no longer pending: {}", from, e);
            false
        }
    }
}

/// Write under the declared base name, never outside `output_dir`. An
/// existing file of the same name is not overwritten.
async fn save(output_dir: &Path, file: &FileMeta, data: &[u8]) -> io::Result<PathBuf> {
    let name = file.safe_name();
    let mut path = output_dir.join(&name);
    let mut n = 1;
    while tokio::fs::try_exists(&path).await? {
        path = output_dir.join(format!("{}.{}", name, n));
        n += 1;
    }
    tokio::fs::write(&path, data).await?;
    Ok(path)
}
