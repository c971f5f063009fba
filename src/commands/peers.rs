use std::error::Error;

use log::debug;

use crate::config::ClientConfig;
use crate::messages::validate_identity;
use crate::networking::establish_connection;

/// Join the relay, print the current peer list and leave.
pub async fn run(config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let display_name = validate_identity(&config.display_name)?;
    debug!("Connecting to relay server at {}", config.relay_addr);
    let connection = establish_connection(&config.relay_addr, &display_name).await?;

    let others: Vec<_> = connection
        .initial_peers
        .iter()
        .filter(|p| p.connection_id != connection.connection_id)
        .collect();
    if others.is_empty() {
        println!("Nobody else is online");
        return Ok(());
    }
    println!("{} peer(s) online:", others.len());
    for peer in others {
        println!("  {:<24} {}", peer.display_name, peer.connection_id);
    }
    Ok(())
}
