//! # Commands Module
//!
//! Handlers behind the `peerdrop` subcommands:
//!
//! ## `relay`
//! Runs the signaling relay: tracks who is online and forwards transfer
//! control and negotiation messages between them. File bytes never pass
//! through it.
//!
//! ## `peers`
//! Joins the relay briefly and prints who else is online.
//!
//! ## `send`
//! Offers one file to a peer chosen by display name or connection id, then
//! streams it over the direct channel once the peer accepts.
//!
//! ## `receive`
//! Stays online, asks (or auto-accepts with `--yes`) for each incoming
//! request, and writes received files to the output directory.

pub mod peers;
pub mod receive;
pub mod relay;
pub mod send;

use indicatif::{ProgressBar, ProgressStyle};

use crate::messages::{ConnectionId, Peer};

/// Find a peer by connection id, or by display name when the name is
/// unambiguous.
pub fn resolve_peer(peers: &[Peer], own_id: ConnectionId, target: &str) -> Result<ConnectionId, String> {
    if let Ok(id) = target.parse::<ConnectionId>() {
        if peers.iter().any(|p| p.connection_id == id) {
            return Ok(id);
        }
        return Err(format!("No peer with id {}", id));
    }
    let matches: Vec<&Peer> = peers
        .iter()
        .filter(|p| p.connection_id != own_id && p.display_name == target.trim())
        .collect();
    match matches.as_slice() {
        [peer] => Ok(peer.connection_id),
        [] => Err(format!("No peer named {:?} is online", target)),
        _ => Err(format!(
            "{} peers are named {:?}; pass a connection id instead",
            matches.len(),
            target
        )),
    }
}

pub(crate) fn transfer_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] [{bar:40.black}] {bytes}/{total_bytes} ({eta}) {msg}")
    {
        bar.set_style(style);
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> Peer {
        Peer {
            connection_id: ConnectionId::new(),
            display_name: name.to_string(),
        }
    }

    #[test]
    fn test_resolve_by_name_and_id() {
        let me = peer("me");
        let bob = peer("bob");
        let peers = vec![me.clone(), bob.clone()];
        assert_eq!(resolve_peer(&peers, me.connection_id, "bob"), Ok(bob.connection_id));
        assert_eq!(
            resolve_peer(&peers, me.connection_id, &bob.connection_id.to_string()),
            Ok(bob.connection_id)
        );
        assert!(resolve_peer(&peers, me.connection_id, "carol").is_err());
        // never resolves to ourselves by name
        assert!(resolve_peer(&peers, me.connection_id, "me").is_err());
    }

    #[test]
    fn test_ambiguous_names_are_refused() {
        let me = peer("me");
        let peers = vec![me.clone(), peer("bob"), peer("bob")];
        let err = resolve_peer(&peers, me.connection_id, "bob").unwrap_err();
        assert!(err.contains("2 peers"));
    }
}
