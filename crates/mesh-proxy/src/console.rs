//! Administrative console on the proxy's stdin.
//!
//! Dumps of the node registry and the user ledger go straight to stdout;
//! `!exit` fires the shutdown channel and the server task takes it from
//! there.

use crate::ledger::UserLedger;
use crate::registry::NodeRegistry;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Run the operator console until `!exit` or stdin closes.
pub async fn run(
    registry: Arc<NodeRegistry>,
    ledger: Arc<UserLedger>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if dispatch(line, &registry, &ledger) {
            let _ = shutdown_tx.send(());
            break;
        }
    }
}

/// Handle one console line; returns true when the proxy should shut down.
fn dispatch(line: &str, registry: &NodeRegistry, ledger: &UserLedger) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let command = tokens.first().copied().unwrap_or("");
    let extra = tokens.len().saturating_sub(1);
    match command {
        "!fileservers" => {
            if extra == 0 {
                print_nodes(registry);
            } else {
                println!("Wrong parameters - Usage: !fileservers");
            }
            false
        }
        "!users" => {
            if extra == 0 {
                print_users(ledger);
            } else {
                println!("Wrong parameters - Usage: !users");
            }
            false
        }
        "!exit" => {
            if extra == 0 {
                println!("Exit success!");
                true
            } else {
                println!("Wrong parameters - Usage: !exit");
                false
            }
        }
        _ => {
            println!("Unknown command: {}", tokens.join(" "));
            false
        }
    }
}

fn print_nodes(registry: &NodeRegistry) {
    let nodes = registry.snapshot();
    if nodes.is_empty() {
        println!("No servers registered!");
        return;
    }
    for node in nodes {
        let status = if node.online { "online" } else { "offline" };
        println!(
            "IP:{} Port:{} {} Usage: {}",
            node.address, node.listen_port, status, node.cumulative_load
        );
    }
}

fn print_users(ledger: &UserLedger) {
    let users = ledger.snapshot();
    if users.is_empty() {
        println!("No users found!");
        return;
    }
    for user in users {
        let status = if user.logged_in { "online" } else { "offline" };
        println!("{} {} Credits: {}", user.name, status, user.credits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixtures() -> (NodeRegistry, UserLedger) {
        (
            NodeRegistry::new(Duration::from_secs(3)),
            UserLedger::new(vec![("alice".into(), "secret".into(), 200)]),
        )
    }

    #[test]
    fn exit_requests_shutdown() {
        let (registry, ledger) = fixtures();
        assert!(dispatch("!exit", &registry, &ledger));
        assert!(!dispatch("!exit now", &registry, &ledger));
    }

    #[test]
    fn dumps_do_not_shut_down() {
        let (registry, ledger) = fixtures();
        assert!(!dispatch("!fileservers", &registry, &ledger));
        assert!(!dispatch("!fileservers all", &registry, &ledger));
        assert!(!dispatch("!users", &registry, &ledger));
        assert!(!dispatch("!bogus", &registry, &ledger));
    }
}
