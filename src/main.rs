use std::env;
use std::net::SocketAddr;
use std::process;

use tokio::time::{interval, Duration};
use tracing::{error, info, Level};

use raft_imitate::{Config, NodeHandle, RaftError, RaftNode, RaftResult};

const BASE_PORT: u16 = 5600;

fn usage() -> ! {
    eprintln!("usage: raft-imitate <config.toml | node-count>");
    process::exit(2);
}

fn main() {
    let arg = env::args().nth(1).unwrap_or_else(|| usage());

    // A bare number starts a local cluster; anything else is a config path
    let (nodes, level) = match arg.parse::<u16>() {
        Ok(0) => usage(),
        Ok(count) => match local_cluster(count) {
            Some(nodes) => (nodes, Level::INFO),
            None => {
                eprintln!(
                    "At most {} local nodes fit from port {}",
                    u16::MAX - BASE_PORT + 1,
                    BASE_PORT
                );
                process::exit(2);
            }
        },
        Err(_) => match Config::load(&arg).and_then(|config| config.level().map(|level| (level, config))) {
            Ok((level, config)) => (vec![RaftNode::from_config(&config)], level),
            Err(e) => {
                eprintln!("Failed to load {}: {}", arg, e);
                process::exit(1);
            }
        },
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(nodes)) {
        error!(error = %e, "stopped with error");
        process::exit(1);
    }
}

/// `count` nodes on consecutive ports from `BASE_PORT`, or None if the
/// ports run past 65535.
fn local_cluster(count: u16) -> Option<Vec<RaftNode>> {
    let addresses = (0..count)
        .map(|i| BASE_PORT.checked_add(i).map(|port| SocketAddr::from(([127, 0, 0, 1], port))))
        .collect::<Option<Vec<SocketAddr>>>()?;
    let nodes = addresses
        .iter()
        .map(|&address| {
            let mut node = RaftNode::new(address);
            for &peer in &addresses {
                node.add_peer(peer);
            }
            node
        })
        .collect();
    Some(nodes)
}

async fn run(nodes: Vec<RaftNode>) -> RaftResult<()> {
    let mut handles: Vec<NodeHandle> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let handle = node.start().await?;
        info!(node = %handle.id(), "listening");
        handles.push(handle);
    }

    let mut report = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = report.tick() => {
                for handle in &handles {
                    let status = handle.status();
                    info!(
                        node = %status.id,
                        role = ?status.role,
                        term = status.term,
                        leader = ?status.leader,
                        commit_index = status.commit_index,
                        "status"
                    );
                    if !handle.is_running() {
                        error!(node = %status.id, "node halted");
                    }
                }
                if handles.iter().all(|h| !h.is_running()) {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutting down");
                break;
            }
        }
    }

    let mut first_error: Option<RaftError> = None;
    for handle in handles {
        if let Err(e) = handle.stop().await {
            error!(error = %e, "node stopped with error");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_cluster_ports() {
        let nodes = local_cluster(3).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2].address().port(), 5602);
        assert_eq!(nodes[0].peers().len(), 2);
    }

    #[test]
    fn test_local_cluster_port_overflow() {
        assert!(local_cluster(60000).is_none());
        assert!(local_cluster(u16::MAX).is_none());
    }
}
