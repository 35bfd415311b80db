#[macro_use]
extern crate log;
extern crate kad_swarm;
extern crate sha3;
extern crate simplelog;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use sha3::{Digest, Sha3_256};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use kad_swarm::{Address, DebugLevel, Delegate, MultiAddress, Node, Options};

struct EventLogger;

impl Delegate for EventLogger {
    fn on_ping_received(&self, from: &MultiAddress) {
        info!("ping from {}", from);
    }

    fn on_query_closer_peers_received(&self, from: &MultiAddress) {
        info!("query from {}", from);
    }

    fn on_query_closer_peers_on_frontier_received(&self, from: &MultiAddress) {
        info!("frontier query from {}", from);
    }
}

fn derive_address(name: &str) -> Address {
    let digest = Sha3_256::digest(name.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(digest.as_slice());
    Address::new(bytes)
}

fn spawn_node(name: &str, bootstrap: Vec<MultiAddress>) -> Node {
    let multi_address = MultiAddress::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        0,
        derive_address(name),
    );
    let mut options = Options::new(multi_address);
    options.bootstrap_multi_addresses = bootstrap;
    options.concurrent = true;
    options.timeout = Duration::from_secs(1);
    options.timeout_step = Duration::from_secs(1);
    options.debug = DebugLevel::Medium;
    let node = Node::new(options, Arc::new(EventLogger)).expect("could not bind node");
    if let Err(err) = node.bootstrap() {
        warn!("{} did not bootstrap: {}", node.multi_address(), err);
    }
    node
}

fn main() {
    let debug = DebugLevel::Medium;
    TermLogger::init(
        debug.level_filter(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("could not initialize logging");

    let mut nodes: HashMap<u32, Node> = HashMap::new();
    let mut id = 0;
    for i in 0..8 {
        let bootstrap = if i == 0 {
            Vec::new()
        } else {
            vec![nodes[&0].multi_address().clone()]
        };
        let node = spawn_node(&format!("node-{}", i), bootstrap);
        nodes.insert(id, node);
        id += 1;
    }

    let input = io::stdin();
    loop {
        let mut buffer = String::new();
        println!("Ready for input!");
        if input.read_line(&mut buffer).is_err() {
            break;
        }
        let args: Vec<&str> = buffer.trim_end().split(' ').collect();
        match args[0] {
            "new" => {
                let node = spawn_node(
                    &format!("node-{}", id),
                    vec![nodes[&0].multi_address().clone()],
                );
                nodes.insert(id, node);
                id += 1;
            }
            "ping" => {
                let from: u32 = args[1].parse().unwrap();
                let to: u32 = args[2].parse().unwrap();
                let to = nodes[&to].multi_address().clone();
                match nodes[&from].ping_target(&to, Duration::from_secs(2)) {
                    Ok(()) => info!("{} is healthy", to),
                    Err(err) => warn!("{} is unhealthy: {}", to, err),
                }
            }
            "search" => {
                let from: u32 = args[1].parse().unwrap();
                let target = derive_address(args[2]);
                match nodes[&from].search_target(&target, Duration::from_secs(1)) {
                    Ok(Some(found)) => info!("found {}", found),
                    Ok(None) => info!("no route to {}", target),
                    Err(err) => warn!("search failed: {}", err),
                }
            }
            "peers" => {
                let index: u32 = args[1].parse().unwrap();
                for multi_address in nodes[&index].multi_addresses() {
                    info!("{}", multi_address);
                }
            }
            "kill" => {
                let index: u32 = args[1].parse().unwrap();
                nodes[&index].kill();
            }
            _ => {}
        }
    }
}
