use std::time::Duration;

use log::LevelFilter;

use {ALPHA, MAX_BUCKET_LENGTH};
use identity::MultiAddress;

/// Verbosity of the node. Low keeps only swallowed errors, medium adds
/// lifecycle events, and high traces every served request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    Low,
    Medium,
    High,
}

impl DebugLevel {
    /// The logger filter that shows exactly the messages of this level.
    pub fn level_filter(&self) -> LevelFilter {
        match *self {
            DebugLevel::Low => LevelFilter::Warn,
            DebugLevel::Medium => LevelFilter::Info,
            DebugLevel::High => LevelFilter::Debug,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    /// The endpoint at which this node is reachable.
    pub multi_address: MultiAddress,
    /// Peers to contact on startup.
    pub bootstrap_multi_addresses: Vec<MultiAddress>,
    /// Capacity of each bucket in the routing table.
    pub max_bucket_length: usize,
    /// Fan-out of searches and neighbor queries.
    pub alpha: usize,
    /// Whether bootstrap peers are queried in parallel.
    pub concurrent: bool,
    /// Base timeout of a bootstrap query.
    pub timeout: Duration,
    /// Timeout growth per bootstrap attempt.
    pub timeout_step: Duration,
    /// Number of attempts per bootstrap peer.
    pub timeout_retries: usize,
    /// Deadline of the liveness probe used when pruning a full bucket.
    pub prune_timeout: Duration,
    pub debug: DebugLevel,
}

impl Options {
    pub fn new(multi_address: MultiAddress) -> Options {
        Options {
            multi_address: multi_address,
            bootstrap_multi_addresses: Vec::new(),
            max_bucket_length: MAX_BUCKET_LENGTH,
            alpha: ALPHA,
            concurrent: false,
            timeout: Duration::from_secs(10),
            timeout_step: Duration::from_secs(10),
            timeout_retries: 3,
            prune_timeout: Duration::from_secs(60),
            debug: DebugLevel::Low,
        }
    }
}
