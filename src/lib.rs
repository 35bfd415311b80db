extern crate bincode;
#[macro_use]
extern crate log;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate thiserror;
extern crate time;

pub mod address;
pub mod error;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod routing;

pub use address::{closer, Address};
pub use error::{Error, Result};
pub use identity::MultiAddress;
pub use node::options::{DebugLevel, Options};
pub use node::{Delegate, Node};

/// The number of bytes in an address.
const ADDRESS_LENGTH: usize = 32;

/// The number of buckets in the routing table, one per address bit.
const ADDRESS_LENGTH_IN_BITS: usize = ADDRESS_LENGTH * 8;

/// The maximum number of entries in a bucket.
const MAX_BUCKET_LENGTH: usize = 100;

/// The maximum number of concurrent peer expansions during a search.
const ALPHA: usize = 3;

/// The maximum length of a message in bytes.
const MESSAGE_LENGTH: usize = 8196;

/// Timeout for a single frontier expansion query in milliseconds.
const FRONTIER_QUERY_TIMEOUT: u64 = 1000;

/// Interval at which a blocked handler polls its cancellation token in
/// milliseconds.
const CANCEL_POLL_INTERVAL: u64 = 50;
