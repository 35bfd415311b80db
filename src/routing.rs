use std::cmp;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use time::SteadyTime;

use ADDRESS_LENGTH_IN_BITS;
use address::Address;
use error::{Error, Result};
use identity::MultiAddress;

/// An entry in a bucket: a reachable endpoint and the time at which it was
/// first stored.
#[derive(Clone, Debug)]
pub struct Entry {
    pub multi_address: MultiAddress,
    pub inserted_at: SteadyTime,
}

#[derive(Clone, Debug)]
pub struct Bucket {
    entries: Vec<Entry>,
    max_length: usize,
}

impl Bucket {
    fn new(max_length: usize) -> Self {
        Bucket {
            entries: Vec::new(),
            max_length: max_length,
        }
    }

    /// Finds the endpoint stored for the target address, if any.
    pub fn find(&self, target: &Address) -> Option<&MultiAddress> {
        self.entries
            .iter()
            .find(|entry| entry.multi_address.address() == *target)
            .map(|entry| &entry.multi_address)
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.max_length
    }

    /// The least recently stored endpoint in the bucket.
    pub fn oldest(&self) -> Option<&MultiAddress> {
        self.entries.first().map(|entry| &entry.multi_address)
    }

    /// The most recently stored endpoint in the bucket.
    pub fn newest(&self) -> Option<&MultiAddress> {
        self.entries.last().map(|entry| &entry.multi_address)
    }

    /// Restores insertion order after the entries have been permuted. The
    /// sort is stable, so entries stored at the same instant keep their
    /// relative order.
    pub fn sort_by_time(&mut self) {
        self.entries.sort_by_key(|entry| entry.inserted_at);
    }

    pub fn multi_addresses(&self) -> Vec<MultiAddress> {
        self.entries
            .iter()
            .map(|entry| entry.multi_address.clone())
            .collect()
    }

    pub fn entries(&self) -> &[Entry] {
        self.entries.as_slice()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A table of peers bucketed by the length of the prefix they share with the
/// owner's address. Established entries are favored: re-storing a known
/// address rewrites its endpoint in place without refreshing its timestamp
/// or its position, and a full bucket rejects new entries instead of
/// displacing old ones. It is safe to use concurrently.
pub struct RoutingTable {
    address: Address,
    buckets: RwLock<Vec<Bucket>>,
}

impl RoutingTable {
    pub fn new(address: Address, max_bucket_length: usize) -> Self {
        let buckets = vec![Bucket::new(max_bucket_length); ADDRESS_LENGTH_IN_BITS];
        RoutingTable {
            address: address,
            buckets: RwLock::new(buckets),
        }
    }

    /// The owner's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Stores an endpoint in its bucket. A known address has its endpoint
    /// rewritten in place; a new address is appended with the current time.
    /// Fails with `BucketFull` when the bucket has no room, and with
    /// `SelfAddress` when the endpoint carries the owner's own address.
    pub fn update(&self, multi_address: MultiAddress) -> Result<()> {
        let index = self.bucket_index(&multi_address.address())?;
        let mut buckets = self.write_buckets();
        let bucket = &mut buckets[index];
        if let Some(entry) = bucket
            .entries
            .iter_mut()
            .find(|entry| entry.multi_address.address() == multi_address.address())
        {
            // The timestamp is deliberately not refreshed.
            entry.multi_address = multi_address;
            return Ok(());
        }
        if bucket.is_full() {
            return Err(Error::BucketFull);
        }
        bucket.entries.push(Entry {
            multi_address: multi_address,
            inserted_at: SteadyTime::now(),
        });
        Ok(())
    }

    /// Removes the entry holding the endpoint's address, if present. Later
    /// entries shift one slot earlier, preserving insertion order.
    pub fn remove(&self, multi_address: &MultiAddress) -> Result<()> {
        let index = self.bucket_index(&multi_address.address())?;
        let mut buckets = self.write_buckets();
        let bucket = &mut buckets[index];
        if let Some(position) = bucket
            .entries
            .iter()
            .position(|entry| entry.multi_address.address() == multi_address.address())
        {
            bucket.entries.remove(position);
        }
        Ok(())
    }

    /// Finds the endpoint stored for the target address, if any.
    pub fn find_multi_address(&self, target: &Address) -> Result<Option<MultiAddress>> {
        let index = self.bucket_index(target)?;
        let buckets = self.read_buckets();
        Ok(buckets[index].find(target).cloned())
    }

    /// Returns a snapshot of the bucket that owns the target address.
    pub fn find_bucket(&self, target: &Address) -> Result<Bucket> {
        let index = self.bucket_index(target)?;
        let buckets = self.read_buckets();
        Ok(buckets[index].clone())
    }

    /// The index range of buckets within the given radius of the target's
    /// bucket, clamped to the table.
    pub fn neighborhood(&self, target: &Address, radius: usize) -> Result<(usize, usize)> {
        let index = self.bucket_index(target)?;
        let start = index.saturating_sub(radius);
        let end = cmp::min(ADDRESS_LENGTH_IN_BITS, index + radius);
        Ok((start, end))
    }

    /// Returns up to `alpha` endpoints drawn from the target's bucket and,
    /// as needed, from neighboring buckets, ordered by XOR distance to the
    /// target ascending.
    pub fn find_multi_address_neighbors(
        &self,
        target: &Address,
        alpha: usize,
    ) -> Result<Vec<MultiAddress>> {
        let index = self.bucket_index(target)?;
        let buckets = self.read_buckets();
        let mut multi_addresses = buckets[index].multi_addresses();
        let mut radius = 1;
        while multi_addresses.len() < alpha {
            let below = index >= radius;
            let above = index + radius < ADDRESS_LENGTH_IN_BITS;
            if !below && !above {
                break;
            }
            if below {
                multi_addresses.extend(buckets[index - radius].multi_addresses());
            }
            if above {
                multi_addresses.extend(buckets[index + radius].multi_addresses());
            }
            radius += 1;
        }
        multi_addresses
            .sort_by(|a, b| a.address().xor(target).cmp(&b.address().xor(target)));
        multi_addresses.truncate(alpha);
        Ok(multi_addresses)
    }

    /// A snapshot of every endpoint in the table.
    pub fn multi_addresses(&self) -> Vec<MultiAddress> {
        let buckets = self.read_buckets();
        buckets
            .iter()
            .flat_map(|bucket| bucket.multi_addresses())
            .collect()
    }

    fn bucket_index(&self, target: &Address) -> Result<usize> {
        let same = self.address.same_prefix_length(target);
        if same == ADDRESS_LENGTH_IN_BITS {
            return Err(Error::SelfAddress);
        }
        Ok(ADDRESS_LENGTH_IN_BITS - same - 1)
    }

    fn read_buckets(&self) -> RwLockReadGuard<Vec<Bucket>> {
        match self.buckets.read() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_buckets(&self) -> RwLockWriteGuard<Vec<Bucket>> {
        match self.buckets.write() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
