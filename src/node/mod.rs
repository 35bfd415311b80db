pub mod options;

use std::cmp;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use {CANCEL_POLL_INTERVAL, FRONTIER_QUERY_TIMEOUT};
use address::{closer, Address};
use error::{Error, Result};
use identity::MultiAddress;
use node::options::Options;
use protocol::{
    CancelToken, Message, Protocol, Request, RequestPayload, Response, ResponsePayload,
};
use routing::RoutingTable;

/// Callbacks injected by the embedder, invoked after each served request.
/// They run on the handler's thread and must be cheap and non-blocking.
pub trait Delegate {
    fn on_ping_received(&self, from: &MultiAddress);
    fn on_query_closer_peers_received(&self, from: &MultiAddress);
    fn on_query_closer_peers_on_frontier_received(&self, from: &MultiAddress);
}

#[derive(Clone)]
pub struct Node {
    options: Options,
    delegate: Arc<dyn Delegate + Send + Sync>,
    routing_table: Arc<RoutingTable>,
    protocol: Arc<Protocol>,
    pending_requests: Arc<Mutex<HashMap<Address, Sender<Response>>>>,
    inflight_requests: Arc<Mutex<HashMap<Address, CancelToken>>>,
    is_active: Arc<AtomicBool>,
}

impl Node {
    /// Binds the node to the endpoint named by `options.multi_address` and
    /// starts serving requests. A port of zero is replaced by the port the
    /// operating system assigns.
    pub fn new(mut options: Options, delegate: Arc<dyn Delegate + Send + Sync>) -> Result<Node> {
        let socket = UdpSocket::bind(options.multi_address.socket_addr())?;
        let local_addr = socket.local_addr()?;
        if options.multi_address.port() == 0 {
            options.multi_address = MultiAddress::new(
                local_addr.ip(),
                local_addr.port(),
                options.multi_address.address(),
            );
        }
        let routing_table = RoutingTable::new(
            options.multi_address.address(),
            options.max_bucket_length,
        );
        let (message_tx, message_rx) = channel();
        let protocol = Protocol::new(socket, message_tx);

        let node = Node {
            options: options,
            delegate: delegate,
            routing_table: Arc::new(routing_table),
            protocol: Arc::new(protocol),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            inflight_requests: Arc::new(Mutex::new(HashMap::new())),
            is_active: Arc::new(AtomicBool::new(true)),
        };
        node.start_message_handler(message_rx);
        Ok(node)
    }

    pub fn address(&self) -> Address {
        self.options.multi_address.address()
    }

    pub fn multi_address(&self) -> &MultiAddress {
        &self.options.multi_address
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// A snapshot of every peer this node knows.
    pub fn multi_addresses(&self) -> Vec<MultiAddress> {
        self.routing_table.multi_addresses()
    }

    /// Stops serving requests and cancels every in-flight handler.
    pub fn kill(&self) {
        if let Err(err) = self
            .protocol
            .send_message(&Message::Kill, &self.options.multi_address.socket_addr())
        {
            warn!("{} could not be killed: {}", self.options.multi_address, err);
        }
    }

    /// Connects the node to the network by searching for itself through each
    /// bootstrap peer. Succeeds when any bootstrap peer yields at least one
    /// discovered peer; if every peer fails all its attempts, the last
    /// transport error is surfaced.
    pub fn bootstrap(&self) -> Result<()> {
        info!("{} is bootstrapping...", self.options.multi_address);
        for bootstrap_multi_address in &self.options.bootstrap_multi_addresses {
            if let Err(err) = self.routing_table.update(bootstrap_multi_address.clone()) {
                warn!(
                    "{} could not store bootstrap peer {}: {}",
                    self.options.multi_address, bootstrap_multi_address, err,
                );
            }
        }

        let outcomes: Vec<Result<usize>> = if self.options.concurrent {
            let (tx, rx) = channel();
            for bootstrap_multi_address in self.options.bootstrap_multi_addresses.clone() {
                let node = self.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let outcome = node.bootstrap_using_multi_address(&bootstrap_multi_address);
                    if tx.send(outcome).is_err() {
                        warn!("bootstrap result receiver closed early");
                    }
                });
            }
            drop(tx);
            rx.iter().collect()
        } else {
            self.options
                .bootstrap_multi_addresses
                .iter()
                .map(|bootstrap_multi_address| {
                    self.bootstrap_using_multi_address(bootstrap_multi_address)
                })
                .collect()
        };

        info!(
            "{} connected to {} peers after bootstrapping",
            self.options.multi_address,
            self.multi_addresses().len(),
        );
        for multi_address in self.multi_addresses() {
            debug!("{} is connected to {}", self.options.multi_address, multi_address);
        }

        if self.options.bootstrap_multi_addresses.is_empty() {
            return Ok(());
        }
        let mut discovered = 0;
        let mut last_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(count) => discovered += count,
                Err(err) => last_error = Some(err),
            }
        }
        if discovered > 0 {
            return Ok(());
        }
        match last_error {
            Some(err) => Err(err),
            None => Err(Error::Transport(
                "no peers were discovered during bootstrap".to_string(),
            )),
        }
    }

    fn bootstrap_using_multi_address(
        &self,
        bootstrap_multi_address: &MultiAddress,
    ) -> Result<usize> {
        let mut peers = Vec::new();
        for attempt in 0..self.options.timeout_retries {
            let timeout = self.options.timeout + self.options.timeout_step * attempt as u32;
            match self.query_closer_peers_on_frontier_from_target(
                bootstrap_multi_address,
                &self.address(),
                timeout,
            ) {
                Ok(found) => {
                    peers = found;
                    break;
                }
                // A bootstrap peer may simply be unavailable right now.
                Err(err) => {
                    warn!(
                        "{} bootstrap attempt {} against {} failed: {}",
                        self.options.multi_address,
                        attempt + 1,
                        bootstrap_multi_address,
                        err,
                    );
                    if attempt + 1 == self.options.timeout_retries {
                        return Err(err);
                    }
                }
            }
        }

        info!(
            "{} received {} peers from {}",
            self.options.multi_address,
            peers.len(),
            bootstrap_multi_address.address(),
        );
        let mut stored = 0;
        for peer in peers {
            if peer.address() == self.address() {
                continue;
            }
            match self.routing_table.update(peer.clone()) {
                Ok(()) => stored += 1,
                Err(err) => {
                    warn!(
                        "{} could not store discovered peer {}: {}",
                        self.options.multi_address, peer, err,
                    );
                }
            }
        }
        Ok(stored)
    }

    /// Routes toward `target` by repeatedly querying the closest known
    /// peers, up to `options.alpha` of them in parallel, until the target
    /// itself is found or no closer peers remain. Every peer discovered on
    /// the way is recorded in the routing table.
    pub fn search_target(
        &self,
        target: &Address,
        timeout: Duration,
    ) -> Result<Option<MultiAddress>> {
        let seeds = self
            .routing_table
            .find_multi_address_neighbors(target, self.options.alpha)?;
        let mut seen: HashSet<Address> = seeds.iter().map(|peer| peer.address()).collect();
        seen.insert(self.address());
        let mut closed = HashSet::new();
        closed.insert(self.address());
        let mut open: BinaryHeap<MultiAddressDistancePair> = seeds
            .into_iter()
            .map(|peer| {
                let distance = peer.address().xor(target);
                MultiAddressDistancePair(peer, distance)
            })
            .collect();

        loop {
            match open.peek() {
                Some(head) => {
                    if head.0.address() == *target {
                        return Ok(Some(head.0.clone()));
                    }
                }
                None => return Ok(None),
            }

            let mut expansions = Vec::new();
            while expansions.len() < self.options.alpha {
                match open.pop() {
                    Some(pair) => {
                        if closed.contains(&pair.0.address()) {
                            continue;
                        }
                        expansions.push(pair.0);
                    }
                    None => break,
                }
            }
            if expansions.is_empty() {
                return Ok(None);
            }

            let (tx, rx) = channel();
            for peer in expansions {
                let node = self.clone();
                let target = *target;
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = node.query_closer_peers_from_target(&peer, &target, timeout);
                    if tx.send((peer, result)).is_err() {
                        warn!("search result receiver closed before the query returned");
                    }
                });
            }
            drop(tx);

            for (peer, result) in rx.iter() {
                closed.insert(peer.address());
                match result {
                    Ok(candidates) => {
                        for candidate in candidates {
                            if !seen.insert(candidate.address()) {
                                continue;
                            }
                            if let Err(err) = self.update_peer(&candidate) {
                                warn!(
                                    "{} could not record discovered peer {}: {}",
                                    self.options.multi_address, candidate, err,
                                );
                            }
                            let distance = candidate.address().xor(target);
                            open.push(MultiAddressDistancePair(candidate, distance));
                        }
                    }
                    Err(err) => {
                        warn!(
                            "{} dropping search peer {}: {}",
                            self.options.multi_address, peer, err,
                        );
                    }
                }
            }
        }
    }

    /// Tests the connection to a peer. A peer that does not respond within
    /// the timeout should be considered unhealthy.
    pub fn ping_target(&self, to: &MultiAddress, timeout: Duration) -> Result<()> {
        let (token, rx) = self.send_request(to, RequestPayload::Ping)?;
        let result = match rx.recv_timeout(timeout) {
            Ok(Response {
                payload: ResponsePayload::Pong,
                ..
            }) => Ok(()),
            Ok(response) => Err(unexpected_response("ping", response)),
            Err(_) => {
                self.cancel_remote(to, token);
                Err(Error::Transport(format!("ping to {} timed out", to)))
            }
        };
        self.deregister(&token);
        result
    }

    /// Asks a peer for up to `alpha` peers closer to `target` than the peer
    /// itself. The returned endpoints are not guaranteed to be healthy.
    pub fn query_closer_peers_from_target(
        &self,
        to: &MultiAddress,
        target: &Address,
        timeout: Duration,
    ) -> Result<Vec<MultiAddress>> {
        let (token, rx) = self.send_request(to, RequestPayload::QueryCloserPeers(*target))?;
        let result = match rx.recv_timeout(timeout) {
            Ok(Response {
                payload: ResponsePayload::Peers(multi_addresses),
                ..
            }) => decode_multi_addresses(&multi_addresses),
            Ok(response) => Err(unexpected_response("query", response)),
            Err(_) => {
                self.cancel_remote(to, token);
                Err(Error::Transport(format!("query to {} timed out", to)))
            }
        };
        self.deregister(&token);
        result
    }

    /// Asks a peer to walk its own frontier toward `target` and aggregates
    /// the streamed discoveries into a list. The timeout is a deadline on
    /// the whole stream.
    pub fn query_closer_peers_on_frontier_from_target(
        &self,
        to: &MultiAddress,
        target: &Address,
        timeout: Duration,
    ) -> Result<Vec<MultiAddress>> {
        let (token, rx) =
            self.send_request(to, RequestPayload::QueryCloserPeersOnFrontier(*target))?;
        let deadline = Instant::now() + timeout;
        let mut peers = Vec::new();
        let result = loop {
            let now = Instant::now();
            if now >= deadline {
                self.cancel_remote(to, token);
                break Err(Error::Transport(format!(
                    "frontier query to {} timed out",
                    to,
                )));
            }
            match rx.recv_timeout(deadline - now) {
                Ok(Response {
                    payload: ResponsePayload::FrontierPeer(multi_address),
                    ..
                }) => match multi_address.parse() {
                    Ok(peer) => peers.push(peer),
                    Err(err) => break Err(err),
                },
                Ok(Response {
                    payload: ResponsePayload::FrontierEnd,
                    ..
                }) => break Ok(peers),
                Ok(response) => break Err(unexpected_response("frontier query", response)),
                Err(_) => {
                    self.cancel_remote(to, token);
                    break Err(Error::Transport(format!(
                        "frontier query to {} timed out",
                        to,
                    )));
                }
            }
        };
        self.deregister(&token);
        result
    }

    fn start_message_handler(&self, rx: Receiver<Message>) {
        let node = self.clone();
        thread::spawn(move || {
            for message in rx.iter() {
                match message {
                    Message::Request(request) => {
                        let handler = node.clone();
                        thread::spawn(move || handler.handle_request(request));
                    }
                    Message::Response(response) => node.handle_response(response),
                    Message::Kill => {
                        node.is_active.store(false, Ordering::Release);
                        for token in lock(&node.inflight_requests).values() {
                            token.cancel();
                        }
                        info!("{} stopped serving requests", node.options.multi_address);
                        break;
                    }
                }
            }
        });
    }

    fn handle_request(&self, request: Request) {
        if !self.is_active.load(Ordering::Acquire) {
            return;
        }
        let Request {
            id,
            sender,
            payload,
        } = request;

        if let RequestPayload::Cancel(ref request_id) = payload {
            if let Some(token) = lock(&self.inflight_requests).get(request_id) {
                token.cancel();
            }
            return;
        }

        let from = match sender.parse::<MultiAddress>() {
            Ok(from) => from,
            Err(err) => {
                warn!(
                    "{} rejecting a request with a malformed sender: {}",
                    self.options.multi_address, err,
                );
                return;
            }
        };

        let token = CancelToken::new();
        lock(&self.inflight_requests).insert(id, token.clone());
        let result = match payload {
            RequestPayload::Ping => {
                let node = self.clone();
                let from = from.clone();
                self.finish_or_cancel(&token, move || {
                    node.serve_ping(&from)?;
                    Ok(ResponsePayload::Pong)
                })
            }
            RequestPayload::QueryCloserPeers(target) => {
                let node = self.clone();
                let from = from.clone();
                self.finish_or_cancel(&token, move || {
                    let peers = node.serve_query_closer_peers(&target, &from)?;
                    Ok(ResponsePayload::Peers(
                        peers.iter().map(|peer| peer.to_string()).collect(),
                    ))
                })
            }
            RequestPayload::QueryCloserPeersOnFrontier(target) => {
                let node = self.clone();
                let from = from.clone();
                let cancel = token.clone();
                self.finish_or_cancel(&token, move || {
                    node.serve_frontier(&target, &from, id, &cancel)?;
                    Ok(ResponsePayload::FrontierEnd)
                })
            }
            RequestPayload::Cancel(..) => {
                lock(&self.inflight_requests).remove(&id);
                return;
            }
        };
        lock(&self.inflight_requests).remove(&id);

        let payload = match result {
            Ok(payload) => payload,
            Err(err) => {
                debug!(
                    "{} could not serve {}: {}",
                    self.options.multi_address, from, err,
                );
                ResponsePayload::Error(err.to_string())
            }
        };
        let response = Message::Response(Response {
            request_id: id,
            receiver: self.options.multi_address.to_string(),
            payload: payload,
        });
        if let Err(err) = self.protocol.send_message(&response, &from.socket_addr()) {
            warn!(
                "{} could not respond to {}: {}",
                self.options.multi_address, from, err,
            );
        }
    }

    fn handle_response(&self, response: Response) {
        let request_id = response.request_id;
        let mut pending_requests = lock(&self.pending_requests);
        let mut stale = false;
        if let Some(sender) = pending_requests.get(&request_id) {
            stale = sender.send(response).is_err();
        } else {
            debug!(
                "{} dropping a response without a waiting request",
                self.options.multi_address,
            );
        }
        if stale {
            pending_requests.remove(&request_id);
        }
    }

    /// Runs the blocking body of a handler on a worker thread and races it
    /// against the request's cancellation token. A cancelled handler returns
    /// immediately; the worker is left to finish and its result discarded.
    fn finish_or_cancel<T, F>(&self, cancel: &CancelToken, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = channel();
        thread::spawn(move || {
            let _ = tx.send(work());
        });
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match rx.recv_timeout(Duration::from_millis(CANCEL_POLL_INTERVAL)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport(
                        "request worker exited before sending a result".to_string(),
                    ))
                }
            }
        }
    }

    fn serve_ping(&self, from: &MultiAddress) -> Result<()> {
        debug!("{} was pinged by {}", self.options.multi_address, from);
        self.delegate.on_ping_received(from);
        self.update_peer(from)
    }

    fn serve_query_closer_peers(
        &self,
        target: &Address,
        from: &MultiAddress,
    ) -> Result<Vec<MultiAddress>> {
        debug!(
            "{} was queried by {} for peers near {}",
            self.options.multi_address, from, target,
        );
        let peers = self
            .routing_table
            .find_multi_address_neighbors(target, self.options.alpha)?;
        let mut closer_peers = Vec::with_capacity(peers.len());
        for peer in peers {
            if closer(&peer.address(), &self.address(), target) {
                closer_peers.push(peer);
            }
        }
        self.delegate.on_query_closer_peers_received(from);
        self.update_peer(from)?;
        Ok(closer_peers)
    }

    /// Expands a wavefront of peers strictly moving toward `target`,
    /// streaming every discovery to the caller as it is found. Peers that
    /// fail to answer within a second are skipped; the search ends when the
    /// frontier is exhausted.
    fn serve_frontier(
        &self,
        target: &Address,
        from: &MultiAddress,
        request_id: Address,
        cancel: &CancelToken,
    ) -> Result<()> {
        debug!(
            "{} was frontier queried by {} for {}",
            self.options.multi_address, from, target,
        );
        let peers = self.routing_table.multi_addresses();

        let mut frontier = VecDeque::with_capacity(peers.len());
        let mut black = HashSet::new();
        let mut white = HashSet::new();

        for peer in peers {
            if closer(&peer.address(), &self.address(), target) {
                self.stream_frontier_peer(&peer, request_id, from)?;
                frontier.push_back(peer);
            }
        }

        // The node running the query is closed immediately, and everything
        // already on the frontier is marked as seen.
        black.insert(self.address());
        for peer in &frontier {
            white.insert(peer.address());
        }

        while let Some(peer) = frontier.pop_front() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            black.insert(peer.address());
            // The target itself has no better neighbors to offer.
            if peer.address() == *target {
                continue;
            }
            let candidates = match self.query_closer_peers_from_target(
                &peer,
                target,
                Duration::from_millis(FRONTIER_QUERY_TIMEOUT),
            ) {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(
                        "{} skipping frontier peer {}: {}",
                        self.options.multi_address, peer, err,
                    );
                    continue;
                }
            };
            for candidate in candidates {
                if black.contains(&candidate.address()) || white.contains(&candidate.address()) {
                    continue;
                }
                self.stream_frontier_peer(&candidate, request_id, from)?;
                white.insert(candidate.address());
                frontier.push_back(candidate);
            }
        }

        self.delegate.on_query_closer_peers_on_frontier_received(from);
        self.update_peer(from)
    }

    fn stream_frontier_peer(
        &self,
        peer: &MultiAddress,
        request_id: Address,
        to: &MultiAddress,
    ) -> Result<()> {
        let response = Message::Response(Response {
            request_id: request_id,
            receiver: self.options.multi_address.to_string(),
            payload: ResponsePayload::FrontierPeer(peer.to_string()),
        });
        self.protocol.send_message(&response, &to.socket_addr())
    }

    /// The write path invoked by every served request. A peer that would
    /// overflow its bucket triggers a liveness probe of the bucket's oldest
    /// entry; the new peer is dropped unless the probe fails.
    fn update_peer(&self, peer: &MultiAddress) -> Result<()> {
        if peer.address() == self.address() {
            return Ok(());
        }
        match self.routing_table.update(peer.clone()) {
            Ok(()) => Ok(()),
            Err(Error::BucketFull) => {
                if self.prune(&peer.address())? {
                    match self.routing_table.update(peer.clone()) {
                        // Lost the slot to a concurrent writer; keep the
                        // established entries.
                        Err(Error::BucketFull) => Ok(()),
                        other => other,
                    }
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Probes the oldest entry of the bucket owning `target` and evicts it
    /// if it no longer responds. Returns whether an entry was evicted.
    fn prune(&self, target: &Address) -> Result<bool> {
        let bucket = self.routing_table.find_bucket(target)?;
        let oldest = match bucket.oldest() {
            Some(multi_address) => multi_address.clone(),
            None => return Ok(false),
        };
        if self.ping_target(&oldest, self.options.prune_timeout).is_err() {
            self.routing_table.remove(&oldest)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn send_request(
        &self,
        to: &MultiAddress,
        payload: RequestPayload,
    ) -> Result<(Address, Receiver<Response>)> {
        let (response_tx, response_rx) = channel();
        let mut pending_requests = lock(&self.pending_requests);
        let mut token = Address::rand();
        while pending_requests.contains_key(&token) {
            token = Address::rand();
        }
        pending_requests.insert(token, response_tx);
        drop(pending_requests);

        let request = Message::Request(Request {
            id: token,
            sender: self.options.multi_address.to_string(),
            payload: payload,
        });
        if let Err(err) = self.protocol.send_message(&request, &to.socket_addr()) {
            self.deregister(&token);
            return Err(err);
        }
        Ok((token, response_rx))
    }

    fn deregister(&self, token: &Address) {
        lock(&self.pending_requests).remove(token);
    }

    /// Tells a peer to abandon a request this node is no longer waiting on.
    fn cancel_remote(&self, to: &MultiAddress, request_id: Address) {
        let request = Message::Request(Request {
            id: Address::rand(),
            sender: self.options.multi_address.to_string(),
            payload: RequestPayload::Cancel(request_id),
        });
        if let Err(err) = self.protocol.send_message(&request, &to.socket_addr()) {
            debug!(
                "{} could not cancel a request to {}: {}",
                self.options.multi_address, to, err,
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn decode_multi_addresses(multi_addresses: &[String]) -> Result<Vec<MultiAddress>> {
    multi_addresses
        .iter()
        .map(|multi_address| multi_address.parse())
        .collect()
}

fn unexpected_response(operation: &str, response: Response) -> Error {
    match response.payload {
        ResponsePayload::Error(message) => {
            Error::Transport(format!("remote error: {}", message))
        }
        _ => Error::Transport(format!("unexpected response to {}", operation)),
    }
}

#[derive(Clone, Debug)]
struct MultiAddressDistancePair(MultiAddress, Address);

impl PartialEq for MultiAddressDistancePair {
    fn eq(&self, other: &MultiAddressDistancePair) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for MultiAddressDistancePair {}

impl PartialOrd for MultiAddressDistancePair {
    fn partial_cmp(&self, other: &MultiAddressDistancePair) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MultiAddressDistancePair {
    // Reversed so that the head of a binary heap is the pair closest to the
    // target, with ties broken by address order.
    fn cmp(&self, other: &MultiAddressDistancePair) -> cmp::Ordering {
        other
            .1
            .cmp(&self.1)
            .then_with(|| other.0.address().cmp(&self.0.address()))
    }
}

#[cfg(test)]
mod tests {
    use super::{lock, Delegate, Node};
    use MESSAGE_LENGTH;
    use address::Address;
    use bincode;
    use error::{Error, Result};
    use identity::MultiAddress;
    use node::options::Options;
    use protocol::{CancelToken, Message, Request, RequestPayload, Response, ResponsePayload};
    use std::net::{IpAddr, Ipv4Addr, UdpSocket};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingDelegate {
        pings: AtomicUsize,
        queries: AtomicUsize,
        frontier_queries: AtomicUsize,
    }

    impl Delegate for CountingDelegate {
        fn on_ping_received(&self, _from: &MultiAddress) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }

        fn on_query_closer_peers_received(&self, _from: &MultiAddress) {
            self.queries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_query_closer_peers_on_frontier_received(&self, _from: &MultiAddress) {
            self.frontier_queries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn address_with_lead(lead: u8) -> Address {
        let mut bytes = [0u8; 32];
        bytes[0] = lead;
        Address::new(bytes)
    }

    fn local_options(address: Address) -> Options {
        Options::new(MultiAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            address,
        ))
    }

    fn spawn_node(options: Options) -> (Node, Arc<CountingDelegate>) {
        let delegate = Arc::new(CountingDelegate::default());
        let node = Node::new(options, delegate.clone()).unwrap();
        (node, delegate)
    }

    #[test]
    fn test_ping_records_the_caller() {
        let (n1, _) = spawn_node(local_options(address_with_lead(0x01)));
        let (n2, d2) = spawn_node(local_options(address_with_lead(0x80)));

        n1.ping_target(n2.multi_address(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(n2.multi_addresses(), vec![n1.multi_address().clone()]);
        assert_eq!(d2.pings.load(Ordering::SeqCst), 1);

        // Pinging again does not duplicate the entry.
        n1.ping_target(n2.multi_address(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(n2.multi_addresses().len(), 1);

        n1.kill();
        n2.kill();
    }

    #[test]
    fn test_query_returns_only_closer_peers() {
        let target = Address::new([0xFF; 32]);
        let (n1, _) = spawn_node(local_options(address_with_lead(0x01)));
        let (n2, d2) = spawn_node(local_options(address_with_lead(0xF0)));
        let (n3, _) = spawn_node(local_options(address_with_lead(0xFE)));
        let (n4, _) = spawn_node(local_options(address_with_lead(0x10)));

        n2.routing_table.update(n3.multi_address().clone()).unwrap();
        n2.routing_table.update(n4.multi_address().clone()).unwrap();

        let peers = n1
            .query_closer_peers_from_target(n2.multi_address(), &target, Duration::from_secs(2))
            .unwrap();
        assert_eq!(peers, vec![n3.multi_address().clone()]);
        assert_eq!(d2.queries.load(Ordering::SeqCst), 1);
        // The caller is recorded by the served query.
        assert!(n2.multi_addresses().contains(n1.multi_address()));

        for node in &[n1, n2, n3, n4] {
            node.kill();
        }
    }

    #[test]
    fn test_frontier_streams_closer_peers_in_discovery_order() {
        let (n0, _) = spawn_node(local_options(address_with_lead(0x02)));
        let (n1, d1) = spawn_node(local_options(address_with_lead(0x01)));
        let (n2, _) = spawn_node(local_options(address_with_lead(0xC0)));
        let (n3, _) = spawn_node(local_options(Address::new([0xFF; 32])));

        n1.routing_table.update(n2.multi_address().clone()).unwrap();
        n2.routing_table.update(n3.multi_address().clone()).unwrap();

        let peers = n0
            .query_closer_peers_on_frontier_from_target(
                n1.multi_address(),
                &n3.address(),
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(
            peers,
            vec![n2.multi_address().clone(), n3.multi_address().clone()],
        );
        assert_eq!(d1.frontier_queries.load(Ordering::SeqCst), 1);
        assert!(n1.multi_addresses().contains(n0.multi_address()));

        for node in &[n0, n1, n2, n3] {
            node.kill();
        }
    }

    #[test]
    fn test_frontier_terminates_on_cycles_without_duplicates() {
        let target = Address::new([0xFF; 32]);
        let (n0, _) = spawn_node(local_options(address_with_lead(0x02)));
        let (n1, _) = spawn_node(local_options(address_with_lead(0x01)));
        let (n2, _) = spawn_node(local_options(address_with_lead(0xC0)));
        let (n3, _) = spawn_node(local_options(address_with_lead(0xE0)));

        n1.routing_table.update(n2.multi_address().clone()).unwrap();
        n1.routing_table.update(n3.multi_address().clone()).unwrap();
        n2.routing_table.update(n3.multi_address().clone()).unwrap();
        n3.routing_table.update(n2.multi_address().clone()).unwrap();

        let peers = n0
            .query_closer_peers_on_frontier_from_target(
                n1.multi_address(),
                &target,
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(n2.multi_address()));
        assert!(peers.contains(n3.multi_address()));

        for node in &[n0, n1, n2, n3] {
            node.kill();
        }
    }

    #[test]
    fn test_full_bucket_prunes_dead_oldest() {
        let mut options = local_options(address_with_lead(0x01));
        options.max_bucket_length = 1;
        options.prune_timeout = Duration::from_millis(300);
        let (n1, _) = spawn_node(options);

        // A bound socket that never answers stands in for a dead peer.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dead = MultiAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            silent.local_addr().unwrap().port(),
            address_with_lead(0x80),
        );
        n1.routing_table.update(dead).unwrap();

        let (n2, _) = spawn_node(local_options(address_with_lead(0xC0)));
        n2.ping_target(n1.multi_address(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(n1.multi_addresses(), vec![n2.multi_address().clone()]);

        n1.kill();
        n2.kill();
    }

    #[test]
    fn test_full_bucket_keeps_live_oldest() {
        let mut options = local_options(address_with_lead(0x01));
        options.max_bucket_length = 1;
        options.prune_timeout = Duration::from_secs(2);
        let (n1, _) = spawn_node(options);
        let (n3, _) = spawn_node(local_options(address_with_lead(0x80)));
        n1.routing_table.update(n3.multi_address().clone()).unwrap();

        let (n2, _) = spawn_node(local_options(address_with_lead(0xC0)));
        n2.ping_target(n1.multi_address(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(n1.multi_addresses(), vec![n3.multi_address().clone()]);

        for node in &[n1, n2, n3] {
            node.kill();
        }
    }

    #[test]
    fn test_search_walks_toward_the_target() {
        let (n1, _) = spawn_node(local_options(address_with_lead(0x01)));
        let (n2, _) = spawn_node(local_options(address_with_lead(0xC0)));
        let (n3, _) = spawn_node(local_options(Address::new([0xFF; 32])));

        n1.routing_table.update(n2.multi_address().clone()).unwrap();
        n2.routing_table.update(n3.multi_address().clone()).unwrap();

        let found = n1
            .search_target(&n3.address(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(found, Some(n3.multi_address().clone()));
        // Peers discovered on the way are recorded.
        assert!(n1.multi_addresses().contains(n3.multi_address()));

        let missing = Address::new([0xAB; 32]);
        assert_eq!(
            n2.search_target(&missing, Duration::from_millis(200)).unwrap(),
            None,
        );

        for node in &[n1, n2, n3] {
            node.kill();
        }
    }

    #[test]
    fn test_bootstrap_discovers_peers_close_to_self() {
        let (b, _) = spawn_node(local_options(address_with_lead(0x80)));
        let (p1, _) = spawn_node(local_options(address_with_lead(0x40)));
        let (p2, _) = spawn_node(local_options(address_with_lead(0x01)));
        b.routing_table.update(p1.multi_address().clone()).unwrap();
        b.routing_table.update(p2.multi_address().clone()).unwrap();

        let mut options = local_options(address_with_lead(0x41));
        options.bootstrap_multi_addresses = vec![b.multi_address().clone()];
        options.timeout = Duration::from_secs(2);
        let (n, _) = spawn_node(options);

        n.bootstrap().unwrap();
        let known = n.multi_addresses();
        assert!(known.contains(b.multi_address()));
        assert!(known.contains(p1.multi_address()));
        assert!(known.contains(p2.multi_address()));

        for node in &[b, p1, p2, n] {
            node.kill();
        }
    }

    #[test]
    fn test_concurrent_bootstrap_uses_every_peer() {
        let (b1, _) = spawn_node(local_options(address_with_lead(0x80)));
        let (b2, _) = spawn_node(local_options(address_with_lead(0xC0)));
        let (p1, _) = spawn_node(local_options(address_with_lead(0x02)));
        let (p2, _) = spawn_node(local_options(address_with_lead(0x03)));
        b1.routing_table.update(p1.multi_address().clone()).unwrap();
        b2.routing_table.update(p2.multi_address().clone()).unwrap();

        let mut options = local_options(address_with_lead(0x01));
        options.bootstrap_multi_addresses =
            vec![b1.multi_address().clone(), b2.multi_address().clone()];
        options.concurrent = true;
        options.timeout = Duration::from_secs(2);
        let (n, _) = spawn_node(options);

        n.bootstrap().unwrap();
        let known = n.multi_addresses();
        for peer in &[&b1, &b2, &p1, &p2] {
            assert!(known.contains(peer.multi_address()));
        }

        for node in &[b1, b2, p1, p2, n] {
            node.kill();
        }
    }

    fn spawn_flaky_bootstrap_peer(responds_on: usize) -> MultiAddress {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let multi_address = MultiAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            socket.local_addr().unwrap().port(),
            address_with_lead(0xE0),
        );
        let receiver = multi_address.clone();
        let discovered = MultiAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            40999,
            address_with_lead(0x90),
        );
        thread::spawn(move || {
            let mut buffer = [0u8; MESSAGE_LENGTH];
            let mut frontier_requests = 0;
            loop {
                let (len, src) = match socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(_) => return,
                };
                let message: Message = match bincode::deserialize(&buffer[..len]) {
                    Ok(message) => message,
                    Err(_) => continue,
                };
                let request = match message {
                    Message::Request(request) => request,
                    _ => continue,
                };
                if let RequestPayload::QueryCloserPeersOnFrontier(_) = request.payload {
                    frontier_requests += 1;
                    if frontier_requests < responds_on {
                        continue;
                    }
                    let payloads = vec![
                        ResponsePayload::FrontierPeer(discovered.to_string()),
                        ResponsePayload::FrontierEnd,
                    ];
                    for payload in payloads {
                        let response = Message::Response(Response {
                            request_id: request.id,
                            receiver: receiver.to_string(),
                            payload: payload,
                        });
                        let encoded =
                            bincode::serialize(&response, bincode::Bounded(MESSAGE_LENGTH as u64))
                                .unwrap();
                        socket.send_to(&encoded, src).unwrap();
                    }
                    return;
                }
            }
        });
        multi_address
    }

    #[test]
    fn test_bootstrap_retries_until_the_peer_responds() {
        let flaky = spawn_flaky_bootstrap_peer(3);
        let mut options = local_options(address_with_lead(0x01));
        options.bootstrap_multi_addresses = vec![flaky];
        options.timeout = Duration::from_millis(200);
        options.timeout_step = Duration::from_millis(100);
        options.timeout_retries = 3;
        let (n, _) = spawn_node(options);

        n.bootstrap().unwrap();
        assert!(n
            .multi_addresses()
            .iter()
            .any(|peer| peer.address() == address_with_lead(0x90)));

        n.kill();
    }

    #[test]
    fn test_bootstrap_surfaces_failure_after_retries() {
        let flaky = spawn_flaky_bootstrap_peer(3);
        let mut options = local_options(address_with_lead(0x01));
        options.bootstrap_multi_addresses = vec![flaky];
        options.timeout = Duration::from_millis(200);
        options.timeout_step = Duration::from_millis(100);
        options.timeout_retries = 2;
        let (n, _) = spawn_node(options);

        match n.bootstrap() {
            Err(Error::Transport(_)) => {}
            other => panic!("expected Transport, got {:?}", other),
        }

        n.kill();
    }

    #[test]
    fn test_cancelled_handler_returns_before_its_worker() {
        let (n, _) = spawn_node(local_options(address_with_lead(0x01)));
        let token = CancelToken::new();
        let cancel = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let started = Instant::now();
        let result: Result<()> = n.finish_or_cancel(&token, || {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        });
        match result {
            Err(Error::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        n.kill();
    }

    #[test]
    fn test_cancel_for_an_unknown_request_is_ignored() {
        let (n1, _) = spawn_node(local_options(address_with_lead(0x01)));
        let (n2, _) = spawn_node(local_options(address_with_lead(0x80)));

        let request = Message::Request(Request {
            id: Address::rand(),
            sender: n2.multi_address().to_string(),
            payload: RequestPayload::Cancel(Address::rand()),
        });
        n2.protocol
            .send_message(&request, &n1.multi_address().socket_addr())
            .unwrap();
        assert!(lock(&n1.inflight_requests).is_empty());

        // The node keeps serving after the stray cancellation.
        n2.ping_target(n1.multi_address(), Duration::from_secs(2))
            .unwrap();

        n1.kill();
        n2.kill();
    }
}
