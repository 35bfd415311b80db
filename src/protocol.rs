use bincode;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread;

use MESSAGE_LENGTH;
use address::Address;
use error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub id: Address,
    pub sender: String,
    pub payload: RequestPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RequestPayload {
    Ping,
    QueryCloserPeers(Address),
    QueryCloserPeersOnFrontier(Address),
    Cancel(Address),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub request_id: Address,
    pub receiver: String,
    pub payload: ResponsePayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ResponsePayload {
    Pong,
    Peers(Vec<String>),
    FrontierPeer(String),
    FrontierEnd,
    Error(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
    Kill,
}

/// A one-shot cancellation signal shared between the transport and the
/// handler serving a request.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct Protocol {
    socket: Arc<UdpSocket>,
}

impl Protocol {
    pub fn new(socket: UdpSocket, tx: Sender<Message>) -> Protocol {
        let protocol = Protocol {
            socket: Arc::new(socket),
        };
        let ret = protocol.clone();
        thread::spawn(move || {
            let mut buffer = [0u8; MESSAGE_LENGTH];
            loop {
                let (len, _src_addr) = match protocol.socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("protocol: could not receive data: {}", err);
                        continue;
                    }
                };
                let message = match bincode::deserialize(&buffer[..len]) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("protocol: dropping malformed datagram: {}", err);
                        continue;
                    }
                };
                if tx.send(message).is_err() {
                    warn!("protocol: connection closed");
                    break;
                }
            }
        });
        ret
    }

    pub fn send_message(&self, message: &Message, to: &SocketAddr) -> Result<()> {
        let buffer = bincode::serialize(message, bincode::Bounded(MESSAGE_LENGTH as u64))
            .map_err(|err| Error::Transport(format!("could not encode message: {}", err)))?;
        self.socket.send_to(&buffer, to)?;
        Ok(())
    }
}
