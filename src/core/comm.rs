//! Point-to-point messaging between the ranks of a process group.
//!
//! The protocol runs on a fixed star topology: the soma owner (rank 0) talks
//! to every other rank, workers only talk to the soma owner. Sends and
//! receives block; messages between a pair of ranks arrive in send order.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::assignment::SOMA_OWNER;
use crate::error::CommError;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Config handshake: the dendrite range a worker owns.
    Assign { first: usize, count: usize },
    /// Somatic voltage at the start of fine step `step`.
    SomaVoltage { step: u64, mv: f64 },
    /// A worker's summed dendrite current for fine step `step`.
    Current { step: u64, amps: f64 },
    /// Orderly end of the run.
    Shutdown,
    /// The sender failed; the receiver must stop too.
    Abort { reason: String },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Assign { .. } => "assign",
            Message::SomaVoltage { .. } => "soma-voltage",
            Message::Current { .. } => "current",
            Message::Shutdown => "shutdown",
            Message::Abort { .. } => "abort",
        }
    }
}

/// One rank's view of the process group.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Blocking send to `to`.
    fn send(&mut self, to: usize, msg: Message) -> Result<(), CommError>;

    /// Block until the next message from `from` arrives.
    fn recv(&mut self, from: usize) -> Result<Message, CommError>;
}

impl<C: Communicator + ?Sized> Communicator for &mut C {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn send(&mut self, to: usize, msg: Message) -> Result<(), CommError> {
        (**self).send(to, msg)
    }

    fn recv(&mut self, from: usize) -> Result<Message, CommError> {
        (**self).recv(from)
    }
}

struct Link {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// In-process endpoint backed by `std::sync::mpsc` channels.
///
/// Dropping an endpoint disconnects its links, which peers observe as
/// `CommError::Disconnected`.
pub struct LocalEndpoint {
    rank: usize,
    size: usize,
    // Indexed by peer rank; `None` where the star has no edge.
    links: Vec<Option<Link>>,
}

impl LocalEndpoint {
    fn link(&mut self, peer: usize) -> Result<&mut Link, CommError> {
        let rank = self.rank;
        self.links
            .get_mut(peer)
            .and_then(Option::as_mut)
            .ok_or(CommError::NoRoute {
                from: rank,
                to: peer,
            })
    }
}

impl Communicator for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, to: usize, msg: Message) -> Result<(), CommError> {
        self.link(to)?
            .tx
            .send(msg)
            .map_err(|_| CommError::Disconnected { peer: to })
    }

    fn recv(&mut self, from: usize) -> Result<Message, CommError> {
        self.link(from)?
            .rx
            .recv()
            .map_err(|_| CommError::Disconnected { peer: from })
    }
}

/// Builder for an in-process group of `size` ranks.
pub struct LocalGroup;

impl LocalGroup {
    /// Endpoints for ranks `0..size`, in rank order.
    pub fn new(size: usize) -> Vec<LocalEndpoint> {
        let mut endpoints: Vec<LocalEndpoint> = (0..size)
            .map(|rank| LocalEndpoint {
                rank,
                size,
                links: (0..size).map(|_| None).collect(),
            })
            .collect();

        for worker in 1..size {
            let (to_worker, from_owner) = mpsc::channel();
            let (to_owner, from_worker) = mpsc::channel();
            endpoints[SOMA_OWNER].links[worker] = Some(Link {
                tx: to_worker,
                rx: from_worker,
            });
            endpoints[worker].links[SOMA_OWNER] = Some(Link {
                tx: to_owner,
                rx: from_owner,
            });
        }
        endpoints
    }
}
