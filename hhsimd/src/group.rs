//! Blocking TCP transport for the fine-step hot loop.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use hhsim::comm::{Communicator, Message};
use hhsim::error::CommError;

use crate::codec::{Frame, FrameCodec};

const READ_CHUNK: usize = 8 * 1024;

/// A connected socket plus whatever was read past the last decoded frame.
pub struct Peer {
    stream: TcpStream,
    inbox: BytesMut,
    outbox: BytesMut,
}

impl Peer {
    /// Takes over a stream from the bootstrap, including bytes it had already
    /// buffered.
    pub fn new(stream: TcpStream, leftover: BytesMut) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            inbox: leftover,
            outbox: BytesMut::with_capacity(64),
        })
    }
}

/// One rank's sockets. Rank 0 holds one per worker; a worker holds only
/// rank 0's.
pub struct TcpGroup {
    rank: usize,
    size: usize,
    peers: Vec<Option<Peer>>,
}

impl TcpGroup {
    pub fn new(rank: usize, size: usize, connected: Vec<(usize, Peer)>) -> Self {
        let mut peers: Vec<Option<Peer>> = (0..size).map(|_| None).collect();
        for (peer_rank, peer) in connected {
            if let Some(slot) = peers.get_mut(peer_rank) {
                *slot = Some(peer);
            }
        }
        Self { rank, size, peers }
    }

    fn peer(&mut self, rank: usize) -> Result<&mut Peer, CommError> {
        let from = self.rank;
        self.peers
            .get_mut(rank)
            .and_then(Option::as_mut)
            .ok_or(CommError::NoRoute { from, to: rank })
    }
}

fn disconnected(peer: usize, e: io::Error) -> CommError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => CommError::Disconnected { peer },
        _ => CommError::Io(e),
    }
}

impl Communicator for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, to: usize, msg: Message) -> Result<(), CommError> {
        let peer = self.peer(to)?;
        peer.outbox.clear();
        FrameCodec.encode(Frame::Msg(msg), &mut peer.outbox)?;
        peer.stream
            .write_all(&peer.outbox)
            .map_err(|e| disconnected(to, e))
    }

    fn recv(&mut self, from: usize) -> Result<Message, CommError> {
        let peer = self.peer(from)?;
        loop {
            match FrameCodec.decode(&mut peer.inbox)? {
                Some(Frame::Msg(msg)) => return Ok(msg),
                Some(other) => {
                    return Err(CommError::Unexpected {
                        peer: from,
                        expected: "protocol message",
                        got: format!("{other:?}"),
                    })
                }
                None => {}
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = match peer.stream.read(&mut chunk) {
                Ok(0) => return Err(CommError::Disconnected { peer: from }),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(disconnected(from, e)),
            };
            peer.inbox.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (TcpGroup, TcpGroup) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let owner = TcpGroup::new(
            0,
            2,
            vec![(1, Peer::new(server, BytesMut::new()).unwrap())],
        );
        let worker = TcpGroup::new(
            1,
            2,
            vec![(0, Peer::new(client, BytesMut::new()).unwrap())],
        );
        (owner, worker)
    }

    #[test]
    fn messages_cross_the_socket_in_order() {
        let (mut owner, mut worker) = pair();
        let t = thread::spawn(move || {
            for step in 0..100 {
                worker
                    .send(0, Message::Current { step, amps: step as f64 * 0.5 })
                    .unwrap();
            }
            worker.recv(0).unwrap()
        });
        for step in 0..100 {
            assert_eq!(
                owner.recv(1).unwrap(),
                Message::Current { step, amps: step as f64 * 0.5 }
            );
        }
        owner.send(1, Message::Shutdown).unwrap();
        assert_eq!(t.join().unwrap(), Message::Shutdown);
    }

    #[test]
    fn leftover_bootstrap_bytes_are_delivered_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let mut leftover = BytesMut::new();
        FrameCodec
            .encode(
                Frame::Msg(Message::Assign { first: 1, count: 2 }),
                &mut leftover,
            )
            .unwrap();
        let mut worker = TcpGroup::new(1, 2, vec![(0, Peer::new(client, leftover).unwrap())]);
        assert_eq!(
            worker.recv(0).unwrap(),
            Message::Assign { first: 1, count: 2 }
        );
    }

    #[test]
    fn closed_socket_is_a_disconnect() {
        let (mut owner, worker) = pair();
        drop(worker);
        assert!(matches!(
            owner.recv(1),
            Err(CommError::Disconnected { peer: 1 })
        ));
        assert!(matches!(
            owner.recv(2),
            Err(CommError::NoRoute { from: 0, to: 2 })
        ));
    }
}
