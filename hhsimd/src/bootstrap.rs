//! Group formation over TCP.
//!
//! Rank 0 listens; every worker connects, says `Hello { rank, size }` and
//! waits for `Welcome { config }`. Rank 0 only welcomes once all `size - 1`
//! workers have joined, so a worker that got its config knows the whole
//! group exists. The sockets are then handed to the blocking [`TcpGroup`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info};

use hhsim::assignment::SOMA_OWNER;
use hhsim::config::SimConfig;

use crate::codec::{Frame, FrameCodec};
use crate::error::DaemonError;
use crate::group::{Peer, TcpGroup};

pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_RETRY: Duration = Duration::from_millis(100);

struct Pending {
    stream: TcpStream,
    buf: BytesMut,
}

impl Pending {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(256),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, DaemonError> {
        loop {
            if let Some(frame) = FrameCodec.decode(&mut self.buf)? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(DaemonError::Bootstrap(
                    "connection closed during handshake".to_string(),
                ));
            }
        }
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), DaemonError> {
        let mut out = BytesMut::new();
        FrameCodec.encode(frame, &mut out)?;
        self.stream.write_all(&out).await?;
        Ok(())
    }

    fn into_peer(self) -> Result<Peer, DaemonError> {
        let stream = self.stream.into_std()?;
        Ok(Peer::new(stream, self.buf)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rank 0
// ═══════════════════════════════════════════════════════════════════════════

/// Accept `size - 1` workers on `listener` and send each the run config.
pub async fn host(
    listener: TcpListener,
    size: usize,
    cfg: &SimConfig,
    timeout: Duration,
) -> Result<TcpGroup, DaemonError> {
    let expected = size.saturating_sub(1);
    let mut joined: Vec<Option<Pending>> = (0..size).map(|_| None).collect();

    let accept_all = async {
        let mut count = 0;
        while count < expected {
            let (stream, addr) = listener.accept().await?;
            let mut pending = Pending::new(stream);
            let rank = match pending.read_frame().await? {
                Frame::Hello { rank, size: theirs } => {
                    check_hello(rank as usize, theirs as usize, size, &joined, addr)?
                }
                other => {
                    return Err(DaemonError::Bootstrap(format!(
                        "{addr} sent {other:?} instead of hello"
                    )))
                }
            };
            info!(rank, %addr, "worker joined");
            joined[rank] = Some(pending);
            count += 1;
        }
        Ok::<_, DaemonError>(())
    };

    let accepted = time::timeout(timeout, accept_all).await;
    match accepted {
        Ok(result) => result?,
        Err(_) => {
            return Err(DaemonError::Timeout {
                after: timeout,
                joined: joined.iter().filter(|p| p.is_some()).count(),
                expected,
            })
        }
    }

    let config = serde_json::to_string(cfg)?;
    let mut peers = Vec::with_capacity(expected);
    for (rank, slot) in joined.into_iter().enumerate() {
        let Some(mut pending) = slot else {
            continue;
        };
        pending
            .write_frame(Frame::Welcome {
                config: config.clone(),
            })
            .await?;
        peers.push((rank, pending.into_peer()?));
    }
    debug!(size, "group formed");
    Ok(TcpGroup::new(SOMA_OWNER, size, peers))
}

fn check_hello(
    rank: usize,
    theirs: usize,
    size: usize,
    joined: &[Option<Pending>],
    addr: SocketAddr,
) -> Result<usize, DaemonError> {
    if theirs != size {
        return Err(DaemonError::Bootstrap(format!(
            "{addr} expects a group of {theirs}, this one has {size}"
        )));
    }
    if rank == SOMA_OWNER || rank >= size {
        return Err(DaemonError::Bootstrap(format!(
            "{addr} claims rank {rank}, valid worker ranks are 1..{size}"
        )));
    }
    if joined[rank].is_some() {
        return Err(DaemonError::Bootstrap(format!(
            "{addr} claims rank {rank}, which already joined"
        )));
    }
    Ok(rank)
}

// ═══════════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════════

/// Connect to rank 0 at `addr` as `rank` of `size`, retrying until rank 0
/// is listening. Returns the group's config and the worker's endpoint.
pub async fn join(
    addr: SocketAddr,
    rank: usize,
    size: usize,
    timeout: Duration,
) -> Result<(SimConfig, TcpGroup), DaemonError> {
    let deadline = Instant::now() + timeout;
    let stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() < deadline => {
                debug!(%addr, "rank 0 not reachable yet: {e}");
                time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut pending = Pending::new(stream);
    pending
        .write_frame(Frame::Hello {
            rank: rank as u32,
            size: size as u32,
        })
        .await?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    let frame = time::timeout(remaining.max(CONNECT_RETRY), pending.read_frame())
        .await
        .map_err(|_| DaemonError::Timeout {
            after: timeout,
            joined: 0,
            expected: 1,
        })??;
    let cfg: SimConfig = match frame {
        Frame::Welcome { config } => serde_json::from_str(&config)?,
        other => {
            return Err(DaemonError::Bootstrap(format!(
                "rank 0 sent {other:?} instead of welcome"
            )))
        }
    };
    info!(rank, size, "joined group");

    let peer = pending.into_peer()?;
    Ok((cfg, TcpGroup::new(rank, size, vec![(SOMA_OWNER, peer)])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhsim::comm::Communicator;
    use hhsim::coordinator::{simulate_local, Coordinator};
    use hhsim::observer::NullObserver;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn workers_receive_the_hosts_config() {
        let (listener, addr) = listener().await;
        let cfg = SimConfig::with_size(5, 3).with_timing(10_000, 4);

        let w1 = tokio::spawn(join(addr, 1, 3, BOOTSTRAP_TIMEOUT));
        let w2 = tokio::spawn(join(addr, 2, 3, BOOTSTRAP_TIMEOUT));
        let owner = host(listener, 3, &cfg, BOOTSTRAP_TIMEOUT).await.unwrap();
        assert_eq!(owner.rank(), 0);
        assert_eq!(owner.size(), 3);

        for (handle, rank) in [(w1, 1), (w2, 2)] {
            let (got, group) = handle.await.unwrap().unwrap();
            assert_eq!(got, cfg);
            assert_eq!(group.rank(), rank);
            assert_eq!(group.size(), 3);
        }
    }

    #[tokio::test]
    async fn duplicate_rank_fails_bootstrap() {
        let (listener, addr) = listener().await;
        let cfg = SimConfig::default();

        let _a = tokio::spawn(join(addr, 1, 3, Duration::from_secs(2)));
        let _b = tokio::spawn(join(addr, 1, 3, Duration::from_secs(2)));
        let err = host(listener, 3, &cfg, BOOTSTRAP_TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DaemonError::Bootstrap(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_workers_time_out() {
        let (listener, _addr) = listener().await;
        let err = host(listener, 2, &SimConfig::default(), Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DaemonError::Timeout {
                joined: 0,
                expected: 1,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_group_matches_the_in_process_run() {
        let (listener, addr) = listener().await;
        let cfg = SimConfig::with_size(3, 2).with_timing(10_000, 2);

        let workers: Vec<_> = (1..3)
            .map(|rank| {
                tokio::spawn(async move {
                    let (cfg, group) = join(addr, rank, 3, BOOTSTRAP_TIMEOUT).await.unwrap();
                    tokio::task::spawn_blocking(move || {
                        Coordinator::new(cfg, group)
                            .unwrap()
                            .run(&mut NullObserver)
                            .unwrap()
                    })
                    .await
                    .unwrap()
                })
            })
            .collect();

        let group = host(listener, 3, &cfg, BOOTSTRAP_TIMEOUT).await.unwrap();
        let report = tokio::task::spawn_blocking(move || {
            Coordinator::new(cfg, group)
                .unwrap()
                .run(&mut NullObserver)
                .unwrap()
                .into_report()
                .unwrap()
        })
        .await
        .unwrap();
        for w in workers {
            assert!(w.await.unwrap().into_report().is_none());
        }

        let local = simulate_local(cfg, 3, &mut NullObserver).unwrap();
        assert_eq!(report.series, local.series);
        assert_eq!(report.processes, 3);
    }
}
