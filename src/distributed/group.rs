//! TCP rendezvous group.
//!
//! Root listens on the master address and every other rank holds one
//! connection to it. Barriers are centralized: peers report arrival, root
//! waits for all of them and then releases everyone.
use super::ProcessGroup;
use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const MAGIC: [u8; 4] = *b"ELK1";
const MSG_JOINED: u8 = 1;
const MSG_ARRIVE: u8 = 2;
const MSG_RELEASE: u8 = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// A single stray connection must not stall the rendezvous for long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    links: Links,
    generation: AtomicU64,
}

enum Links {
    /// Connections from ranks `1..world_size`, indexed by `rank - 1`.
    Root(Vec<TcpStream>),
    Peer(TcpStream),
}

impl TcpGroup {
    /// Join the group at `addr`. Rank 0 binds it; other ranks connect,
    /// retrying until `init_timeout` elapses.
    pub fn connect(
        rank: usize,
        world_size: usize,
        addr: &str,
        init_timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + init_timeout;
        if rank == 0 {
            let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
            return Self::accept(listener, world_size, deadline);
        }
        let stream = join_root(rank, world_size, addr, deadline)?;
        tracing::debug!(rank, world_size, "joined process group");
        Ok(Self {
            rank,
            world_size,
            links: Links::Peer(stream),
            generation: AtomicU64::new(0),
        })
    }

    /// Root setup on an already bound listener.
    fn accept(listener: TcpListener, world_size: usize, deadline: Instant) -> Result<Self> {
        let peers = accept_peers(&listener, world_size, deadline)?;
        tracing::debug!(world_size, "process group ready");
        Ok(Self {
            rank: 0,
            world_size,
            links: Links::Root(peers),
            generation: AtomicU64::new(0),
        })
    }
}

impl ProcessGroup for TcpGroup {
    fn barrier(&self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(rank = self.rank, world_size = self.world_size, generation, "barrier");
        match &self.links {
            Links::Root(peers) => {
                for (index, stream) in peers.iter().enumerate() {
                    expect_message(stream, MSG_ARRIVE, generation)
                        .with_context(|| format!("barrier {generation}: wait for rank {}", index + 1))?;
                }
                for (index, stream) in peers.iter().enumerate() {
                    send_message(stream, MSG_RELEASE, generation)
                        .with_context(|| format!("barrier {generation}: release rank {}", index + 1))?;
                }
            }
            Links::Peer(stream) => {
                send_message(stream, MSG_ARRIVE, generation)
                    .with_context(|| format!("barrier {generation}: notify root"))?;
                expect_message(stream, MSG_RELEASE, generation)
                    .with_context(|| format!("barrier {generation}: wait for root"))?;
            }
        }
        Ok(())
    }
}

fn accept_peers(
    listener: &TcpListener,
    world_size: usize,
    deadline: Instant,
) -> Result<Vec<TcpStream>> {
    listener
        .set_nonblocking(true)
        .context("set listener nonblocking")?;
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined < slots.len() {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(anyhow!(
                        "timed out waiting for ranks to join ({joined} of {} joined)",
                        slots.len()
                    ));
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(err) => return Err(err).context("accept rank connection"),
        };
        stream
            .set_nonblocking(false)
            .context("set connection blocking")?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(remaining(deadline)?.min(HANDSHAKE_TIMEOUT)))
            .context("set handshake timeout")?;
        let peer_rank = match read_handshake(&stream, world_size) {
            Ok(rank) => rank,
            Err(err) => {
                tracing::warn!("ignoring connection with a bad handshake: {err:#}");
                continue;
            }
        };
        let slot = &mut slots[peer_rank - 1];
        if slot.is_some() {
            tracing::warn!(peer_rank, "ignoring duplicate connection for rank");
            continue;
        }
        stream.set_read_timeout(None).context("clear read timeout")?;
        (&stream)
            .write_all(&[MSG_JOINED])
            .with_context(|| format!("acknowledge rank {peer_rank}"))?;
        tracing::debug!(peer_rank, "rank joined");
        *slot = Some(stream);
        joined += 1;
    }
    Ok(slots.into_iter().flatten().collect())
}

fn join_root(rank: usize, world_size: usize, addr: &str, deadline: Instant) -> Result<TcpStream> {
    let stream = loop {
        match TcpStream::connect(addr) {
            Ok(stream) => break stream,
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(err).with_context(|| format!("connect to rank 0 at {addr}"));
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };
    stream.set_nodelay(true).ok();
    let mut handshake = Vec::with_capacity(12);
    handshake.extend_from_slice(&MAGIC);
    handshake.extend_from_slice(&(rank as u32).to_le_bytes());
    handshake.extend_from_slice(&(world_size as u32).to_le_bytes());
    (&stream)
        .write_all(&handshake)
        .context("send handshake to rank 0")?;
    stream
        .set_read_timeout(Some(remaining(deadline)?))
        .context("set handshake timeout")?;
    let mut ack = [0u8; 1];
    (&stream)
        .read_exact(&mut ack)
        .context("wait for rank 0 to acknowledge")?;
    if ack[0] != MSG_JOINED {
        return Err(anyhow!("unexpected handshake reply {}", ack[0]));
    }
    stream.set_read_timeout(None).context("clear read timeout")?;
    Ok(stream)
}

fn read_handshake(mut stream: &TcpStream, world_size: usize) -> Result<usize> {
    let mut buf = [0u8; 12];
    stream
        .read_exact(&mut buf)
        .context("read rank handshake")?;
    if buf[..4] != MAGIC {
        return Err(anyhow!("connection is not an elk rank (bad handshake)"));
    }
    let peer_rank = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let peer_world = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if peer_world != world_size {
        return Err(anyhow!(
            "rank {peer_rank} reports world size {peer_world}, expected {world_size}"
        ));
    }
    if peer_rank == 0 || peer_rank >= world_size {
        return Err(anyhow!("rank {peer_rank} is out of range for world size {world_size}"));
    }
    Ok(peer_rank)
}

fn send_message(mut stream: &TcpStream, kind: u8, generation: u64) -> Result<()> {
    let mut buf = [0u8; 9];
    buf[0] = kind;
    buf[1..].copy_from_slice(&generation.to_le_bytes());
    stream.write_all(&buf)?;
    Ok(())
}

fn expect_message(mut stream: &TcpStream, kind: u8, generation: u64) -> Result<()> {
    let mut buf = [0u8; 9];
    stream.read_exact(&mut buf).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            anyhow!("peer disconnected")
        } else {
            anyhow::Error::new(err)
        }
    })?;
    let mut gen_bytes = [0u8; 8];
    gen_bytes.copy_from_slice(&buf[1..]);
    let got = u64::from_le_bytes(gen_bytes);
    if buf[0] != kind || got != generation {
        return Err(anyhow!(
            "protocol mismatch: expected message {kind} for barrier {generation}, got {} for {got}",
            buf[0]
        ));
    }
    Ok(())
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(anyhow!("process group init deadline passed"));
    }
    Ok(left)
}
