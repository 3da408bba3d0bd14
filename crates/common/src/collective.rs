//! Rendezvous-based collective process group
//!
//! Independently started processes agree on membership at `(host,
//! port)` before any data moves: rank 0 accepts every peer, then
//! releases the whole group at once, so formation has barrier
//! semantics. The group offers exactly the two primitives the
//! weight-update protocol needs, `broadcast` and `barrier`, over a
//! star topology with rank 0 as the relay hub.
//!
//! All I/O here is synchronous: collective operations run strictly
//! sequentially inside a shard's command processing. The barrier has
//! no timeout; a hang is fatal and must be diagnosed externally.

use crate::error::{Result, SwapServeError};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;
use tracing::{debug, trace};

const FORMED: u8 = 0x01;
const ARRIVE: u8 = 0x02;
const RELEASE: u8 = 0x03;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

enum Role {
    /// Rank 0: holds one stream per peer, indexed by peer rank.
    Hub { spokes: Vec<(usize, TcpStream)> },

    /// Any other rank: a single stream to the hub.
    Spoke { hub: TcpStream },
}

/// Membership in a formed collective group.
pub struct CollectiveGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl CollectiveGroup {
    /// Join the group at `(host, port)` as `rank` of `world_size`.
    ///
    /// Blocks until every member has connected. Rank 0 binds the
    /// rendezvous endpoint; other ranks retry their connection until
    /// the hub is up, then wait for the formation release.
    pub fn join(host: &str, port: u16, rank: usize, world_size: usize) -> Result<Self> {
        if world_size < 2 {
            return Err(SwapServeError::invalid_input(
                "collective world size must be at least 2",
            ));
        }
        if rank >= world_size {
            return Err(SwapServeError::invalid_input(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }

        let role = if rank == 0 {
            Self::host_group(host, port, world_size)?
        } else {
            Self::connect_group(host, port, rank)?
        };

        debug!(rank, world_size, "collective group formed");
        Ok(Self {
            rank,
            world_size,
            role,
        })
    }

    fn host_group(host: &str, port: u16, world_size: usize) -> Result<Role> {
        let listener = TcpListener::bind((host, port)).map_err(|e| {
            SwapServeError::collective(format!(
                "failed to bind rendezvous endpoint {}:{}: {}",
                host, port, e
            ))
        })?;

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < world_size - 1 {
            let (mut stream, peer) = listener.accept()?;
            stream.set_nodelay(true)?;

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf)?;
            let peer_rank = u32::from_be_bytes(buf) as usize;
            if peer_rank == 0 || peer_rank >= world_size {
                return Err(SwapServeError::collective(format!(
                    "peer {} announced invalid rank {}",
                    peer, peer_rank
                )));
            }

            let slot = &mut slots[peer_rank - 1];
            if slot.is_some() {
                return Err(SwapServeError::collective(format!(
                    "duplicate rank {} in rendezvous",
                    peer_rank
                )));
            }
            *slot = Some(stream);
            joined += 1;
            trace!(peer_rank, joined, "rendezvous peer connected");
        }

        // Everyone is here; release the group.
        let mut spokes = Vec::with_capacity(world_size - 1);
        for (idx, slot) in slots.into_iter().enumerate() {
            let mut stream = slot.ok_or_else(|| {
                SwapServeError::collective("rendezvous slot unexpectedly empty")
            })?;
            stream.write_all(&[FORMED])?;
            spokes.push((idx + 1, stream));
        }
        Ok(Role::Hub { spokes })
    }

    fn connect_group(host: &str, port: u16, rank: usize) -> Result<Role> {
        // INADDR_ANY is a bind address, not a routable peer.
        let dial_host = if host == "0.0.0.0" { "127.0.0.1" } else { host };

        let mut stream = loop {
            match TcpStream::connect((dial_host, port)) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(CONNECT_RETRY_INTERVAL),
            }
        };
        stream.set_nodelay(true)?;

        stream.write_all(&(rank as u32).to_be_bytes())?;

        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf)?;
        if buf[0] != FORMED {
            return Err(SwapServeError::collective(
                "unexpected byte during group formation",
            ));
        }
        Ok(Role::Spoke { hub: stream })
    }

    /// This member's rank within the group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of members, including the external client.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Broadcast a byte buffer from `src_rank` to every member.
    ///
    /// On the source, `data` is the payload to send; on every other
    /// member it is replaced with the received payload. The hub relays
    /// for sources that are spokes.
    pub fn broadcast(&mut self, data: &mut Vec<u8>, src_rank: usize) -> Result<()> {
        if src_rank >= self.world_size {
            return Err(SwapServeError::invalid_input(format!(
                "broadcast source rank {} out of range for world size {}",
                src_rank, self.world_size
            )));
        }

        match &mut self.role {
            Role::Hub { spokes } => {
                if src_rank == self.rank {
                    for (_, stream) in spokes.iter_mut() {
                        write_frame(stream, data)?;
                    }
                } else {
                    let payload = {
                        let (_, src) = spokes
                            .iter_mut()
                            .find(|(r, _)| *r == src_rank)
                            .ok_or_else(|| {
                                SwapServeError::collective(format!(
                                    "no stream for source rank {}",
                                    src_rank
                                ))
                            })?;
                        read_frame(src)?
                    };
                    for (rank, stream) in spokes.iter_mut() {
                        if *rank != src_rank {
                            write_frame(stream, &payload)?;
                        }
                    }
                    *data = payload;
                }
            }
            Role::Spoke { hub } => {
                if src_rank == self.rank {
                    write_frame(hub, data)?;
                } else {
                    *data = read_frame(hub)?;
                }
            }
        }
        Ok(())
    }

    /// Block until every member has reached this point.
    pub fn barrier(&mut self) -> Result<()> {
        match &mut self.role {
            Role::Hub { spokes } => {
                for (rank, stream) in spokes.iter_mut() {
                    let mut buf = [0u8; 1];
                    stream.read_exact(&mut buf)?;
                    if buf[0] != ARRIVE {
                        return Err(SwapServeError::collective(format!(
                            "unexpected barrier byte from rank {}",
                            rank
                        )));
                    }
                }
                for (_, stream) in spokes.iter_mut() {
                    stream.write_all(&[RELEASE])?;
                }
            }
            Role::Spoke { hub } => {
                hub.write_all(&[ARRIVE])?;
                let mut buf = [0u8; 1];
                hub.read_exact(&mut buf)?;
                if buf[0] != RELEASE {
                    return Err(SwapServeError::collective(
                        "unexpected byte during barrier release",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn write_frame(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    stream.write_all(&(data.len() as u32).to_be_bytes())?;
    stream.write_all(data)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}
