//! Rendezvous of a `StarGroup` over TCP.

use std::{io, num::NonZeroUsize, time::Duration};

use log::{debug, info, warn};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use super::StarGroup;
use crate::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg},
};

/// A group whose links are TCP connections.
pub type TcpGroup = StarGroup<OwnedReadHalf, OwnedWriteHalf>;

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;

/// How many times a member tries to reach the hub before giving up.
pub const DEFAULT_RETRIES: usize = 30;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Forms the group from the hub's side.
///
/// Accepts `world_size - 1` connections, each of which must announce itself with a
/// `Command::Join` carrying a distinct rank in `1..world_size` and the same world size. Once every
/// rank joined, answers `Command::Ready` to all of them.
///
/// # Arguments
/// * `listener` - A bound listener every member connects to.
/// * `world_size` - The amount of ranks in the group, hub included.
///
/// # Returns
/// The hub's `TcpGroup` or an io error if any member fails to join.
pub async fn host(listener: TcpListener, world_size: NonZeroUsize) -> io::Result<TcpGroup> {
    let world_size = world_size.get();
    let mut peers: Vec<Option<(NetRx, NetTx)>> = (0..world_size).map(|_| None).collect();
    let mut rx_buf: Vec<f32> = Vec::new();

    info!("waiting for {} rank(s) to join", world_size - 1);

    for _ in 1..world_size {
        let (stream, addr) = listener.accept().await?;
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = crate::channel(rx, tx);

        let rank = match rx.recv_into(&mut rx_buf).await? {
            Msg::Control(Command::Join {
                rank,
                world_size: theirs,
            }) => validate_join(rank, theirs, world_size, &peers),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected join from {addr}, got {}", other.kind()),
            )),
        };

        let rank = match rank {
            Ok(rank) => rank,
            Err(e) => {
                warn!("rejecting connection from {addr}: {e}");
                let detail = e.to_string();
                tx.send(&Msg::Err(detail.into())).await?;
                return Err(e);
            }
        };

        debug!("rank {rank} joined from {addr}");
        peers[rank] = Some((rx, tx));
    }

    let mut peers: Vec<_> = peers
        .into_iter()
        .enumerate()
        .filter_map(|(rank, link)| link.map(|(rx, tx)| (rank, rx, tx)))
        .collect();

    let ready = Msg::Control(Command::Ready);
    for (_, _, tx) in peers.iter_mut() {
        tx.send(&ready).await?;
    }

    info!("group of {world_size} formed");
    Ok(StarGroup::hub(peers))
}

fn validate_join<T>(
    rank: usize,
    theirs: usize,
    world_size: usize,
    peers: &[Option<T>],
) -> io::Result<usize> {
    if theirs != world_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("rank {rank} expects a group of {theirs}, the hub expects {world_size}"),
        ));
    }

    if rank == 0 || rank >= world_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("rank {rank} is not a member rank of a group of {world_size}"),
        ));
    }

    if peers[rank].is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("rank {rank} joined twice"),
        ));
    }

    Ok(rank)
}

/// Joins the group hosted at `addr` as a non-hub member.
///
/// # Arguments
/// * `addr` - The hub's address.
/// * `rank` - This member's rank, in `1..world_size`.
/// * `world_size` - The amount of ranks in the group.
/// * `retries` - How many failed connection attempts are tolerated before giving up.
///
/// # Returns
/// The member's `TcpGroup` once the hub answered `Command::Ready`.
pub async fn join(
    addr: &str,
    rank: usize,
    world_size: NonZeroUsize,
    retries: usize,
) -> io::Result<TcpGroup> {
    let world_size = world_size.get();
    let stream = connect_with_retries(addr, retries).await?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = crate::channel(rx, tx);

    tx.send(&Msg::Control(Command::Join { rank, world_size }))
        .await?;

    let mut rx_buf: Vec<f32> = Vec::new();
    match rx.recv_into(&mut rx_buf).await? {
        Msg::Control(Command::Ready) => {}
        Msg::Err(detail) => return Err(io::Error::other(detail.into_owned())),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected ready from the hub, got {}", other.kind()),
            ));
        }
    }

    info!("rank {rank} joined a group of {world_size} at {addr}");
    Ok(StarGroup::member(rank, world_size, rx, tx))
}

/// Forms the group from any rank: rank 0 binds `addr` and hosts, every other rank joins it.
///
/// # Arguments
/// * `addr` - The hub's address.
/// * `rank` - This worker's rank.
/// * `world_size` - The amount of ranks in the group.
pub async fn connect(addr: &str, rank: usize, world_size: NonZeroUsize) -> io::Result<TcpGroup> {
    if rank == 0 {
        let listener = TcpListener::bind(addr).await?;
        info!("hosting group at {addr}");
        host(listener, world_size).await
    } else {
        join(addr, rank, world_size, DEFAULT_RETRIES).await
    }
}

async fn connect_with_retries(addr: &str, retries: usize) -> io::Result<TcpStream> {
    let mut attempt = 0;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < retries => {
                debug!("hub at {addr} not reachable yet ({e}), retrying");
                attempt += 1;
                time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}
