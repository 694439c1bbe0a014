use std::{io, num::NonZeroUsize};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};

use super::{Collective, invalid_src};
use crate::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};

const HUB: usize = 0;
const LOCAL_LINK_CAPACITY: usize = 64 * 1024;

/// An in-process group, every link is an in-memory duplex pipe.
pub type LocalGroup = StarGroup<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Both ends of the channel to a single peer.
struct Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    peer: usize,
    rx: FrameReceiver<R>,
    tx: FrameSender<W>,
}

/// A group in a star topology: rank 0 is the hub and holds a link to every other rank, every other
/// rank only holds the link to the hub. All collective traffic goes through the hub.
pub struct StarGroup<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    world_size: usize,
    links: Vec<Link<R, W>>,
    rx_buf: Vec<f32>,
}

impl<R, W> StarGroup<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates the hub (rank 0) of a group.
    ///
    /// # Arguments
    /// * `peers` - The channel to every other rank, as `(rank, receiver, sender)`.
    ///
    /// # Returns
    /// A new `StarGroup` whose world size is the amount of peers plus one.
    pub fn hub<I>(peers: I) -> Self
    where
        I: IntoIterator<Item = (usize, FrameReceiver<R>, FrameSender<W>)>,
    {
        let mut links: Vec<_> = peers
            .into_iter()
            .map(|(peer, rx, tx)| Link { peer, rx, tx })
            .collect();

        links.sort_by_key(|link| link.peer);

        Self {
            rank: HUB,
            world_size: links.len() + 1,
            links,
            rx_buf: Vec::new(),
        }
    }

    /// Creates a non-hub member of a group.
    ///
    /// # Arguments
    /// * `rank` - This member's rank.
    /// * `world_size` - The amount of ranks in the group.
    /// * `rx` - The receiving end of the channel to the hub.
    /// * `tx` - The sending end of the channel to the hub.
    ///
    /// # Returns
    /// A new `StarGroup` instance.
    pub fn member(rank: usize, world_size: usize, rx: FrameReceiver<R>, tx: FrameSender<W>) -> Self {
        Self {
            rank,
            world_size,
            links: vec![Link { peer: HUB, rx, tx }],
            rx_buf: Vec::new(),
        }
    }

    fn is_hub(&self) -> bool {
        self.rank == HUB
    }

    async fn hub_broadcast(&mut self, buf: &mut [f32], src: usize) -> io::Result<()> {
        let Self { links, rx_buf, .. } = self;

        if src != HUB {
            let link = links
                .iter_mut()
                .find(|link| link.peer == src)
                .ok_or_else(|| io::Error::other(format!("hub has no link to rank {src}")))?;

            let nums = recv_tensor(&mut link.rx, rx_buf, buf.len()).await?;
            buf.copy_from_slice(nums);
        }

        for link in links.iter_mut().filter(|link| link.peer != src) {
            link.tx.send(&Msg::Data(Payload::Tensor(&mut *buf))).await?;
        }

        Ok(())
    }

    async fn member_broadcast(&mut self, buf: &mut [f32], src: usize) -> io::Result<()> {
        let rank = self.rank;
        let Self { links, rx_buf, .. } = self;
        let hub = &mut links[0];

        if rank == src {
            hub.tx.send(&Msg::Data(Payload::Tensor(buf))).await
        } else {
            let nums = recv_tensor(&mut hub.rx, rx_buf, buf.len()).await?;
            buf.copy_from_slice(nums);
            Ok(())
        }
    }
}

impl LocalGroup {
    /// Creates every rank of an in-process group, ordered by rank.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks in the group.
    ///
    /// # Returns
    /// One `StarGroup` per rank, meant to be moved into one task each.
    pub fn local(world_size: NonZeroUsize) -> Vec<Self> {
        let world_size = world_size.get();
        let mut peers = Vec::with_capacity(world_size - 1);
        let mut members = Vec::with_capacity(world_size - 1);

        for rank in 1..world_size {
            let (hub_end, member_end) = tokio::io::duplex(LOCAL_LINK_CAPACITY);

            let (rx, tx) = tokio::io::split(hub_end);
            let (rx, tx) = crate::channel(rx, tx);
            peers.push((rank, rx, tx));

            let (rx, tx) = tokio::io::split(member_end);
            let (rx, tx) = crate::channel(rx, tx);
            members.push(Self::member(rank, world_size, rx, tx));
        }

        let mut groups = vec![Self::hub(peers)];
        groups.extend(members);
        groups
    }
}

impl<R, W> Collective for StarGroup<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&mut self, buf: &mut [f32], src: usize) -> io::Result<()> {
        if src >= self.world_size {
            return invalid_src(src, self.world_size);
        }

        debug!(
            "broadcast: rank={} src={src} len={}",
            self.rank,
            buf.len()
        );

        if self.is_hub() {
            self.hub_broadcast(buf, src).await
        } else {
            self.member_broadcast(buf, src).await
        }
    }

    async fn all_reduce_sum(&mut self, buf: &mut [f32]) -> io::Result<()> {
        debug!("all_reduce_sum: rank={} len={}", self.rank, buf.len());

        let is_hub = self.is_hub();
        let Self { links, rx_buf, .. } = self;

        if is_hub {
            for link in links.iter_mut() {
                let nums = recv_tensor(&mut link.rx, rx_buf, buf.len()).await?;
                buf.iter_mut().zip(nums.iter()).for_each(|(acc, x)| *acc += x);
            }

            for link in links.iter_mut() {
                link.tx.send(&Msg::Data(Payload::Tensor(&mut *buf))).await?;
            }
        } else {
            let hub = &mut links[0];
            hub.tx.send(&Msg::Data(Payload::Tensor(&mut *buf))).await?;

            let nums = recv_tensor(&mut hub.rx, rx_buf, buf.len()).await?;
            buf.copy_from_slice(nums);
        }

        Ok(())
    }

    async fn barrier(&mut self) -> io::Result<()> {
        debug!("barrier: rank={}", self.rank);

        let msg = Msg::Control(Command::Barrier);
        let is_hub = self.is_hub();
        let Self { links, rx_buf, .. } = self;

        // The hub waits for everyone before answering, members send then wait for the answer.
        if is_hub {
            for link in links.iter_mut() {
                recv_barrier(&mut link.rx, rx_buf).await?;
            }

            for link in links.iter_mut() {
                link.tx.send(&msg).await?;
            }
        } else {
            let hub = &mut links[0];
            hub.tx.send(&msg).await?;
            recv_barrier(&mut hub.rx, rx_buf).await?;
        }

        Ok(())
    }
}

/// Receives a tensor frame of exactly `len` elements.
async fn recv_tensor<'buf, R>(
    rx: &mut FrameReceiver<R>,
    rx_buf: &'buf mut Vec<f32>,
    len: usize,
) -> io::Result<&'buf mut [f32]>
where
    R: AsyncRead + Unpin,
{
    match rx.recv_into(rx_buf).await? {
        Msg::Data(Payload::Tensor(nums)) if nums.len() == len => Ok(nums),
        Msg::Data(Payload::Tensor(nums)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received a tensor of {} elements, expected {len}", nums.len()),
        )),
        Msg::Err(detail) => Err(io::Error::other(detail.into_owned())),
        other => Err(unexpected(&other, "data/tensor")),
    }
}

async fn recv_barrier<R>(rx: &mut FrameReceiver<R>, rx_buf: &mut Vec<f32>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match rx.recv_into(rx_buf).await? {
        Msg::Control(Command::Barrier) => Ok(()),
        Msg::Err(detail) => Err(io::Error::other(detail.into_owned())),
        other => Err(unexpected(&other, "control/barrier")),
    }
}

fn unexpected(msg: &Msg<'_>, expected: &str) -> io::Error {
    warn!("expected {expected}, got {msg:?}");

    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("expected {expected}, got {}", msg.kind()),
    )
}
