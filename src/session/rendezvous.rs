//! Rendezvous-based connection forwarding (spec §4.6): a peer holding no
//! registration for a received peering id, but a live session with another
//! peer that does claim it, pairs two otherwise-unconnectable sockets and
//! splices their bytes together without ever holding the forwarded pair's
//! session keys.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

use crate::error::{Result, SessionError};
use crate::identifier::Identifier;

/// A socket waiting to be paired, carrying the obfuscated bytes already
/// read off it so they can be replayed to whichever peer it ends up
/// spliced with (so that peer sees a coherent stream from byte zero).
pub struct PendingSocket {
    pub stream: TcpStream,
    pub obfuscated_prefix: Vec<u8>,
}

impl PendingSocket {
    pub fn new(stream: TcpStream, obfuscated_prefix: Vec<u8>) -> Self {
        Self { stream, obfuscated_prefix }
    }
}

struct Waiting {
    socket: PendingSocket,
    done_tx: oneshot::Sender<()>,
}

/// What happens to an arriving socket: either a peer arrival completes the
/// pairing and takes over splicing, or this socket was the first to arrive
/// and simply hands off once the second side shows up.
pub enum Arrival {
    /// A second arrival for the same target paired with us and will run
    /// the splice; nothing left for this task to do.
    Yielded,
    /// We are the second arrival: we now hold both sockets and must run
    /// the splice ourselves.
    Paired { mine: PendingSocket, other: PendingSocket },
}

/// The process-wide table of meeting points, one entry per target peering
/// id rather than a single shared condition variable (spec §9 Open
/// Question), so an arrival for one target never wakes waiters on another.
#[derive(Default)]
pub struct RendezvousTable {
    points: Mutex<HashMap<Identifier, Waiting>>,
}

impl RendezvousTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrives at the meeting point for `target`. If another side is
    /// already waiting there, pairing completes immediately and this call
    /// returns both sockets. Otherwise it parks here, handing the socket
    /// to the table, and waits up to `step_timeout` for a second arrival.
    pub async fn arrive(&self, target: &Identifier, socket: PendingSocket, step_timeout: Duration) -> Result<Arrival> {
        let key = target.as_peering();

        let done_rx = {
            let mut points = self.points.lock().await;
            match points.remove(&key) {
                Some(Waiting { socket: other_socket, done_tx }) => {
                    let _ = done_tx.send(());
                    return Ok(Arrival::Paired { mine: socket, other: other_socket });
                }
                None => {
                    let (done_tx, done_rx) = oneshot::channel();
                    points.insert(key.clone(), Waiting { socket, done_tx });
                    done_rx
                }
            }
        };

        match timeout(step_timeout, done_rx).await {
            Ok(Ok(())) => Ok(Arrival::Yielded),
            Ok(Err(_)) => Err(SessionError::Interrupted),
            Err(_) => {
                // Closes our own still-parked socket along with removing
                // it from the table (spec: "on any timeout A closes both
                // sides").
                let mut points = self.points.lock().await;
                points.remove(&key);
                Err(SessionError::Timeout)
            }
        }
    }
}

/// Replays each side's obfuscated prefix to the other, then splices the two
/// sockets byte-for-byte in both directions until either closes (spec §4.6
/// step 4).
pub async fn splice(a: PendingSocket, b: PendingSocket) -> io::Result<(u64, u64)> {
    let PendingSocket { stream: mut a_stream, obfuscated_prefix: a_prefix } = a;
    let PendingSocket { stream: mut b_stream, obfuscated_prefix: b_prefix } = b;

    if !b_prefix.is_empty() {
        a_stream.write_all(&b_prefix).await?;
    }
    if !a_prefix.is_empty() {
        b_stream.write_all(&a_prefix).await?;
    }

    io::copy_bidirectional(&mut a_stream, &mut b_stream).await
}

/// The capability the rendezvous orchestration needs from the session
/// registry: broadcast a `peer:<target>` locate request to every connected
/// session and report whether any claimed the target. Expressed as a trait
/// (rather than depending on `crate::core` directly) so the two modules
/// don't need to know about each other's internals.
pub trait Broadcaster: Send + Sync {
    fn locate<'a>(
        &'a self,
        target: &'a Identifier,
        step_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Option<Identifier>> + Send + 'a>>;
}

/// Runs the intermediary side of rendezvous forwarding end to end: locate a
/// peer claiming `target`, arrive at the meeting point under `target`, then
/// splice once paired. Returns `None` when this task was the first
/// arrival and the pairing peer took over the splice.
pub async fn forward(
    broadcaster: &dyn Broadcaster,
    table: &RendezvousTable,
    target: &Identifier,
    incoming: PendingSocket,
    step_timeout: Duration,
) -> Result<Option<(u64, u64)>> {
    if broadcaster.locate(target, step_timeout).await.is_none() {
        return Err(SessionError::UnknownPeering);
    }

    match table.arrive(target, incoming, step_timeout).await? {
        Arrival::Yielded => Ok(None),
        Arrival::Paired { mine, other } => Ok(Some(splice(mine, other).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_res, connect_res) = tokio::join!(listener.accept(), connect);
        (accept_res.unwrap().0, connect_res.unwrap())
    }

    fn peering(fill: u8) -> Identifier {
        Identifier::peering([fill; 64])
    }

    #[tokio::test]
    async fn second_arrival_pairs_and_first_yields() {
        let table = RendezvousTable::new();
        let target = peering(7);

        let (a_local, _a_remote) = connected_pair().await;
        let (b_local, _b_remote) = connected_pair().await;

        let table_ref = &table;
        let target_ref = &target;
        let first = async {
            table_ref
                .arrive(target_ref, PendingSocket::new(a_local, vec![1, 2, 3]), Duration::from_secs(2))
                .await
        };
        let second = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            table_ref
                .arrive(target_ref, PendingSocket::new(b_local, vec![4, 5]), Duration::from_secs(2))
                .await
        };

        let (first_res, second_res) = tokio::join!(first, second);
        assert!(matches!(first_res.unwrap(), Arrival::Yielded));
        match second_res.unwrap() {
            Arrival::Paired { mine, other } => {
                assert_eq!(mine.obfuscated_prefix, vec![4, 5]);
                assert_eq!(other.obfuscated_prefix, vec![1, 2, 3]);
            }
            Arrival::Yielded => panic!("second arrival should complete the pairing"),
        }
    }

    #[tokio::test]
    async fn solo_arrival_times_out() {
        let table = RendezvousTable::new();
        let target = peering(9);
        let (local, _remote) = connected_pair().await;

        let result = table
            .arrive(&target, PendingSocket::new(local, vec![]), Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[tokio::test]
    async fn splice_replays_obfuscated_prefixes_before_bridging() {
        use tokio::io::AsyncReadExt;

        let (a_local, mut a_remote) = connected_pair().await;
        let (b_local, mut b_remote) = connected_pair().await;

        let a = PendingSocket::new(a_local, b"from-a-prefix".to_vec());
        let b = PendingSocket::new(b_local, b"from-b-prefix".to_vec());

        let splice_task = tokio::spawn(async move { splice(a, b).await });

        let mut buf = [0u8; 32];
        let n = a_remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-b-prefix");

        let mut buf2 = [0u8; 32];
        let n2 = b_remote.read(&mut buf2).await.unwrap();
        assert_eq!(&buf2[..n2], b"from-a-prefix");

        a_remote.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        b_remote.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(a_remote);
        drop(b_remote);
        let _ = splice_task.await.unwrap();
    }
}
