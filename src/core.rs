//! The session core registry (spec §4.9): owns every live [`Session`], the
//! peering registry and the rendezvous meeting table, runs the accept loop
//! and outbound `connect`, and brokers requests across whichever sessions
//! can answer them. Everything above this layer (the contact store, the
//! HTTP interface) talks to a `Core`, never to a bare `Session`.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::codec::Framed;

use crate::address::Address;
use crate::conf::SessionConf;
use crate::crypto::cipher::{CipherStream, DumpSink};
use crate::error::{Result, SessionError, Status};
use crate::identifier::Identifier;
use crate::message::Message;
use crate::peering::{Listener, PeeringRegistration, PeeringRegistry};
use crate::protocol::ProtocolCodec;
use crate::request::Request;
use crate::session::handshake::{self, HandshakeKeys, Role};
use crate::session::rendezvous::{self, Broadcaster, PendingSocket, RendezvousTable};
use crate::session::Session;

/// One logical, caller-facing request, possibly fanned out across several
/// sessions' own per-session request tables: the core's `lastRequestId`
/// sits one layer above each session's wire-level ids, since a wire `req_id`
/// is only meaningful to the one connection that assigned it.
struct CoreRequest {
    handles: Vec<(Identifier, Arc<Session>, u64)>,
}

/// Brokers every live session for one local node.
pub struct Core {
    local_instance: String,
    conf: SessionConf,
    accept_rate_limit: u32,
    peerings: StdMutex<PeeringRegistry>,
    /// Keyed by `local_peering.as_peering()`; several registrations (and
    /// thus several simultaneous sessions, one per connected instance) can
    /// share the same local peering id.
    sessions: StdMutex<HashMap<Identifier, Vec<Arc<Session>>>>,
    rendezvous: RendezvousTable,
    requests: StdMutex<HashMap<u64, CoreRequest>>,
    next_request_id: AtomicU64,
    /// Refcounted multiset of externally-observed addresses for this node,
    /// used to settle on the address published to the tracker when
    /// `external_address` is `Auto` (spec §4.4, §9).
    known_addresses: StdMutex<HashMap<Address, usize>>,
}

impl Core {
    pub fn new(local_instance: impl Into<String>, conf: SessionConf, accept_rate_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            local_instance: local_instance.into(),
            conf,
            accept_rate_limit,
            peerings: StdMutex::new(PeeringRegistry::new()),
            sessions: StdMutex::new(HashMap::new()),
            rendezvous: RendezvousTable::new(),
            requests: StdMutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            known_addresses: StdMutex::new(HashMap::new()),
        })
    }

    pub fn register_peering(&self, registration: PeeringRegistration) {
        self.peerings.lock().unwrap().register(registration);
    }

    pub fn unregister_peering(&self, local_peering: &Identifier) -> Option<PeeringRegistration> {
        self.peerings.lock().unwrap().unregister(local_peering)
    }

    pub fn note_public_address(&self, addr: Address) {
        *self.known_addresses.lock().unwrap().entry(addr).or_insert(0) += 1;
    }

    pub fn forget_public_address(&self, addr: Address) {
        let mut known = self.known_addresses.lock().unwrap();
        if let Some(count) = known.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                known.remove(&addr);
            }
        }
    }

    /// The most commonly observed external address, if any peer has told us
    /// one yet. Used to fill in `external_address = auto` when publishing.
    pub fn best_public_address(&self) -> Option<Address> {
        self.known_addresses
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(addr, _)| *addr)
    }

    /// Runs the accept loop until the listener itself errors. Inbound
    /// connections above `accept_rate_limit` per second are left to queue in
    /// the OS backlog rather than accepted immediately (spec §4.9: "the
    /// engine throttles inbound connection acceptance").
    pub async fn listen(self: &Arc<Self>, bind_addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        let mut tick = interval(Duration::from_secs(1));
        let mut accepted_this_tick = 0u32;
        loop {
            if accepted_this_tick >= self.accept_rate_limit.max(1) {
                tick.tick().await;
                accepted_this_tick = 0;
            }
            let (stream, peer_addr) = listener.accept().await?;
            accepted_this_tick += 1;
            let core = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = core.accept_one(stream, peer_addr).await {
                    debug!("inbound connection from {} did not become a session: {}", peer_addr, e);
                }
            });
        }
    }

    /// Dials `remote_addr` as the peering registered under `local_peering`,
    /// runs the handshake as the initiator, and installs the resulting
    /// session (spec §4.5, initiator side).
    pub async fn connect(self: &Arc<Self>, local_peering: &Identifier, remote_addr: SocketAddr) -> Result<()> {
        let (reg_local, reg_remote, secret, listener) = {
            let peerings = self.peerings.lock().unwrap();
            let reg = peerings.lookup(local_peering).ok_or(SessionError::UnknownPeering)?;
            (reg.local_peering.clone(), reg.remote_peering.clone(), reg.secret.clone(), Arc::clone(&reg.listener))
        };

        let stream = TcpStream::connect(remote_addr).await?;
        let _ = stream.set_nodelay(true);
        let cipher = CipherStream::new_obfuscated(stream);
        let mut framed = Framed::new(cipher, ProtocolCodec::new());

        let nonce_self = handshake::generate_nonce();
        let reg_remote_text = reg_remote.to_text();
        handshake::with_handshake_timeout(self.conf.handshake_timeout, async {
            handshake::send_hello(&mut framed, &reg_remote_text, &self.local_instance, &nonce_self).await
        })
        .await?;
        let peer_hello =
            handshake::with_handshake_timeout(self.conf.handshake_timeout, handshake::recv_hello(&mut framed)).await?;

        let keys = handshake::with_handshake_timeout(
            self.conf.handshake_timeout,
            handshake::authenticate_and_derive_keys(
                &mut framed,
                Role::Initiator,
                &secret,
                reg_local.digest(),
                reg_remote.digest(),
                &nonce_self,
                &peer_hello.nonce,
            ),
        )
        .await?;

        self.finalize_session(framed, keys, reg_local, reg_remote, peer_hello.instance, false, Address::from(remote_addr), listener)
            .await
    }

    /// Runs the acceptor side of the handshake over one freshly accepted
    /// socket and dispatches on its outcome (spec §4.5 Step 2):
    /// - (a) the claimed peering id matches a local registration: complete
    ///   the handshake and install a session.
    /// - (b)/(c) no local registration claims it (whether because it names a
    ///   different local instance we don't host, or we simply don't
    ///   recognize it at all): forward the still-obfuscated socket through
    ///   rendezvous relaying. This core hosts a single local instance, so
    ///   cases (b) and (c) collapse into the same path (see DESIGN.md).
    async fn accept_one(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let dump: DumpSink = Arc::new(StdMutex::new(Vec::new()));
        let mut cipher = CipherStream::new_obfuscated(stream);
        cipher.set_dump_sink(dump.clone());
        let mut framed = Framed::new(cipher, ProtocolCodec::new());

        let peer_hello =
            handshake::with_handshake_timeout(self.conf.handshake_timeout, handshake::recv_hello(&mut framed)).await?;
        let claimed = handshake::parse_claimed_peering(&peer_hello.remote_peering_text)?;

        let registration = {
            let peerings = self.peerings.lock().unwrap();
            peerings
                .lookup(&claimed)
                .map(|reg| (reg.local_peering.clone(), reg.remote_peering.clone(), reg.secret.clone(), Arc::clone(&reg.listener)))
        };

        let Some((reg_local, reg_remote, secret, listener)) = registration else {
            let cipher = framed.into_inner();
            let prefix = dump.lock().unwrap().clone();
            let socket = cipher.into_inner();
            let pending = PendingSocket::new(socket, prefix);
            rendezvous::forward(&**self, &self.rendezvous, &claimed, pending, self.conf.meeting_step_timeout()).await?;
            return Ok(());
        };

        let nonce_self = handshake::generate_nonce();
        let reg_remote_text = reg_remote.to_text();
        handshake::with_handshake_timeout(self.conf.handshake_timeout, async {
            handshake::send_hello(&mut framed, &reg_remote_text, &self.local_instance, &nonce_self).await
        })
        .await?;

        let keys = handshake::with_handshake_timeout(
            self.conf.handshake_timeout,
            handshake::authenticate_and_derive_keys(
                &mut framed,
                Role::Acceptor,
                &secret,
                reg_local.digest(),
                reg_remote.digest(),
                &nonce_self,
                &peer_hello.nonce,
            ),
        )
        .await?;

        self.finalize_session(framed, keys, reg_local, reg_remote, peer_hello.instance, true, Address::from(peer_addr), listener)
            .await
    }

    /// Installs the session material negotiated by either handshake path:
    /// rekeys the transport in place, rejects a duplicate (spec §4.9: a
    /// second session for an already-connected remote instance is closed
    /// rather than replacing the first), and spawns the session's tasks.
    async fn finalize_session(
        self: &Arc<Self>,
        framed: Framed<CipherStream<TcpStream>, ProtocolCodec>,
        keys: HandshakeKeys,
        local_peering: Identifier,
        mut remote_peering: Identifier,
        remote_instance: String,
        incoming: bool,
        remote_addr: Address,
        listener: Arc<dyn Listener>,
    ) -> Result<()> {
        if !remote_instance.is_empty() {
            remote_peering.set_name(remote_instance);
        }

        let mut cipher = framed.into_inner();
        cipher.clear_dump_sink();
        cipher.rekey_write(&keys.key_out, &keys.iv_out);
        cipher.rekey_read(&keys.key_in, &keys.iv_in);
        let transport = Framed::new(cipher, ProtocolCodec::new());

        let local_key = local_peering.as_peering();
        {
            let sessions = self.sessions.lock().unwrap();
            if sessions
                .get(&local_key)
                .map(|list| list.iter().any(|s| s.remote_peering == remote_peering))
                .unwrap_or(false)
            {
                return Err(SessionError::AuthFailed);
            }
        }

        let wrapped = CoreSessionListener::new(self, listener);
        let (session, sender_task, demux_task) = Session::spawn(
            local_peering,
            remote_peering,
            incoming,
            remote_addr,
            transport,
            wrapped,
            self.conf.chunk_size,
            self.conf.read_timeout,
        );
        self.track_session(local_key, session, sender_task, demux_task);
        Ok(())
    }

    /// Registers a newly established session and spawns a reaper that
    /// removes it and marks every in-flight request interrupted once either
    /// of its tasks ends (spec §7: "Network I/O failure").
    fn track_session(
        self: &Arc<Self>,
        local_key: Identifier,
        session: Arc<Session>,
        sender_task: JoinHandle<Result<()>>,
        demux_task: JoinHandle<Result<()>>,
    ) {
        self.sessions.lock().unwrap().entry(local_key.clone()).or_default().push(Arc::clone(&session));

        let core = Arc::clone(self);
        let reaped = Arc::clone(&session);
        tokio::spawn(async move {
            let _ = demux_task.await;
            reaped.close();
            sender_task.abort();
            if let Some(list) = core.sessions.lock().unwrap().get_mut(&local_key) {
                list.retain(|s| !Arc::ptr_eq(s, &reaped));
            }
        });
    }

    fn matches_receiver(session: &Session, receiver: &Identifier) -> bool {
        if receiver.is_null() {
            return true;
        }
        if receiver.name().is_empty() {
            session.remote_peering.as_peering() == *receiver
        } else {
            &session.remote_peering == receiver
        }
    }

    /// Sends `message` to every currently connected session matching its
    /// receiver (spec §3: a null receiver means broadcast to every
    /// connected peering).
    pub fn send_message(&self, message: Message) {
        let sessions = self.sessions.lock().unwrap();
        for list in sessions.values() {
            for session in list {
                if Self::matches_receiver(session, &message.receiver) {
                    session.send_message(message.clone());
                }
            }
        }
    }

    /// Submits a request to every session matching `receiver`, assigning it
    /// a process-wide id that stays stable across however many sessions end
    /// up answering it (spec §4.9).
    pub fn add_request(
        &self,
        target: impl Into<String>,
        is_data: bool,
        receiver: Identifier,
        parameters: HashMap<String, String>,
    ) -> u64 {
        let target = target.into();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let mut handles = Vec::new();
        {
            let sessions = self.sessions.lock().unwrap();
            for list in sessions.values() {
                for session in list {
                    if Self::matches_receiver(session, &receiver) {
                        let mut request = Request::new(target.clone(), is_data).with_receiver(session.remote_peering.clone());
                        for (k, v) in &parameters {
                            request = request.with_parameter(k.clone(), v.clone());
                        }
                        let local_id = session.submit_request(request);
                        handles.push((session.remote_peering.clone(), Arc::clone(session), local_id));
                    }
                }
            }
        }

        self.requests.lock().unwrap().insert(id, CoreRequest { handles });
        id
    }

    /// Blocks until every session this request reached has answered (or
    /// been interrupted), or `timeout` elapses; returns whether the request
    /// completed (spec §5: `wait(timeout)`).
    pub async fn wait_request(&self, id: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let handles = match self.requests.lock().unwrap().get(&id) {
                Some(r) => r.handles.clone(),
                None => return true,
            };
            if handles.iter().all(|(_, session, local_id)| session.is_request_complete(*local_id)) {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }

            let notifies: Vec<_> = handles.iter().filter_map(|(_, session, local_id)| session.request_notify(*local_id)).collect();
            if notifies.is_empty() {
                return true;
            }
            let waiters: Vec<_> = notifies.iter().map(|n| Box::pin(n.notified())).collect();
            let _ = tokio::time::timeout_at(deadline, futures::future::select_all(waiters)).await;
        }
    }

    /// A snapshot of every response collected so far, one entry per
    /// `(answering peering, status, parameters)`.
    pub fn request_responses(&self, id: u64) -> Vec<(Identifier, Status, HashMap<String, String>)> {
        let handles = match self.requests.lock().unwrap().get(&id) {
            Some(r) => r.handles.clone(),
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        for (peering, session, local_id) in handles {
            for (status, params) in session.response_snapshot(local_id) {
                out.push((peering.clone(), status, params));
            }
        }
        out
    }

    /// Takes the content pipe for one peering's response, if it carries one.
    pub fn take_response_content(&self, id: u64, peering: &Identifier, response_index: usize) -> Option<mpsc::Receiver<Vec<u8>>> {
        let handles = self.requests.lock().unwrap().get(&id)?.handles.clone();
        let (_, session, local_id) = handles.into_iter().find(|(p, _, _)| p == peering)?;
        session.take_response_content(local_id, response_index)
    }

    /// Cancels an outstanding request on every session it reached and drops
    /// its core-level bookkeeping.
    pub fn cancel_request(&self, id: u64) {
        if let Some(request) = self.requests.lock().unwrap().remove(&id) {
            for (_, session, local_id) in request.handles {
                session.cancel_request(local_id);
            }
        }
    }
}

impl Broadcaster for Core {
    /// Answers "does any connected session claim `target`" by issuing a
    /// `peer:<target>` discovery request to every session and waiting for
    /// the first non-failing answer (spec §4.6 step 2).
    fn locate<'a>(&'a self, target: &'a Identifier, step_timeout: Duration) -> Pin<Box<dyn Future<Output = Option<Identifier>> + Send + 'a>> {
        Box::pin(async move {
            let locate_target = format!("peer:{}", target.to_text());
            let id = self.add_request(locate_target, false, Identifier::NULL, HashMap::new());
            self.wait_request(id, step_timeout).await;
            let responses = self.request_responses(id);
            self.cancel_request(id);
            responses
                .into_iter()
                .find(|(_, status, _)| *status != Status::Failed && *status != Status::NotFound)
                .map(|(peering, _, _)| peering)
        })
    }
}

/// Wraps a registration's externally-owned [`Listener`] so the core can
/// intercept `peer:<target>` discovery requests (the other half of
/// [`Broadcaster::locate`]) before anything reaches the outer listener.
pub struct CoreSessionListener {
    core: Weak<Core>,
    inner: Arc<dyn Listener>,
}

impl CoreSessionListener {
    fn new(core: &Arc<Core>, inner: Arc<dyn Listener>) -> Arc<Self> {
        Arc::new(Self { core: Arc::downgrade(core), inner })
    }
}

impl Listener for CoreSessionListener {
    fn on_message(&self, message: Message) {
        self.inner.on_message(message);
    }

    fn on_request(&self, session: Arc<Session>, request: Request) {
        if let Some(text) = request.target.strip_prefix("peer:") {
            if let (Some(wanted), Some(core)) = (Identifier::from_text(text), self.core.upgrade()) {
                let known = core
                    .sessions
                    .lock()
                    .unwrap()
                    .values()
                    .flatten()
                    .any(|s| s.remote_peering.as_peering() == wanted.as_peering());
                let mut params = HashMap::new();
                let status = if known {
                    params.insert("remote".to_string(), wanted.to_text());
                    Status::Success
                } else {
                    Status::NotFound
                };
                session.respond(request.id, status, params, None, true);
                return;
            }
            warn!("malformed peer: discovery target {:?}", request.target);
        }
        self.inner.on_request(session, request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::Mutex as AsyncMutex;

    fn peering(fill: u8) -> Identifier {
        Identifier::peering([fill; 64])
    }

    fn test_conf() -> SessionConf {
        let mut conf = SessionConf::default();
        conf.handshake_timeout = Duration::from_secs(2);
        conf.read_timeout = Duration::from_secs(5);
        conf.request_timeout = Duration::from_millis(400);
        conf.meeting_timeout = Duration::from_millis(300);
        conf
    }

    struct RecordingListener {
        messages: AsyncMutex<Vec<Message>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self { messages: AsyncMutex::new(Vec::new()) })
        }
    }

    impl Listener for RecordingListener {
        fn on_message(&self, message: Message) {
            self.messages.try_lock().unwrap().push(message);
        }
        fn on_request(&self, _session: Arc<Session>, _request: Request) {}
    }

    #[test]
    fn add_request_with_no_sessions_completes_immediately() {
        let core = Core::new("t", test_conf(), 10);
        let id = core.add_request("file:/doc.txt", false, Identifier::NULL, HashMap::new());
        assert!(core.request_responses(id).is_empty());
        core.cancel_request(id);
    }

    #[tokio::test]
    async fn direct_connect_authenticates_and_delivers_a_message() {
        let a_local = peering(1);
        let b_local = peering(2);
        let secret = b"shared secret".to_vec();

        let a_core = Core::new("a", test_conf(), 100);
        let b_core = Core::new("b", test_conf(), 100);

        let a_inbox = RecordingListener::new();
        a_core.register_peering(PeeringRegistration::new(a_local.clone(), b_local.clone(), secret.clone(), a_inbox.clone()));
        b_core.register_peering(PeeringRegistration::new(b_local.clone(), a_local.clone(), secret.clone(), RecordingListener::new()));

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(bind_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let b_for_listen = Arc::clone(&b_core);
        tokio::spawn(async move {
            let _ = b_for_listen.listen(addr).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        a_core.connect(&a_local, addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        b_core.send_message(Message::new(a_local.clone(), b"hello from b".to_vec()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = a_inbox.messages.lock().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, b"hello from b");
    }

    #[tokio::test]
    async fn duplicate_session_for_same_remote_peering_is_rejected() {
        let (local_end, remote_end) = tokio::io::duplex(64 * 1024);
        let local_transport = Framed::new(local_end, ProtocolCodec::new());
        let remote_transport = Framed::new(remote_end, ProtocolCodec::new());

        let core = Core::new("t", test_conf(), 10);
        let local_peering = peering(5);
        let remote_peering = peering(6);

        let listener = RecordingListener::new();
        let (existing, _sender, _demux) = Session::spawn(
            local_peering.clone(),
            remote_peering.clone(),
            false,
            Address::Null,
            local_transport,
            listener,
            4096,
            Duration::from_secs(5),
        );
        core.sessions.lock().unwrap().entry(local_peering.as_peering()).or_default().push(existing);

        let (dup_local, _dup_remote) = tokio::io::duplex(4 * 1024);
        let dup_framed = Framed::new(CipherStream::new_obfuscated(dup_local), ProtocolCodec::new());
        let keys = HandshakeKeys { key_out: [0u8; 32], iv_out: [0u8; 16], key_in: [0u8; 32], iv_in: [0u8; 16] };

        let result = core
            .finalize_session(
                dup_framed,
                keys,
                local_peering,
                remote_peering,
                String::new(),
                true,
                Address::Null,
                RecordingListener::new(),
            )
            .await;
        assert!(matches!(result, Err(SessionError::AuthFailed)));
        drop(remote_transport);
    }
}
