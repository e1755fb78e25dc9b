//! One live connection to one authenticated peer instance (spec §3, §4.5–
//! §4.9): owns the socket, the handshake, the inbound demultiplexer and the
//! outbound sender, and presents `send_message`/`submit_request`/
//! `cancel_request`/`respond` to whatever owns the session (the core
//! registry, not yet in scope of this module).

pub mod handshake;
pub mod rendezvous;
pub mod sender;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::address::Address;
use crate::error::{Result, SessionError, Status};
use crate::identifier::Identifier;
use crate::message::Message;
use crate::peering::Listener;
use crate::protocol::{Command, ProtocolCodec};
use crate::request::{Request, Response};
use tokio_util::codec::Framed;

use self::sender::{ChunkResult, Sender, SenderCommand};

/// Everything a session needs to route an inbound frame back to whoever
/// submitted the outbound request it answers, keyed by the request's
/// session-local id (spec §4.9: this is the per-session mirror of the
/// core's global `lastRequestId` table; the core's fan-out to multiple
/// sessions is a layer above this one).
pub struct Session {
    pub local_peering: Identifier,
    pub remote_peering: Identifier,
    pub incoming: bool,
    pub remote_addr: Address,
    sender_tx: mpsc::UnboundedSender<SenderCommand>,
    requests: Mutex<HashMap<u64, Request>>,
    content_senders: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_request_id: AtomicU64,
    listener: Arc<dyn Listener>,
}

impl Session {
    pub fn new(
        local_peering: Identifier,
        remote_peering: Identifier,
        incoming: bool,
        remote_addr: Address,
        sender_tx: mpsc::UnboundedSender<SenderCommand>,
        listener: Arc<dyn Listener>,
    ) -> Self {
        Self {
            local_peering,
            remote_peering,
            incoming,
            remote_addr,
            sender_tx,
            requests: Mutex::new(HashMap::new()),
            content_senders: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            listener,
        }
    }

    /// Spawns the sender and inbound-demultiplexer tasks over an already
    /// rekeyed transport and returns the session handle plus their join
    /// handles.
    pub fn spawn<RW>(
        local_peering: Identifier,
        remote_peering: Identifier,
        incoming: bool,
        remote_addr: Address,
        transport: Framed<RW, ProtocolCodec>,
        listener: Arc<dyn Listener>,
        chunk_size: usize,
        read_timeout: Duration,
    ) -> (
        Arc<Session>,
        tokio::task::JoinHandle<Result<()>>,
        tokio::task::JoinHandle<Result<()>>,
    )
    where
        RW: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = transport.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(local_peering, remote_peering, incoming, remote_addr, tx, listener));

        let sender_task = tokio::spawn(Sender::new(sink, chunk_size, read_timeout).run(rx));

        let demux_session = Arc::clone(&session);
        let demux_task = tokio::spawn(async move { demux_session.run(stream, read_timeout).await });

        (session, sender_task, demux_task)
    }

    /// Enqueues an outbound message (spec §2 "Session: ... presents
    /// operations sendMessage").
    pub fn send_message(&self, message: Message) {
        let _ = self.sender_tx.send(SenderCommand::SendMessage(message));
    }

    /// Submits a request on this session: assigns it a session-local wire
    /// id, records it for inbound response demultiplexing, and enqueues
    /// its header on the sender.
    pub fn submit_request(&self, mut request: Request) -> u64 {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        request.pending_peers.insert(self.remote_peering.clone());
        let target = request.target.clone();
        let is_data = request.is_data;
        let params = request.parameters.clone();
        self.requests.lock().unwrap().insert(id, request);
        let _ = self.sender_tx.send(SenderCommand::SendRequest { req_id: id, target, is_data, params });
        id
    }

    /// True once this session's peering has answered with a terminal
    /// status (or the request doesn't exist here at all, e.g. it was
    /// already garbage collected after completing).
    pub fn is_request_complete(&self, id: u64) -> bool {
        self.requests.lock().unwrap().get(&id).map(|r| r.is_complete()).unwrap_or(true)
    }

    /// The notify handle a caller can await for this request's next state
    /// change (new response recorded, or interrupted).
    pub fn request_notify(&self, id: u64) -> Option<Arc<tokio::sync::Notify>> {
        self.requests.lock().unwrap().get(&id).map(|r| r.notify.clone())
    }

    /// Drops a completed request's local bookkeeping once its owner (the
    /// core registry) is done reading its responses.
    pub fn forget_request(&self, id: u64) {
        self.requests.lock().unwrap().remove(&id);
    }

    /// Cancels a previously submitted request: sends a `C` for every
    /// channel its responses opened and drops the local table entry (spec
    /// §4.7 "Request cancellation").
    pub fn cancel_request(&self, id: u64) {
        let request = self.requests.lock().unwrap().remove(&id);
        let Some(request) = request else { return };
        let mut content_senders = self.content_senders.lock().unwrap();
        for response in &request.responses {
            if response.channel != 0 {
                let _ = self.sender_tx.send(SenderCommand::SendCancel { channel: response.channel });
                content_senders.remove(&response.channel);
            }
        }
    }

    /// Answers one inbound request this session's listener was handed via
    /// [`Listener::on_request`]. `is_final` marks the last response for
    /// `req_id` (spec §4.8 step 2).
    pub fn respond(
        &self,
        req_id: u64,
        status: Status,
        params: HashMap<String, String>,
        content: Option<mpsc::Receiver<ChunkResult>>,
        is_final: bool,
    ) {
        let _ = self.sender_tx.send(SenderCommand::Respond { req_id, status, params, content, is_final });
    }

    /// Takes the content-pipe consumer half for one response of a
    /// previously submitted request (spec §2 "Session: ... presents
    /// operations ... registerResponseSink").
    pub fn take_response_content(&self, request_id: u64, response_index: usize) -> Option<mpsc::Receiver<Vec<u8>>> {
        let mut requests = self.requests.lock().unwrap();
        requests.get_mut(&request_id)?.responses.get_mut(response_index)?.take_content_rx()
    }

    /// A read-only snapshot of a submitted request's responses so far,
    /// used by callers (the core registry's rendezvous locate, the
    /// splicer) that need to inspect parameters without taking the
    /// content pipe.
    pub fn response_snapshot(&self, request_id: u64) -> Vec<(Status, HashMap<String, String>)> {
        self.requests
            .lock()
            .unwrap()
            .get(&request_id)
            .map(|r| r.responses.iter().map(|resp| (resp.status, resp.parameters.clone())).collect())
            .unwrap_or_default()
    }

    /// Called when the session's socket fails or closes: marks every
    /// in-flight response from this peering `Interrupted` and closes its
    /// content pipe (spec §7 "Network I/O failure").
    pub fn close(&self) {
        let mut requests = self.requests.lock().unwrap();
        for request in requests.values_mut() {
            request.interrupt_peer(&self.remote_peering);
        }
    }

    /// Drives the inbound demultiplexer until the transport closes, times
    /// out, or a protocol violation occurs.
    pub async fn run<St>(self: Arc<Self>, mut stream: St, read_timeout: Duration) -> Result<()>
    where
        St: Stream<Item = std::io::Result<Command>> + Unpin,
    {
        loop {
            let next = tokio::time::timeout(read_timeout, stream.next()).await;
            match next {
                Ok(Some(Ok(cmd))) => self.handle_command(cmd).await?,
                Ok(Some(Err(e))) => return Err(SessionError::from(e)),
                Ok(None) => return Err(SessionError::Interrupted),
                Err(_) => return Err(SessionError::Timeout),
            }
        }
    }

    async fn handle_command(self: &Arc<Self>, cmd: Command) -> Result<()> {
        match cmd {
            Command::KeepAlive { .. } => Ok(()),
            Command::Hello { .. } | Command::Auth { .. } => Err(SessionError::UnexpectedVerb {
                expected: "a post-handshake verb",
                got: format!("{:?}", cmd.verb()),
            }),
            Command::Message { headers, body } => {
                crate::message::Message::validate_len(body.len())?;
                let mut parameters: HashMap<String, String> = headers.into();
                let receiver = parameters
                    .remove("receiver")
                    .and_then(|text| Identifier::from_text(&text))
                    .unwrap_or(Identifier::NULL);
                let mut message = Message::new(receiver, body);
                message.parameters = parameters;
                self.listener.on_message(message);
                Ok(())
            }
            Command::Request { req_id, target, is_data, headers } => {
                let parameters: HashMap<String, String> = headers.into();
                let mut request = Request::new(target, is_data);
                request.id = req_id;
                request.parameters = parameters;
                request.receiver = self.local_peering.clone();
                self.listener.on_request(Arc::clone(self), request);
                Ok(())
            }
            Command::Response { req_id, status, channel, headers } => {
                let status = Status::from_code(status).unwrap_or(Status::Failed);
                let mut response = Response::new(status, self.remote_peering.clone());
                response.parameters = headers.into();
                if channel != 0 {
                    let tx = response.open_content(channel);
                    self.content_senders.lock().unwrap().insert(channel, tx);
                    response.mark_started();
                }
                let mut requests = self.requests.lock().unwrap();
                if let Some(request) = requests.get_mut(&req_id) {
                    let peering = self.remote_peering.clone();
                    request.record_response(peering, response);
                }
                Ok(())
            }
            Command::Data { channel, body } => {
                let sender = self.content_senders.lock().unwrap().get(&channel).cloned();
                match sender {
                    Some(tx) if body.is_empty() => {
                        self.content_senders.lock().unwrap().remove(&channel);
                        drop(tx);
                        self.finish_channel(channel, None);
                        Ok(())
                    }
                    Some(tx) => {
                        if tx.send(body).await.is_err() {
                            self.content_senders.lock().unwrap().remove(&channel);
                        }
                        Ok(())
                    }
                    None => {
                        // Unknown channel: discard the body and ask the
                        // peer to stop (spec §7).
                        let _ = self.sender_tx.send(SenderCommand::SendCancel { channel });
                        Ok(())
                    }
                }
            }
            Command::Error { channel, status } => {
                self.content_senders.lock().unwrap().remove(&channel);
                let status = Status::from_code(status).unwrap_or(Status::ReadFailed);
                self.finish_channel(channel, Some(status));
                Ok(())
            }
            Command::Cancel { channel } => {
                let _ = self.sender_tx.send(SenderCommand::Cancel { channel });
                Ok(())
            }
        }
    }

    /// Locates the response owning `channel` across every in-flight
    /// request and closes its content pipe, optionally overriding its
    /// status first (used for `E` frames).
    fn finish_channel(&self, channel: u64, error_status: Option<Status>) {
        let mut requests = self.requests.lock().unwrap();
        for request in requests.values_mut() {
            for response in &mut request.responses {
                if response.channel == channel {
                    if let Some(status) = error_status {
                        response.status = status;
                    }
                    response.close_content();
                    return;
                }
            }
        }
    }
}
