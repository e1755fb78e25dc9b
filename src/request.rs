//! Requests and responses: the multi-peer RPC abstraction sessions carry
//! over verbs `I`/`G`/`R`/`D`/`E`/`C` (spec §3, §4.7).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::error::Status;
use crate::identifier::Identifier;

/// Default bound on a response's content channel: enough to smooth out a
/// sender/receiver speed mismatch without letting an unread response buffer
/// unboundedly (spec §5: "the pipe's write side blocks when its internal
/// buffer is full").
const CONTENT_CHANNEL_CAPACITY: usize = 64;

/// An outbound or inbound RPC, possibly answered by several peers, possibly
/// receiving several responses each.
pub struct Request {
    /// `0` until [`crate::core::Core::add_request`] assigns it.
    pub id: u64,
    pub target: String,
    pub is_data: bool,
    pub parameters: HashMap<String, String>,
    /// [`Identifier::NULL`] means broadcast to every known peering.
    pub receiver: Identifier,
    /// Peerings a response is still outstanding from.
    pub pending_peers: HashSet<Identifier>,
    pub responses: Vec<Response>,
    /// Signalled whenever `pending_peers` shrinks, so a waiter such as
    /// [`crate::core::Core::wait_request`] can block on it instead of
    /// polling (spec §5: "`wait(timeout)` returns when `pendingPeers` is
    /// empty or the deadline elapses").
    pub notify: Arc<Notify>,
}

impl Request {
    pub fn new(target: impl Into<String>, is_data: bool) -> Self {
        Self {
            id: 0,
            target: target.into(),
            is_data,
            parameters: HashMap::new(),
            receiver: Identifier::NULL,
            pending_peers: HashSet::new(),
            responses: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_receiver(mut self, receiver: Identifier) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn is_submitted(&self) -> bool {
        self.id != 0
    }

    /// True once every expected peer has either answered with a terminal
    /// status or been dropped (spec §4.7: "the request notifies its
    /// waiters").
    pub fn is_complete(&self) -> bool {
        self.pending_peers.is_empty()
    }

    /// Records a response from `peering` and, if its status is terminal,
    /// removes that peering from `pending_peers` (spec §4.7).
    pub fn record_response(&mut self, peering: Identifier, response: Response) {
        if response.status.is_terminal() {
            self.pending_peers.remove(&peering);
        }
        self.responses.push(response);
        self.notify.notify_waiters();
    }

    /// Marks every response from `peering` interrupted and drops it from
    /// `pending_peers`, used when its session dies mid-flight (spec §7:
    /// "Network I/O failure ... remove the session's peering from every
    /// outbound request's pendingPeers").
    pub fn interrupt_peer(&mut self, peering: &Identifier) {
        self.pending_peers.remove(peering);
        for response in &mut self.responses {
            if &response.peering == peering && !response.status.is_terminal() {
                response.status = Status::Interrupted;
                response.close_content();
            }
        }
        self.notify.notify_waiters();
    }
}

/// One reply to a [`Request`], possibly carrying a streamed content body.
pub struct Response {
    pub status: Status,
    pub parameters: HashMap<String, String>,
    pub channel: u64,
    pub transfer_started: bool,
    pub transfer_finished: bool,
    pub peering: Identifier,
    content_tx: Option<mpsc::Sender<Vec<u8>>>,
    content_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl Response {
    pub fn new(status: Status, peering: Identifier) -> Self {
        Self {
            status,
            parameters: HashMap::new(),
            channel: 0,
            transfer_started: false,
            transfer_finished: false,
            peering,
            content_tx: None,
            content_rx: None,
        }
    }

    /// Opens the content pipe, returning the producer half; the consumer
    /// half is retrieved once via [`Self::take_content_rx`] (spec §3:
    /// "`content` is a producer/consumer pipe owned by the response").
    pub fn open_content(&mut self, channel: u64) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel(CONTENT_CHANNEL_CAPACITY);
        self.channel = channel;
        self.content_tx = Some(tx.clone());
        self.content_rx = Some(rx);
        tx
    }

    pub fn take_content_rx(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.content_rx.take()
    }

    pub fn has_content(&self) -> bool {
        self.content_tx.is_some()
    }

    /// Closes the content pipe (drops the sender half), which is how the
    /// receiving end observes EOF (spec §8, invariant 4: "`transferFinished
    /// == true` implies the pipe is closed").
    pub fn close_content(&mut self) {
        self.transfer_finished = true;
        self.content_tx = None;
    }

    pub fn mark_started(&mut self) {
        self.transfer_started = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peering(fill: u8) -> Identifier {
        Identifier::peering([fill; 64])
    }

    #[test]
    fn new_request_is_unsubmitted() {
        let req = Request::new("file:/doc.txt", true);
        assert!(!req.is_submitted());
    }

    #[test]
    fn record_terminal_response_clears_pending_peer() {
        let mut req = Request::new("file:/doc.txt", true);
        req.pending_peers.insert(peering(1));
        req.record_response(peering(1), Response::new(Status::Success, peering(1)));
        assert!(req.is_complete());
    }

    #[test]
    fn record_pending_response_keeps_peer_pending() {
        let mut req = Request::new("file:/doc.txt", true);
        req.pending_peers.insert(peering(1));
        req.record_response(peering(1), Response::new(Status::Pending, peering(1)));
        assert!(!req.is_complete());
    }

    #[test]
    fn interrupt_peer_marks_in_flight_responses_interrupted() {
        let mut req = Request::new("file:/doc.txt", true);
        req.pending_peers.insert(peering(2));
        let mut response = Response::new(Status::Pending, peering(2));
        response.mark_started();
        req.responses.push(response);
        req.interrupt_peer(&peering(2));
        assert!(req.is_complete());
        assert_eq!(req.responses[0].status, Status::Interrupted);
        assert!(req.responses[0].transfer_finished);
    }

    #[tokio::test]
    async fn content_pipe_closes_on_close_content() {
        let mut response = Response::new(Status::Pending, peering(3));
        let tx = response.open_content(7);
        let mut rx = response.take_content_rx().unwrap();
        tx.send(b"chunk".to_vec()).await.unwrap();
        response.close_content();
        assert_eq!(rx.recv().await, Some(b"chunk".to_vec()));
        assert_eq!(rx.recv().await, None);
        assert!(response.transfer_finished);
    }
}
