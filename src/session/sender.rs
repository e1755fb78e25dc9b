//! The per-session sender scheduler (spec §4.8): a single cooperative loop
//! that interleaves keep-alives, outgoing messages, outgoing request
//! headers, outgoing response headers, and outbound data chunks with fair,
//! priority-ordered progress.
//!
//! Callers push work onto an unbounded channel; the scheduler drains it and
//! drives a `futures::Sink` built from the same `Framed` the inbound side
//! reads from.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures::SinkExt;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{SessionError, Status};
use crate::message::Message;
use crate::protocol::{Command, Headers};

/// A single chunk of outbound response content, or a terminal signal.
/// Produced by whatever handler is answering a data request.
pub type ChunkResult = Result<Vec<u8>, SessionError>;

/// Work items callers queue on the sender.
pub enum SenderCommand {
    SendMessage(Message),
    SendRequest {
        req_id: u64,
        target: String,
        is_data: bool,
        params: HashMap<String, String>,
    },
    /// Queues one response to an inbound request. `is_final` marks the last
    /// response for this `req_id`: only it carries the true status on the
    /// wire, earlier ones are sent as `Pending` (spec §4.8 step 2).
    Respond {
        req_id: u64,
        status: Status,
        params: HashMap<String, String>,
        content: Option<mpsc::Receiver<ChunkResult>>,
        is_final: bool,
    },
    /// We were sending data on `channel` and the peer asked us to stop
    /// (we received their `C`): drop the local transfer silently, no wire
    /// frame needed.
    Cancel { channel: u64 },
    /// We are the one receiving data on `channel` and want the peer to
    /// stop sending: enqueue an outbound `C` frame (spec §4.7 verb `C`,
    /// used both for caller-initiated request cancellation and for
    /// rejecting data on a channel we don't recognize).
    SendCancel { channel: u64 },
    Shutdown,
}

struct PendingResponse {
    req_id: u64,
    status: Status,
    params: HashMap<String, String>,
    content: Option<mpsc::Receiver<ChunkResult>>,
    is_final: bool,
    announced: bool,
    channel: u64,
    finished: bool,
}

/// Drives the sender loop until `control_rx` closes or a [`SenderCommand::Shutdown`]
/// arrives. `sink` is the write half of the session's framed transport.
pub struct Sender<Si> {
    sink: Si,
    messages_queue: VecDeque<Message>,
    requests_queue: VecDeque<(u64, String, bool, HashMap<String, String>)>,
    requests_to_respond: Vec<PendingResponse>,
    cancel_queue: VecDeque<u64>,
    transfers: HashMap<u64, mpsc::Receiver<ChunkResult>>,
    next_channel: u64,
    chunk_size: usize,
    read_timeout: Duration,
}

impl<Si> Sender<Si>
where
    Si: futures::Sink<Command, Error = std::io::Error> + Unpin,
{
    pub fn new(sink: Si, chunk_size: usize, read_timeout: Duration) -> Self {
        Self {
            sink,
            messages_queue: VecDeque::new(),
            requests_queue: VecDeque::new(),
            requests_to_respond: Vec::new(),
            cancel_queue: VecDeque::new(),
            transfers: HashMap::new(),
            next_channel: 1,
            chunk_size,
            read_timeout,
        }
    }

    fn has_work(&self) -> bool {
        !self.messages_queue.is_empty()
            || !self.requests_queue.is_empty()
            || !self.cancel_queue.is_empty()
            || !self.transfers.is_empty()
            || self.requests_to_respond.iter().any(|r| !r.announced)
    }

    fn allocate_channel(&mut self) -> u64 {
        let channel = self.next_channel;
        self.next_channel += 1;
        channel
    }

    fn enqueue(&mut self, cmd: SenderCommand) -> bool {
        match cmd {
            SenderCommand::SendMessage(msg) => self.messages_queue.push_back(msg),
            SenderCommand::SendRequest { req_id, target, is_data, params } => {
                self.requests_queue.push_back((req_id, target, is_data, params));
            }
            SenderCommand::Respond { req_id, status, params, content, is_final } => {
                self.requests_to_respond.push(PendingResponse {
                    req_id,
                    status,
                    params,
                    content,
                    is_final,
                    announced: false,
                    channel: 0,
                    finished: false,
                });
            }
            SenderCommand::Cancel { channel } => {
                self.transfers.remove(&channel);
            }
            SenderCommand::SendCancel { channel } => {
                self.cancel_queue.push_back(channel);
            }
            SenderCommand::Shutdown => return false,
        }
        true
    }

    /// Runs the scheduler until the control channel closes or a
    /// [`SenderCommand::Shutdown`] is received.
    pub async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<SenderCommand>) -> Result<(), SessionError> {
        loop {
            // Drain any commands already queued without blocking, so a
            // burst of work gets picked up in one iteration.
            while let Ok(cmd) = control_rx.try_recv() {
                if !self.enqueue(cmd) {
                    return Ok(());
                }
            }

            if !self.has_work() {
                match timeout(self.read_timeout / 2, control_rx.recv()).await {
                    Ok(Some(cmd)) => {
                        if !self.enqueue(cmd) {
                            return Ok(());
                        }
                        continue;
                    }
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        // Woke with nothing to do: send a keep-alive (spec
                        // §4.8 step 1).
                        let nonce = rand::thread_rng().next_u32();
                        self.sink.send(Command::KeepAlive { nonce }).await?;
                        continue;
                    }
                }
            }

            self.announce_responses().await?;

            if let Some(channel) = self.cancel_queue.pop_front() {
                self.sink.send(Command::Cancel { channel }).await?;
            }

            if let Some(msg) = self.messages_queue.pop_front() {
                let mut headers = Headers::new();
                for (k, v) in &msg.parameters {
                    headers.insert(k, v);
                }
                headers.insert("receiver", msg.receiver.to_text());
                self.sink
                    .send(Command::Message { headers, body: msg.content })
                    .await?;
            }

            if let Some((req_id, target, is_data, params)) = self.requests_queue.pop_front() {
                let mut headers = Headers::new();
                for (k, v) in params {
                    headers.insert(k, v);
                }
                self.sink
                    .send(Command::Request { req_id, target, is_data, headers })
                    .await?;
            }

            self.drive_transfers().await?;
            self.garbage_collect_responded();
        }
    }

    /// Step 2: announce any not-yet-announced response, allocating a
    /// channel only when it carries content.
    async fn announce_responses(&mut self) -> Result<(), SessionError> {
        let last_by_request: HashMap<u64, usize> = {
            let mut last = HashMap::new();
            for (idx, r) in self.requests_to_respond.iter().enumerate() {
                if r.is_final {
                    last.insert(r.req_id, idx);
                }
            }
            last
        };

        for idx in 0..self.requests_to_respond.len() {
            if self.requests_to_respond[idx].announced {
                continue;
            }
            let is_truly_last = last_by_request.get(&self.requests_to_respond[idx].req_id) == Some(&idx);
            let wire_status = if is_truly_last {
                self.requests_to_respond[idx].status
            } else {
                Status::Pending
            };

            let channel = if self.requests_to_respond[idx].content.is_some() {
                let ch = self.allocate_channel();
                let rx = self.requests_to_respond[idx].content.take().unwrap();
                self.transfers.insert(ch, rx);
                self.requests_to_respond[idx].channel = ch;
                ch
            } else {
                0
            };

            let mut headers = Headers::new();
            for (k, v) in &self.requests_to_respond[idx].params {
                headers.insert(k, v);
            }
            let req_id = self.requests_to_respond[idx].req_id;
            self.sink
                .send(Command::Response {
                    req_id,
                    status: wire_status.code(),
                    channel,
                    headers,
                })
                .await?;
            self.requests_to_respond[idx].announced = true;
            if channel == 0 {
                self.requests_to_respond[idx].finished = true;
            }
        }
        Ok(())
    }

    /// Step 5: round-robin one chunk per open channel, preempting back to
    /// higher-priority queues as soon as they have work.
    async fn drive_transfers(&mut self) -> Result<(), SessionError> {
        let channels: Vec<u64> = self.transfers.keys().copied().collect();
        for channel in channels {
            if !self.messages_queue.is_empty()
                || !self.requests_queue.is_empty()
                || !self.cancel_queue.is_empty()
                || self.requests_to_respond.iter().any(|r| !r.announced)
            {
                break;
            }

            let Some(rx) = self.transfers.get_mut(&channel) else { continue };
            match rx.recv().await {
                Some(Ok(chunk)) if !chunk.is_empty() => {
                    for slice in chunk.chunks(self.chunk_size) {
                        self.sink
                            .send(Command::Data { channel, body: slice.to_vec() })
                            .await?;
                    }
                }
                Some(Ok(_)) | None => {
                    self.sink
                        .send(Command::Data { channel, body: Vec::new() })
                        .await?;
                    self.transfers.remove(&channel);
                    self.mark_channel_finished(channel);
                }
                Some(Err(_)) => {
                    self.sink
                        .send(Command::Error {
                            channel,
                            status: Status::ReadFailed.code(),
                        })
                        .await?;
                    self.transfers.remove(&channel);
                    self.mark_channel_finished(channel);
                }
            }
        }
        Ok(())
    }

    fn mark_channel_finished(&mut self, channel: u64) {
        for r in &mut self.requests_to_respond {
            if r.channel == channel {
                r.finished = true;
            }
        }
    }

    /// Step 6: drop responses whose transfer has completed.
    fn garbage_collect_responded(&mut self) {
        self.requests_to_respond.retain(|r| !(r.announced && r.finished));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as futures_mpsc;
    use futures::StreamExt;

    struct VecSink(futures_mpsc::UnboundedSender<Command>);
    impl futures::Sink<Command> for VecSink {
        type Error = std::io::Error;
        fn poll_ready(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn start_send(self: std::pin::Pin<&mut Self>, item: Command) -> Result<(), Self::Error> {
            let _ = self.get_mut().0.unbounded_send(item);
            Ok(())
        }
        fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_close(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn single_response_without_content_is_sent_with_true_status() {
        let (out_tx, mut out_rx) = futures_mpsc::unbounded();
        let sender = Sender::new(VecSink(out_tx), 4096, Duration::from_secs(10));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        control_tx
            .send(SenderCommand::Respond {
                req_id: 1,
                status: Status::Success,
                params: HashMap::new(),
                content: None,
                is_final: true,
            })
            .unwrap();
        control_tx.send(SenderCommand::Shutdown).unwrap();

        sender.run(control_rx).await.unwrap();

        let got = out_rx.next().await.unwrap();
        match got {
            Command::Response { req_id, status, channel, .. } => {
                assert_eq!(req_id, 1);
                assert_eq!(status, Status::Success.code());
                assert_eq!(channel, 0);
            }
            _ => panic!("expected a Response frame"),
        }
    }

    #[tokio::test]
    async fn data_transfer_ends_with_zero_length_frame() {
        let (out_tx, mut out_rx) = futures_mpsc::unbounded();
        let sender = Sender::new(VecSink(out_tx), 4096, Duration::from_secs(10));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (content_tx, content_rx) = mpsc::channel(4);

        content_tx.send(Ok(b"hello".to_vec())).await.unwrap();
        drop(content_tx);

        control_tx
            .send(SenderCommand::Respond {
                req_id: 9,
                status: Status::Success,
                params: HashMap::new(),
                content: Some(content_rx),
                is_final: true,
            })
            .unwrap();
        control_tx.send(SenderCommand::Shutdown).unwrap();

        sender.run(control_rx).await.unwrap();

        let announce = out_rx.next().await.unwrap();
        let channel = match announce {
            Command::Response { channel, status, .. } => {
                assert_eq!(status, Status::Success.code());
                assert_ne!(channel, 0);
                channel
            }
            _ => panic!("expected a Response frame"),
        };
        let chunk = out_rx.next().await.unwrap();
        match chunk {
            Command::Data { channel: c, body } => {
                assert_eq!(c, channel);
                assert_eq!(body, b"hello");
            }
            _ => panic!("expected a Data frame"),
        }
        let eof = out_rx.next().await.unwrap();
        match eof {
            Command::Data { channel: c, body } => {
                assert_eq!(c, channel);
                assert!(body.is_empty());
            }
            _ => panic!("expected an EOF Data frame"),
        }
    }

    #[tokio::test]
    async fn earlier_responses_of_same_request_report_pending() {
        let (out_tx, mut out_rx) = futures_mpsc::unbounded();
        let sender = Sender::new(VecSink(out_tx), 4096, Duration::from_secs(10));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        control_tx
            .send(SenderCommand::Respond {
                req_id: 3,
                status: Status::Success,
                params: HashMap::new(),
                content: None,
                is_final: false,
            })
            .unwrap();
        control_tx
            .send(SenderCommand::Respond {
                req_id: 3,
                status: Status::NotFound,
                params: HashMap::new(),
                content: None,
                is_final: true,
            })
            .unwrap();
        control_tx.send(SenderCommand::Shutdown).unwrap();

        sender.run(control_rx).await.unwrap();

        let first = out_rx.next().await.unwrap();
        match first {
            Command::Response { status, .. } => assert_eq!(status, Status::Pending.code()),
            _ => panic!("expected Response"),
        }
        let second = out_rx.next().await.unwrap();
        match second {
            Command::Response { status, .. } => assert_eq!(status, Status::NotFound.code()),
            _ => panic!("expected Response"),
        }
    }
}
