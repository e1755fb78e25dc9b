//! Parallel multi-source striped download (spec §3 "Splicer", §4.10).
//!
//! Given a target content digest, discovers the peers holding it, opens one
//! striped data request per source, and keeps every stripe's source
//! up to date: a stripe whose latest response errored is rerouted, and a
//! stripe lagging far enough behind its fastest sibling is reassigned to
//! the fast sibling's source ("fast preemption").
//!
//! Built on top of [`crate::core::Core`]'s request API rather than talking
//! to sessions directly, the same way the teacher's piece downloads are
//! driven through `DiskHandle`/`PeerSession` rather than touching sockets.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::Core;
use crate::error::{Result, SessionError, Status};
use crate::identifier::Identifier;
use crate::striped_file::{Cursor, StripedFile};

/// Reassign a lagging stripe once its fastest sibling is at least this many
/// blocks ahead (spec §4.10 step 3: "fast preemption").
const PREEMPTION_LEAD_BLOCKS: u64 = 2;
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(30);

struct Stripe {
    source: Identifier,
    request_id: u64,
    cursor: Arc<StdMutex<Cursor>>,
    writer: Option<JoinHandle<()>>,
    errored: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

/// Drives one stripe's data request: waits for its source's response to
/// carry a content pipe, then copies chunks into the striped view until the
/// pipe closes, publishing the write cursor after every chunk so
/// [`Splicer::tick`] can observe progress without touching the file itself.
async fn run_stripe_writer(
    core: Arc<Core>,
    file: Arc<File>,
    block_size: usize,
    stripe_count: usize,
    index: usize,
    request_id: u64,
    source: Identifier,
    start: Cursor,
    cursor: Arc<StdMutex<Cursor>>,
    errored: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    response_timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + response_timeout;
    let mut rx = loop {
        let snapshot = core.request_responses(request_id);
        if let Some((_, status, _)) = snapshot.into_iter().find(|(p, _, _)| *p == source) {
            if status == Status::Failed || status == Status::NotFound || status == Status::ReadFailed {
                errored.store(true, Ordering::SeqCst);
                return;
            }
            if let Some(rx) = core.take_response_content(request_id, &source, 0) {
                break rx;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            errored.store(true, Ordering::SeqCst);
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let mut view = StripedFile::new(file, block_size, stripe_count, index);
    view.seek_write(start.0, start.1);

    while let Some(chunk) = rx.recv().await {
        if view.write(chunk).await.is_err() {
            errored.store(true, Ordering::SeqCst);
            return;
        }
        *cursor.lock().unwrap() = view.write_cursor();
    }
    finished.store(true, Ordering::SeqCst);
}

fn stripe_parameters(block_size: usize, stripe_count: usize, index: usize, cursor: Cursor) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("block-size".to_string(), block_size.to_string());
    params.insert("stripes-count".to_string(), stripe_count.to_string());
    params.insert("stripe".to_string(), index.to_string());
    params.insert("block".to_string(), cursor.0.to_string());
    params.insert("offset".to_string(), cursor.1.to_string());
    params
}

/// A running striped download of `target` across `stripe_count` sources,
/// one open data request per stripe, written concurrently into disjoint
/// regions of the same file (spec §3 "Splicer" invariant).
pub struct Splicer {
    core: Arc<Core>,
    file: Arc<File>,
    target: Identifier,
    block_size: usize,
    stripe_count: usize,
    response_timeout: Duration,
    stripes: StdMutex<Vec<Stripe>>,
}

impl Splicer {
    /// Discovers sources for `target`, opens one stripe per source starting
    /// at `first_block`, and returns the running splicer (spec §4.10 steps
    /// 1-2). Fails with [`SessionError::UnknownPeering`] if discovery finds
    /// no sources at all.
    pub async fn open(
        core: Arc<Core>,
        file: Arc<File>,
        target: Identifier,
        block_size: usize,
        first_block: u64,
        discover_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let sources = Self::discover(&core, &target, discover_timeout, &[]).await;
        if sources.is_empty() {
            return Err(SessionError::UnknownPeering);
        }
        let stripe_count = sources.len();

        let mut stripes = Vec::with_capacity(stripe_count);
        for (index, source) in sources.into_iter().enumerate() {
            stripes.push(Self::spawn_stripe(
                &core,
                &file,
                &target,
                block_size,
                stripe_count,
                index,
                source,
                (first_block, 0),
                discover_timeout,
            ));
        }

        Ok(Arc::new(Self {
            core,
            file,
            target,
            block_size,
            stripe_count,
            response_timeout: discover_timeout,
            stripes: StdMutex::new(stripes),
        }))
    }

    /// Issues a discovery request for `target` and returns the unique
    /// responding peerings, excluding any in `exclude` (spec §4.10 step 1,
    /// and step 3's "re-issue discovery" fallback).
    async fn discover(core: &Arc<Core>, target: &Identifier, timeout: Duration, exclude: &[Identifier]) -> Vec<Identifier> {
        let id = core.add_request(target.to_text(), false, Identifier::NULL, HashMap::new());
        core.wait_request(id, timeout).await;
        let responses = core.request_responses(id);
        core.cancel_request(id);

        let mut sources = Vec::new();
        for (peering, status, _) in responses {
            if status == Status::Failed || status == Status::NotFound {
                continue;
            }
            if exclude.contains(&peering) || sources.contains(&peering) {
                continue;
            }
            sources.push(peering);
        }
        sources
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_stripe(
        core: &Arc<Core>,
        file: &Arc<File>,
        target: &Identifier,
        block_size: usize,
        stripe_count: usize,
        index: usize,
        source: Identifier,
        start: Cursor,
        response_timeout: Duration,
    ) -> Stripe {
        let params = stripe_parameters(block_size, stripe_count, index, start);
        let request_id = core.add_request(target.to_text(), true, source.clone(), params);

        let cursor = Arc::new(StdMutex::new(start));
        let errored = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(run_stripe_writer(
            Arc::clone(core),
            Arc::clone(file),
            block_size,
            stripe_count,
            index,
            request_id,
            source.clone(),
            start,
            Arc::clone(&cursor),
            Arc::clone(&errored),
            Arc::clone(&finished),
            response_timeout,
        ));

        Stripe {
            source,
            request_id,
            cursor,
            writer: Some(writer),
            errored,
            finished,
        }
    }

    /// True once every stripe has a non-error response and its content pipe
    /// has closed (spec §4.10 step 4).
    pub fn is_finished(&self) -> bool {
        let stripes = self.stripes.lock().unwrap();
        !stripes.is_empty() && stripes.iter().all(|s| s.finished.load(Ordering::SeqCst) && !s.errored.load(Ordering::SeqCst))
    }

    /// The minimum write-cursor block across all stripes: a monotone floor
    /// on how much of the file is fully in place (spec §4.10 step 5).
    pub fn finished_blocks(&self) -> u64 {
        self.stripes.lock().unwrap().iter().map(|s| s.cursor.lock().unwrap().0).min().unwrap_or(0)
    }

    /// Runs one maintenance pass: reroutes any stripe whose source errored,
    /// then applies fast preemption (spec §4.10 step 3).
    pub async fn tick(self: &Arc<Self>) {
        let snapshot: Vec<(usize, Cursor, bool, bool, Identifier)> = {
            let stripes = self.stripes.lock().unwrap();
            stripes
                .iter()
                .enumerate()
                .map(|(i, s)| (i, *s.cursor.lock().unwrap(), s.errored.load(Ordering::SeqCst), s.finished.load(Ordering::SeqCst), s.source.clone()))
                .collect()
        };

        for (index, _, errored, finished, _) in &snapshot {
            if *errored && !*finished {
                self.reroute_stripe(*index).await;
            }
        }

        let active: Vec<_> = snapshot.iter().filter(|(_, _, errored, finished, _)| !errored && !finished).collect();
        if let (Some(fastest), Some(slowest)) = (active.iter().max_by_key(|(_, c, ..)| c.0), active.iter().min_by_key(|(_, c, ..)| c.0)) {
            if fastest.4 != slowest.4 && fastest.1 .0 >= 2 * slowest.1 .0 + PREEMPTION_LEAD_BLOCKS {
                self.reassign_stripe_to_source(slowest.0, fastest.4.clone()).await;
            }
        }
    }

    /// Picks a replacement source for a failing stripe: the fastest other
    /// active stripe's source, or (if none exists) a fresh source from a
    /// re-issued discovery (spec §4.10 step 3).
    async fn reroute_stripe(self: &Arc<Self>, index: usize) {
        let failing_source = self.stripes.lock().unwrap()[index].source.clone();

        let candidate = {
            let stripes = self.stripes.lock().unwrap();
            stripes
                .iter()
                .filter(|s| s.source != failing_source && !s.errored.load(Ordering::SeqCst))
                .max_by_key(|s| s.cursor.lock().unwrap().0)
                .map(|s| s.source.clone())
        };

        let new_source = match candidate {
            Some(source) => Some(source),
            None => {
                let known: Vec<Identifier> = self.stripes.lock().unwrap().iter().map(|s| s.source.clone()).collect();
                Self::discover(&self.core, &self.target, self.response_timeout, &known).await.into_iter().next()
            }
        };

        if let Some(new_source) = new_source {
            self.reassign_stripe_to_source(index, new_source).await;
        }
    }

    /// Cancels a stripe's current data request and starts a new one against
    /// `new_source`, resuming from the stripe's last write cursor.
    async fn reassign_stripe_to_source(self: &Arc<Self>, index: usize, new_source: Identifier) {
        let (old_request_id, resume, cursor_handle, old_writer) = {
            let mut stripes = self.stripes.lock().unwrap();
            let stripe = &mut stripes[index];
            (stripe.request_id, *stripe.cursor.lock().unwrap(), Arc::clone(&stripe.cursor), stripe.writer.take())
        };
        self.core.cancel_request(old_request_id);
        if let Some(writer) = old_writer {
            writer.abort();
        }

        let params = stripe_parameters(self.block_size, self.stripe_count, index, resume);
        let request_id = self.core.add_request(self.target.to_text(), true, new_source.clone(), params);

        let errored = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(run_stripe_writer(
            Arc::clone(&self.core),
            Arc::clone(&self.file),
            self.block_size,
            self.stripe_count,
            index,
            request_id,
            new_source.clone(),
            resume,
            Arc::clone(&cursor_handle),
            Arc::clone(&errored),
            Arc::clone(&finished),
            self.response_timeout,
        ));

        let mut stripes = self.stripes.lock().unwrap();
        stripes[index].source = new_source;
        stripes[index].request_id = request_id;
        stripes[index].writer = Some(writer);
        stripes[index].errored = errored;
        stripes[index].finished = finished;
    }

    /// Runs [`Self::tick`] on a fixed cadence until every stripe finishes,
    /// retrying immediately rather than waiting out the full period right
    /// after a reroute (spec §5: "on stripe failure, the next attempt is
    /// scheduled immediately").
    pub async fn run_maintenance_loop(self: Arc<Self>) {
        loop {
            if self.is_finished() {
                return;
            }
            self.tick().await;
            let any_errored = self.stripes.lock().unwrap().iter().any(|s| s.errored.load(Ordering::SeqCst));
            if any_errored {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            tokio::time::sleep(MAINTENANCE_PERIOD).await;
        }
    }
}
