//! Relay stream consumer.
//!
//! Owns the websocket subscription and the stream cursor. Every accepted
//! commit advances the in-memory cursor; a background task checkpoints it to
//! the [`CursorStore`] on a fixed interval, and once more on the way out.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use peruse_core::{
    derive_created_at, parse_timestamp, AtUri, Clock, Collection, CommitEvent, DecodedRecord, Did,
    OpAction, PeruseError, RepoPath, StorageError, StreamError, SystemClock,
};
use peruse_storage::CursorStore;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::codec::{Frame, RepoDecoder};
use crate::dispatch::EventDispatcher;

const NO_CURSOR: i64 = -1;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Relay base URL, e.g. `wss://bsky.network`.
    pub relay_host: String,
    pub user_agent: String,
    pub checkpoint_interval: Duration,
    /// How long shutdown waits for in-flight dispatches before the final checkpoint.
    pub drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            relay_host: "wss://bsky.network".to_string(),
            user_agent: concat!("peruse/", env!("CARGO_PKG_VERSION")).to_string(),
            checkpoint_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Why [`ConsumerLoop::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The relay closed the stream.
    Closed,
    /// The shutdown signal fired.
    Shutdown,
}

/// Writes the in-memory cursor to the store when it has moved.
struct Checkpointer {
    store: Arc<dyn CursorStore>,
    cursor: Arc<AtomicI64>,
    last_saved: AtomicI64,
}

impl Checkpointer {
    async fn checkpoint(&self) -> Result<bool, StorageError> {
        let current = self.cursor.load(Ordering::Acquire);
        if current == NO_CURSOR || current == self.last_saved.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.store.save(current).await?;
        self.last_saved.store(current, Ordering::Release);
        Ok(true)
    }

    async fn run(self: Arc<Self>, every: Duration, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.checkpoint().await {
                        error!(error = %e, "Failed to checkpoint cursor");
                    }
                }
                _ = &mut stop => break,
            }
        }
    }
}

/// Resumable consumer of the relay's repository event stream.
pub struct ConsumerLoop {
    config: ConsumerConfig,
    decoder: Arc<dyn RepoDecoder>,
    dispatcher: Arc<EventDispatcher>,
    clock: Arc<dyn Clock>,
    cursor: Arc<AtomicI64>,
    checkpointer: Arc<Checkpointer>,
}

impl ConsumerLoop {
    pub fn new(
        config: ConsumerConfig,
        decoder: Arc<dyn RepoDecoder>,
        cursor_store: Arc<dyn CursorStore>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let cursor = Arc::new(AtomicI64::new(NO_CURSOR));
        let checkpointer = Arc::new(Checkpointer {
            store: cursor_store,
            cursor: Arc::clone(&cursor),
            last_saved: AtomicI64::new(NO_CURSOR),
        });
        Self {
            config,
            decoder,
            dispatcher,
            clock: Arc::new(SystemClock),
            cursor,
            checkpointer,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Highest sequence number accepted so far.
    pub fn cursor(&self) -> Option<i64> {
        Some(self.cursor.load(Ordering::Acquire)).filter(|c| *c != NO_CURSOR)
    }

    /// Load the persisted cursor into memory.
    pub async fn restore_cursor(&self) -> Result<Option<i64>, PeruseError> {
        let stored = self.checkpointer.store.load().await?;
        if let Some(seq) = stored {
            self.cursor.fetch_max(seq, Ordering::AcqRel);
            self.checkpointer.last_saved.store(seq, Ordering::Release);
        }
        Ok(stored)
    }

    /// Persist the in-memory cursor if it moved. Returns whether anything was written.
    pub async fn checkpoint(&self) -> Result<bool, StorageError> {
        self.checkpointer.checkpoint().await
    }

    /// Subscription URL, resuming after `cursor` when there is one.
    pub fn subscribe_url(&self, cursor: Option<i64>) -> String {
        let base = format!(
            "{}/xrpc/com.atproto.sync.subscribeRepos",
            self.config.relay_host.trim_end_matches('/')
        );
        match cursor {
            Some(seq) => format!("{base}?cursor={seq}"),
            None => base,
        }
    }

    /// Consume the stream until it ends, fails, or `shutdown` resolves.
    ///
    /// There is no reconnect here; the caller decides what to do next.
    pub async fn run<S>(&self, shutdown: S) -> Result<StreamEnd, PeruseError>
    where
        S: Future<Output = ()>,
    {
        let start = self.restore_cursor().await?;
        let url = self.subscribe_url(start);
        info!(url = %url, "Connecting to relay");

        let connect_err = |reason: String| StreamError::Connect {
            url: url.clone(),
            reason,
        };
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        let agent = HeaderValue::from_str(&self.config.user_agent)
            .map_err(|e| connect_err(e.to_string()))?;
        request.headers_mut().insert(USER_AGENT, agent);

        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        info!(cursor = ?start, "Relay stream connected");

        let (stop_tx, stop_rx) = oneshot::channel();
        let ticker = tokio::spawn(
            Arc::clone(&self.checkpointer).run(self.config.checkpoint_interval, stop_rx),
        );

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(StreamEnd::Shutdown),
                message = stream.next() => {
                    let frame: Vec<u8> = match message {
                        Some(Ok(Message::Binary(bytes))) => bytes.into(),
                        Some(Ok(Message::Text(text))) => text.into(),
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "Relay closed the stream");
                            break Ok(StreamEnd::Closed);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            break Err(StreamError::Transport { reason: e.to_string() }.into());
                        }
                        None => break Ok(StreamEnd::Closed),
                    };
                    // Handing records to a saturated dispatcher can block; shutdown
                    // still wins. The cursor only moves once a whole commit is handed off.
                    tokio::select! {
                        _ = self.handle_frame(&frame) => {}
                        _ = &mut shutdown => {
                            warn!("Shutdown while waiting on the dispatcher, dropping current frame");
                            break Ok(StreamEnd::Shutdown);
                        }
                    }
                }
            }
        };

        let _ = stop_tx.send(());
        let _ = ticker.await;
        if tokio::time::timeout(self.config.drain_timeout, self.dispatcher.drain())
            .await
            .is_err()
        {
            warn!("Timed out waiting for in-flight dispatches");
        }
        match self.checkpoint().await {
            Ok(_) => info!(cursor = ?self.cursor(), "Final cursor checkpoint written"),
            Err(e) => error!(error = %e, "Failed to write final cursor checkpoint"),
        }
        outcome
    }

    /// Decode one frame and process it if it is a commit.
    pub async fn handle_frame(&self, bytes: &[u8]) {
        match self.decoder.decode_frame(bytes) {
            Ok(Frame::Commit(event)) => {
                self.process_commit(event).await;
            }
            Ok(Frame::Other { kind }) => debug!(kind = %kind, "Ignoring frame"),
            Err(e) => warn!(error = %e, "Failed to decode relay frame"),
        }
    }

    /// Submit a commit's records for dispatch and advance the cursor.
    ///
    /// Oversized commits are skipped without touching the cursor. Returns the
    /// number of records submitted.
    pub async fn process_commit(&self, event: CommitEvent) -> usize {
        if event.too_big {
            warn!(seq = event.seq, repo = %event.repo, "Skipping oversized commit");
            return 0;
        }

        let records = self.decode_commit(&event);
        let submitted = records.len();
        for record in records {
            self.dispatcher.submit(record).await;
        }
        self.cursor.fetch_max(event.seq, Ordering::AcqRel);
        submitted
    }

    /// Verify and decode the created records of a commit.
    pub fn decode_commit(&self, event: &CommitEvent) -> Vec<DecodedRecord> {
        if !event.ops.iter().any(|op| op.action == OpAction::Create) {
            return Vec::new();
        }

        let author = match Did::parse(&event.repo) {
            Ok(did) => did,
            Err(e) => {
                warn!(seq = event.seq, error = %e, "Commit from malformed repo DID");
                return Vec::new();
            }
        };
        let blocks = match self.decoder.decode_blocks(event) {
            Ok(blocks) => blocks,
            Err(e) => {
                error!(seq = event.seq, repo = %event.repo, error = %e, "Failed to decode commit blocks");
                return Vec::new();
            }
        };
        let now = self.clock.now();
        let indexed_at = parse_timestamp(&event.time).unwrap_or(now);

        let mut records = Vec::new();
        for op in event.ops.iter().filter(|op| op.action == OpAction::Create) {
            let path = match RepoPath::parse(&op.path) {
                Ok(path) => path,
                Err(e) => {
                    warn!(repo = %event.repo, error = %e, "Skipping op with malformed path");
                    continue;
                }
            };
            let collection = Collection::from_nsid(path.collection());
            if !collection.is_dispatched() {
                continue;
            }

            let Some(declared) = &op.cid else {
                warn!(repo = %event.repo, path = %op.path, "Create op without cid");
                continue;
            };
            let Some(block) = blocks.get(&op.path) else {
                warn!(repo = %event.repo, path = %op.path, "Record missing from commit blocks");
                continue;
            };
            if &block.cid != declared {
                warn!(
                    repo = %event.repo,
                    path = %op.path,
                    expected = %declared,
                    actual = %block.cid,
                    "Record hash mismatch, dropping"
                );
                continue;
            }

            let payload = match self.decoder.decode_record(&op.path, block) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(repo = %event.repo, error = %e, "Failed to decode record");
                    continue;
                }
            };
            let uri = AtUri::for_record(&author, path.collection(), path.rkey());
            let created_at =
                match derive_created_at(&collection, &payload, &uri, path.rkey(), now) {
                    Ok(ts) => ts,
                    Err(e) => {
                        warn!(uri = %uri, error = %e, "Record has no usable timestamp");
                        continue;
                    }
                };

            records.push(DecodedRecord {
                collection,
                uri,
                author: author.clone(),
                rkey: path.rkey().to_string(),
                cid: block.cid.clone(),
                indexed_at,
                created_at,
                payload,
                entities: Vec::new(),
            });
        }
        records
    }
}
