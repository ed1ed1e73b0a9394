//! Event listener
//!
//! Keeps a venue feed connected, decodes its records, refreshes the pool
//! book and hands swap intents to the engine through a bounded,
//! drop-oldest queue. Sessions are reopened after a delay whenever they
//! end; a trailing signature cache suppresses records replayed across
//! reconnects.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backpressure::{BackpressureChannel, SendOutcome};
use super::decoder::{Decoded, PumpDecoder, RawRecord};
use crate::config::{Config, DropPolicy};
use crate::engine::status::{StatusBus, StatusUpdate};
use crate::error::Result;
use crate::strategy::pool_book::PoolBook;
use crate::strategy::types::SwapIntent;

/// Report the drop counter every this many drops
const DROP_REPORT_INTERVAL: u64 = 100;

/// A source of raw venue records
#[async_trait]
pub trait VenueFeed: Send + Sync {
    /// Open one session. The receiver ends when the session does.
    async fn open_session(&self) -> Result<mpsc::Receiver<RawRecord>>;

    fn name(&self) -> &str;
}

/// Bounded FIFO set of recently seen record ids
#[derive(Debug)]
pub struct TrailingIdCache {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl TrailingIdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns true the first time an id is seen within the window
    pub fn insert(&mut self, id: String) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Listener tuning, taken from configuration at spawn time
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub channel_capacity: usize,
    pub drop_policy: DropPolicy,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub dedup_capacity: usize,
    pub venue_fee_bps: u32,
}

impl ListenerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channel_capacity: config.backpressure.channel_capacity,
            drop_policy: config.backpressure.drop_policy,
            reconnect_delay: Duration::from_millis(config.feed.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(config.feed.connect_timeout_ms),
            dedup_capacity: config.feed.dedup_capacity,
            venue_fee_bps: config.venue.venue_fee_bps,
        }
    }
}

/// Lazy stream of observed intents, in feed order within a session.
/// It ends once the listener stops and the queue is drained; it cannot be
/// restarted.
pub struct IntentStream {
    channel: Arc<BackpressureChannel<SwapIntent>>,
}

impl IntentStream {
    pub async fn next(&mut self) -> Option<SwapIntent> {
        self.channel.recv().await
    }

    /// Intents discarded under backpressure so far
    pub fn dropped(&self) -> u64 {
        self.channel.dropped_count()
    }
}

pub struct EventListener {
    feed: Arc<dyn VenueFeed>,
    decoder: PumpDecoder,
    book: Arc<PoolBook>,
    settings: ListenerSettings,
    status: StatusBus,
    channel: Arc<BackpressureChannel<SwapIntent>>,
    dedup: TrailingIdCache,
}

impl EventListener {
    /// Start the listener task; it runs until `cancel` fires
    pub fn spawn(
        feed: Arc<dyn VenueFeed>,
        book: Arc<PoolBook>,
        settings: ListenerSettings,
        status: StatusBus,
        cancel: CancellationToken,
    ) -> (IntentStream, JoinHandle<()>) {
        let channel = Arc::new(BackpressureChannel::new(
            settings.channel_capacity,
            settings.drop_policy,
        ));
        let listener = Self {
            feed,
            decoder: PumpDecoder::new(settings.venue_fee_bps),
            book,
            dedup: TrailingIdCache::new(settings.dedup_capacity),
            settings,
            status,
            channel: channel.clone(),
        };

        let handle = tokio::spawn(listener.run(cancel));
        (IntentStream { channel }, handle)
    }

    async fn run(mut self, cancel: CancellationToken) {
        let feed_name = self.feed.name().to_string();
        info!(feed = %feed_name, "Event listener started");

        'sessions: loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break 'sessions,
                opened = timeout(self.settings.connect_timeout, self.feed.open_session()) => opened,
            };

            let reason = match opened {
                Ok(Ok(mut session)) => {
                    self.status.publish(StatusUpdate::FeedConnected {
                        feed: feed_name.clone(),
                    });
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break 'sessions,
                            record = session.recv() => match record {
                                Some(record) => self.handle_record(record),
                                None => break,
                            },
                        }
                    }
                    "session ended".to_string()
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "session open timed out after {}ms",
                    self.settings.connect_timeout.as_millis()
                ),
            };

            warn!(feed = %feed_name, %reason, "Feed interrupted");
            self.status.publish(StatusUpdate::FeedInterrupted {
                feed: feed_name.clone(),
                reason,
            });

            tokio::select! {
                _ = cancel.cancelled() => break 'sessions,
                _ = sleep(self.settings.reconnect_delay) => {}
            }
        }

        self.channel.close();
        info!(feed = %feed_name, "Event listener stopped");
    }

    fn handle_record(&mut self, record: RawRecord) {
        if let Some(key) = record.dedup_key() {
            if !self.dedup.insert(key) {
                debug!("Duplicate record suppressed");
                return;
            }
        }

        match self.decoder.decode(record, &self.book) {
            Decoded::Intent(intent) => self.emit(intent),
            Decoded::Reserves(state) => self.book.upsert(state),
            Decoded::Trade(intent, state) => {
                self.book.upsert(state);
                self.emit(intent);
            }
            Decoded::Discard => {}
        }
    }

    fn emit(&self, intent: SwapIntent) {
        match self.channel.send(intent) {
            SendOutcome::Queued => {}
            SendOutcome::EvictedOldest | SendOutcome::Rejected => {
                let total = self.channel.dropped_count();
                if total % DROP_REPORT_INTERVAL == 1 {
                    warn!(total, "Intent queue saturated; dropping");
                    self.status.publish(StatusUpdate::IntentsDropped { total });
                }
            }
            SendOutcome::Closed => debug!("Intent queue closed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pump::instruction::BuyInstruction;
    use crate::pump::price::Reserves;
    use crate::stream::decoder::RawInstruction;
    use crate::strategy::pool_book::PoolState;
    use solana_sdk::pubkey::Pubkey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Feed that replays one scripted batch per session
    pub(crate) struct ScriptedFeed {
        sessions: Mutex<VecDeque<Vec<RawRecord>>>,
        pub(crate) opened: AtomicUsize,
    }

    impl ScriptedFeed {
        pub(crate) fn new(sessions: Vec<Vec<RawRecord>>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                opened: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VenueFeed for ScriptedFeed {
        async fn open_session(&self) -> Result<mpsc::Receiver<RawRecord>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let batch = self.sessions.lock().unwrap().pop_front();
            let (tx, rx) = mpsc::channel(64);
            match batch {
                Some(records) => {
                    for record in records {
                        tx.send(record).await.unwrap();
                    }
                    // Dropping tx ends the session
                }
                None => {
                    // Out of script: hold the session open
                    tokio::spawn(async move {
                        tx.closed().await;
                    });
                }
            }
            Ok(rx)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    pub(crate) fn settings() -> ListenerSettings {
        ListenerSettings {
            channel_capacity: 16,
            drop_policy: DropPolicy::DropOldest,
            reconnect_delay: Duration::from_millis(5),
            connect_timeout: Duration::from_millis(200),
            dedup_capacity: 64,
            venue_fee_bps: 0,
        }
    }

    pub(crate) fn seeded_book() -> (Arc<PoolBook>, PoolState) {
        let book = Arc::new(PoolBook::new());
        let state = PoolState {
            pool: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
            creator: None,
            reserves: Reserves {
                sol: 100_000_000_000,
                token: 100_000_000_000,
            },
            real_sol_reserves: 0,
            complete: false,
            slot: 1,
        };
        book.upsert(state.clone());
        (book, state)
    }

    pub(crate) fn pending_buy(signature: &str, state: &PoolState, tokens: u64) -> RawRecord {
        let mut accounts = vec![Pubkey::new_unique(); 12];
        accounts[2] = state.mint;
        accounts[3] = state.pool;
        RawRecord::Instruction(RawInstruction {
            signature: signature.to_string(),
            slot: 10,
            data: BuyInstruction {
                amount: tokens,
                max_sol_cost: u64::MAX / 2,
            }
            .to_bytes(),
            accounts,
            pending: true,
            transaction: None,
        })
    }

    #[test]
    fn test_trailing_cache_evicts_oldest() {
        let mut cache = TrailingIdCache::new(2);
        assert!(cache.insert("a".into()));
        assert!(!cache.insert("a".into()));
        assert!(cache.insert("b".into()));
        assert!(cache.insert("c".into()));
        // "a" fell out of the window
        assert!(cache.insert("a".into()));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_intents_in_order_and_deduped_across_reconnect() {
        let (book, state) = seeded_book();
        let feed = Arc::new(ScriptedFeed::new(vec![
            vec![
                pending_buy("s1", &state, 1_000),
                pending_buy("s2", &state, 2_000),
            ],
            vec![
                pending_buy("s2", &state, 2_000),
                pending_buy("s3", &state, 3_000),
            ],
        ]));
        let status = StatusBus::new();
        let mut updates = status.subscribe();
        let cancel = CancellationToken::new();

        let (mut stream, handle) =
            EventListener::spawn(feed.clone(), book, settings(), status, cancel.clone());

        let ids: Vec<String> = vec![
            stream.next().await.unwrap().id,
            stream.next().await.unwrap().id,
            stream.next().await.unwrap().id,
        ];
        assert_eq!(ids, vec!["s1", "s2", "s3"]);

        let mut interrupted = false;
        while let Ok(update) = updates.try_recv() {
            if matches!(update, StatusUpdate::FeedInterrupted { .. }) {
                interrupted = true;
            }
        }
        assert!(interrupted);
        assert!(feed.opened.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        handle.await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_pending_until_intent() {
        let (book, _) = seeded_book();
        let feed = Arc::new(ScriptedFeed::new(vec![]));
        let cancel = CancellationToken::new();
        let (mut stream, handle) =
            EventListener::spawn(feed, book, settings(), StatusBus::new(), cancel.clone());

        {
            let mut next = tokio_test::task::spawn(stream.next());
            tokio_test::assert_pending!(next.poll());
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_updates_reach_pool_book() {
        let (book, state) = seeded_book();
        let curve = crate::pump::accounts::BondingCurve::new_for_test(
            120_000_000_000,
            90_000_000_000,
            0,
            false,
            Pubkey::new_unique(),
        );
        let feed = Arc::new(ScriptedFeed::new(vec![vec![
            RawRecord::CurveAccount {
                pool: state.pool,
                mint: state.mint,
                data: borsh::to_vec(&curve).unwrap(),
                slot: 50,
            },
            pending_buy("after-update", &state, 1_000),
        ]]));
        let cancel = CancellationToken::new();
        let (mut stream, handle) =
            EventListener::spawn(feed, book.clone(), settings(), StatusBus::new(), cancel.clone());

        stream.next().await.unwrap();
        assert_eq!(book.snapshot(&state.pool).unwrap().reserves.sol, 120_000_000_000);

        cancel.cancel();
        handle.await.unwrap();
    }
}
