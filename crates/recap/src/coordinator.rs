//! The context cache: public entry point composing policy, merge, store and
//! collaborators.
//!
//! Each [`get_context`](ContextCache::get_context) call runs
//! read → decide → fetch → (merge → summarize) → write as one critical section
//! per conversation id. Calls on the same id queue behind each other, so two
//! callers that both arrive while a refresh is due produce exactly one
//! summarizer call: the second sees the freshly reset counter and reuses the
//! new summary. Calls on different ids never share a lock.
//!
//! Both external calls are bounded by the configured timeouts. Any failure
//! returns before the store is written, so the entry is exactly as it was and
//! a retry re-evaluates the same transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::completion::Summarizer;
use crate::config::{RecapConfig, RefreshConfig};
use crate::error::{ConfigError, ContextError, FetchError, SummarizationError};
use crate::history::MessageFetcher;
use crate::policy::{self, Decision, RefreshState};
use crate::store::{CacheEntry, CacheStore, InMemoryStore};
use crate::{CompletionOptions, ContextRequest, ContextResponse, HistoryMessage, Turn, merge};

// ── Per-id locks ───────────────────────────────────────────────────

/// Table of per-conversation async mutexes.
///
/// A lock is created on first use and removed once no task holds or waits
/// on it. Each slot counts its users (holder plus waiters); the count is
/// taken before awaiting the lock, so a waiter cancelled mid-queue still
/// gives its share back.
#[derive(Default)]
struct KeyedLocks {
    table: Mutex<HashMap<i64, LockSlot>>,
}

struct LockSlot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

impl KeyedLocks {
    async fn acquire(&self, key: i64) -> KeyGuard<'_> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let slot = table.entry(key).or_insert_with(|| LockSlot {
                lock: Arc::default(),
                users: 0,
            });
            slot.users += 1;
            slot.lock.clone()
        };
        let mut guard = KeyGuard {
            locks: self,
            key,
            guard: None,
        };
        guard.guard = Some(lock.lock_owned().await);
        guard
    }

    fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Holds (or waits for) one key. Dropping it, acquired or not, releases the
/// user count and removes the slot when it was the last one.
struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locks.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = table.get_mut(&self.key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                table.remove(&self.key);
            }
        }
    }
}

// ── Stats ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    reuses: AtomicU64,
    refreshes: AtomicU64,
    fetch_failures: AtomicU64,
    summarization_failures: AtomicU64,
}

/// Snapshot of cache activity since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub reuses: u64,
    pub refreshes: u64,
    pub fetch_failures: u64,
    pub summarization_failures: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// ── Cache ──────────────────────────────────────────────────────────

/// Refresh-ahead rolling summary cache.
///
/// Owns the [`CacheStore`]; every mutation of cached state goes through
/// this type.
pub struct ContextCache {
    config: RecapConfig,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn MessageFetcher>,
    summarizer: Arc<dyn Summarizer>,
    locks: KeyedLocks,
    counters: Counters,
}

impl ContextCache {
    /// Build a cache backed by an [`InMemoryStore`] sized from `config`.
    ///
    /// Fails if `config` does not validate; an invalid configuration never
    /// serves a request.
    pub fn new(
        config: RecapConfig,
        fetcher: Arc<dyn MessageFetcher>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(InMemoryStore::new(config.store));
        Self::with_store(config, store, fetcher, summarizer)
    }

    /// Build a cache over a caller-supplied store.
    pub fn with_store(
        config: RecapConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn MessageFetcher>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            threshold = config.refresh.threshold,
            step = config.refresh.step,
            max_entries = config.store.max_entries,
            "context cache ready"
        );
        Ok(Self {
            config,
            store,
            fetcher,
            summarizer,
            locks: KeyedLocks::default(),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &RecapConfig {
        &self.config
    }

    /// Return the current context for `conversation_id`, refreshing it first
    /// when the policy says so.
    pub async fn get_context(
        &self,
        conversation_id: i64,
        request: &ContextRequest,
    ) -> Result<ContextResponse, ContextError> {
        let refresh = self.refresh_for(request.window_count)?;
        let _guard = self.locks.acquire(conversation_id).await;

        let entry = self.store.get(conversation_id);
        let state = RefreshState::classify(entry.as_ref(), refresh.threshold);
        let decision = policy::decide(entry.as_ref(), refresh);
        let next_counter = decision.next_counter();
        debug!(
            conversation_id,
            %state,
            window = decision.window(),
            counter = entry.as_ref().map(|e| e.refresh_counter),
            next_counter,
            "refresh decision"
        );

        let window = self
            .fetch(conversation_id, decision.window())
            .await
            .inspect_err(|e| {
                self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(conversation_id, %state, "history fetch failed: {e}");
            })?;

        let summary = match decision {
            Decision::Refresh { prior, .. } => {
                let turns = merge::build_turns(prior.as_deref(), &window);
                let summary = self
                    .summarize(&turns, &request.model, request.options.as_ref())
                    .await
                    .inspect_err(|e| {
                        self.counters
                            .summarization_failures
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(conversation_id, %state, "summarization failed: {e}");
                    })?;
                self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
                info!(
                    conversation_id,
                    %state,
                    messages = window.len(),
                    chars = summary.len(),
                    "context refreshed"
                );
                summary
            }
            Decision::Reuse { summary, .. } => {
                self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                debug!(conversation_id, "context reused");
                summary
            }
        };

        self.store.put(CacheEntry {
            conversation_id,
            refresh_counter: next_counter,
            summary_text: summary.clone(),
        });

        let mut messages = merge::render_window(&window);
        messages.push(summary.clone());
        Ok(ContextResponse {
            messages,
            context: summary,
        })
    }

    /// Read the stored entry without running the policy. Does not count as
    /// an access for eviction or expiry.
    pub fn peek(&self, conversation_id: i64) -> Option<CacheEntry> {
        self.store.peek(conversation_id)
    }

    /// Drop the entry for `conversation_id`, waiting for any in-flight call
    /// on it to finish first. The next call bootstraps from scratch.
    pub async fn invalidate(&self, conversation_id: i64) -> bool {
        let _guard = self.locks.acquire(conversation_id).await;
        let removed = self.store.remove(conversation_id).is_some();
        if removed {
            info!(conversation_id, "context invalidated");
        }
        removed
    }

    /// Drop expired entries from the store.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.store.stats();
        CacheStats {
            entries: store.entries,
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            fetch_failures: self.counters.fetch_failures.load(Ordering::Relaxed),
            summarization_failures: self.counters.summarization_failures.load(Ordering::Relaxed),
            evictions: store.evictions,
            expirations: store.expirations,
        }
    }

    fn refresh_for(&self, window_count: Option<usize>) -> Result<RefreshConfig, ContextError> {
        let step = self.config.refresh.step;
        match window_count {
            None => Ok(self.config.refresh),
            Some(window) if window == 0 || window < step => {
                Err(ContextError::InvalidWindow { window, step })
            }
            Some(window) => Ok(RefreshConfig::new(window, step)),
        }
    }

    async fn fetch(
        &self,
        conversation_id: i64,
        n: usize,
    ) -> Result<Vec<HistoryMessage>, FetchError> {
        let timeout = self.config.timeouts.fetch;
        match tokio::time::timeout(timeout, self.fetcher.fetch_last_n(conversation_id, n)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(timeout)),
        }
    }

    async fn summarize(
        &self,
        turns: &[Turn],
        model: &str,
        options: Option<&CompletionOptions>,
    ) -> Result<String, SummarizationError> {
        let timeout = self.config.timeouts.completion;
        let text =
            match tokio::time::timeout(timeout, self.summarizer.complete(turns, model, options))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(SummarizationError::Timeout(timeout)),
            };
        if text.trim().is_empty() {
            return Err(SummarizationError::EmptyResult);
        }
        Ok(text)
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionFuture;
    use crate::history::FetchFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    // ── Fakes ──────────────────────────────────────────────────────

    /// Returns `n` numbered messages and records every request.
    #[derive(Default)]
    struct RecordingFetcher {
        calls: Mutex<Vec<(i64, usize)>>,
        fail: AtomicBool,
    }

    impl RecordingFetcher {
        fn calls(&self) -> Vec<(i64, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MessageFetcher for RecordingFetcher {
        fn fetch_last_n(&self, conversation_id: i64, n: usize) -> FetchFuture<'_> {
            Box::pin(async move {
                self.calls.lock().unwrap().push((conversation_id, n));
                if self.fail.load(Ordering::SeqCst) {
                    return Err(FetchError::Status {
                        status: 503,
                        body: "down".into(),
                    });
                }
                let call = self.calls.lock().unwrap().len();
                Ok((0..n)
                    .map(|i| {
                        let role = if i % 2 == 0 { "user" } else { "assistant" };
                        HistoryMessage::new(role, format!("c{conversation_id}-call{call}-m{i}"))
                    })
                    .collect())
            })
        }
    }

    /// Pops scripted results in order; records the turns it was given.
    #[derive(Default)]
    struct ScriptedSummarizer {
        script: Mutex<VecDeque<Result<String, SummarizationError>>>,
        calls: Mutex<Vec<Vec<Turn>>>,
        delay: Option<Duration>,
    }

    impl ScriptedSummarizer {
        fn new(script: Vec<Result<String, SummarizationError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> Vec<Vec<Turn>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Summarizer for ScriptedSummarizer {
        fn complete<'a>(
            &'a self,
            turns: &'a [Turn],
            _model: &'a str,
            _options: Option<&'a CompletionOptions>,
        ) -> CompletionFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(turns.to_vec());
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok("default summary".into()))
            })
        }
    }

    /// Never answers.
    struct StallingFetcher;

    impl MessageFetcher for StallingFetcher {
        fn fetch_last_n(&self, _conversation_id: i64, _n: usize) -> FetchFuture<'_> {
            Box::pin(std::future::pending())
        }
    }

    /// Never completes for conversation 1; answers immediately otherwise.
    struct StallingSummarizer;

    impl Summarizer for StallingSummarizer {
        fn complete<'a>(
            &'a self,
            turns: &'a [Turn],
            _model: &'a str,
            _options: Option<&'a CompletionOptions>,
        ) -> CompletionFuture<'a> {
            Box::pin(async move {
                let stall = turns.iter().any(|t| t.content.contains("c1-"));
                if stall {
                    std::future::pending::<()>().await;
                }
                Ok("quick".into())
            })
        }
    }

    fn build(
        fetcher: Arc<RecordingFetcher>,
        summarizer: Arc<dyn Summarizer>,
    ) -> (ContextCache, Arc<InMemoryStore>) {
        let config = RecapConfig::default();
        let store = Arc::new(InMemoryStore::new(config.store));
        let cache = ContextCache::with_store(config, store.clone(), fetcher, summarizer).unwrap();
        (cache, store)
    }

    fn entry(id: i64, counter: usize, text: &str) -> CacheEntry {
        CacheEntry {
            conversation_id: id,
            refresh_counter: counter,
            summary_text: text.into(),
        }
    }

    fn request() -> ContextRequest {
        ContextRequest::new("test-model")
    }

    // ── Policy through the coordinator ─────────────────────────────

    #[tokio::test]
    async fn end_to_end_refresh_cycle() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::new(vec![
            Ok("S1".into()),
            Ok("S2".into()),
        ]));
        let (cache, store) = build(fetcher.clone(), summarizer.clone());

        // Call 1: bootstrap.
        let first = cache.get_context(42, &request()).await.unwrap();
        assert_eq!(first.context, "S1");
        assert_eq!(store.get(42), Some(entry(42, 2, "S1")));
        assert_eq!(summarizer.calls()[0].len(), 2, "no prior context turn");

        // Call 2: reuse, display window STEP + counter.
        let second = cache.get_context(42, &request()).await.unwrap();
        assert_eq!(second.context, "S1");
        assert_eq!(store.get(42), Some(entry(42, 4, "S1")));
        assert_eq!(summarizer.calls().len(), 1);

        // Call 3: due, merges with S1.
        let third = cache.get_context(42, &request()).await.unwrap();
        assert_eq!(third.context, "S2");
        assert_eq!(store.get(42), Some(entry(42, 2, "S2")));

        assert_eq!(fetcher.calls(), vec![(42, 4), (42, 4), (42, 4)]);
        let calls = summarizer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1][1].content, "CONTEXT: S1");
    }

    #[tokio::test]
    async fn response_appends_context_to_window() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::new(vec![Ok("S1".into())]));
        let (cache, _) = build(fetcher, summarizer);

        let reply = cache.get_context(5, &request()).await.unwrap();
        assert_eq!(reply.messages.len(), 5);
        assert_eq!(reply.messages[0], "user: c5-call1-m0");
        assert_eq!(reply.messages[1], "assistant: c5-call1-m1");
        assert_eq!(reply.messages.last().map(String::as_str), Some("S1"));
    }

    #[tokio::test]
    async fn merge_turns_carry_prior_summary_and_window() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::new(vec![Ok("S2".into())]));
        let (cache, store) = build(fetcher, summarizer.clone());
        store.put(entry(3, 4, "prior facts"));

        cache.get_context(3, &request()).await.unwrap();

        let turns = &summarizer.calls()[0];
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0], Turn::system(merge::SUMMARY_SYSTEM_PROMPT));
        assert_eq!(turns[1], Turn::user("CONTEXT: prior facts"));
        assert_eq!(
            turns[2].content,
            "CHAT:\nuser: c3-call1-m0\nassistant: c3-call1-m1\nuser: c3-call1-m2\nassistant: c3-call1-m3"
        );
    }

    #[tokio::test]
    async fn counter_never_exceeds_threshold() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::default());
        let (cache, store) = build(fetcher, summarizer);

        for _ in 0..20 {
            cache.get_context(9, &request()).await.unwrap();
            let counter = store.get(9).unwrap().refresh_counter;
            assert!((2..=4).contains(&counter), "counter={counter}");
        }
    }

    #[tokio::test]
    async fn window_count_overrides_threshold() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::default());
        let (cache, store) = build(fetcher.clone(), summarizer.clone());
        let req = request().with_window_count(6);

        cache.get_context(1, &req).await.unwrap(); // bootstrap, counter 2
        cache.get_context(1, &req).await.unwrap(); // reuse, counter 4
        cache.get_context(1, &req).await.unwrap(); // reuse, counter 6
        assert_eq!(store.get(1).unwrap().refresh_counter, 6);
        cache.get_context(1, &req).await.unwrap(); // due

        assert_eq!(fetcher.calls(), vec![(1, 6), (1, 4), (1, 6), (1, 6)]);
        assert_eq!(summarizer.calls().len(), 2);
    }

    #[tokio::test]
    async fn invalid_window_count_is_rejected_before_fetch() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let (cache, _) = build(fetcher.clone(), Arc::new(ScriptedSummarizer::default()));

        let err = cache
            .get_context(1, &request().with_window_count(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidWindow { window: 1, step: 2 }));
        assert!(fetcher.calls().is_empty());
    }

    // ── Failure isolation ──────────────────────────────────────────

    #[tokio::test]
    async fn summarizer_failure_leaves_entry_untouched() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::new(vec![
            Err(SummarizationError::Status {
                status: 500,
                body: "boom".into(),
            }),
            Ok("S2".into()),
        ]));
        let (cache, store) = build(fetcher, summarizer.clone());
        store.put(entry(7, 4, "S1"));

        let err = cache.get_context(7, &request()).await.unwrap_err();
        assert!(matches!(err, ContextError::Summarization(_)));
        assert_eq!(store.get(7), Some(entry(7, 4, "S1")));

        // Still due: the retry refreshes.
        let reply = cache.get_context(7, &request()).await.unwrap();
        assert_eq!(reply.context, "S2");
        assert_eq!(summarizer.calls().len(), 2);
        assert_eq!(cache.stats().summarization_failures, 1);
    }

    #[tokio::test]
    async fn empty_summary_is_a_failure() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::new(vec![Ok("   \n".into())]));
        let (cache, store) = build(fetcher, summarizer);

        let err = cache.get_context(1, &request()).await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::Summarization(SummarizationError::EmptyResult)
        ));
        assert!(store.get(1).is_none());
    }

    #[tokio::test]
    async fn fetch_failure_leaves_entry_untouched() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::default());
        let (cache, store) = build(fetcher.clone(), summarizer.clone());
        store.put(entry(2, 2, "S1"));
        fetcher.fail.store(true, Ordering::SeqCst);

        let err = cache.get_context(2, &request()).await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert_eq!(store.get(2), Some(entry(2, 2, "S1")));
        assert!(summarizer.calls().is_empty());
        assert_eq!(cache.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn summarizer_timeout_leaves_entry_untouched() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer: Arc<dyn Summarizer> = Arc::new(
            ScriptedSummarizer::new(vec![Ok("late".into())]).with_delay(Duration::from_millis(500)),
        );
        let config = RecapConfig::default().with_completion_timeout(Duration::from_millis(20));
        let store = Arc::new(InMemoryStore::new(config.store));
        let cache = ContextCache::with_store(config, store.clone(), fetcher, summarizer).unwrap();
        store.put(entry(4, 4, "S1"));

        let err = cache.get_context(4, &request()).await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::Summarization(SummarizationError::Timeout(_))
        ));
        assert_eq!(store.get(4), Some(entry(4, 4, "S1")));
    }

    #[tokio::test]
    async fn fetch_timeout_leaves_entry_untouched() {
        let summarizer = Arc::new(ScriptedSummarizer::default());
        let config = RecapConfig::default().with_fetch_timeout(Duration::from_millis(20));
        let store = Arc::new(InMemoryStore::new(config.store));
        let cache = ContextCache::with_store(
            config,
            store.clone(),
            Arc::new(StallingFetcher),
            summarizer.clone(),
        )
        .unwrap();
        store.put(entry(4, 4, "S1"));

        let err = cache.get_context(4, &request()).await.unwrap_err();
        assert!(matches!(err, ContextError::Fetch(FetchError::Timeout(_))));
        assert_eq!(store.get(4), Some(entry(4, 4, "S1")));
        assert!(summarizer.calls().is_empty());
        assert_eq!(cache.stats().fetch_failures, 1);
        assert_eq!(cache.lock_count(), 0);
    }

    #[tokio::test]
    async fn fetch_timeout_on_bootstrap_stores_nothing() {
        let config = RecapConfig::default().with_fetch_timeout(Duration::from_millis(20));
        let cache = ContextCache::new(
            config,
            Arc::new(StallingFetcher),
            Arc::new(ScriptedSummarizer::default()),
        )
        .unwrap();

        let err = cache.get_context(9, &request()).await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(cache.peek(9).is_none());
    }

    // ── Concurrency ────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrent_due_calls_refresh_once() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(
            ScriptedSummarizer::new(vec![Ok("S2".into()), Ok("unexpected".into())])
                .with_delay(Duration::from_millis(50)),
        );
        let (cache, store) = build(fetcher, summarizer.clone());
        store.put(entry(42, 4, "S1"));
        let req = request();

        let (a, b) = tokio::join!(cache.get_context(42, &req), cache.get_context(42, &req));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(summarizer.calls().len(), 1);
        assert_eq!(a.context, "S2");
        assert_eq!(b.context, "S2");
        assert_eq!(cache.stats().refreshes, 1);
        assert_eq!(cache.stats().reuses, 1);
    }

    #[tokio::test]
    async fn many_concurrent_bootstraps_refresh_once() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer =
            Arc::new(ScriptedSummarizer::default().with_delay(Duration::from_millis(10)));
        let (cache, _) = build(fetcher, summarizer.clone());
        let req = request();

        let replies =
            futures::future::join_all((0..8).map(|_| cache.get_context(11, &req))).await;

        assert!(replies.iter().all(|r| r.is_ok()));
        // Calls serialize: bootstrap, then reuse and refresh alternate.
        let refreshes = cache.stats().refreshes;
        let reuses = cache.stats().reuses;
        assert_eq!(refreshes + reuses, 8);
        assert_eq!(summarizer.calls().len() as u64, refreshes);
        assert_eq!(refreshes, 4);
    }

    #[tokio::test]
    async fn different_conversations_do_not_block_each_other() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let (cache, _) = build(fetcher, Arc::new(StallingSummarizer));
        let cache = Arc::new(cache);

        let stalled = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_context(1, &request()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = tokio::time::timeout(Duration::from_secs(2), cache.get_context(2, &request()))
            .await
            .expect("conversation 2 must not wait on conversation 1");
        assert_eq!(other.unwrap().context, "quick");

        stalled.abort();
    }

    #[tokio::test]
    async fn cancelled_refresh_writes_nothing() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let (cache, store) = build(fetcher, Arc::new(StallingSummarizer));
        store.put(entry(1, 4, "S1"));

        let result =
            tokio::time::timeout(Duration::from_millis(30), cache.get_context(1, &request())).await;
        assert!(result.is_err());
        assert_eq!(store.get(1), Some(entry(1, 4, "S1")));
        assert_eq!(cache.lock_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_lock_entry() {
        let locks = KeyedLocks::default();
        let holder = locks.acquire(1).await;
        let mut waiter = Box::pin(locks.acquire(1));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(holder);
        drop(waiter);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn waiter_cancelled_before_holder_releases() {
        let locks = KeyedLocks::default();
        let holder = locks.acquire(7).await;
        let mut waiter = Box::pin(locks.acquire(7));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(waiter);
        assert_eq!(locks.len(), 1, "holder still owns the slot");
        drop(holder);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn queued_request_cancelled_leaves_no_lock() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let (cache, store) = build(fetcher, Arc::new(StallingSummarizer));
        store.put(entry(1, 4, "S1"));
        let req = request();

        let mut holder = Box::pin(cache.get_context(1, &req));
        assert!(futures::poll!(holder.as_mut()).is_pending());
        let mut queued = Box::pin(cache.get_context(1, &req));
        assert!(futures::poll!(queued.as_mut()).is_pending());

        drop(holder);
        drop(queued);
        assert_eq!(cache.lock_count(), 0);
        assert_eq!(store.get(1), Some(entry(1, 4, "S1")));
    }

    #[tokio::test]
    async fn idle_locks_are_released() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let (cache, _) = build(fetcher, Arc::new(ScriptedSummarizer::default()));

        for id in 0..10 {
            cache.get_context(id, &request()).await.unwrap();
        }
        assert_eq!(cache.lock_count(), 0);
    }

    // ── Introspection ──────────────────────────────────────────────

    #[tokio::test]
    async fn invalidate_forces_bootstrap() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let summarizer = Arc::new(ScriptedSummarizer::new(vec![
            Ok("S1".into()),
            Ok("fresh".into()),
        ]));
        let (cache, _) = build(fetcher, summarizer.clone());

        cache.get_context(8, &request()).await.unwrap();
        assert!(cache.invalidate(8).await);
        assert!(cache.peek(8).is_none());
        assert!(!cache.invalidate(8).await);

        let reply = cache.get_context(8, &request()).await.unwrap();
        assert_eq!(reply.context, "fresh");
        assert_eq!(summarizer.calls()[1].len(), 2, "no prior context after invalidate");
    }

    #[tokio::test]
    async fn peek_does_not_advance_counter() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let (cache, _) = build(fetcher.clone(), Arc::new(ScriptedSummarizer::default()));

        cache.get_context(6, &request()).await.unwrap();
        assert_eq!(cache.peek(6).unwrap().refresh_counter, 2);
        assert_eq!(cache.peek(6).unwrap().refresh_counter, 2);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn peek_does_not_extend_ttl() {
        let config = RecapConfig::default().with_ttl(Some(Duration::from_millis(100)));
        let cache = ContextCache::new(
            config,
            Arc::new(RecordingFetcher::default()),
            Arc::new(ScriptedSummarizer::default()),
        )
        .unwrap();
        cache.get_context(3, &request()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.peek(3).is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.peek(3).is_none(), "peek must not refresh the idle clock");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RecapConfig::default().with_refresh(RefreshConfig::new(2, 3));
        let result = ContextCache::new(
            config,
            Arc::new(RecordingFetcher::default()),
            Arc::new(ScriptedSummarizer::default()),
        );
        assert!(matches!(
            result,
            Err(ConfigError::StepExceedsThreshold { .. })
        ));
    }
}
