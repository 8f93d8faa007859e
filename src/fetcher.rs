//! Paced, resumable fetch loop over the friend list.
//!
//! Each friend moves `pending -> in flight -> {ok, not_found, error}`; only
//! terminal states are written to the cache, so a friend interrupted mid-retry
//! is simply pending again on the next run.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::api::{ApiOutcome, MutualsApi};
use crate::cache::{FetchStatus, MutualCache, MutualResult};
use crate::cancel::CancelFlag;
use crate::config::FetchConfig;
use crate::error::{NetworkError, Result};
use crate::session::Session;

/// Longest uninterrupted sleep while waiting out a pacing or backoff delay
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based): doubles from the initial
    /// backoff, capped at the maximum
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_retries: config.max_retries,
        }
    }
}

/// Per-run tally, reported to the caller on completion or cancellation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub total: usize,
    /// Fetched from the network with status ok
    pub fetched: usize,
    /// Reused from an earlier ok result
    pub cached: usize,
    pub not_found: usize,
    /// Gave up after exhausting retries
    pub errors: usize,
    pub network_calls: usize,
}

impl FetchSummary {
    pub fn completed(&self) -> usize {
        self.fetched + self.cached + self.not_found + self.errors
    }

    pub fn succeeded(&self) -> usize {
        self.fetched + self.cached
    }

    pub fn skipped(&self) -> usize {
        self.not_found + self.errors
    }
}

impl fmt::Display for FetchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} friends processed, {} skipped due to errors",
            self.succeeded(),
            self.total,
            self.skipped()
        )?;
        let pending = self.total - self.completed();
        if pending > 0 {
            write!(f, ", {} not yet fetched", pending)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed(FetchSummary),
    Cancelled(FetchSummary),
}

impl FetchOutcome {
    pub fn summary(&self) -> &FetchSummary {
        match self {
            FetchOutcome::Completed(summary) | FetchOutcome::Cancelled(summary) => summary,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchOutcome::Cancelled(_))
    }
}

enum Attempt {
    Done(FetchStatus),
    Cancelled,
}

pub struct MutualFetcher<'a> {
    api: &'a dyn MutualsApi,
    session: &'a dyn Session,
    cache: &'a MutualCache,
    policy: RetryPolicy,
    last_request: Option<Instant>,
}

impl<'a> MutualFetcher<'a> {
    pub fn new(
        api: &'a dyn MutualsApi,
        session: &'a dyn Session,
        cache: &'a MutualCache,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            api,
            session,
            cache,
            policy,
            last_request: None,
        }
    }

    /// Fetch mutuals for `user_ids` in order, one request at a time.
    ///
    /// `on_progress(completed, total)` fires after every friend, whether it was
    /// fetched, served from cache or given up on. Per-friend failures are
    /// recorded and skipped; only a missing or rejected session and storage
    /// failures end the run with an error.
    pub fn run(
        &mut self,
        user_ids: &[String],
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<FetchOutcome> {
        if !self.session.authenticated() {
            return Err(NetworkError::AuthenticationRequired);
        }

        let mut summary = FetchSummary {
            total: user_ids.len(),
            ..FetchSummary::default()
        };
        info!(total = summary.total, "Fetching mutual connections");

        for user_id in user_ids {
            if cancel.is_cancelled() {
                info!(%summary, "Fetch cancelled");
                return Ok(FetchOutcome::Cancelled(summary));
            }

            if self.cache.get_ok(user_id).is_some() {
                debug!(%user_id, "Using cached mutuals");
                summary.cached += 1;
            } else {
                match self.fetch_one(user_id, cancel, &mut summary)? {
                    Attempt::Done(FetchStatus::Ok) => summary.fetched += 1,
                    Attempt::Done(FetchStatus::NotFound) => summary.not_found += 1,
                    Attempt::Done(_) => summary.errors += 1,
                    Attempt::Cancelled => {
                        info!(%summary, "Fetch cancelled during backoff");
                        return Ok(FetchOutcome::Cancelled(summary));
                    }
                }
            }

            on_progress(summary.completed(), summary.total);
        }

        info!(%summary, "Finished fetching mutual connections");
        Ok(FetchOutcome::Completed(summary))
    }

    fn fetch_one(
        &mut self,
        user_id: &str,
        cancel: &CancelFlag,
        summary: &mut FetchSummary,
    ) -> Result<Attempt> {
        let mut not_before = self.next_slot(Duration::ZERO);

        for attempt in 0..=self.policy.max_retries {
            if !wait_until(not_before, cancel) {
                return Ok(Attempt::Cancelled);
            }

            summary.network_calls += 1;
            let outcome = self.api.fetch_mutuals(self.session, user_id);
            // Spacing is measured from when the previous request finished
            self.last_request = Some(Instant::now());

            let failure = match outcome {
                ApiOutcome::Found(mutuals) => {
                    let mut result = MutualResult::ok(user_id, Vec::with_capacity(mutuals.len()));
                    for mutual in mutuals {
                        if let Some(name) = mutual.display_name {
                            result.display_names.insert(mutual.user_id.clone(), name);
                        }
                        result.mutual_ids.push(mutual.user_id);
                    }
                    debug!(%user_id, mutuals = result.mutual_ids.len(), "Fetched mutuals");
                    self.cache.put(result)?;
                    return Ok(Attempt::Done(FetchStatus::Ok));
                }
                ApiOutcome::NotFound => {
                    debug!(%user_id, "User not found");
                    self.cache.put(MutualResult::failed(user_id, FetchStatus::NotFound))?;
                    return Ok(Attempt::Done(FetchStatus::NotFound));
                }
                ApiOutcome::Unauthorized => {
                    warn!(%user_id, "Session rejected by remote service");
                    return Err(NetworkError::AuthenticationRequired);
                }
                ApiOutcome::RateLimited => "rate limited".to_string(),
                ApiOutcome::Transient(reason) => reason,
            };

            if attempt == self.policy.max_retries {
                break;
            }
            let delay = self.policy.backoff(attempt);
            warn!(%user_id, attempt = attempt + 1, reason = %failure, ?delay, "Retrying after backoff");
            not_before = self.next_slot(delay);
        }

        warn!(%user_id, retries = self.policy.max_retries, "Giving up on user");
        self.cache.put(MutualResult::failed(user_id, FetchStatus::Error))?;
        Ok(Attempt::Done(FetchStatus::Error))
    }

    /// Earliest instant the next request may go out, honoring both the
    /// minimum interval and an extra delay measured from the last request
    fn next_slot(&self, delay: Duration) -> Instant {
        match self.last_request {
            Some(last) => last + self.policy.min_interval.max(delay),
            None => Instant::now(),
        }
    }
}

/// Sleep until `deadline` in short slices; false when cancelled first
fn wait_until(deadline: Instant, cancel: &CancelFlag) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(WAIT_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MutualFriend;
    use crate::session::CookieSession;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Replays scripted outcomes per user and records call instants
    #[derive(Default)]
    struct ScriptedApi {
        script: Mutex<HashMap<String, VecDeque<ApiOutcome>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedApi {
        fn respond(self, user_id: &str, outcomes: Vec<ApiOutcome>) -> Self {
            self.script.lock().insert(user_id.to_string(), outcomes.into());
            self
        }

        fn calls_for(&self, user_id: &str) -> Vec<Instant> {
            self.calls
                .lock()
                .iter()
                .filter(|(id, _)| id == user_id)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    impl MutualsApi for ScriptedApi {
        fn fetch_mutuals(&self, _session: &dyn Session, user_id: &str) -> ApiOutcome {
            self.calls.lock().push((user_id.to_string(), Instant::now()));
            self.script
                .lock()
                .get_mut(user_id)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(ApiOutcome::Found(Vec::new()))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            min_interval: Duration::from_millis(1),
            initial_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_millis(60),
            max_retries: 2,
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn cache_in(dir: &tempfile::TempDir) -> MutualCache {
        MutualCache::open(dir.path().join("cache.jsonl"), None).unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            min_interval: Duration::ZERO,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            max_retries: 5,
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(32));
        assert_eq!(policy.backoff(5), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_requires_authenticated_session() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let api = ScriptedApi::default();
        let session = CookieSession::default();

        let mut fetcher = MutualFetcher::new(&api, &session, &cache, policy());
        let err = fetcher
            .run(&ids(&["usr_a"]), &CancelFlag::new(), &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, NetworkError::AuthenticationRequired));
        assert!(api.calls.lock().is_empty());
    }

    #[test]
    fn test_rate_limited_then_ok() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let api = ScriptedApi::default().respond(
            "usr_x",
            vec![
                ApiOutcome::RateLimited,
                ApiOutcome::Found(vec![MutualFriend::named("usr_y", "Why")]),
            ],
        );
        let session = CookieSession::new("cookie");

        let mut fetcher = MutualFetcher::new(&api, &session, &cache, policy());
        let outcome = fetcher
            .run(&ids(&["usr_x"]), &CancelFlag::new(), &mut |_, _| {})
            .unwrap();

        let result = cache.get("usr_x").unwrap();
        assert_eq!(result.status, FetchStatus::Ok);
        assert_eq!(result.mutual_ids, ids(&["usr_y"]));
        assert_eq!(result.display_names.get("usr_y").map(String::as_str), Some("Why"));

        let calls = api.calls_for("usr_x");
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= policy().backoff(0));
        assert_eq!(outcome.summary().network_calls, 2);
        assert_eq!(outcome.summary().fetched, 1);
    }

    #[test]
    fn test_exhausted_retries_degrade_to_error_and_continue() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let api = ScriptedApi::default()
            .respond(
                "usr_a",
                vec![
                    ApiOutcome::Transient("reset".into()),
                    ApiOutcome::RateLimited,
                    ApiOutcome::Transient("reset".into()),
                ],
            )
            .respond("usr_b", vec![ApiOutcome::NotFound]);
        let session = CookieSession::new("cookie");

        let mut progress = Vec::new();
        let mut fetcher = MutualFetcher::new(&api, &session, &cache, policy());
        let outcome = fetcher
            .run(
                &ids(&["usr_a", "usr_b", "usr_c"]),
                &CancelFlag::new(),
                &mut |done, total| progress.push((done, total)),
            )
            .unwrap();

        assert!(!outcome.is_cancelled());
        assert_eq!(api.calls_for("usr_a").len(), 3);
        assert_eq!(cache.get("usr_a").unwrap().status, FetchStatus::Error);
        assert_eq!(cache.get("usr_b").unwrap().status, FetchStatus::NotFound);
        assert_eq!(cache.get("usr_c").unwrap().status, FetchStatus::Ok);
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(
            outcome.summary().to_string(),
            "1/3 friends processed, 2 skipped due to errors"
        );
    }

    #[test]
    fn test_warm_cache_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let api = ScriptedApi::default();
        let session = CookieSession::new("cookie");

        let mut fetcher = MutualFetcher::new(&api, &session, &cache, policy());
        let outcome = fetcher
            .run(&ids(&["usr_a", "usr_a"]), &CancelFlag::new(), &mut |_, _| {})
            .unwrap();

        assert_eq!(api.calls_for("usr_a").len(), 1);
        assert_eq!(outcome.summary().fetched, 1);
        assert_eq!(outcome.summary().cached, 1);
    }

    #[test]
    fn test_unauthorized_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let api = ScriptedApi::default().respond("usr_b", vec![ApiOutcome::Unauthorized]);
        let session = CookieSession::new("cookie");

        let mut fetcher = MutualFetcher::new(&api, &session, &cache, policy());
        let err = fetcher
            .run(&ids(&["usr_a", "usr_b", "usr_c"]), &CancelFlag::new(), &mut |_, _| {})
            .unwrap_err();

        assert!(matches!(err, NetworkError::AuthenticationRequired));
        assert!(cache.get_ok("usr_a").is_some());
        assert!(cache.get("usr_c").is_none());
    }

    #[test]
    fn test_cancel_stops_new_requests() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let api = ScriptedApi::default();
        let session = CookieSession::new("cookie");
        let cancel = CancelFlag::new();

        let mut fetcher = MutualFetcher::new(&api, &session, &cache, policy());
        let outcome = fetcher
            .run(&ids(&["usr_a", "usr_b", "usr_c"]), &cancel, &mut |done, _| {
                if done == 1 {
                    cancel.request_cancel();
                }
            })
            .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(api.calls.lock().len(), 1);
        assert!(cache.get_ok("usr_a").is_some());
        assert!(cache.get("usr_b").is_none());
    }

    #[test]
    fn test_cancel_during_backoff_leaves_user_pending() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let api = ScriptedApi::default().respond("usr_a", vec![ApiOutcome::RateLimited]);
        let session = CookieSession::new("cookie");
        let cancel = CancelFlag::new();
        let slow = RetryPolicy {
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            ..policy()
        };

        let flag = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flag.request_cancel();
        });

        let started = Instant::now();
        let mut fetcher = MutualFetcher::new(&api, &session, &cache, slow);
        let outcome = fetcher.run(&ids(&["usr_a"]), &cancel, &mut |_, _| {}).unwrap();
        canceller.join().unwrap();

        assert!(outcome.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(cache.get("usr_a").is_none());
    }
}
