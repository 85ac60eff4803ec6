//! Per-endpoint rate-limit admission
//!
//! The queue mirrors the server's stated quota for each endpoint bucket and
//! enforces one in-flight request per bucket. Callers acquire access before
//! sending and hold an RAII guard for the duration of the request; dropping
//! the guard releases the bucket and wakes the next waiter. Buckets start
//! out keyed by a per-class placeholder and are re-keyed once the server
//! names the real bucket in its response headers, which also lets several
//! endpoint classes converge on one shared bucket.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use courier_core::workload::{EndpointClass, HttpResponse};
use courier_core::ClientConfig;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Pinned quota policy for buckets whose server headers are unreliable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecialPolicy {
    /// Trust the server's headers
    None,
    /// Force a fixed interval between requests regardless of headers
    PinnedInterval(Duration),
    /// Never let the advertised reset drop below this floor
    ResetFloor(Duration),
}

#[derive(Debug)]
struct BucketState {
    gets_remaining: i64,
    reset_after: Duration,
    sampled_at: Instant,
    do_we_wait: bool,
    in_flight: bool,
}

#[derive(Debug)]
struct Bucket {
    state: Mutex<BucketState>,
    readiness: Condvar,
    policy: SpecialPolicy,
}

impl Bucket {
    fn new(policy: SpecialPolicy) -> Self {
        Bucket {
            state: Mutex::new(BucketState {
                gets_remaining: 1,
                reset_after: Duration::ZERO,
                sampled_at: Instant::now(),
                do_we_wait: false,
                in_flight: false,
            }),
            readiness: Condvar::new(),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, BucketState>,
        timeout: Duration,
    ) -> MutexGuard<'a, BucketState> {
        let (guard, _) = self
            .readiness
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
    }
}

/// Scoped admission to one bucket; dropping it releases the bucket
pub struct BucketGuard {
    bucket: Arc<Bucket>,
    class: EndpointClass,
}

impl BucketGuard {
    pub fn endpoint_class(&self) -> EndpointClass {
        self.class
    }
}

impl Drop for BucketGuard {
    fn drop(&mut self) {
        let mut state = self.bucket.lock();
        state.in_flight = false;
        drop(state);
        self.bucket.readiness.notify_all();
    }
}

struct QueueInner {
    /// Endpoint class to current bucket key
    keys: HashMap<EndpointClass, String>,
    /// Bucket key to shared bucket
    buckets: HashMap<String, Arc<Bucket>>,
}

/// Admission queue over every endpoint class
pub struct RateLimitQueue {
    inner: Mutex<QueueInner>,
    admission_timeout: Duration,
}

impl RateLimitQueue {
    /// Seed one bucket per endpoint class under a placeholder key. The
    /// placeholder is replaced once the server names the real bucket.
    pub fn new(config: &ClientConfig) -> Self {
        let mut keys = HashMap::new();
        let mut buckets = HashMap::new();
        for class in EndpointClass::ALL {
            let policy = match class {
                EndpointClass::PostMessage | EndpointClass::PatchMessage => {
                    SpecialPolicy::PinnedInterval(config.special_bucket_interval())
                }
                EndpointClass::DeleteMessageOld => {
                    SpecialPolicy::ResetFloor(config.delete_message_reset())
                }
                _ => SpecialPolicy::None,
            };
            let key = Uuid::new_v4().to_string();
            keys.insert(class, key.clone());
            buckets.insert(key, Arc::new(Bucket::new(policy)));
        }
        RateLimitQueue {
            inner: Mutex::new(QueueInner { keys, buckets }),
            admission_timeout: config.admission_timeout(),
        }
    }

    fn bucket_for(&self, class: EndpointClass) -> Arc<Bucket> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = &inner.keys[&class];
        Arc::clone(&inner.buckets[key])
    }

    /// Block until this endpoint class may send a request. Waits out both
    /// quota replenishment and any in-flight holder, bounded overall by the
    /// admission timeout.
    pub fn acquire(&self, class: EndpointClass) -> Result<BucketGuard> {
        let bucket = self.bucket_for(class);
        let deadline = Instant::now() + self.admission_timeout;
        let mut state = bucket.lock();
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(?class, "rate-limit admission timed out");
                return Err(Error::AdmissionTimeout(class));
            }
            if state.in_flight {
                state = bucket.wait(state, deadline - now);
                continue;
            }
            if state.do_we_wait || state.gets_remaining <= 0 {
                let ready_at = state.sampled_at + state.reset_after;
                if now < ready_at {
                    let timeout = (ready_at - now).min(deadline - now);
                    trace!(?class, ?timeout, "waiting on rate-limit replenishment");
                    state = bucket.wait(state, timeout);
                    continue;
                }
                state.do_we_wait = false;
            }
            state.in_flight = true;
            state.gets_remaining -= 1;
            return Ok(BucketGuard {
                bucket: Arc::clone(&bucket),
                class,
            });
        }
    }

    /// Fold the server's rate-limit headers into the bucket after a
    /// response, re-keying to the server-named bucket when one is present.
    pub fn update_from_response(&self, class: EndpointClass, response: &HttpResponse) {
        if let Some(server_key) = response.headers.get("x-ratelimit-bucket") {
            self.rekey(class, server_key);
        }
        let bucket = self.bucket_for(class);
        let mut state = bucket.lock();
        state.sampled_at = Instant::now();
        if let Some(remaining) = response
            .headers
            .get("x-ratelimit-remaining")
            .and_then(|raw| raw.parse::<i64>().ok())
        {
            state.gets_remaining = remaining;
        }
        if let Some(reset_after) = response
            .headers
            .get("x-ratelimit-reset-after")
            .and_then(|raw| raw.parse::<f64>().ok())
        {
            state.reset_after = Duration::from_secs_f64(reset_after.max(0.0));
        }
        match bucket.policy {
            SpecialPolicy::PinnedInterval(interval) => {
                state.reset_after = interval;
                state.do_we_wait = true;
            }
            SpecialPolicy::ResetFloor(floor) => {
                if state.reset_after < floor {
                    state.reset_after = floor;
                }
                if state.gets_remaining <= 1 {
                    state.do_we_wait = true;
                }
            }
            SpecialPolicy::None => {
                if state.gets_remaining <= 1 {
                    state.do_we_wait = true;
                }
            }
        }
    }

    /// Record a 429. The reset comes from the response body's `retry_after`
    /// field in seconds, falling back to the retry-after headers, and the
    /// next acquire is guaranteed to stall rather than race the server.
    pub fn record_too_many_requests(&self, class: EndpointClass, response: &HttpResponse) {
        let retry_after = retry_after_seconds(response);
        let bucket = self.bucket_for(class);
        let mut state = bucket.lock();
        state.sampled_at = Instant::now();
        if let Some(seconds) = retry_after {
            state.reset_after = Duration::from_secs_f64(seconds.max(0.0));
        }
        state.do_we_wait = true;
        state.gets_remaining = 0;
        debug!(?class, reset_after = ?state.reset_after, "hit rate limit");
    }

    /// Wait out a pending forced stall for this class, clearing it once the
    /// reset moment passes. Bounded by the admission timeout. Used by the
    /// client between a 429 and its resend, while the bucket is still held.
    pub fn wait_until_reset(&self, class: EndpointClass) {
        let bucket = self.bucket_for(class);
        let deadline = Instant::now() + self.admission_timeout;
        let mut state = bucket.lock();
        while state.do_we_wait {
            let now = Instant::now();
            let ready_at = state.sampled_at + state.reset_after;
            if now >= ready_at || now >= deadline {
                state.do_we_wait = false;
                break;
            }
            let timeout = (ready_at - now).min(deadline - now);
            state = bucket.wait(state, timeout);
        }
    }

    /// Whether the next acquire for this class is guaranteed to stall
    pub fn is_waiting(&self, class: EndpointClass) -> bool {
        let bucket = self.bucket_for(class);
        let state = bucket.lock();
        state.do_we_wait && Instant::now() < state.sampled_at + state.reset_after
    }

    fn rekey(&self, class: EndpointClass, server_key: &str) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = inner.keys[&class].clone();
        if current == server_key {
            return;
        }
        debug!(?class, server_key, "re-keying rate-limit bucket");
        if inner.buckets.contains_key(server_key) {
            // Another class already discovered this bucket; share it
            inner.buckets.remove(&current);
        } else {
            let bucket = inner
                .buckets
                .remove(&current)
                .unwrap_or_else(|| Arc::new(Bucket::new(SpecialPolicy::None)));
            inner.buckets.insert(server_key.to_owned(), bucket);
        }
        inner.keys.insert(class, server_key.to_owned());
    }
}

fn retry_after_seconds(response: &HttpResponse) -> Option<f64> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&response.body) {
        if let Some(seconds) = value.get("retry_after").and_then(|v| v.as_f64()) {
            return Some(seconds);
        }
    }
    if let Some(millis) = response
        .headers
        .get("x-ratelimit-retry-after")
        .and_then(|raw| raw.parse::<f64>().ok())
    {
        return Some(millis / 1000.0);
    }
    response
        .headers
        .get("retry-after")
        .and_then(|raw| raw.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn test_queue() -> RateLimitQueue {
        RateLimitQueue::new(&ClientConfig::default())
    }

    fn response_with_headers(pairs: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_immediate_admission_with_quota() {
        let queue = test_queue();
        let start = Instant::now();
        let guard = queue.acquire(EndpointClass::GetUser).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        drop(guard);
    }

    #[test]
    fn test_depleted_bucket_blocks_until_reset() {
        let queue = test_queue();
        {
            let bucket = queue.bucket_for(EndpointClass::GetChannel);
            let mut state = bucket.lock();
            state.gets_remaining = 0;
            state.reset_after = Duration::from_millis(200);
            state.sampled_at = Instant::now();
        }
        let start = Instant::now();
        let guard = queue.acquire(EndpointClass::GetChannel).unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(190), "waited {waited:?}");
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
        drop(guard);
    }

    #[test]
    fn test_concurrent_acquires_serialized() {
        let queue = Arc::new(test_queue());
        let first = queue.acquire(EndpointClass::GetGuild).unwrap();
        let second_ran = Arc::new(AtomicBool::new(false));

        let queue_clone = Arc::clone(&queue);
        let flag = Arc::clone(&second_ran);
        let second = thread::spawn(move || {
            let guard = queue_clone.acquire(EndpointClass::GetGuild).unwrap();
            flag.store(true, Ordering::SeqCst);
            drop(guard);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(
            !second_ran.load(Ordering::SeqCst),
            "second acquire must wait for release"
        );
        drop(first);
        second.join().unwrap();
        assert!(second_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_admission_timeout_reports_failure() {
        let mut config = ClientConfig::default();
        config.admission_timeout_ms = 100;
        let queue = RateLimitQueue::new(&config);
        {
            let bucket = queue.bucket_for(EndpointClass::GetInvite);
            let mut state = bucket.lock();
            state.gets_remaining = 0;
            state.reset_after = Duration::from_secs(60);
            state.sampled_at = Instant::now();
        }
        let result = queue.acquire(EndpointClass::GetInvite);
        assert!(matches!(
            result,
            Err(Error::AdmissionTimeout(EndpointClass::GetInvite))
        ));
    }

    #[test]
    fn test_headers_fold_into_bucket() {
        let queue = test_queue();
        let response = response_with_headers(&[
            ("x-ratelimit-remaining", "5"),
            ("x-ratelimit-reset-after", "1.5"),
        ]);
        queue.update_from_response(EndpointClass::GetAuditLog, &response);
        let bucket = queue.bucket_for(EndpointClass::GetAuditLog);
        let state = bucket.lock();
        assert_eq!(state.gets_remaining, 5);
        assert_eq!(state.reset_after, Duration::from_millis(1500));
        assert!(!state.do_we_wait);
    }

    #[test]
    fn test_last_remaining_request_forces_wait() {
        let queue = test_queue();
        let response = response_with_headers(&[
            ("x-ratelimit-remaining", "1"),
            ("x-ratelimit-reset-after", "0.5"),
        ]);
        queue.update_from_response(EndpointClass::GetCurrentUser, &response);
        let bucket = queue.bucket_for(EndpointClass::GetCurrentUser);
        assert!(bucket.lock().do_we_wait);
    }

    #[test]
    fn test_rekey_shares_bucket_across_classes() {
        let queue = test_queue();
        let response = response_with_headers(&[("x-ratelimit-bucket", "shared-bucket")]);
        queue.update_from_response(EndpointClass::PutReaction, &response);
        queue.update_from_response(EndpointClass::DeleteReaction, &response);
        let first = queue.bucket_for(EndpointClass::PutReaction);
        let second = queue.bucket_for(EndpointClass::DeleteReaction);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_429_body_sets_wait_state() {
        let queue = test_queue();
        let response = HttpResponse {
            status: 429,
            headers: HashMap::new(),
            body: br#"{"retry_after":0.25}"#.to_vec(),
        };
        queue.record_too_many_requests(EndpointClass::GetGatewayBot, &response);
        assert!(queue.is_waiting(EndpointClass::GetGatewayBot));
        let bucket = queue.bucket_for(EndpointClass::GetGatewayBot);
        let state = bucket.lock();
        assert_eq!(state.reset_after, Duration::from_millis(250));
        assert_eq!(state.gets_remaining, 0);
    }

    #[test]
    fn test_429_header_fallback() {
        let queue = test_queue();
        let response = response_with_headers(&[("x-ratelimit-retry-after", "500")]);
        queue.record_too_many_requests(EndpointClass::GetGateway, &response);
        let bucket = queue.bucket_for(EndpointClass::GetGateway);
        assert_eq!(bucket.lock().reset_after, Duration::from_millis(500));
    }

    #[test]
    fn test_special_bucket_pins_interval() {
        let queue = test_queue();
        let response = response_with_headers(&[
            ("x-ratelimit-remaining", "50"),
            ("x-ratelimit-reset-after", "0.001"),
        ]);
        queue.update_from_response(EndpointClass::PostMessage, &response);
        let bucket = queue.bucket_for(EndpointClass::PostMessage);
        let state = bucket.lock();
        assert_eq!(
            state.reset_after,
            ClientConfig::default().special_bucket_interval()
        );
        assert!(state.do_we_wait);
    }

    #[test]
    fn test_bulk_delete_reset_floor() {
        let queue = test_queue();
        let response = response_with_headers(&[("x-ratelimit-reset-after", "0.1")]);
        queue.update_from_response(EndpointClass::DeleteMessageOld, &response);
        let bucket = queue.bucket_for(EndpointClass::DeleteMessageOld);
        assert_eq!(
            bucket.lock().reset_after,
            ClientConfig::default().delete_message_reset()
        );
    }
}
