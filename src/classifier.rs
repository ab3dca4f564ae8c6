//! Maps an upload response to per-event dispositions.
//!
//! Every event of a submitted batch ends up in exactly one of two sets:
//! events handed to the execute callback (delivered, or failed for good) and
//! events returned to storage for another attempt. Retries that must wait
//! carry a `retry_at`; immediate retries have it cleared so they land in the
//! fresh lane.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::error;

use crate::event::StorageEvent;
use crate::response::{NormalizedStatus, UploadResponse};

/// Default number of retries before a transient failure becomes terminal.
pub const DEFAULT_MAX_RETRIES: u32 = 12;

/// Default base for the exponential retry schedule.
pub const DEFAULT_RETRY_BASE_INTERVAL: Duration = Duration::from_millis(100);

/// Default delay for throttled events.
pub const DEFAULT_RETRY_THROTTLED_INTERVAL: Duration = Duration::from_secs(30);

const SUCCESS_MESSAGE: &str = "Event sent successfully.";
const INVALID_API_KEY_PREFIX: &str = "Invalid API key:";

/// Source of the current time. Injected so retry schedules can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Delay before retry number `retries` (1-based): the base interval,
/// doubled every two retries.
pub fn retry_interval(base: Duration, retries: u32) -> Duration {
    let doublings = (retries.max(1) - 1) / 2;
    base.saturating_mul(1u32 << doublings.min(31))
}

pub(crate) fn add_interval(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Which branch of the classifier handled a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Connection timeout, 408 or 5xx.
    Timeout,
    /// 413; a split batch should be retried with a smaller chunk size.
    PayloadTooLarge,
    BadRequest,
    /// 429.
    Throttled,
    /// Any other status, or a transport failure.
    Unknown,
}

/// Classification of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierResult {
    pub disposition: Disposition,

    /// `code` echoed from the response body.
    pub code: i32,

    pub message: String,
    pub events_for_callback: Vec<StorageEvent>,
    pub events_for_retry: Vec<StorageEvent>,
}

impl ClassifierResult {
    fn new(disposition: Disposition, code: i32, message: impl Into<String>) -> Self {
        Self {
            disposition,
            code,
            message: message.into(),
            events_for_callback: Vec::new(),
            events_for_retry: Vec::new(),
        }
    }

    fn with_callback(mut self, events: Vec<StorageEvent>) -> Self {
        self.events_for_callback = events;
        self
    }

    fn with_retry(mut self, events: Vec<StorageEvent>) -> Self {
        self.events_for_retry = events;
        self
    }

    /// Returns `true` if the worker should shrink its chunk size.
    pub fn should_shrink_chunk(&self) -> bool {
        self.disposition == Disposition::PayloadTooLarge && !self.events_for_retry.is_empty()
    }
}

/// Retry policy settings.
#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    pub max_retries: u32,
    pub retry_base_interval: Duration,
    pub retry_throttled_interval: Duration,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_interval: DEFAULT_RETRY_BASE_INTERVAL,
            retry_throttled_interval: DEFAULT_RETRY_THROTTLED_INTERVAL,
        }
    }
}

/// Classifies upload responses.
#[derive(Clone)]
pub struct ResponseClassifier {
    options: ClassifierOptions,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResponseClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseClassifier")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ResponseClassifier {
    pub fn new(options: ClassifierOptions, clock: Arc<dyn Clock>) -> Self {
        Self { options, clock }
    }

    pub fn options(&self) -> &ClassifierOptions {
        &self.options
    }

    /// Classify the response to `events`, which must be the batch exactly as
    /// submitted: response indices refer to positions in it.
    pub fn classify(&self, events: Vec<StorageEvent>, response: &UploadResponse) -> ClassifierResult {
        let status = response.normalized_status();
        let timed_out = response
            .transport_error
            .as_ref()
            .is_some_and(|err| err.is_timeout());
        let is_success = response.transport_error.is_none() && status == NormalizedStatus::Success;

        let result = if is_success {
            ClassifierResult::new(Disposition::Success, response.code, SUCCESS_MESSAGE)
                .with_callback(events)
        } else if timed_out
            || status == NormalizedStatus::RequestTimeout
            || status == NormalizedStatus::ServerError
        {
            self.process_timeout(events, response)
        } else {
            match status {
                NormalizedStatus::PayloadTooLarge => self.process_too_large(events, response),
                NormalizedStatus::BadRequest => self.process_bad_request(events, response),
                NormalizedStatus::TooManyRequests => self.process_too_many_requests(events, response),
                _ => self.process_unknown(events, response),
            }
        };

        if !is_success && !result.events_for_callback.is_empty() {
            error!(
                code = result.code,
                status = ?response.status,
                events = result.events_for_callback.len(),
                "{}",
                result.message
            );
        }

        result
    }

    fn process_timeout(&self, events: Vec<StorageEvent>, response: &UploadResponse) -> ClassifierResult {
        let now = self.clock.now();
        let mut for_callback = Vec::with_capacity(events.len());
        let mut for_retry = Vec::with_capacity(events.len());

        for mut event in events {
            if event.retry_count >= self.options.max_retries {
                for_callback.push(event);
            } else {
                event.retry_count += 1;
                let delay = retry_interval(self.options.retry_base_interval, event.retry_count);
                event.retry_at = Some(add_interval(now, delay));
                for_retry.push(event);
            }
        }

        let message = format!("Event reached max retry times {}", self.options.max_retries);
        ClassifierResult::new(Disposition::Timeout, response.code, message)
            .with_callback(for_callback)
            .with_retry(for_retry)
    }

    fn process_too_large(&self, mut events: Vec<StorageEvent>, response: &UploadResponse) -> ClassifierResult {
        let result = ClassifierResult::new(Disposition::PayloadTooLarge, response.code, &response.error);

        if events.len() == 1 {
            return result.with_callback(events);
        }

        for event in &mut events {
            event.retry_at = None;
        }
        result.with_retry(events)
    }

    fn process_bad_request(&self, events: Vec<StorageEvent>, response: &UploadResponse) -> ClassifierResult {
        if response.error.starts_with(INVALID_API_KEY_PREFIX) {
            return ClassifierResult::new(Disposition::BadRequest, response.code, "Invalid API key")
                .with_callback(events);
        }

        if !response.missing_field.is_empty() {
            let message = format!("Request missing required field {}", response.missing_field);
            return ClassifierResult::new(Disposition::BadRequest, response.code, message)
                .with_callback(events);
        }

        let invalid = response.invalid_or_silenced_indices();
        let mut for_callback = Vec::with_capacity(invalid.len());
        let mut for_retry = Vec::with_capacity(events.len());

        for (index, mut event) in events.into_iter().enumerate() {
            if invalid.contains(&index) {
                for_callback.push(event);
            } else {
                event.retry_at = None;
                for_retry.push(event);
            }
        }

        ClassifierResult::new(Disposition::BadRequest, response.code, &response.error)
            .with_callback(for_callback)
            .with_retry(for_retry)
    }

    fn process_too_many_requests(
        &self,
        events: Vec<StorageEvent>,
        response: &UploadResponse,
    ) -> ClassifierResult {
        let now = self.clock.now();
        let throttled_until = add_interval(now, self.options.retry_throttled_interval);

        let mut for_callback = Vec::with_capacity(events.len());
        let mut for_retry = Vec::with_capacity(events.len());
        let mut for_retry_delayed = Vec::new();

        for (index, mut event) in events.into_iter().enumerate() {
            if !response.is_throttled(index) {
                event.retry_at = None;
                for_retry.push(event);
            } else if response.exceeded_daily_quota(&event.event) {
                for_callback.push(event);
            } else {
                event.retry_at = Some(throttled_until);
                for_retry_delayed.push(event);
            }
        }

        for_retry.append(&mut for_retry_delayed);

        ClassifierResult::new(Disposition::Throttled, response.code, "Exceeded daily quota")
            .with_callback(for_callback)
            .with_retry(for_retry)
    }

    fn process_unknown(&self, events: Vec<StorageEvent>, response: &UploadResponse) -> ClassifierResult {
        let message = match &response.transport_error {
            Some(err) => err.to_string(),
            None if !response.error.is_empty() => response.error.clone(),
            None => "Unknown error".to_string(),
        };

        ClassifierResult::new(Disposition::Unknown, response.code, message).with_callback(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::event::Event;
    use std::collections::{HashMap, HashSet};

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn classifier(now: DateTime<Utc>) -> ResponseClassifier {
        ResponseClassifier::new(ClassifierOptions::default(), Arc::new(FixedClock(now)))
    }

    fn batch(size: usize) -> Vec<StorageEvent> {
        (0..size)
            .map(|i| StorageEvent::new(Event::new(format!("e{}", i)).with_user_id(format!("u{}", i))))
            .collect()
    }

    fn status(code: u16) -> UploadResponse {
        UploadResponse {
            status: Some(code),
            code: code as i32,
            ..UploadResponse::default()
        }
    }

    fn names(events: &[StorageEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event.event_type.as_str()).collect()
    }

    fn assert_partition(result: &ClassifierResult, size: usize) {
        let callback: HashSet<_> = names(&result.events_for_callback).into_iter().collect();
        let retry: HashSet<_> = names(&result.events_for_retry).into_iter().collect();
        assert!(callback.is_disjoint(&retry));
        assert_eq!(callback.len() + retry.len(), size);
    }

    #[test]
    fn test_retry_interval_schedule() {
        let base = Duration::from_millis(100);
        let schedule: Vec<u64> = (1..=8)
            .map(|n| retry_interval(base, n).as_millis() as u64)
            .collect();
        assert_eq!(schedule, [100, 100, 200, 200, 400, 400, 800, 800]);
        assert_eq!(retry_interval(base, 200), base.saturating_mul(1 << 31));
    }

    #[test]
    fn test_success_routes_all_to_callback() {
        let result = classifier(Utc::now()).classify(batch(3), &status(200));

        assert_eq!(result.disposition, Disposition::Success);
        assert_eq!(result.code, 200);
        assert_eq!(result.message, "Event sent successfully.");
        assert_eq!(result.events_for_callback.len(), 3);
        assert!(result.events_for_retry.is_empty());
    }

    #[test]
    fn test_server_error_schedules_backoff() {
        let now = Utc::now();
        let mut events = batch(2);
        events[1].retry_count = 2;

        let result = classifier(now).classify(events, &status(500));

        assert_eq!(result.disposition, Disposition::Timeout);
        assert_eq!(result.events_for_retry.len(), 2);
        assert_eq!(result.events_for_retry[0].retry_count, 1);
        assert_eq!(
            result.events_for_retry[0].retry_at,
            Some(now + chrono::Duration::milliseconds(100))
        );
        assert_eq!(result.events_for_retry[1].retry_count, 3);
        assert_eq!(
            result.events_for_retry[1].retry_at,
            Some(now + chrono::Duration::milliseconds(200))
        );
    }

    #[test]
    fn test_exhausted_retries_go_to_callback() {
        let mut events = batch(2);
        events[0].retry_count = DEFAULT_MAX_RETRIES;

        let result = classifier(Utc::now()).classify(events, &status(408));

        assert_eq!(names(&result.events_for_callback), ["e0"]);
        assert_eq!(names(&result.events_for_retry), ["e1"]);
        assert_eq!(result.message, "Event reached max retry times 12");
        assert_partition(&result, 2);
    }

    #[test]
    fn test_connection_timeout_is_retried() {
        let response = UploadResponse::from_transport_error(TransportError::Request {
            message: "operation timed out".to_string(),
            timeout: true,
        });

        let result = classifier(Utc::now()).classify(batch(1), &response);
        assert_eq!(result.disposition, Disposition::Timeout);
        assert_eq!(result.events_for_retry.len(), 1);
    }

    #[test]
    fn test_payload_too_large_single_event_goes_to_callback() {
        let result = classifier(Utc::now()).classify(batch(1), &status(413));

        assert_eq!(result.events_for_callback.len(), 1);
        assert!(result.events_for_retry.is_empty());
        assert!(!result.should_shrink_chunk());
    }

    #[test]
    fn test_payload_too_large_batch_is_retried_immediately() {
        let mut events = batch(2);
        events[0].retry_at = Some(Utc::now());

        let result = classifier(Utc::now()).classify(events, &status(413));

        assert_eq!(result.events_for_retry.len(), 2);
        assert!(result.events_for_retry.iter().all(|e| e.retry_at.is_none()));
        assert!(result.should_shrink_chunk());
    }

    #[test]
    fn test_bad_request_invalid_api_key() {
        let response = UploadResponse {
            error: "Invalid API key: abc".to_string(),
            ..status(400)
        };

        let result = classifier(Utc::now()).classify(batch(2), &response);
        assert_eq!(result.message, "Invalid API key");
        assert_eq!(result.events_for_callback.len(), 2);
    }

    #[test]
    fn test_bad_request_missing_field() {
        let response = UploadResponse {
            missing_field: "api_key".to_string(),
            ..status(400)
        };

        let result = classifier(Utc::now()).classify(batch(2), &response);
        assert_eq!(result.message, "Request missing required field api_key");
        assert_eq!(result.events_for_callback.len(), 2);
    }

    #[test]
    fn test_bad_request_splits_by_index() {
        let response = UploadResponse {
            error: "Request contains invalid fields".to_string(),
            events_with_invalid_fields: HashMap::from([("user_id".to_string(), vec![1, 3])]),
            silenced_events: vec![4],
            ..status(400)
        };

        let result = classifier(Utc::now()).classify(batch(6), &response);

        assert_eq!(names(&result.events_for_callback), ["e1", "e3", "e4"]);
        assert_eq!(names(&result.events_for_retry), ["e0", "e2", "e5"]);
        assert!(result.events_for_retry.iter().all(|e| e.retry_at.is_none()));
        assert_partition(&result, 6);
    }

    #[test]
    fn test_too_many_requests_routes_by_quota() {
        let now = Utc::now();
        let response = UploadResponse {
            throttled_events: vec![0, 2],
            exceeded_daily_quota_users: HashMap::from([("u0".to_string(), 1)]),
            ..status(429)
        };

        let result = classifier(now).classify(batch(3), &response);

        assert_eq!(result.disposition, Disposition::Throttled);
        assert_eq!(names(&result.events_for_callback), ["e0"]);
        assert_eq!(names(&result.events_for_retry), ["e1", "e2"]);
        assert_eq!(result.events_for_retry[0].retry_at, None);
        assert_eq!(
            result.events_for_retry[1].retry_at,
            Some(now + chrono::Duration::seconds(30))
        );
        assert_partition(&result, 3);
    }

    #[test]
    fn test_unknown_status_uses_transport_error_message() {
        let response = UploadResponse::from_transport_error(TransportError::Request {
            message: "connection refused".to_string(),
            timeout: false,
        });

        let result = classifier(Utc::now()).classify(batch(2), &response);
        assert_eq!(result.disposition, Disposition::Unknown);
        assert_eq!(result.message, "HTTP request failed: connection refused");
        assert_eq!(result.events_for_callback.len(), 2);

        let result = classifier(Utc::now()).classify(batch(1), &status(302));
        assert_eq!(result.message, "Unknown error");
    }
}
