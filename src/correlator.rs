//! Matches responses to outstanding requests by sequence number

use crate::error::{ComfoError, Result};
use crate::lock;
use crate::protocol::{Request, Response, SequenceNumber, UNSOLICITED};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};

struct Pending {
    request: Request,
    tx: oneshot::Sender<Result<Response>>,
}

/// What happened to an incoming response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller
    Delivered,
    /// The request had already expired; response discarded
    Late,
    /// No request was ever waiting for this number
    Unmatched,
}

/// Pending-request table with sequence number allocation
///
/// Numbers are handed out in increasing order, wrapping at `u16::MAX` and
/// skipping 0. A number stays unavailable while its request is pending, and
/// for `retire_for` after the request expired so a late response cannot be
/// taken for the answer to a newer request.
pub struct Correlator {
    next_sequence: SequenceNumber,
    pending: HashMap<SequenceNumber, Pending>,
    retired: HashMap<SequenceNumber, Instant>,
    retire_for: Duration,
}

impl Correlator {
    pub fn new(retire_for: Duration) -> Self {
        Self::starting_at(1, retire_for)
    }

    /// Start allocating at a specific number
    pub fn starting_at(sequence: SequenceNumber, retire_for: Duration) -> Self {
        Self {
            next_sequence: if sequence == UNSOLICITED { 1 } else { sequence },
            pending: HashMap::new(),
            retired: HashMap::new(),
            retire_for,
        }
    }

    /// Allocate the next free sequence number
    pub fn next_sequence(&mut self) -> Result<SequenceNumber> {
        self.prune_retired(Instant::now());

        for _ in 0..u16::MAX {
            let candidate = self.next_sequence;
            self.next_sequence = advance(candidate);
            if !self.pending.contains_key(&candidate) && !self.retired.contains_key(&candidate) {
                return Ok(candidate);
            }
        }

        Err(ComfoError::DuplicateSequence(self.next_sequence))
    }

    /// Register a request and get the handle its response arrives on
    pub fn submit(&mut self, request: Request) -> Result<PendingResponse> {
        let sequence = request.sequence;
        if sequence == UNSOLICITED
            || self.pending.contains_key(&sequence)
            || self.retired.contains_key(&sequence)
        {
            return Err(ComfoError::DuplicateSequence(sequence));
        }

        let (tx, rx) = oneshot::channel();
        let handle = PendingResponse {
            sequence,
            deadline: request.deadline,
            rx,
        };
        tracing::trace!(sequence, operation = ?request.operation, "Request submitted");
        self.pending.insert(sequence, Pending { request, tx });
        Ok(handle)
    }

    /// Route a response to the request waiting for it
    pub fn resolve(&mut self, response: Response) -> Resolution {
        let sequence = response.sequence;

        if let Some(pending) = self.pending.remove(&sequence) {
            if Instant::now() >= pending.request.deadline {
                tracing::warn!(sequence, "Response arrived after the deadline, discarding");
                let _ = pending.tx.send(Err(ComfoError::Timeout));
                self.retired
                    .insert(sequence, Instant::now() + self.retire_for);
                return Resolution::Late;
            }

            let expected = pending.request.operation.response_kind();
            let result = if response.kind == expected {
                Ok(response)
            } else {
                Err(ComfoError::Decode(format!(
                    "expected {:?} for sequence {}, got {:?}",
                    expected, sequence, response.kind
                )))
            };
            let _ = pending.tx.send(result);
            return Resolution::Delivered;
        }

        if self.retired.remove(&sequence).is_some() {
            tracing::debug!(sequence, "Discarding late response for expired request");
            Resolution::Late
        } else {
            tracing::warn!(sequence, "Response does not match any pending request");
            Resolution::Unmatched
        }
    }

    /// Fail a pending request with a timeout and retire its number
    pub fn expire(&mut self, sequence: SequenceNumber) -> bool {
        match self.pending.remove(&sequence) {
            Some(pending) => {
                let _ = pending.tx.send(Err(ComfoError::Timeout));
                self.retired
                    .insert(sequence, Instant::now() + self.retire_for);
                true
            }
            None => false,
        }
    }

    /// Forget a request that never made it onto the wire
    pub fn withdraw(&mut self, sequence: SequenceNumber) -> bool {
        self.pending.remove(&sequence).is_some()
    }

    /// Expire every request past its deadline and forget old retired numbers
    pub fn sweep(&mut self, now: Instant) -> Vec<SequenceNumber> {
        let overdue: Vec<SequenceNumber> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.request.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in &overdue {
            tracing::debug!(sequence, "Request timed out");
            self.expire(*sequence);
        }

        self.prune_retired(now);
        overdue
    }

    /// Fail every pending request with [`ComfoError::Cancelled`]
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.tx.send(Err(ComfoError::Cancelled));
        }
        if count > 0 {
            tracing::debug!(count, "Cancelled pending requests");
        }
        count
    }

    /// Cancel everything and start a fresh sequence space
    pub fn reset(&mut self) {
        self.cancel_all();
        self.retired.clear();
        self.next_sequence = 1;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn prune_retired(&mut self, now: Instant) {
        self.retired.retain(|_, until| *until > now);
    }
}

fn advance(sequence: SequenceNumber) -> SequenceNumber {
    match sequence.wrapping_add(1) {
        UNSOLICITED => 1,
        next => next,
    }
}

/// Handle a caller awaits its response on
pub struct PendingResponse {
    sequence: SequenceNumber,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingResponse {
    /// Wait for the response until the request deadline
    ///
    /// Resolves exactly once: with the response, [`ComfoError::Timeout`] or
    /// [`ComfoError::Cancelled`].
    pub async fn wait(self, correlator: &Mutex<Correlator>) -> Result<Response> {
        match timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ComfoError::Cancelled),
            Err(_) => {
                lock(correlator).expire(self.sequence);
                Err(ComfoError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::FAN_SPEED_SETTING;
    use crate::protocol::{FrameKind, Operation, ResultCode};

    const RETIRE: Duration = Duration::from_secs(20);

    fn read_request(sequence: SequenceNumber, timeout: Duration) -> Request {
        Request {
            sequence,
            operation: Operation::Read(FAN_SPEED_SETTING.id),
            deadline: Instant::now() + timeout,
        }
    }

    fn read_response(sequence: SequenceNumber) -> Response {
        Response::new(FrameKind::PropertyReadResponse, sequence, ResultCode::Ok)
    }

    #[test]
    fn test_sequence_numbers_increase_and_skip_zero_on_wrap() {
        let mut correlator = Correlator::starting_at(u16::MAX - 1, RETIRE);
        assert_eq!(correlator.next_sequence().unwrap(), u16::MAX - 1);
        assert_eq!(correlator.next_sequence().unwrap(), u16::MAX);
        assert_eq!(correlator.next_sequence().unwrap(), 1);
        assert_eq!(correlator.next_sequence().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wraparound_skips_numbers_still_pending() {
        let mut correlator = Correlator::starting_at(u16::MAX, RETIRE);
        let first = correlator.next_sequence().unwrap();
        let _pending = correlator
            .submit(read_request(first, Duration::from_secs(10)))
            .unwrap();
        let second = correlator.next_sequence().unwrap();
        let _pending2 = correlator
            .submit(read_request(second, Duration::from_secs(10)))
            .unwrap();

        // walk the whole number space back around
        let mut seen = std::collections::HashSet::new();
        for _ in 0..u16::MAX - 2 {
            let sequence = correlator.next_sequence().unwrap();
            assert_ne!(sequence, first);
            assert_ne!(sequence, second);
            assert_ne!(sequence, UNSOLICITED);
            assert!(seen.insert(sequence));
        }
        assert_eq!(seen.len(), (u16::MAX - 2) as usize);
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_rejected() {
        let mut correlator = Correlator::new(RETIRE);
        let _pending = correlator
            .submit(read_request(5, Duration::from_secs(10)))
            .unwrap();
        assert!(matches!(
            correlator.submit(read_request(5, Duration::from_secs(10))),
            Err(ComfoError::DuplicateSequence(5))
        ));
        assert!(matches!(
            correlator.submit(read_request(UNSOLICITED, Duration::from_secs(10))),
            Err(ComfoError::DuplicateSequence(0))
        ));
    }

    #[tokio::test]
    async fn test_response_is_delivered() {
        let correlator = Mutex::new(Correlator::new(RETIRE));
        let pending = lock(&correlator)
            .submit(read_request(1, Duration::from_secs(10)))
            .unwrap();

        assert_eq!(lock(&correlator).resolve(read_response(1)), Resolution::Delivered);
        let response = pending.wait(&correlator).await.unwrap();
        assert_eq!(response.sequence, 1);
        assert_eq!(lock(&correlator).pending_count(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_response_kind_is_an_error() {
        let correlator = Mutex::new(Correlator::new(RETIRE));
        let pending = lock(&correlator)
            .submit(read_request(1, Duration::from_secs(10)))
            .unwrap();
        let wrong = Response::new(FrameKind::SubscribeResponse, 1, ResultCode::Ok);
        lock(&correlator).resolve(wrong);
        assert!(matches!(pending.wait(&correlator).await, Err(ComfoError::Decode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once_and_late_response_is_discarded() {
        let correlator = Mutex::new(Correlator::new(RETIRE));
        let sequence = lock(&correlator).next_sequence().unwrap();
        let pending = lock(&correlator)
            .submit(read_request(sequence, Duration::from_secs(1)))
            .unwrap();

        assert!(matches!(pending.wait(&correlator).await, Err(ComfoError::Timeout)));

        // the number is retired, a late answer is dropped rather than misrouted
        assert_eq!(lock(&correlator).resolve(read_response(sequence)), Resolution::Late);
        assert_eq!(lock(&correlator).resolve(read_response(sequence)), Resolution::Unmatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_deadline_still_times_out() {
        let correlator = Mutex::new(Correlator::new(RETIRE));
        let pending = lock(&correlator)
            .submit(read_request(1, Duration::from_secs(1)))
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(lock(&correlator).resolve(read_response(1)), Resolution::Late);
        assert!(matches!(pending.wait(&correlator).await, Err(ComfoError::Timeout)));

        // retired like an expired number, not handed out again straight away
        assert!(matches!(
            lock(&correlator).submit(read_request(1, Duration::from_secs(1))),
            Err(ComfoError::DuplicateSequence(1))
        ));
        assert_eq!(lock(&correlator).next_sequence().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_numbers_come_back_after_margin() {
        let mut correlator = Correlator::starting_at(7, Duration::from_secs(5));
        let _pending = correlator
            .submit(read_request(7, Duration::from_millis(100)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(correlator.sweep(Instant::now()), vec![7]);
        assert!(matches!(
            correlator.submit(read_request(7, Duration::from_secs(1))),
            Err(ComfoError::DuplicateSequence(7))
        ));

        tokio::time::advance(Duration::from_secs(6)).await;
        correlator.sweep(Instant::now());
        assert!(correlator
            .submit(read_request(7, Duration::from_secs(1)))
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancel_all_fails_pending_requests() {
        let correlator = Mutex::new(Correlator::new(RETIRE));
        let first = lock(&correlator)
            .submit(read_request(1, Duration::from_secs(10)))
            .unwrap();
        let second = lock(&correlator)
            .submit(read_request(2, Duration::from_secs(10)))
            .unwrap();

        assert_eq!(lock(&correlator).cancel_all(), 2);
        assert!(matches!(first.wait(&correlator).await, Err(ComfoError::Cancelled)));
        assert!(matches!(second.wait(&correlator).await, Err(ComfoError::Cancelled)));
    }

    #[tokio::test]
    async fn test_withdrawn_request_frees_its_number() {
        let correlator = Mutex::new(Correlator::new(RETIRE));
        let pending = lock(&correlator)
            .submit(read_request(1, Duration::from_secs(10)))
            .unwrap();
        assert!(lock(&correlator).withdraw(1));
        assert!(!lock(&correlator).withdraw(1));
        assert_eq!(lock(&correlator).pending_count(), 0);
        assert!(matches!(pending.wait(&correlator).await, Err(ComfoError::Cancelled)));
        assert_eq!(lock(&correlator).resolve(read_response(1)), Resolution::Unmatched);
    }

    #[tokio::test]
    async fn test_reset_starts_fresh_sequence_space() {
        let mut correlator = Correlator::starting_at(300, RETIRE);
        let _ = correlator.next_sequence().unwrap();
        correlator.reset();
        assert_eq!(correlator.next_sequence().unwrap(), 1);
    }
}
