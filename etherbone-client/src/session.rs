//! Reliable request/reply exchange on top of a [Transport].
//!
//! A session owns one transport handle and a table of pending transactions
//! keyed by transaction identifier. Lost requests and replies are recovered by
//! retransmitting the exact bytes of the original request with a doubling timeout.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use etherbone_protocol::{FRAME_HEADER_LEN, Frame, MAX_RECORDS, Record, TransactionId};

use crate::{
    config::SessionConfig,
    error::SessionError,
    transport::{Transport, TransportError},
};

enum TransactionState {
    Pending,
    Replied(Frame),
    Aborted,
}

struct Transaction {
    records: Vec<Record>,
    /// Encoded request, resent verbatim on every retry
    bytes: Box<[u8]>,
    deadline: Instant,
    retries: u32,
    state: TransactionState,
}

/// A batch submitted with [Session::submit_all] stopped at a failing frame.
#[derive(Debug)]
pub struct BatchError {
    /// Number of records that completed before the failure, in submission order.
    pub completed: usize,
    pub cause: SessionError,
}

/// Request/reply session over one transport handle.
///
/// Not synchronized; wrap it in a lock to share it (see [crate::RegisterClient]).
pub struct Session<T: Transport> {
    target: T::Target,
    transport: Option<T>,
    config: SessionConfig,
    next_id: TransactionId,
    pending: HashMap<TransactionId, Transaction>,
}

impl<T: Transport> Session<T> {
    /// Opens a transport to `target` and starts a session on it.
    pub fn open(target: T::Target, config: SessionConfig) -> Result<Session<T>, SessionError> {
        log::debug!("Opening session to {:?} with {:?}", target, config);
        let transport = T::open(&target).map_err(SessionError::Transport)?;
        Ok(Session {
            target,
            transport: Some(transport),
            config,
            next_id: 0,
            pending: HashMap::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn target(&self) -> &T::Target {
        &self.target
    }

    /// Whether the session still holds a working transport.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Number of transactions that were started and not yet collected.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Largest frame this session sends.
    pub fn max_frame_len(&self) -> Result<usize, SessionError> {
        let transport = self.transport.as_ref().ok_or(SessionError::Closed)?;
        let limit = transport.max_frame_len();
        Ok(self.config.max_frame_len.map_or(limit, |cap| cap.min(limit)))
    }

    /// Closes the current transport, if any, and opens a fresh one.
    /// Transactions that were pending are dropped.
    pub fn reopen(&mut self) -> Result<(), SessionError> {
        log::info!("Reopening session to {:?}", self.target);
        self.close_transport();
        if !self.pending.is_empty() {
            log::debug!("Dropping {} transactions on reopen", self.pending.len());
            self.pending.clear();
        }
        self.transport = Some(T::open(&self.target).map_err(SessionError::Transport)?);
        Ok(())
    }

    /// Closes the transport.
    pub fn close(mut self) -> Result<(), SessionError> {
        match self.transport.take() {
            Some(transport) => transport.close().map_err(SessionError::Transport),
            None => Ok(()),
        }
    }

    /// Sends `records` as one frame and waits for the reply records.
    pub fn submit(&mut self, records: Vec<Record>) -> Result<Vec<Record>, SessionError> {
        let id = self.start(records)?;
        self.wait(id)
    }

    /// Sends `records` as one frame and returns without waiting.
    /// The reply must be collected with [Session::wait] or the transaction [cancelled](Session::cancel).
    ///
    /// Retransmission only happens inside `wait` for that identifier. While a caller
    /// waits on one transaction, other started transactions still collect their
    /// replies but pass their deadlines without being resent; they catch up once
    /// they are waited on themselves.
    pub fn start(&mut self, records: Vec<Record>) -> Result<TransactionId, SessionError> {
        let max_frame_len = self.max_frame_len()?;
        let id = self.allocate_id()?;
        let frame = Frame::request(id, records);
        let bytes = frame.encode()?.into_boxed_slice();
        if bytes.len() > max_frame_len {
            return Err(SessionError::FrameTooLarge {
                max: max_frame_len,
                got: bytes.len(),
            });
        }

        log::debug!(
            "Starting transaction {} with {} records",
            id,
            frame.records().len()
        );
        log::trace!("Transaction {} request: {:02x?}", id, bytes);
        self.send(&bytes)?;

        let timeout = self.config.timeout_for_retry(0);
        self.pending.insert(
            id,
            Transaction {
                records: frame.into_records(),
                bytes,
                deadline: Instant::now() + timeout,
                retries: 0,
                state: TransactionState::Pending,
            },
        );
        Ok(id)
    }

    /// Blocks until the reply to `id` arrives or the transaction fails.
    ///
    /// Replies to other pending transactions that arrive meanwhile are kept for their own `wait`.
    /// Only `id` is retransmitted here, see [Session::start].
    pub fn wait(&mut self, id: TransactionId) -> Result<Vec<Record>, SessionError> {
        loop {
            let transaction = self
                .pending
                .get(&id)
                .ok_or(SessionError::UnknownTransaction(id))?;
            let deadline = transaction.deadline;
            let retries = transaction.retries;
            match transaction.state {
                TransactionState::Pending => {}
                TransactionState::Replied(_) => return Ok(self.take_reply(id)),
                TransactionState::Aborted => {
                    self.pending.remove(&id);
                    return Err(SessionError::Aborted(id));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if retries >= self.config.max_retries {
                    self.pending.remove(&id);
                    log::warn!(
                        "Transaction {} unanswered after {} attempts",
                        id,
                        retries + 1
                    );
                    return Err(SessionError::Unreachable {
                        id,
                        attempts: retries + 1,
                    });
                }
                if let Err(e) = self.retransmit(id) {
                    self.pending.remove(&id);
                    return Err(e);
                }
                continue;
            }

            if let Err(e) = self.receive(deadline - now) {
                self.pending.remove(&id);
                return Err(e);
            }
        }
    }

    /// Stops tracking `id`. Bytes already sent are not recalled;
    /// a late reply is discarded like any other stale reply.
    pub fn cancel(&mut self, id: TransactionId) -> bool {
        let cancelled = self.pending.remove(&id).is_some();
        if cancelled {
            log::debug!("Cancelled transaction {}", id);
        }
        cancelled
    }

    /// Submits any number of records, split into as many frames as the transport requires.
    ///
    /// Frames are submitted one after another and their replies concatenated in order.
    /// The first failing frame ends the batch; later frames are never sent.
    pub fn submit_all(&mut self, records: Vec<Record>) -> Result<Vec<Record>, BatchError> {
        let max_frame_len = self
            .max_frame_len()
            .map_err(|cause| BatchError { completed: 0, cause })?;
        let fragments =
            fragment(records, max_frame_len).map_err(|cause| BatchError { completed: 0, cause })?;
        if fragments.len() > 1 {
            log::debug!("Submitting batch as {} frames", fragments.len());
        }

        let mut replies = Vec::new();
        for fragment in fragments {
            match self.submit(fragment) {
                Ok(records) => replies.extend(records),
                Err(cause) => {
                    return Err(BatchError {
                        completed: replies.len(),
                        cause,
                    });
                }
            }
        }
        Ok(replies)
    }

    fn allocate_id(&mut self) -> Result<TransactionId, SessionError> {
        for _ in 0..=TransactionId::MAX as usize {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(SessionError::NoFreeIdentifier)
    }

    fn take_reply(&mut self, id: TransactionId) -> Vec<Record> {
        match self.pending.remove(&id).map(|t| t.state) {
            Some(TransactionState::Replied(frame)) => {
                log::debug!("Transaction {} completed", id);
                frame.into_records()
            }
            _ => Vec::new(),
        }
    }

    fn retransmit(&mut self, id: TransactionId) -> Result<(), SessionError> {
        let transaction = self
            .pending
            .get_mut(&id)
            .ok_or(SessionError::UnknownTransaction(id))?;
        transaction.retries += 1;
        let timeout = self.config.timeout_for_retry(transaction.retries);
        transaction.deadline = Instant::now() + timeout;
        log::debug!(
            "Retransmitting transaction {} (retry {}/{}), waiting {:?}",
            id,
            transaction.retries,
            self.config.max_retries,
            timeout
        );
        let bytes = transaction.bytes.clone();
        self.send(&bytes)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::Closed)?;
        match transport.send(bytes) {
            Ok(()) => Ok(()),
            // Treated as a lost request; the retry timer covers it.
            Err(TransportError::Timeout) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn receive(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::Closed)?;
        match transport.receive(timeout) {
            Ok(bytes) => {
                self.dispatch(&bytes);
                Ok(())
            }
            Err(TransportError::Timeout) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Matches an inbound frame against the pending table.
    fn dispatch(&mut self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Discarding undecodable frame: {}", e);
                log::trace!("Undecodable frame: {:02x?}", bytes);
                return;
            }
        };
        if !frame.is_reply() {
            log::warn!("Discarding request frame {} received from device", frame.id());
            return;
        }
        let Some(transaction) = self.pending.get_mut(&frame.id()) else {
            log::debug!("Discarding stale reply for transaction {}", frame.id());
            return;
        };
        if !matches!(transaction.state, TransactionState::Pending) {
            log::debug!("Discarding duplicate reply for transaction {}", frame.id());
            return;
        }
        if !reply_matches(&transaction.records, frame.records()) {
            log::warn!(
                "Discarding reply for transaction {} that does not match its request",
                frame.id()
            );
            return;
        }
        log::trace!("Transaction {} reply: {:02x?}", frame.id(), bytes);
        transaction.state = TransactionState::Replied(frame);
    }

    /// Tears down the transport after a fatal error and aborts everything pending.
    fn fail(&mut self, error: TransportError) -> SessionError {
        log::error!("Transport to {:?} failed: {}", self.target, error);
        self.close_transport();
        for (id, transaction) in self.pending.iter_mut() {
            if matches!(transaction.state, TransactionState::Pending) {
                log::debug!("Aborting transaction {}", id);
                transaction.state = TransactionState::Aborted;
            }
        }
        SessionError::Transport(error)
    }

    fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take()
            && let Err(e) = transport.close()
        {
            log::warn!("Error while closing transport: {}", e);
        }
    }
}

fn reply_matches(requests: &[Record], replies: &[Record]) -> bool {
    requests.len() == replies.len()
        && requests
            .iter()
            .zip(replies)
            .all(|(request, reply)| reply.answers(request))
}

/// Splits `records` into frames no longer than `max_frame_len`, keeping their order.
/// A record is sized for the larger of its request and reply form.
fn fragment(records: Vec<Record>, max_frame_len: usize) -> Result<Vec<Vec<Record>>, SessionError> {
    let mut fragments = Vec::new();
    let mut current = Vec::new();
    let mut current_len = FRAME_HEADER_LEN;
    for record in records {
        let record_len = record.max_wire_len();
        if FRAME_HEADER_LEN + record_len > max_frame_len {
            return Err(SessionError::FrameTooLarge {
                max: max_frame_len,
                got: FRAME_HEADER_LEN + record_len,
            });
        }
        if current_len + record_len > max_frame_len || current.len() == MAX_RECORDS {
            fragments.push(std::mem::take(&mut current));
            current_len = FRAME_HEADER_LEN;
        }
        current_len += record_len;
        current.push(record);
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    Ok(fragments)
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use etherbone_protocol::{Frame, Record, Width};
    use etherbone_server::MemoryBus;

    use super::{Session, fragment};
    use crate::config::Builder;
    use crate::error::SessionError;
    use crate::mock::{MockTarget, MockTransport};

    fn session(target: &MockTarget, base_timeout: Duration, max_retries: u32) -> Session<MockTransport> {
        let config = Builder::new()
            .base_timeout(base_timeout)
            .max_timeout(Duration::from_secs(1))
            .max_retries(max_retries)
            .build();
        Session::open(target.clone(), config).unwrap()
    }

    #[test]
    fn submit_returns_device_reply() {
        let target = MockTarget::with_device(MemoryBus::new());
        let mut session = session(&target, Duration::from_millis(50), 2);
        let replies = session
            .submit(vec![
                Record::write(0x100, Width::Word, 7u32.to_be_bytes()),
                Record::read(0x100, Width::Word),
            ])
            .unwrap();
        assert_eq!(replies[0], Record::write_ack(0x100, Width::Word));
        assert_eq!(replies[1].payload(), &7u32.to_be_bytes());
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn unreachable_after_exactly_max_retries() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(10), 3);

        let start = Instant::now();
        let result = session.submit(vec![Record::read(0, Width::Word)]);
        let elapsed = start.elapsed();

        assert!(matches!(
            result,
            Err(SessionError::Unreachable { attempts: 4, .. })
        ));
        // one initial send and three retransmissions
        assert_eq!(target.sent().len(), 4);
        // 10 + 20 + 40 + 80 ms
        assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn retransmissions_are_bit_identical() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(2), 2);
        let _ = session.submit(vec![
            Record::write(0x40, Width::Double, 1u64.to_be_bytes()),
            Record::read(0x48, Width::Byte),
        ]);

        let sent = target.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|bytes| *bytes == sent[0]));
    }

    #[test]
    fn lost_request_is_recovered_by_retry() {
        let target = MockTarget::with_device(MemoryBus::new());
        target.drop_sends(1);
        let mut session = session(&target, Duration::from_millis(10), 3);
        let replies = session.submit(vec![Record::read(0x8, Width::Half)]).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(target.sent().len(), 2);
    }

    #[test]
    fn identifiers_skip_pending_transactions() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(10), 0);

        let ids: Vec<u16> = (0..3)
            .map(|_| session.start(vec![Record::read(0, Width::Byte)]).unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        // Force the counter to wrap onto the pending identifiers
        session.next_id = u16::MAX;
        let wrapped = session.start(vec![Record::read(0, Width::Byte)]).unwrap();
        let after_wrap = session.start(vec![Record::read(0, Width::Byte)]).unwrap();
        assert_eq!(wrapped, u16::MAX);
        assert_eq!(after_wrap, 3);
        assert_eq!(session.pending_count(), 5);
    }

    #[test]
    fn only_the_awaited_transaction_is_retransmitted() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(10), 1);
        let first = session.start(vec![Record::read(0x0, Width::Byte)]).unwrap();
        let second = session.start(vec![Record::read(0x1, Width::Byte)]).unwrap();

        assert!(matches!(
            session.wait(first),
            Err(SessionError::Unreachable { attempts: 2, .. })
        ));
        // two initial sends, one retransmission of the awaited transaction
        assert_eq!(target.sent().len(), 3);

        assert!(matches!(
            session.wait(second),
            Err(SessionError::Unreachable { attempts: 2, .. })
        ));
        assert_eq!(target.sent().len(), 4);
    }

    #[test]
    fn stale_reply_does_not_touch_live_transactions() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(100), 0);
        let id = session.start(vec![Record::read(0x10, Width::Byte)]).unwrap();

        // Identifier nobody is waiting for, carrying a different value
        target.push_reply(Frame::reply(
            id.wrapping_add(100),
            vec![Record::read_data(0x10, Width::Byte, vec![0xee])],
        ));
        target.push_reply(Frame::reply(
            id,
            vec![Record::read_data(0x10, Width::Byte, vec![0x11])],
        ));

        let replies = session.wait(id).unwrap();
        assert_eq!(replies[0].payload(), &[0x11]);
    }

    #[test]
    fn mismatching_and_garbage_replies_are_discarded() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(100), 0);
        let id = session.start(vec![Record::read(0x10, Width::Half)]).unwrap();

        target.push_raw(vec![0xde, 0xad]);
        target.push_reply(Frame::reply(
            id,
            vec![Record::read_data(0x12, Width::Half, vec![0, 1])],
        ));
        target.push_reply(Frame::reply(
            id,
            vec![Record::read_data(0x10, Width::Half, vec![2, 3])],
        ));

        assert_eq!(session.wait(id).unwrap()[0].payload(), &[2, 3]);
    }

    #[test]
    fn replies_out_of_order_reach_their_transactions() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(100), 0);
        let first = session.start(vec![Record::read(0x0, Width::Byte)]).unwrap();
        let second = session.start(vec![Record::read(0x1, Width::Byte)]).unwrap();

        target.push_reply(Frame::reply(
            second,
            vec![Record::read_data(0x1, Width::Byte, vec![2])],
        ));
        target.push_reply(Frame::reply(
            first,
            vec![Record::read_data(0x0, Width::Byte, vec![1])],
        ));

        assert_eq!(session.wait(first).unwrap()[0].payload(), &[1]);
        assert_eq!(session.wait(second).unwrap()[0].payload(), &[2]);
    }

    #[test]
    fn cancelled_transaction_ignores_late_reply() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(20), 0);
        let cancelled = session.start(vec![Record::read(0x0, Width::Byte)]).unwrap();
        assert!(session.cancel(cancelled));
        assert!(!session.cancel(cancelled));

        target.push_reply(Frame::reply(
            cancelled,
            vec![Record::read_data(0x0, Width::Byte, vec![9])],
        ));
        let live = session.start(vec![Record::read(0x0, Width::Byte)]).unwrap();
        assert!(matches!(
            session.wait(live),
            Err(SessionError::Unreachable { .. })
        ));
        assert!(matches!(
            session.wait(cancelled),
            Err(SessionError::UnknownTransaction(id)) if id == cancelled
        ));
        // only the initial send, no retransmission after cancelling
        assert_eq!(target.sent().len(), 2);
    }

    #[test]
    fn transport_failure_aborts_every_pending_transaction() {
        let target = MockTarget::silent();
        let mut session = session(&target, Duration::from_millis(100), 0);
        let first = session.start(vec![Record::read(0x0, Width::Byte)]).unwrap();
        let second = session.start(vec![Record::read(0x1, Width::Byte)]).unwrap();

        target.fail_receive();
        assert!(matches!(session.wait(first), Err(SessionError::Transport(_))));
        assert!(!session.is_open());
        assert!(matches!(session.wait(second), Err(SessionError::Aborted(id)) if id == second));
        assert!(matches!(
            session.start(vec![Record::read(0x0, Width::Byte)]),
            Err(SessionError::Closed)
        ));

        target.heal();
        session.reopen().unwrap();
        assert!(session.is_open());
        assert_eq!(target.opens(), 2);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn oversized_single_record_is_rejected() {
        assert!(matches!(
            fragment(vec![Record::read(0, Width::Double)], 20),
            Err(SessionError::FrameTooLarge { max: 20, got: 26 })
        ));
    }

    #[test]
    fn fragments_respect_frame_limit_and_order() {
        let records: Vec<Record> = (0..10)
            .map(|i| Record::read(i * 4, Width::Word))
            .collect();
        // header 8 + 3 records of 14 bytes
        let fragments = fragment(records.clone(), 50).unwrap();
        assert_eq!(
            fragments.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 3, 3, 1]
        );
        assert_eq!(fragments.concat(), records);
    }

    #[test]
    fn submit_all_reassembles_in_order() {
        let mut bus = MemoryBus::new();
        for i in 0..6u64 {
            bus.store(0x1000 + i * 2, &(i as u16).to_be_bytes());
        }
        let target = MockTarget::with_device(bus);
        let config = Builder::new().max_frame_len(8 + 2 * 12).build();
        let mut session: Session<MockTransport> = Session::open(target.clone(), config).unwrap();

        let replies = session
            .submit_all(
                (0..6u64)
                    .map(|i| Record::read(0x1000 + i * 2, Width::Half))
                    .collect(),
            )
            .unwrap();
        let values: Vec<u16> = replies
            .iter()
            .map(|r| u16::from_be_bytes([r.payload()[0], r.payload()[1]]))
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(target.sent().len(), 3);
    }

    #[test]
    fn submit_all_stops_at_first_failure() {
        let target = MockTarget::with_device(MemoryBus::new());
        target.fail_send_at(2);
        let config = Builder::new()
            .max_frame_len(8 + 12)
            .base_timeout(Duration::from_millis(50))
            .build();
        let mut session: Session<MockTransport> = Session::open(target.clone(), config).unwrap();

        let error = session
            .submit_all((0..4).map(|i| Record::read(i * 2, Width::Half)).collect())
            .unwrap_err();
        assert_eq!(error.completed, 1);
        assert!(matches!(error.cause, SessionError::Transport(_)));
        assert_eq!(target.sent().len(), 1);
    }
}
