//! Serial transaction queue for a shared, half-duplex byte channel.
//!
//! This module implements the ordering and failure core of the bus engine
//! without any I/O of its own: the queue owns a single transmit function and
//! is fed inbound bytes by the caller. All state transitions happen inside
//! [`TransactionQueue::process_operations`] and
//! [`TransactionQueue::accept_inbound_bytes`], which are only ever invoked
//! from one logical flow, so no locking is involved anywhere.
//!
//! Forward progress is event-driven: `process_operations` *returns* (never
//! blocks) as soon as it hits an in-sequence transaction that cannot proceed,
//! and resumes when the caller pokes the queue again - on enqueue, on inbound
//! bytes, or on a periodic tick. Timeouts are checked lazily against a clock
//! snapshot taken at the start of each pass; without a periodic tick they are
//! only detected the next time something else touches the queue.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default deadline for receive transactions. Waiting forever on a silent
/// bus is a bug, not a valid state.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Completion callback of a [`Transaction`].
///
/// Fires exactly once per transaction, with `Ok(bytes)` on success (empty for
/// pure sends) or the failure that ended it. The queue passes itself in so a
/// callback can enqueue follow-up transactions; it must not call
/// `process_operations` itself.
pub type CompletionFn = Box<dyn FnOnce(&mut TransactionQueue, Result<Vec<u8>>)>;

/// The transmit function shared by all transactions of one queue. Returns the
/// number of bytes the underlying channel accepted.
pub type TransmitFn = Box<dyn FnMut(&[u8]) -> Result<usize>>;

enum Payload {
    /// Transmit the bytes once on initiation.
    Send { data: Vec<u8> },
    /// Collect `expected` inbound bytes, then complete.
    Receive { buf: Vec<u8>, expected: usize },
    /// Transmit, then splice a receive for `expected` bytes into the queue,
    /// carrying the original completion callback.
    SendThenReceive { data: Vec<u8>, expected: usize },
}

/// A unit of bus work: transmit bytes, receive bytes, or both in sequence.
pub struct Transaction {
    payload: Payload,
    initiated: bool,
    timeout: Duration,
    times_out_at: Option<Instant>,
    initiation_delay: Duration,
    initiates_not_before: Option<Instant>,
    in_sequence: bool,
    completion: Option<CompletionFn>,
}

impl Transaction {
    fn new(payload: Payload, timeout: Duration) -> Self {
        Transaction {
            payload,
            initiated: false,
            timeout,
            times_out_at: None,
            initiation_delay: Duration::ZERO,
            initiates_not_before: None,
            in_sequence: true,
            completion: None,
        }
    }

    /// A pure send with no timeout: it completes as soon as it is initiated.
    pub fn send(data: Vec<u8>) -> Self {
        Self::new(Payload::Send { data }, Duration::ZERO)
    }

    /// A pure receive for `expected` bytes, with the default receive timeout.
    pub fn receive(expected: usize) -> Self {
        Self::new(
            Payload::Receive {
                buf: Vec::with_capacity(expected),
                expected,
            },
            DEFAULT_RECEIVE_TIMEOUT,
        )
    }

    /// A send followed by a receive for `expected` bytes. The timeout applies
    /// to the receive part.
    pub fn send_then_receive(data: Vec<u8>, expected: usize) -> Self {
        Self::new(
            Payload::SendThenReceive { data, expected },
            DEFAULT_RECEIVE_TIMEOUT,
        )
    }

    /// Replace the completion deadline. Zero disables the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay initiation by `delay`, measured from the first time the queue
    /// considers the transaction for initiation (not from enqueue time).
    pub fn with_initiation_delay(mut self, delay: Duration) -> Self {
        self.initiation_delay = delay;
        self.initiates_not_before = None;
        self
    }

    /// Allow this transaction to be initiated and completed ahead of an
    /// earlier, still-blocked in-sequence transaction. Two out-of-sequence
    /// transactions are still never reordered relative to each other.
    pub fn out_of_sequence(mut self) -> Self {
        self.in_sequence = false;
        self
    }

    /// Attach the completion callback.
    pub fn on_completion(
        mut self,
        f: impl FnOnce(&mut TransactionQueue, Result<Vec<u8>>) + 'static,
    ) -> Self {
        self.completion = Some(Box::new(f));
        self
    }

    pub fn is_in_sequence(&self) -> bool {
        self.in_sequence
    }

    /// Check whether the transaction may be initiated now.
    ///
    /// The first call latches the initiation deadline from the configured
    /// delay and consumes the delay; subsequent calls never re-latch or
    /// extend it.
    fn can_initiate(&mut self, now: Instant) -> bool {
        if self.initiation_delay > Duration::ZERO {
            if self.initiates_not_before.is_none() {
                self.initiates_not_before = Some(now + self.initiation_delay);
            }
            self.initiation_delay = Duration::ZERO;
        }
        match self.initiates_not_before {
            None => true,
            Some(t) => t <= now,
        }
    }

    /// Try to initiate: transmit for send-type transactions, arm the timeout.
    /// `Ok(false)` means the initiation delay has not elapsed yet.
    fn initiate(&mut self, now: Instant, transmitter: &mut TransmitFn) -> Result<bool> {
        if !self.can_initiate(now) {
            return Ok(false);
        }
        match &mut self.payload {
            Payload::Send { data } | Payload::SendThenReceive { data, .. } => {
                let data = std::mem::take(data);
                let written = transmitter(&data)?;
                if written != data.len() {
                    return Err(Error::TransmitFailure {
                        written,
                        len: data.len(),
                    });
                }
            }
            Payload::Receive { .. } => {}
        }
        self.initiated = true;
        if self.timeout > Duration::ZERO {
            self.times_out_at = Some(now + self.timeout);
        }
        Ok(true)
    }

    fn timed_out_at(&self, now: Instant) -> bool {
        matches!(self.times_out_at, Some(t) if now >= t)
    }

    /// Offer inbound bytes; returns how many were consumed. Only an initiated
    /// receive consumes anything.
    fn accept_bytes(&mut self, bytes: &[u8]) -> usize {
        if !self.initiated {
            return 0;
        }
        match &mut self.payload {
            Payload::Receive { buf, expected } => {
                let n = bytes.len().min(*expected);
                buf.extend_from_slice(&bytes[..n]);
                *expected -= n;
                n
            }
            _ => 0,
        }
    }

    fn has_completed(&self) -> bool {
        match &self.payload {
            Payload::Receive { expected, .. } => *expected == 0,
            _ => true,
        }
    }

    /// Complete successfully. For a send-then-receive this returns the
    /// successor receive transaction, pre-loaded with the original completion
    /// callback, to be spliced into the vacated queue position; the callback
    /// therefore cannot fire twice.
    fn finalize(mut self, queue: &mut TransactionQueue) -> Option<Transaction> {
        let completion = self.completion.take();
        match self.payload {
            Payload::SendThenReceive { expected, .. } => {
                let mut rx = Transaction::receive(expected);
                if self.timeout > Duration::ZERO {
                    rx.timeout = self.timeout;
                }
                rx.in_sequence = self.in_sequence;
                rx.completion = completion;
                Some(rx)
            }
            Payload::Send { .. } => {
                if let Some(cb) = completion {
                    cb(queue, Ok(Vec::new()));
                }
                None
            }
            Payload::Receive { buf, .. } => {
                if let Some(cb) = completion {
                    cb(queue, Ok(buf));
                }
                None
            }
        }
    }

    /// Complete with a failure. Consumes the transaction, so the callback
    /// cannot fire again afterwards.
    fn abort(mut self, queue: &mut TransactionQueue, error: Error) {
        if let Some(cb) = self.completion.take() {
            cb(queue, Err(error));
        }
    }
}

/// Orders and drives [`Transaction`]s over one shared transmit function and
/// one shared inbound byte stream.
///
/// At most one transaction is being initiated at any time; the transmit
/// function is invoked only from within [`process_operations`], only for that
/// transaction. This is the sole mechanism keeping two transactions from
/// writing to the shared bus concurrently.
///
/// [`process_operations`]: TransactionQueue::process_operations
pub struct TransactionQueue {
    queue: Vec<Transaction>,
    transmitter: TransmitFn,
    processing: bool,
}

impl TransactionQueue {
    pub fn new(transmitter: impl FnMut(&[u8]) -> Result<usize> + 'static) -> Self {
        TransactionQueue {
            queue: Vec::new(),
            transmitter: Box::new(transmitter),
            processing: false,
        }
    }

    /// Append a transaction. Does not process; callers poke the queue with
    /// [`process_operations`](Self::process_operations) after enqueuing so
    /// that completion callbacks can enqueue follow-ups without re-entering
    /// the scan.
    pub fn enqueue(&mut self, transaction: Transaction) {
        self.queue.push(transaction);
    }

    /// Append a transaction and process the queue. This is the normal entry
    /// point from outside the engine.
    pub fn submit(&mut self, transaction: Transaction) {
        self.enqueue(transaction);
        self.process_operations();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The earliest deadline of any initiated transaction, usable by the
    /// driver to size its poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().filter_map(|t| t.times_out_at).min()
    }

    /// Feed raw inbound bytes to the queue; returns how many were consumed.
    ///
    /// Runs a processing pass first (something already queued may have become
    /// completable), then offers the remaining buffer to every queued
    /// transaction in submission order, advancing past whatever each one
    /// consumes, then processes once more since newly delivered bytes may
    /// have completed the head transaction. Bytes nobody claims are
    /// discarded.
    pub fn accept_inbound_bytes(&mut self, bytes: &[u8]) -> usize {
        self.process_operations();
        let mut remaining = bytes;
        let mut accepted = 0;
        let mut idx = 0;
        while idx < self.queue.len() && !remaining.is_empty() {
            let n = self.queue[idx].accept_bytes(remaining);
            remaining = &remaining[n..];
            accepted += n;
            idx += 1;
        }
        if !remaining.is_empty() {
            // TODO: resynchronization could hand these to an "unexpected
            // receive" hook instead of dropping them
            tracing::debug!(count = remaining.len(), "discarding unclaimed inbound bytes");
        }
        self.process_operations();
        accepted
    }

    /// Abort and remove every queued transaction, delivering `error` to each
    /// completion callback.
    pub fn abort_all(&mut self, error: Error) {
        for transaction in std::mem::take(&mut self.queue) {
            transaction.abort(self, error.clone());
        }
    }

    /// Drive the queue to a fixed point.
    ///
    /// Repeats scanning from the head until a full pass produces no mutation:
    ///
    /// 1. a transaction past its deadline is removed and aborted with
    ///    [`Error::Timeout`], and the scan restarts;
    /// 2. an uninitiated transaction is initiated if its delay has elapsed;
    ///    if it refuses and is in-sequence, the scan stops entirely (nothing
    ///    may be initiated out of turn ahead of a blocked sequential item);
    /// 3. an initiated, complete transaction is removed and finalized; a
    ///    successor it produces is spliced into the vacated position, and the
    ///    scan restarts;
    /// 4. an initiated, incomplete in-sequence transaction stops the scan;
    ///    out-of-sequence transactions are skipped over instead.
    pub fn process_operations(&mut self) {
        if self.processing {
            // invoked from within a completion callback; the running scan
            // restarts from the head after every mutation anyway
            return;
        }
        self.processing = true;
        let now = Instant::now();
        'scan: loop {
            let mut idx = 0;
            while idx < self.queue.len() {
                if self.queue[idx].timed_out_at(now) {
                    let transaction = self.queue.remove(idx);
                    transaction.abort(self, Error::Timeout);
                    continue 'scan;
                }
                if !self.queue[idx].initiated {
                    let op = &mut self.queue[idx];
                    match op.initiate(now, &mut self.transmitter) {
                        Ok(true) => {}
                        Ok(false) => {
                            if self.queue[idx].in_sequence {
                                break 'scan;
                            }
                            idx += 1;
                            continue;
                        }
                        Err(e) => {
                            let transaction = self.queue.remove(idx);
                            transaction.abort(self, e);
                            continue 'scan;
                        }
                    }
                }
                if self.queue[idx].has_completed() {
                    let transaction = self.queue.remove(idx);
                    let successor = transaction.finalize(self);
                    if let Some(successor) = successor {
                        let at = idx.min(self.queue.len());
                        self.queue.insert(at, successor);
                    }
                    continue 'scan;
                }
                if self.queue[idx].in_sequence {
                    break 'scan;
                }
                idx += 1;
            }
            break;
        }
        self.processing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    fn collecting_queue() -> (TransactionQueue, Rc<RefCell<Vec<Vec<u8>>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let sink = sent.clone();
        let queue = TransactionQueue::new(move |bytes: &[u8]| {
            sink.borrow_mut().push(bytes.to_vec());
            Ok(bytes.len())
        });
        (queue, sent)
    }

    #[test]
    fn send_completes_immediately() {
        let (mut queue, sent) = collecting_queue();
        let done = Rc::new(RefCell::new(None));
        let flag = done.clone();
        queue.submit(
            Transaction::send(vec![1, 2, 3]).on_completion(move |_, res| {
                *flag.borrow_mut() = Some(res);
            }),
        );
        assert_eq!(sent.borrow().as_slice(), &[vec![1, 2, 3]]);
        assert!(matches!(&*done.borrow(), Some(Ok(b)) if b.is_empty()));
        assert!(queue.is_empty());
    }

    #[test]
    fn receive_completes_on_expected_bytes_in_any_chunking() {
        for chunks in [vec![vec![0xAAu8, 0xBB]], vec![vec![0xAA], vec![0xBB]]] {
            let (mut queue, _) = collecting_queue();
            let done = Rc::new(RefCell::new(None));
            let flag = done.clone();
            queue.submit(Transaction::receive(2).on_completion(move |_, res| {
                *flag.borrow_mut() = Some(res);
            }));
            for chunk in chunks {
                assert!(done.borrow().is_none());
                queue.accept_inbound_bytes(&chunk);
            }
            assert_eq!(*done.borrow(), Some(Ok(vec![0xAA, 0xBB])));
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn send_then_receive_chunked_delivery_fires_once() {
        let (mut queue, sent) = collecting_queue();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        queue.submit(
            Transaction::send_then_receive(vec![0x32, 0x01, 0x91], 2).on_completion(
                move |_, res| {
                    sink.borrow_mut().push(res);
                },
            ),
        );
        assert_eq!(sent.borrow().len(), 1);
        queue.accept_inbound_bytes(&[0x2D]);
        assert!(calls.borrow().is_empty());
        queue.accept_inbound_bytes(&[0xFF]);
        assert_eq!(calls.borrow().as_slice(), &[Ok(vec![0x2D, 0xFF])]);
        assert!(queue.is_empty());
    }

    #[test]
    fn timeout_aborts_exactly_once_and_removes() {
        let (mut queue, _) = collecting_queue();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        queue.submit(
            Transaction::receive(1)
                .with_timeout(Duration::from_millis(10))
                .on_completion(move |_, res| {
                    sink.borrow_mut().push(res);
                }),
        );
        thread::sleep(Duration::from_millis(20));
        queue.process_operations();
        queue.process_operations();
        assert_eq!(calls.borrow().as_slice(), &[Err(Error::Timeout)]);
        assert!(queue.is_empty());
        // late bytes for the timed-out transaction are discarded, not
        // delivered to a second callback invocation
        queue.accept_inbound_bytes(&[0x00]);
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn blocked_in_sequence_head_blocks_everything_behind_it() {
        let (mut queue, sent) = collecting_queue();
        let order = Rc::new(RefCell::new(Vec::new()));
        let (a, b, c) = (order.clone(), order.clone(), order.clone());
        queue.enqueue(Transaction::receive(1).on_completion(move |_, _| {
            a.borrow_mut().push("A");
        }));
        queue.enqueue(Transaction::send(vec![0xB0]).on_completion(move |_, _| {
            b.borrow_mut().push("B");
        }));
        queue.enqueue(
            Transaction::send(vec![0xC0])
                .out_of_sequence()
                .on_completion(move |_, _| {
                    c.borrow_mut().push("C");
                }),
        );
        queue.process_operations();
        // nothing may be initiated out of turn behind the sequential head
        assert!(order.borrow().is_empty());
        assert!(sent.borrow().is_empty());
        queue.accept_inbound_bytes(&[0x01]);
        assert_eq!(order.borrow().as_slice(), &["A", "B", "C"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn blocked_out_of_sequence_head_is_overtaken() {
        let (mut queue, sent) = collecting_queue();
        let order = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        queue.enqueue(
            Transaction::receive(1)
                .out_of_sequence()
                .on_completion(move |_, _| {
                    a.borrow_mut().push("A");
                }),
        );
        queue.enqueue(Transaction::send(vec![0xB0]).on_completion(move |_, _| {
            b.borrow_mut().push("B");
        }));
        queue.process_operations();
        // the later send completed ahead of the still-waiting receive
        assert_eq!(order.borrow().as_slice(), &["B"]);
        assert_eq!(sent.borrow().as_slice(), &[vec![0xB0]]);
        queue.accept_inbound_bytes(&[0x01]);
        assert_eq!(order.borrow().as_slice(), &["B", "A"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn out_of_sequence_receives_keep_relative_order() {
        let (mut queue, _) = collecting_queue();
        let order = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        queue.enqueue(
            Transaction::receive(1)
                .out_of_sequence()
                .on_completion(move |_, res| {
                    a.borrow_mut().push(("A", res));
                }),
        );
        queue.enqueue(
            Transaction::receive(1)
                .out_of_sequence()
                .on_completion(move |_, res| {
                    b.borrow_mut().push(("B", res));
                }),
        );
        queue.process_operations();
        // bytes are offered in submission order, so the earlier receive
        // always fills first
        queue.accept_inbound_bytes(&[0x11, 0x22]);
        assert_eq!(
            order.borrow().as_slice(),
            &[("A", Ok(vec![0x11])), ("B", Ok(vec![0x22]))]
        );
    }

    #[test]
    fn initiation_delay_latches_once() {
        let mut t = Transaction::send(vec![0]).with_initiation_delay(Duration::from_millis(50));
        let now = Instant::now();
        assert!(!t.can_initiate(now));
        let deadline = t.initiates_not_before;
        assert!(deadline.is_some());
        // a second check with no elapsed time must not reset or extend it
        assert!(!t.can_initiate(now));
        assert_eq!(t.initiates_not_before, deadline);
        assert!(t.can_initiate(deadline.unwrap()));
    }

    #[test]
    fn delayed_transaction_holds_the_line() {
        let (mut queue, sent) = collecting_queue();
        queue.enqueue(
            Transaction::send(vec![0x01]).with_initiation_delay(Duration::from_millis(30)),
        );
        queue.enqueue(Transaction::send(vec![0x02]));
        queue.process_operations();
        // head-of-line blocking: nothing is initiated out of turn
        assert!(sent.borrow().is_empty());
        thread::sleep(Duration::from_millis(40));
        queue.process_operations();
        assert_eq!(sent.borrow().as_slice(), &[vec![0x01], vec![0x02]]);
    }

    #[test]
    fn transmit_failure_surfaces_to_the_caller() {
        let mut queue = TransactionQueue::new(|bytes: &[u8]| Ok(bytes.len() - 1));
        let done = Rc::new(RefCell::new(None));
        let flag = done.clone();
        queue.submit(Transaction::send(vec![1, 2, 3]).on_completion(move |_, res| {
            *flag.borrow_mut() = Some(res);
        }));
        assert_eq!(
            *done.borrow(),
            Some(Err(Error::TransmitFailure { written: 2, len: 3 }))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn abort_all_delivers_to_every_callback() {
        let (mut queue, _) = collecting_queue();
        let calls = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let n = calls.clone();
            queue.enqueue(Transaction::receive(1).on_completion(move |_, res| {
                assert_eq!(res, Err(Error::Aborted));
                *n.borrow_mut() += 1;
            }));
        }
        queue.abort_all(Error::Aborted);
        assert_eq!(*calls.borrow(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn completion_callback_may_enqueue_follow_up() {
        let (mut queue, sent) = collecting_queue();
        queue.submit(Transaction::send(vec![0x01]).on_completion(|q, _| {
            q.enqueue(Transaction::send(vec![0x02]));
        }));
        assert_eq!(sent.borrow().as_slice(), &[vec![0x01], vec![0x02]]);
        assert!(queue.is_empty());
    }
}
