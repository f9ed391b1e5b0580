//! I/O-free core of the bus engine.
//!
//! This module contains the transaction queue and the pure protocol
//! functions, independent of any actual transport. The design allows:
//!
//! - Testing ordering, timeout and framing logic without real hardware
//! - Flexibility in the I/O driver (TCP bridge, unix socket, test doubles)
//! - Runtime-agnostic, single-threaded operation without locks
//!
//! # Architecture
//!
//! The queue is fed by the surrounding driver:
//!
//! - [`TransactionQueue::submit`]: queue a transaction and process
//! - [`TransactionQueue::accept_inbound_bytes`]: feed bytes read from the
//!   bridge
//! - [`TransactionQueue::process_operations`]: periodic tick so lazy
//!   timeouts are detected
//!
//! Transmission happens through the single transmit function the queue owns;
//! completion is reported through each transaction's one-shot callback.

pub mod protocol;
pub mod queue;
pub mod types;

pub use queue::{Transaction, TransactionQueue, DEFAULT_RECEIVE_TIMEOUT};
pub use types::{ProbeStatus, QueryOutcome, ScanResult};
