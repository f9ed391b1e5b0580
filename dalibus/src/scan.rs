//! Bus scanning: address probing and full discovery.
//!
//! The quick scan probes every short address with QUERY_CONTROL_GEAR and
//! classifies each from the three-valued query outcome. The full scan runs
//! the standard binary search over the 24-bit random address space
//! (INITIALISE / RANDOMISE / SEARCHADDR / COMPARE / WITHDRAW), assigning a
//! free short address to every device that has none or shares one.

use std::time::Duration;

use crate::comm::{
    self, DaliComm, ProbeCallback, ProcedureToken, ScanCallback, PROBE_RESPONSE_TIMEOUT,
};
use crate::defs::{opcode, special, SHORT_ADDRESS_COUNT};
use crate::error::Error;
use crate::sansio::types::{ProbeStatus, QueryOutcome, ScanResult};
use crate::sansio::TransactionQueue;
use crate::DaliAddress;

const SEARCH_SPACE_MAX: u32 = 0xFF_FFFF;

/// Settle time after RANDOMISE before the first COMPARE.
const RANDOMISE_SETTLE: Duration = Duration::from_millis(100);

/// Diagnostic probe of all short addresses, one classification character per
/// address. Bridge-level failures mark the address and the sweep continues.
pub(crate) fn probe_scan(comm: &mut DaliComm, cb: ProbeCallback) {
    probe_step(comm.queue_mut(), 0, String::with_capacity(64), cb);
    comm.process();
}

fn probe_step(queue: &mut TransactionQueue, addr: u8, mut acc: String, cb: ProbeCallback) {
    if addr >= SHORT_ADDRESS_COUNT {
        return cb(queue, Ok(acc));
    }
    comm::query_on(
        queue,
        DaliAddress::Short(addr),
        u16::from(opcode::QUERY_CONTROL_GEAR),
        PROBE_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| {
            let status = match res {
                Ok(QueryOutcome::Answer(0xFF)) => ProbeStatus::Present,
                Ok(QueryOutcome::Answer(_)) | Ok(QueryOutcome::Collision) => ProbeStatus::Conflict,
                Ok(QueryOutcome::NoAnswer) => ProbeStatus::Silent,
                Err(e) => {
                    tracing::warn!(short_address = addr, error = %e, "probe failed");
                    ProbeStatus::Error
                }
            };
            acc.push(status.as_char());
            probe_step(q, addr + 1, acc, cb);
        }),
    );
}

/// Probe every short address and split the answers into reliable and
/// uncertain ones.
pub(crate) fn quick_scan(comm: &mut DaliComm, cb: ScanCallback) {
    let token = match comm.begin_procedure() {
        Ok(token) => token,
        Err(e) => {
            cb(comm.queue_mut(), Err(e));
            comm.process();
            return;
        }
    };
    quick_step(
        comm.queue_mut(),
        0,
        ScanResult::default(),
        Box::new(move |q, res| {
            drop(token);
            cb(q, res)
        }),
    );
    comm.process();
}

fn quick_step(queue: &mut TransactionQueue, addr: u8, mut acc: ScanResult, cb: ScanCallback) {
    if addr >= SHORT_ADDRESS_COUNT {
        tracing::info!(
            reliable = acc.reliable.len(),
            unreliable = acc.unreliable.len(),
            "quick bus scan finished"
        );
        return cb(queue, Ok(acc));
    }
    comm::query_on(
        queue,
        DaliAddress::Short(addr),
        u16::from(opcode::QUERY_CONTROL_GEAR),
        PROBE_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| {
            match res {
                Ok(QueryOutcome::Answer(0xFF)) => acc.reliable.push(addr),
                Ok(QueryOutcome::Answer(other)) => {
                    tracing::warn!(short_address = addr, answer = other, "garbled scan answer");
                    acc.unreliable.push(addr);
                }
                Ok(QueryOutcome::Collision) => {
                    tracing::warn!(short_address = addr, "collision during scan");
                    acc.unreliable.push(addr);
                }
                Ok(QueryOutcome::NoAnswer) => {}
                Err(e) => return cb(q, Err(e)),
            }
            quick_step(q, addr + 1, acc, cb);
        }),
    );
}

struct FullScan {
    token: ProcedureToken,
    used: u64,
    result: ScanResult,
    min: u32,
    max: u32,
    restarts: u8,
    cb: ScanCallback,
}

/// Full discovery. With `quick_when_clean`, the cheap probe pass is used as
/// long as it finds devices and no collisions; otherwise (or when it finds
/// trouble) the binary search runs, reprogramming short addresses as needed.
pub(crate) fn full_scan(comm: &mut DaliComm, quick_when_clean: bool, cb: ScanCallback) {
    let token = match comm.begin_procedure() {
        Ok(token) => token,
        Err(e) => {
            cb(comm.queue_mut(), Err(e));
            comm.process();
            return;
        }
    };
    let queue = comm.queue_mut();
    if quick_when_clean {
        quick_step(
            queue,
            0,
            ScanResult::default(),
            Box::new(move |q, res| match res {
                Ok(result) if !result.reliable.is_empty() && result.unreliable.is_empty() => {
                    drop(token);
                    cb(q, Ok(result))
                }
                Ok(result) => {
                    tracing::info!(
                        found = result.reliable.len(),
                        collisions = result.unreliable.len(),
                        "quick scan insufficient, running full binary search"
                    );
                    full_scan_start(q, token, cb)
                }
                Err(e) => {
                    drop(token);
                    cb(q, Err(e))
                }
            }),
        );
    } else {
        full_scan_start(queue, token, cb);
    }
    comm.process();
}

fn full_scan_start(queue: &mut TransactionQueue, token: ProcedureToken, cb: ScanCallback) {
    // wake every device up for the search, then scatter the random addresses
    comm::send_twice_on(queue, special::INITIALISE, 0x00, None, None);
    comm::send_twice_on(queue, special::RANDOMISE, 0x00, None, None);
    let state = FullScan {
        token,
        used: 0,
        result: ScanResult::default(),
        min: 0,
        max: SEARCH_SPACE_MAX,
        restarts: 0,
        cb,
    };
    round_start(queue, state, Some(RANDOMISE_SETTLE));
}

fn set_search_address(queue: &mut TransactionQueue, value: u32) {
    comm::send_on(queue, special::SEARCHADDRH, (value >> 16) as u8, None);
    comm::send_on(queue, special::SEARCHADDRM, (value >> 8) as u8, None);
    comm::send_on(queue, special::SEARCHADDRL, value as u8, None);
}

fn compare(
    queue: &mut TransactionQueue,
    delay: Option<Duration>,
    cb: impl FnOnce(&mut TransactionQueue, crate::error::Result<bool>) + 'static,
) {
    comm::raw_query_on(
        queue,
        special::COMPARE,
        0x00,
        PROBE_RESPONSE_TIMEOUT,
        delay,
        // a collision on COMPARE means several devices matched, which is
        // still a YES
        Box::new(move |q, res| cb(q, res.map(|outcome| outcome.is_yes(true)))),
    );
}

/// One search round finds the unwithdrawn device with the lowest random
/// address, or ends the scan when none answer the full-range compare.
fn round_start(queue: &mut TransactionQueue, mut state: FullScan, delay: Option<Duration>) {
    state.min = 0;
    state.max = SEARCH_SPACE_MAX;
    set_search_address(queue, SEARCH_SPACE_MAX);
    compare(queue, delay, move |q, res| match res {
        Ok(true) => binary_step(q, state),
        Ok(false) => finish(q, state),
        Err(e) => fail(q, state, e),
    });
}

fn binary_step(queue: &mut TransactionQueue, mut state: FullScan) {
    if state.min == state.max {
        return found_device(queue, state);
    }
    let probe = state.min + (state.max - state.min) / 2;
    set_search_address(queue, probe);
    compare(queue, None, move |q, res| match res {
        Ok(true) => {
            state.max = probe;
            binary_step(q, state)
        }
        Ok(false) => {
            state.min = probe + 1;
            binary_step(q, state)
        }
        Err(e) => fail(q, state, e),
    });
}

fn found_device(queue: &mut TransactionQueue, mut state: FullScan) {
    let random_address = state.min;
    tracing::debug!(random_address, "isolated device");
    set_search_address(queue, random_address);
    comm::raw_query_on(
        queue,
        special::QUERY_SHORT_ADDRESS,
        0x00,
        PROBE_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| match res {
            Ok(QueryOutcome::Answer(byte)) => {
                let existing = match byte {
                    0xFF => None,
                    b if b & 0x81 == 0x01 => Some((b >> 1) & 0x3F),
                    b => {
                        tracing::warn!(answer = b, "malformed short address answer");
                        None
                    }
                };
                match existing {
                    Some(addr) if state.used & (1u64 << addr) == 0 => {
                        state.used |= 1u64 << addr;
                        state.result.reliable.push(addr);
                        withdraw_and_continue(q, state);
                    }
                    existing => {
                        if let Some(addr) = existing {
                            tracing::warn!(
                                short_address = addr,
                                "short address already claimed, reassigning"
                            );
                        }
                        assign_short_address(q, state);
                    }
                }
            }
            Ok(QueryOutcome::NoAnswer) => {
                // the isolated device went away; note nothing and move on
                tracing::warn!(random_address, "isolated device stopped answering");
                withdraw_and_continue(q, state);
            }
            Ok(QueryOutcome::Collision) => {
                // two devices share one random address; withdraw both and
                // let the rest of the search proceed
                tracing::warn!(random_address, "random address collision, withdrawing pair");
                state.restarts += 1;
                if state.restarts > 8 {
                    return fail(q, state, Error::DeviceSearchFailed);
                }
                withdraw_and_continue(q, state);
            }
            Err(e) => fail(q, state, e),
        }),
    );
}

fn assign_short_address(queue: &mut TransactionQueue, mut state: FullScan) {
    let free = (0..SHORT_ADDRESS_COUNT).find(|a| state.used & (1u64 << a) == 0);
    let Some(addr) = free else {
        return fail(queue, state, Error::AddressesMissing);
    };
    let address_byte = (addr << 1) | 0x01;
    comm::send_on(queue, special::PROGRAM_SHORT_ADDRESS, address_byte, None);
    comm::raw_query_on(
        queue,
        special::VERIFY_SHORT_ADDRESS,
        address_byte,
        PROBE_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| match res {
            Ok(outcome) => {
                if outcome.is_yes(false) {
                    tracing::info!(short_address = addr, "assigned free short address");
                    state.used |= 1u64 << addr;
                    state.result.reliable.push(addr);
                } else {
                    tracing::error!(short_address = addr, "short address verify failed");
                    state.result.unreliable.push(addr);
                }
                withdraw_and_continue(q, state);
            }
            Err(e) => fail(q, state, e),
        }),
    );
}

fn withdraw_and_continue(queue: &mut TransactionQueue, state: FullScan) {
    comm::send_on(queue, special::WITHDRAW, 0x00, None);
    round_start(queue, state, None);
}

fn finish(queue: &mut TransactionQueue, mut state: FullScan) {
    comm::send_on(queue, special::TERMINATE, 0x00, None);
    state.result.reliable.sort_unstable();
    state.result.unreliable.sort_unstable();
    tracing::info!(
        reliable = state.result.reliable.len(),
        unreliable = state.result.unreliable.len(),
        "full bus scan finished"
    );
    let FullScan { token, result, cb, .. } = state;
    drop(token);
    cb(queue, Ok(result));
}

fn fail(queue: &mut TransactionQueue, state: FullScan, error: Error) {
    comm::send_on(queue, special::TERMINATE, 0x00, None);
    tracing::error!(error = %error, "full bus scan failed");
    let FullScan { token, cb, .. } = state;
    drop(token);
    cb(queue, Err(error));
}
