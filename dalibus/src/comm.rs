//! Bus protocol operations on top of the transaction queue.
//!
//! Every logical operation (addressed command, paired query, config
//! double-send, identity read) is one or a small fixed chain of transactions.
//! Chain continuations receive the queue back from the completion callback
//! and enqueue the next step from there; they never call
//! `process_operations` themselves, the running scan picks new work up after
//! every mutation.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::config::BusConfig;
use crate::connection::BridgeConnection;
use crate::defs::{bridge, opcode, special};
use crate::device::{self, DaliDeviceInfo, DevInfStatus, DeviceNameLookup};
use crate::error::{Error, Result};
use crate::sansio::protocol::{
    arc_power_byte, bridge_request, classify_query, classify_status, command_byte,
};
use crate::sansio::{QueryOutcome, ScanResult, Transaction, TransactionQueue};
use crate::DaliAddress;

/// Default deadline for a single bridge read.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Shorter deadline used while sweeping addresses during scans.
pub const PROBE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Gap between the two transmissions of a configuration command; together
/// with the frame time this stays well inside the 100 ms double-send window.
const CONFIG_RESEND_GAP: Duration = Duration::from_millis(15);

/// Upper bound on one memory bank readout (the offset register is 8 bits).
const MAX_BANK_READ: usize = 0x100;

pub type StatusCallback = Box<dyn FnOnce(&mut TransactionQueue, Result<()>)>;
pub type QueryCallback = Box<dyn FnOnce(&mut TransactionQueue, Result<QueryOutcome>)>;
pub type Value16Callback = Box<dyn FnOnce(&mut TransactionQueue, Result<u16>)>;
pub type BytesCallback = Box<dyn FnOnce(&mut TransactionQueue, Result<Vec<u8>>)>;
pub type InfoCallback = Box<dyn FnOnce(&mut TransactionQueue, Result<DaliDeviceInfo>)>;
pub type ScanCallback = Box<dyn FnOnce(&mut TransactionQueue, Result<ScanResult>)>;
pub type ProbeCallback = Box<dyn FnOnce(&mut TransactionQueue, Result<String>)>;

/// Context consulted when classifying identity reads.
#[derive(Clone)]
pub struct IdentityContext {
    pub legacy_compat: bool,
    pub bus_instance: String,
    pub names: Option<Rc<dyn DeviceNameLookup>>,
}

fn default_status_cb() -> StatusCallback {
    Box::new(|_, res| {
        if let Err(e) = res {
            tracing::warn!(error = %e, "bus command failed");
        }
    })
}

/// Send a bridge request and hand the raw 2-byte bridge response to `cb`.
fn bridge_exchange_on(
    queue: &mut TransactionQueue,
    cmd: u8,
    dali1: u8,
    dali2: u8,
    timeout: Duration,
    delay: Option<Duration>,
    cb: Box<dyn FnOnce(&mut TransactionQueue, Result<(u8, u8)>)>,
) {
    let mut tx = Transaction::send_then_receive(bridge_request(cmd, dali1, dali2), 2)
        .with_timeout(timeout)
        .on_completion(move |q, res| match res {
            Ok(bytes) => cb(q, Ok((bytes[0], bytes[1]))),
            Err(e) => cb(q, Err(e)),
        });
    if let Some(d) = delay {
        tx = tx.with_initiation_delay(d);
    }
    queue.enqueue(tx);
}

/// Fire-and-forget: put the frame on the bus, expect nothing back.
pub(crate) fn send_on(queue: &mut TransactionQueue, dali1: u8, dali2: u8, delay: Option<Duration>) {
    let mut tx = Transaction::send(bridge_request(bridge::CMD_SEND, dali1, dali2));
    if let Some(d) = delay {
        tx = tx.with_initiation_delay(d);
    }
    queue.enqueue(tx);
}

/// Acknowledged send.
pub(crate) fn send_checked_on(
    queue: &mut TransactionQueue,
    dali1: u8,
    dali2: u8,
    delay: Option<Duration>,
    cb: StatusCallback,
) {
    bridge_exchange_on(
        queue,
        bridge::CMD_SEND_ACK,
        dali1,
        dali2,
        DEFAULT_RESPONSE_TIMEOUT,
        delay,
        Box::new(move |q, res| cb(q, res.and_then(|(r1, r2)| classify_status(r1, r2)))),
    );
}

/// Send the same frame twice within the config-command window. This is an
/// unconditional double transmission with an inter-command gap, not a retry:
/// the second leg is only skipped when the first already failed.
pub(crate) fn send_twice_on(
    queue: &mut TransactionQueue,
    dali1: u8,
    dali2: u8,
    delay: Option<Duration>,
    cb: Option<StatusCallback>,
) {
    let cb = cb.unwrap_or_else(default_status_cb);
    send_checked_on(
        queue,
        dali1,
        dali2,
        delay,
        Box::new(move |q, res| match res {
            Ok(()) => send_checked_on(q, dali1, dali2, Some(CONFIG_RESEND_GAP), cb),
            Err(e) => cb(q, Err(e)),
        }),
    );
}

/// Single-byte query with the three-valued outcome.
pub(crate) fn raw_query_on(
    queue: &mut TransactionQueue,
    dali1: u8,
    dali2: u8,
    timeout: Duration,
    delay: Option<Duration>,
    cb: QueryCallback,
) {
    bridge_exchange_on(
        queue,
        bridge::CMD_QUERY,
        dali1,
        dali2,
        timeout,
        delay,
        Box::new(move |q, res| cb(q, res.and_then(|(r1, r2)| classify_query(r1, r2)))),
    );
}

/// Split a 16-bit command: low byte is the opcode, high byte selects a
/// device type to enable first (0 = none, 0xFF = DT0).
fn split_command(cmd: u16) -> (Option<u8>, u8) {
    let op = cmd as u8;
    match (cmd >> 8) as u8 {
        0 => (None, op),
        0xFF => (Some(0), op),
        dt => (Some(dt), op),
    }
}

/// Enqueue the device-type enable when the command requires one; the delay
/// then applies to the enable, keeping it glued to the command it prefixes.
fn prepare_command(
    queue: &mut TransactionQueue,
    cmd: u16,
    delay: Option<Duration>,
) -> (u8, Option<Duration>) {
    let (device_type, op) = split_command(cmd);
    match device_type {
        Some(dt) => {
            send_on(queue, special::ENABLE_DEVICE_TYPE, dt, delay);
            (op, None)
        }
        None => (op, delay),
    }
}

pub(crate) fn send_command_on(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cmd: u16,
    delay: Option<Duration>,
    cb: Option<StatusCallback>,
) {
    let (op, delay) = prepare_command(queue, cmd, delay);
    match cb {
        Some(cb) => send_checked_on(queue, command_byte(address), op, delay, cb),
        None => send_on(queue, command_byte(address), op, delay),
    }
}

pub(crate) fn send_config_command_on(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cmd: u16,
    delay: Option<Duration>,
    cb: Option<StatusCallback>,
) {
    let (op, delay) = prepare_command(queue, cmd, delay);
    send_twice_on(queue, command_byte(address), op, delay, cb);
}

pub(crate) fn send_dtr_and_command_on(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cmd: u16,
    dtr_value: u8,
    delay: Option<Duration>,
    cb: Option<StatusCallback>,
) {
    send_on(queue, special::SET_DTR, dtr_value, delay);
    send_command_on(queue, address, cmd, None, cb);
}

pub(crate) fn send_dtr_and_config_command_on(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cmd: u16,
    dtr_value: u8,
    delay: Option<Duration>,
    cb: Option<StatusCallback>,
) {
    send_on(queue, special::SET_DTR, dtr_value, delay);
    send_config_command_on(queue, address, cmd, None, cb);
}

/// Stage a 16-bit value in DTR1 (high byte) and DTR (low byte), then issue
/// the command that consumes it.
pub(crate) fn send_u16_and_command_on(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cmd: u16,
    value: u16,
    delay: Option<Duration>,
    cb: Option<StatusCallback>,
) {
    send_on(queue, special::SET_DTR1, (value >> 8) as u8, delay);
    send_on(queue, special::SET_DTR, value as u8, None);
    send_command_on(queue, address, cmd, None, cb);
}

pub(crate) fn query_on(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    query_cmd: u16,
    timeout: Duration,
    delay: Option<Duration>,
    cb: QueryCallback,
) {
    let (op, delay) = prepare_command(queue, query_cmd, delay);
    raw_query_on(queue, command_byte(address), op, timeout, delay, cb);
}

/// Paired 16-bit query: the queried command answers with the high byte and
/// parks the low byte in DTR, which a read-back query then retrieves. The
/// combined value is delivered once, after both legs completed.
pub(crate) fn query_u16_on(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    query_cmd: u16,
    delay: Option<Duration>,
    cb: Value16Callback,
) {
    query_on(
        queue,
        address,
        query_cmd,
        DEFAULT_RESPONSE_TIMEOUT,
        delay,
        Box::new(move |q, res| match res {
            Ok(QueryOutcome::Answer(msb)) => query_on(
                q,
                address,
                u16::from(opcode::QUERY_CONTENT_DTR),
                DEFAULT_RESPONSE_TIMEOUT,
                None,
                Box::new(move |q, res| match res {
                    Ok(QueryOutcome::Answer(lsb)) => {
                        cb(q, Ok((u16::from(msb) << 8) | u16::from(lsb)))
                    }
                    Ok(QueryOutcome::NoAnswer) => cb(q, Err(Error::MissingData)),
                    Ok(QueryOutcome::Collision) => cb(q, Err(Error::BusFrame)),
                    Err(e) => cb(q, Err(e)),
                }),
            ),
            Ok(QueryOutcome::NoAnswer) => cb(q, Err(Error::MissingData)),
            Ok(QueryOutcome::Collision) => cb(q, Err(Error::BusFrame)),
            Err(e) => cb(q, Err(e)),
        }),
    );
}

/// Query both group-membership halves and combine them into one 16-bit mask.
/// A silent half contributes no bits rather than failing the whole query.
pub(crate) fn query_group_mask_on(
    queue: &mut TransactionQueue,
    short_address: u8,
    cb: Value16Callback,
) {
    let address = DaliAddress::Short(short_address);
    query_on(
        queue,
        address,
        u16::from(opcode::QUERY_GROUPS_0_TO_7),
        DEFAULT_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| {
            let mut mask = 0u16;
            match res {
                Ok(QueryOutcome::Answer(low)) => mask |= u16::from(low),
                Ok(_) => {}
                Err(e) => return cb(q, Err(e)),
            }
            query_on(
                q,
                address,
                u16::from(opcode::QUERY_GROUPS_8_TO_15),
                DEFAULT_RESPONSE_TIMEOUT,
                None,
                Box::new(move |q, res| match res {
                    Ok(QueryOutcome::Answer(high)) => cb(q, Ok(mask | (u16::from(high) << 8))),
                    Ok(_) => cb(q, Ok(mask)),
                    Err(e) => cb(q, Err(e)),
                }),
            );
        }),
    );
}

/// Read up to `count` bytes from a device memory bank. The bank and start
/// offset are staged through DTR1/DTR, then sequential reads walk the bank.
/// Reading fewer bytes than requested is not an error; the device simply
/// stops answering past its last addressable location.
pub(crate) fn read_memory_on(
    queue: &mut TransactionQueue,
    short_address: u8,
    bank: u8,
    offset: u8,
    count: usize,
    cb: BytesCallback,
) {
    send_on(queue, special::SET_DTR1, bank, None);
    send_on(queue, special::SET_DTR, offset, None);
    read_memory_step(queue, short_address, count, Vec::new(), cb);
}

fn read_memory_step(
    queue: &mut TransactionQueue,
    short_address: u8,
    remaining: usize,
    mut collected: Vec<u8>,
    cb: BytesCallback,
) {
    if remaining == 0 {
        return cb(queue, Ok(collected));
    }
    raw_query_on(
        queue,
        command_byte(DaliAddress::Short(short_address)),
        opcode::READ_MEMORY_LOCATION,
        PROBE_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| match res {
            Ok(QueryOutcome::Answer(byte)) => {
                collected.push(byte);
                read_memory_step(q, short_address, remaining - 1, collected, cb);
            }
            Ok(QueryOutcome::NoAnswer) => cb(q, Ok(collected)),
            Ok(QueryOutcome::Collision) => cb(q, Err(Error::BusFrame)),
            Err(e) => cb(q, Err(e)),
        }),
    );
}

/// Read and classify a device's identity record.
///
/// Identity anomalies never propagate as errors: they downgrade the record's
/// status and the device stays enumerable under its address-derived
/// identity. With legacy compatibility on, a checksum bearing the historical
/// bug's signature stays usable unless a user-named record already exists
/// under the address-derived identifier, in which case the read is
/// deliberately downgraded so a configured device's identity never silently
/// migrates.
pub(crate) fn read_device_info_on(
    queue: &mut TransactionQueue,
    short_address: u8,
    ctx: IdentityContext,
    cb: InfoCallback,
) {
    read_memory_on(
        queue,
        short_address,
        0,
        0,
        MAX_BANK_READ,
        Box::new(move |q, res| {
            let bank0 = match res {
                Ok(bytes) => bytes,
                Err(e) => return cb(q, Err(e)),
            };
            let mut info = match device::parse_bank0(short_address, &bank0, ctx.legacy_compat) {
                Ok(info) => info,
                Err(e @ (Error::MissingData | Error::BadChecksum | Error::BadDeviceInfo)) => {
                    tracing::info!(short_address, anomaly = %e, "device has no usable identity data");
                    let mut info = DaliDeviceInfo::new(short_address);
                    info.status = DevInfStatus::None;
                    return cb(q, Ok(info));
                }
                Err(e) => return cb(q, Err(e)),
            };
            if info.status == DevInfStatus::LegacyMaybe {
                let address_id = device::address_stable_id(&ctx.bus_instance, short_address);
                if let Some(names) = &ctx.names {
                    if names.has_user_name(&address_id) {
                        tracing::warn!(
                            short_address,
                            "device already named under address-derived identity, keeping it there"
                        );
                        info.status = DevInfStatus::LegacyExcluded;
                    }
                }
            }
            read_memory_on(
                q,
                short_address,
                1,
                0,
                MAX_BANK_READ,
                Box::new(move |q, res| {
                    if let Ok(bank1) = res {
                        if let Some((oem_gtin, oem_serial)) = device::parse_bank1_oem(&bank1) {
                            info.oem_gtin = oem_gtin;
                            info.oem_serial_no = oem_serial;
                        }
                    }
                    cb(q, Ok(info))
                }),
            );
        }),
    );
}

const TEST_PATTERNS: [u8; 6] = [0x55, 0xAA, 0x00, 0xFF, 0xF0, 0x0F];

fn test_rw_step(
    queue: &mut TransactionQueue,
    short_address: u8,
    remaining: usize,
    pattern_index: usize,
    cb: StatusCallback,
) {
    if remaining == 0 {
        return cb(queue, Ok(()));
    }
    let pattern = TEST_PATTERNS[pattern_index % TEST_PATTERNS.len()];
    send_on(queue, special::SET_DTR, pattern, None);
    query_on(
        queue,
        DaliAddress::Short(short_address),
        u16::from(opcode::QUERY_CONTENT_DTR),
        DEFAULT_RESPONSE_TIMEOUT,
        Some(Duration::from_millis(200)),
        Box::new(move |q, res| match res {
            Ok(QueryOutcome::Answer(byte)) if byte == pattern => {
                test_rw_step(q, short_address, remaining - 1, pattern_index + 1, cb)
            }
            Ok(QueryOutcome::Answer(byte)) => {
                tracing::error!(
                    short_address,
                    sent = pattern,
                    received = byte,
                    "R/W test readback mismatch"
                );
                cb(q, Err(Error::DataUnreliable))
            }
            Ok(QueryOutcome::NoAnswer) => cb(q, Err(Error::MissingData)),
            Ok(QueryOutcome::Collision) => cb(q, Err(Error::BusFrame)),
            Err(e) => cb(q, Err(e)),
        }),
    );
}

/// Decrements the running-procedure counter when dropped; moved into the
/// final callback of each scan/discovery chain.
pub(crate) struct ProcedureToken(Rc<Cell<usize>>);

impl Drop for ProcedureToken {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

/// Low level access to one DALI bus through its bridge.
///
/// Owns the transaction queue for the connection; one instance per bus.
pub struct DaliComm {
    queue: TransactionQueue,
    identity: IdentityContext,
    send_edge_adjust: u8,
    sample_point_adjust: i8,
    running_procedures: Rc<Cell<usize>>,
}

impl DaliComm {
    pub fn new(
        transmitter: impl FnMut(&[u8]) -> Result<usize> + 'static,
        config: &BusConfig,
        bus_instance: &str,
    ) -> Self {
        DaliComm {
            queue: TransactionQueue::new(transmitter),
            identity: IdentityContext {
                legacy_compat: config.legacy_checksum_compat,
                bus_instance: bus_instance.to_string(),
                names: None,
            },
            send_edge_adjust: config.send_edge_adjust,
            sample_point_adjust: config.sample_point_adjust,
            running_procedures: Rc::new(Cell::new(0)),
        }
    }

    /// Connect to the configured bridge, wire the write half up as the
    /// queue's transmitter and queue the initial reset and edge adjustment.
    pub fn open(config: &BusConfig, bus_instance: &str) -> Result<(Self, BridgeConnection)> {
        let mut connection = BridgeConnection::connect(
            &config.connection,
            config.default_port,
            config.close_after_idle(),
        )?;
        let transmitter = connection.transmitter()?;
        let mut comm = DaliComm::new(transmitter, config, bus_instance);
        comm.reset(|_, res| {
            if let Err(e) = res {
                tracing::error!(error = %e, "bridge reset failed");
            }
        });
        Ok((comm, connection))
    }

    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        DaliComm::new(
            |bytes: &[u8]| Ok(bytes.len()),
            &BusConfig::default(),
            "testbus",
        )
    }

    /// Install the persisted-name lookup consulted by legacy identity
    /// classification.
    pub fn set_name_lookup(&mut self, lookup: Rc<dyn DeviceNameLookup>) {
        self.identity.names = Some(lookup);
    }

    pub fn queue_mut(&mut self) -> &mut TransactionQueue {
        &mut self.queue
    }

    pub(crate) fn identity_context(&self) -> IdentityContext {
        self.identity.clone()
    }

    pub fn bus_instance(&self) -> &str {
        &self.identity.bus_instance
    }

    /// Run a processing pass; the external periodic tick.
    pub fn process(&mut self) {
        self.queue.process_operations();
    }

    /// Abort every queued transaction, e.g. on connection loss.
    pub fn abort_all(&mut self, error: Error) {
        self.queue.abort_all(error);
    }

    /// True while a scan or discovery procedure runs; such procedures refuse
    /// to start concurrently instead of racing on the bus.
    pub fn is_busy(&self) -> bool {
        self.running_procedures.get() > 0
    }

    pub(crate) fn begin_procedure(&mut self) -> Result<ProcedureToken> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        self.running_procedures.set(self.running_procedures.get() + 1);
        Ok(ProcedureToken(self.running_procedures.clone()))
    }

    /// Reset the bridge, then program the configured edge adjustments.
    pub fn reset(&mut self, cb: impl FnOnce(&mut TransactionQueue, Result<()>) + 'static) {
        let edge = self.send_edge_adjust;
        let sample = self.sample_point_adjust as u8;
        bridge_exchange_on(
            &mut self.queue,
            bridge::CMD_RESET,
            0,
            0,
            DEFAULT_RESPONSE_TIMEOUT,
            None,
            Box::new(move |q, res| match res.and_then(|(r1, r2)| classify_status(r1, r2)) {
                Ok(()) => bridge_exchange_on(
                    q,
                    bridge::CMD_EDGE_ADJ,
                    edge,
                    sample,
                    DEFAULT_RESPONSE_TIMEOUT,
                    None,
                    Box::new(move |q, res| {
                        cb(q, res.and_then(|(r1, r2)| classify_status(r1, r2)))
                    }),
                ),
                Err(e) => cb(q, Err(e)),
            }),
        );
        self.process();
    }

    /// Fire-and-forget two-byte bus frame.
    pub fn send(&mut self, dali1: u8, dali2: u8, delay: Option<Duration>) {
        send_on(&mut self.queue, dali1, dali2, delay);
        self.process();
    }

    /// Acknowledged two-byte bus frame.
    pub fn send_checked(
        &mut self,
        dali1: u8,
        dali2: u8,
        cb: impl FnOnce(&mut TransactionQueue, Result<()>) + 'static,
        delay: Option<Duration>,
    ) {
        send_checked_on(&mut self.queue, dali1, dali2, delay, Box::new(cb));
        self.process();
    }

    /// Same frame twice within the config-command window.
    pub fn send_twice(
        &mut self,
        dali1: u8,
        dali2: u8,
        cb: Option<StatusCallback>,
        delay: Option<Duration>,
    ) {
        send_twice_on(&mut self.queue, dali1, dali2, delay, cb);
        self.process();
    }

    /// Direct arc power to a device, group or broadcast.
    pub fn send_direct_power(
        &mut self,
        address: DaliAddress,
        power: u8,
        cb: Option<StatusCallback>,
        delay: Option<Duration>,
    ) {
        let byte = arc_power_byte(address);
        match cb {
            Some(cb) => send_checked_on(&mut self.queue, byte, power, delay, cb),
            None => send_on(&mut self.queue, byte, power, delay),
        }
        self.process();
    }

    /// Addressed command; the high command byte selects a device type.
    pub fn send_command(
        &mut self,
        address: DaliAddress,
        cmd: u16,
        cb: Option<StatusCallback>,
        delay: Option<Duration>,
    ) {
        send_command_on(&mut self.queue, address, cmd, delay, cb);
        self.process();
    }

    /// Configuration command (double-send).
    pub fn send_config_command(
        &mut self,
        address: DaliAddress,
        cmd: u16,
        cb: Option<StatusCallback>,
        delay: Option<Duration>,
    ) {
        send_config_command_on(&mut self.queue, address, cmd, delay, cb);
        self.process();
    }

    pub fn send_dtr_and_command(
        &mut self,
        address: DaliAddress,
        cmd: u16,
        dtr_value: u8,
        cb: Option<StatusCallback>,
        delay: Option<Duration>,
    ) {
        send_dtr_and_command_on(&mut self.queue, address, cmd, dtr_value, delay, cb);
        self.process();
    }

    pub fn send_dtr_and_config_command(
        &mut self,
        address: DaliAddress,
        cmd: u16,
        dtr_value: u8,
        cb: Option<StatusCallback>,
        delay: Option<Duration>,
    ) {
        send_dtr_and_config_command_on(&mut self.queue, address, cmd, dtr_value, delay, cb);
        self.process();
    }

    /// Stage a 16-bit value through DTR1/DTR, then run the command.
    pub fn send_u16_and_command(
        &mut self,
        address: DaliAddress,
        cmd: u16,
        value: u16,
        cb: Option<StatusCallback>,
        delay: Option<Duration>,
    ) {
        send_u16_and_command_on(&mut self.queue, address, cmd, value, delay, cb);
        self.process();
    }

    /// Single-byte query with three-valued outcome.
    pub fn query(
        &mut self,
        address: DaliAddress,
        query_cmd: u16,
        cb: impl FnOnce(&mut TransactionQueue, Result<QueryOutcome>) + 'static,
        delay: Option<Duration>,
    ) {
        query_on(
            &mut self.queue,
            address,
            query_cmd,
            DEFAULT_RESPONSE_TIMEOUT,
            delay,
            Box::new(cb),
        );
        self.process();
    }

    /// Paired 16-bit query (MSB from the query, LSB read back from DTR).
    pub fn query_u16(
        &mut self,
        address: DaliAddress,
        query_cmd: u16,
        cb: impl FnOnce(&mut TransactionQueue, Result<u16>) + 'static,
        delay: Option<Duration>,
    ) {
        query_u16_on(&mut self.queue, address, query_cmd, delay, Box::new(cb));
        self.process();
    }

    /// Select the device type addressed by subsequent extended commands.
    pub fn enable_device_type(&mut self, device_type: u8) {
        send_on(
            &mut self.queue,
            special::ENABLE_DEVICE_TYPE,
            device_type,
            None,
        );
        self.process();
    }

    /// Read from a device memory bank; short reads are not errors.
    pub fn read_memory(
        &mut self,
        short_address: u8,
        bank: u8,
        offset: u8,
        count: usize,
        cb: impl FnOnce(&mut TransactionQueue, Result<Vec<u8>>) + 'static,
    ) {
        read_memory_on(
            &mut self.queue,
            short_address,
            bank,
            offset,
            count,
            Box::new(cb),
        );
        self.process();
    }

    /// Read and classify the identity record of one device.
    pub fn read_device_info(
        &mut self,
        short_address: u8,
        cb: impl FnOnce(&mut TransactionQueue, Result<DaliDeviceInfo>) + 'static,
    ) {
        let ctx = self.identity_context();
        read_device_info_on(&mut self.queue, short_address, ctx, Box::new(cb));
        self.process();
    }

    /// R/W reliability test against one device's DTR.
    pub fn bus_test_data(
        &mut self,
        short_address: u8,
        cycles: usize,
        cb: impl FnOnce(&mut TransactionQueue, Result<()>) + 'static,
    ) {
        test_rw_step(&mut self.queue, short_address, cycles, 0, Box::new(cb));
        self.process();
    }

    /// Diagnostic probe of all 64 short addresses; resolves to the
    /// one-character-per-address bus state string.
    pub fn probe_scan(&mut self, cb: impl FnOnce(&mut TransactionQueue, Result<String>) + 'static) {
        crate::scan::probe_scan(self, Box::new(cb));
    }

    /// Quick scan: probe every short address and report which answered
    /// cleanly and which collided.
    pub fn bus_scan(
        &mut self,
        cb: impl FnOnce(&mut TransactionQueue, Result<ScanResult>) + 'static,
    ) {
        crate::scan::quick_scan(self, Box::new(cb));
    }

    /// Full discovery scan via binary search over the random address space;
    /// assigns short addresses to unassigned devices. With
    /// `quick_when_clean` the cheap probe scan is used as long as it finds
    /// devices and no collisions.
    pub fn full_bus_scan(
        &mut self,
        quick_when_clean: bool,
        cb: impl FnOnce(&mut TransactionQueue, Result<ScanResult>) + 'static,
    ) {
        crate::scan::full_scan(self, quick_when_clean, Box::new(cb));
    }
}
