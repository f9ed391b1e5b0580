//! Bus device records, stable identity derivation and reconciliation.
//!
//! A device's preferred identity comes from its device-info memory bank
//! (GTIN + serial number); when that is absent, implausible or ambiguous the
//! device falls back to an identifier derived from its short address, which
//! is always unique on one bus. Groups combine member identifiers
//! order-independently so a group's identity survives membership-order
//! changes in persisted configuration.

use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comm::{self, DaliComm};
use crate::defs::{opcode, ARC_POWER_MASK};
use crate::error::{Error, Result};
use crate::sansio::protocol::{brightness_to_arc_power, fade_rate_code, fade_time_code};
use crate::sansio::{QueryOutcome, TransactionQueue};
use crate::DaliAddress;

/// Name space for all identifiers derived by this crate.
pub const DALIBUS_NAMESPACE: Uuid = Uuid::from_u128(0x5d1c_39a4_7b0e_44d2_9f63_2a81_c0de_da11);

/// Reissue interval for continuous dimming; the bus auto-stops UP/DOWN after
/// about 200 ms, so the repeater stays just under that window.
const DIM_REPEAT_INTERVAL: Duration = Duration::from_millis(150);

/// Classification of a device's identity data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevInfStatus {
    /// Only the short address is known so far; the device info should be
    /// queried.
    NeedsQuery,
    /// The device is known to expose no usable device info.
    None,
    /// The GTIN is valid but the serial number is not.
    GtinOnly,
    /// Checksum bears the historical bug's signature; usable for identity in
    /// legacy-compatibility mode.
    LegacyMaybe,
    /// GTIN and serial number validated cleanly.
    Solid,
    /// Identity data would be usable, but a record named by the user already
    /// exists under the address-derived identifier, which must not silently
    /// migrate.
    LegacyExcluded,
}

impl DevInfStatus {
    /// Terminal statuses are cached and reused across incremental
    /// collections without touching the hardware again.
    pub fn is_terminal(self) -> bool {
        self != DevInfStatus::NeedsQuery
    }

    /// Whether the identity data is strong enough to derive the stable
    /// identifier from.
    pub fn usable_for_identity(self) -> bool {
        matches!(self, DevInfStatus::Solid | DevInfStatus::LegacyMaybe)
    }
}

/// Device information record read from the device's memory banks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaliDeviceInfo {
    pub short_address: u8,
    pub gtin: u64,
    pub fw_version_major: u8,
    pub fw_version_minor: u8,
    pub serial_no: u64,
    pub oem_gtin: u64,
    pub oem_serial_no: u64,
    pub status: DevInfStatus,
}

impl DaliDeviceInfo {
    pub fn new(short_address: u8) -> Self {
        DaliDeviceInfo {
            short_address,
            gtin: 0,
            fw_version_major: 0,
            fw_version_minor: 0,
            serial_no: 0,
            oem_gtin: 0,
            oem_serial_no: 0,
            status: DevInfStatus::NeedsQuery,
        }
    }

    /// Clear everything except the short address.
    pub fn clear(&mut self) {
        let addr = self.short_address;
        *self = DaliDeviceInfo::new(addr);
        self.status = DevInfStatus::None;
    }
}

/// Lookup into persisted device records, used to keep an already-named
/// installation on its address-derived identity when the legacy checksum
/// signature is seen.
pub trait DeviceNameLookup {
    /// True when a record with a non-empty user-assigned name exists under
    /// this identifier.
    fn has_user_name(&self, id: &Uuid) -> bool;
}

/// Identifier derived from validated device info, GS1-128 style:
/// `(01)<GTIN>(21)<serial>` hashed into the crate name space.
pub fn devinf_stable_id(info: &DaliDeviceInfo) -> Option<Uuid> {
    if !info.status.usable_for_identity() {
        return None;
    }
    let name = format!("(01){}(21){}", info.gtin, info.serial_no);
    Some(Uuid::new_v5(&DALIBUS_NAMESPACE, name.as_bytes()))
}

/// Identifier derived from the bus instance and short address. Always
/// available and always unique on one bus.
pub fn address_stable_id(bus_instance: &str, short_address: u8) -> Uuid {
    let name = format!("{}::{}", bus_instance, short_address);
    Uuid::new_v5(&DALIBUS_NAMESPACE, name.as_bytes())
}

// device info memory layout (bank 0)
const BANK_LAST_ADDRESSABLE: usize = 0x00;
const BANK_CHECKSUM: usize = 0x01;
const BANK0_GTIN: usize = 0x03;
const BANK0_FW: usize = 0x09;
const BANK0_SERIAL: usize = 0x0B;
const BANK0_MIN_LEN: usize = 0x13;
const BANK1_OEM_GTIN: usize = 0x03;
const BANK1_OEM_SERIAL: usize = 0x09;
const BANK1_MIN_LEN: usize = 0x11;

fn be_u48(bytes: &[u8]) -> u64 {
    bytes[..6].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn be_u64(bytes: &[u8]) -> u64 {
    bytes[..8].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn all_same(bytes: &[u8], value: u8) -> bool {
    bytes.iter().all(|b| *b == value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecksumVerdict {
    Good,
    /// The sum only closes when the trailing byte is left out (or misses by
    /// exactly one): the signature of the pre-2015 readout bug.
    LegacyBug,
    Bad,
}

fn verify_bank_checksum(bytes: &[u8]) -> ChecksumVerdict {
    let full: u8 = bytes[BANK_CHECKSUM..]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    if full == 0 {
        return ChecksumVerdict::Good;
    }
    let without_last = full.wrapping_sub(bytes[bytes.len() - 1]);
    if without_last == 0 || full == 0xFF {
        return ChecksumVerdict::LegacyBug;
    }
    ChecksumVerdict::Bad
}

/// Parse and classify a device-info bank 0 readout.
///
/// Errors are anomalies, not necessarily fatal to a collection pass: the
/// caller downgrades them to a [`DevInfStatus::None`] record and continues.
pub(crate) fn parse_bank0(
    short_address: u8,
    bytes: &[u8],
    legacy_compat: bool,
) -> Result<DaliDeviceInfo> {
    if bytes.len() < BANK0_MIN_LEN {
        return Err(Error::MissingData);
    }
    if usize::from(bytes[BANK_LAST_ADDRESSABLE]) + 1 < BANK0_MIN_LEN {
        return Err(Error::MissingData);
    }
    let verdict = verify_bank_checksum(bytes);
    if verdict == ChecksumVerdict::Bad || (verdict == ChecksumVerdict::LegacyBug && !legacy_compat)
    {
        return Err(Error::BadChecksum);
    }
    let gtin_bytes = &bytes[BANK0_GTIN..BANK0_GTIN + 6];
    let serial_bytes = &bytes[BANK0_SERIAL..BANK0_SERIAL + 8];
    if all_same(gtin_bytes, 0xFF) {
        return Err(Error::BadDeviceInfo);
    }
    let mut info = DaliDeviceInfo::new(short_address);
    info.gtin = be_u48(gtin_bytes);
    info.fw_version_major = bytes[BANK0_FW];
    info.fw_version_minor = bytes[BANK0_FW + 1];
    info.serial_no = be_u64(serial_bytes);
    info.status = if info.gtin == 0 {
        DevInfStatus::None
    } else if all_same(serial_bytes, 0x00) || all_same(serial_bytes, 0xFF) {
        DevInfStatus::GtinOnly
    } else if verdict == ChecksumVerdict::LegacyBug {
        DevInfStatus::LegacyMaybe
    } else {
        DevInfStatus::Solid
    };
    Ok(info)
}

/// Parse the OEM bank (bank 1). Failures here never degrade the device's
/// identity; the OEM fields just stay zero.
pub(crate) fn parse_bank1_oem(bytes: &[u8]) -> Option<(u64, u64)> {
    if bytes.len() < BANK1_MIN_LEN {
        return None;
    }
    if verify_bank_checksum(bytes) == ChecksumVerdict::Bad {
        return None;
    }
    let gtin = be_u48(&bytes[BANK1_OEM_GTIN..BANK1_OEM_GTIN + 6]);
    let serial = be_u64(&bytes[BANK1_OEM_SERIAL..BANK1_OEM_SERIAL + 8]);
    Some((gtin, serial))
}

/// Live parameters retrieved from a device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceParams {
    pub present: bool,
    pub current_brightness: f64,
    pub min_brightness: f64,
}

/// Status bits retrieved from a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub present: bool,
    pub lamp_failure: bool,
}

struct DimRepeater {
    opcode: u8,
    next_due: Instant,
}

/// One physical device on the bus, wrapping its identity record plus cached
/// live state.
pub struct DaliBusDevice {
    pub info: DaliDeviceInfo,
    pub stable_id: Uuid,
    /// Placeholders stand in for configured devices not currently on the
    /// bus; they carry only their last-known identifier and never generate
    /// bus traffic.
    pub is_placeholder: bool,
    pub is_present: bool,
    pub lamp_failure: bool,
    pub supports_led: bool,
    pub supports_color: bool,
    pub current_brightness: Option<f64>,
    pub min_brightness: f64,
    bus_instance: String,
    current_transition: Option<Duration>,
    current_fade_time: u8,
    current_fade_rate: u8,
    current_dim_per_ms: f64,
    dim_repeater: Option<DimRepeater>,
}

impl DaliBusDevice {
    pub fn new(bus_instance: &str, info: DaliDeviceInfo) -> Self {
        let mut device = DaliBusDevice {
            info,
            stable_id: Uuid::nil(),
            is_placeholder: false,
            is_present: false,
            lamp_failure: false,
            supports_led: false,
            supports_color: false,
            current_brightness: None,
            min_brightness: 0.0,
            bus_instance: bus_instance.to_string(),
            current_transition: None,
            current_fade_time: 0xFF,
            current_fade_rate: 0xFF,
            current_dim_per_ms: 0.0,
            dim_repeater: None,
        };
        device.derive_stable_id();
        device
    }

    /// A stand-in for a configured device that is not on the bus.
    pub fn placeholder(stable_id: Uuid) -> Self {
        let mut device = DaliBusDevice::new("", DaliDeviceInfo::new(0));
        device.is_placeholder = true;
        device.stable_id = stable_id;
        device
    }

    pub fn address(&self) -> DaliAddress {
        DaliAddress::Short(self.info.short_address)
    }

    pub fn derive_stable_id(&mut self) {
        if self.is_placeholder {
            return;
        }
        self.stable_id = devinf_stable_id(&self.info)
            .unwrap_or_else(|| address_stable_id(&self.bus_instance, self.info.short_address));
    }

    /// Discard identity data and fall back to the address-derived
    /// identifier.
    pub fn clear_device_info(&mut self) {
        self.info.clear();
        self.derive_stable_id();
    }

    pub fn apply_params(&mut self, params: &DeviceParams) {
        self.is_present = params.present;
        self.current_brightness = Some(params.current_brightness);
        self.min_brightness = params.min_brightness;
    }

    pub fn apply_status(&mut self, status: &DeviceStatus) {
        self.is_present = status.present;
        self.lamp_failure = status.lamp_failure;
    }

    pub fn apply_features(&mut self, features: &DeviceFeatures) {
        self.supports_led = features.supports_led;
        self.supports_color = features.supports_color;
    }

    pub fn register_device_type(&mut self, device_type: u8) {
        tracing::info!(
            short_address = self.info.short_address,
            device_type,
            "device supports extended command set"
        );
        match device_type {
            6 => self.supports_led = true,
            8 => self.supports_color = true,
            _ => {}
        }
    }

    /// Set brightness, converting to arc power. Suppressed entirely when the
    /// target equals the last commanded value.
    pub fn set_brightness(&mut self, comm: &mut DaliComm, brightness: f64) {
        if self.is_placeholder || self.current_brightness == Some(brightness) {
            return;
        }
        self.current_brightness = Some(brightness);
        let power = brightness_to_arc_power(brightness);
        tracing::info!(
            short_address = self.info.short_address,
            brightness,
            arc_power = power,
            "setting brightness"
        );
        comm.send_direct_power(self.address(), power, None, None);
    }

    /// Program the fade time for the next brightness transitions. The
    /// encoded value is only written to the device when it actually differs
    /// from the one last sent.
    pub fn set_transition_time(&mut self, comm: &mut DaliComm, transition: Duration) {
        if self.is_placeholder || self.current_transition == Some(transition) {
            return;
        }
        let code = fade_time_code(transition);
        if self.current_transition.is_none() || code != self.current_fade_time {
            tracing::debug!(
                short_address = self.info.short_address,
                fade_time = code,
                "programming fade time"
            );
            comm.send_dtr_and_config_command(
                self.address(),
                u16::from(opcode::STORE_DTR_AS_FADE_TIME),
                code,
                None,
                None,
            );
            self.current_fade_time = code;
        }
        self.current_transition = Some(transition);
    }

    /// Store the given brightness (or the current one) as the device's
    /// power-on and failure level.
    pub fn set_default_brightness(&mut self, comm: &mut DaliComm, brightness: Option<f64>) {
        if self.is_placeholder {
            return;
        }
        let level = brightness.or(self.current_brightness).unwrap_or(0.0);
        let power = brightness_to_arc_power(level);
        comm.send_dtr_and_config_command(
            self.address(),
            u16::from(opcode::STORE_DTR_AS_POWER_ON_LEVEL),
            power,
            None,
            None,
        );
        comm.send_dtr_and_config_command(
            self.address(),
            u16::from(opcode::STORE_DTR_AS_FAILURE_LEVEL),
            power,
            None,
            None,
        );
    }

    /// Start or stop continuous dimming with repeated UP/DOWN commands.
    pub fn dim(&mut self, comm: &mut DaliComm, mode: DimMode, dim_per_ms: f64) {
        if self.is_placeholder {
            return;
        }
        self.dim_repeater = None;
        match mode {
            DimMode::Stop => {
                // MASK stops a running fade
                comm.send_direct_power(self.address(), ARC_POWER_MASK, None, None);
            }
            DimMode::Up | DimMode::Down => {
                if dim_per_ms != self.current_dim_per_ms {
                    self.current_dim_per_ms = dim_per_ms;
                    let code = fade_rate_code(dim_per_ms);
                    if code != self.current_fade_rate {
                        tracing::debug!(
                            short_address = self.info.short_address,
                            fade_rate = code,
                            "programming fade rate"
                        );
                        comm.send_dtr_and_config_command(
                            self.address(),
                            u16::from(opcode::STORE_DTR_AS_FADE_RATE),
                            code,
                            None,
                            None,
                        );
                        self.current_fade_rate = code;
                    }
                }
                let op = if matches!(mode, DimMode::Up) {
                    opcode::UP
                } else {
                    opcode::DOWN
                };
                comm.send_command(self.address(), u16::from(op), None, None);
                self.dim_repeater = Some(DimRepeater {
                    opcode: op,
                    next_due: Instant::now() + DIM_REPEAT_INTERVAL,
                });
            }
        }
    }

    /// Reissue the dim command when due; driven by the caller's periodic
    /// tick while dimming is active.
    pub fn service_dimming(&mut self, comm: &mut DaliComm, now: Instant) {
        if let Some(repeater) = &mut self.dim_repeater {
            if now >= repeater.next_due {
                let op = repeater.opcode;
                repeater.next_due = now + DIM_REPEAT_INTERVAL;
                comm.send_command(self.address(), u16::from(op), None, None);
            }
        }
    }

    pub fn is_dimming(&self) -> bool {
        self.dim_repeater.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimMode {
    Up,
    Down,
    Stop,
}

/// Query a device's actual and minimum level. Answering marks presence.
pub fn query_device_params(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cb: impl FnOnce(&mut TransactionQueue, Result<DeviceParams>) + 'static,
) {
    comm::query_on(
        queue,
        address,
        u16::from(opcode::QUERY_ACTUAL_LEVEL),
        comm::DEFAULT_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| {
            let mut params = DeviceParams::default();
            match res {
                Ok(QueryOutcome::Answer(level)) => {
                    params.present = true;
                    params.current_brightness =
                        crate::sansio::protocol::arc_power_to_brightness(level);
                }
                Ok(_) => {}
                Err(e) => return cb(q, Err(e)),
            }
            comm::query_on(
                q,
                address,
                u16::from(opcode::QUERY_MIN_LEVEL),
                comm::DEFAULT_RESPONSE_TIMEOUT,
                None,
                Box::new(move |q, res| match res {
                    Ok(QueryOutcome::Answer(level)) => {
                        params.present = true;
                        params.min_brightness =
                            crate::sansio::protocol::arc_power_to_brightness(level);
                        cb(q, Ok(params))
                    }
                    Ok(_) => cb(q, Ok(params)),
                    Err(e) => cb(q, Err(e)),
                }),
            );
        }),
    );
}

/// Query a device's status byte. Anything but a clean answer means "not
/// present".
pub fn query_device_status(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cb: impl FnOnce(&mut TransactionQueue, Result<DeviceStatus>) + 'static,
) {
    comm::query_on(
        queue,
        address,
        u16::from(opcode::QUERY_STATUS),
        comm::DEFAULT_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| match res {
            Ok(QueryOutcome::Answer(status)) => cb(
                q,
                Ok(DeviceStatus {
                    present: true,
                    lamp_failure: status & 0x02 != 0,
                }),
            ),
            Ok(_) => cb(q, Ok(DeviceStatus::default())),
            Err(e) => cb(q, Err(e)),
        }),
    );
}

/// Extended command set support discovered via the device-type query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub supports_led: bool,
    pub supports_color: bool,
}

impl DeviceFeatures {
    fn register(&mut self, device_type: u8) {
        match device_type {
            6 => self.supports_led = true,
            8 => self.supports_color = true,
            _ => {}
        }
    }
}

/// Query which device types a device implements. An answer of 0xFF means
/// "several", in which case every type is probed individually through
/// ENABLE_DEVICE_TYPE + QUERY_EXTENDED_VERSION.
pub fn probe_device_features(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    cb: impl FnOnce(&mut TransactionQueue, Result<DeviceFeatures>) + 'static,
) {
    comm::query_on(
        queue,
        address,
        u16::from(opcode::QUERY_DEVICE_TYPE),
        comm::DEFAULT_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| match res {
            Ok(QueryOutcome::Answer(0xFF)) => {
                probe_next_type(q, address, 0, DeviceFeatures::default(), Box::new(cb))
            }
            Ok(QueryOutcome::Answer(device_type)) => {
                let mut features = DeviceFeatures::default();
                features.register(device_type);
                cb(q, Ok(features))
            }
            Ok(_) => cb(q, Ok(DeviceFeatures::default())),
            Err(e) => cb(q, Err(e)),
        }),
    );
}

fn probe_next_type(
    queue: &mut TransactionQueue,
    address: DaliAddress,
    device_type: u8,
    mut features: DeviceFeatures,
    cb: Box<dyn FnOnce(&mut TransactionQueue, Result<DeviceFeatures>)>,
) {
    if device_type > 10 {
        return cb(queue, Ok(features));
    }
    comm::send_on(queue, crate::defs::special::ENABLE_DEVICE_TYPE, device_type, None);
    comm::query_on(
        queue,
        address,
        u16::from(opcode::QUERY_EXTENDED_VERSION),
        comm::DEFAULT_RESPONSE_TIMEOUT,
        None,
        Box::new(move |q, res| {
            if let Ok(QueryOutcome::Answer(_)) = res {
                features.register(device_type);
            }
            probe_next_type(q, address, device_type + 1, features, cb);
        }),
    );
}

/// One configured group membership, as persisted by the host.
#[derive(Debug, Clone)]
pub struct GroupMembership {
    pub group_no: u8,
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub stable_id: Uuid,
    /// `None` for inert placeholders of members not currently on the bus.
    pub short_address: Option<u8>,
}

/// Several devices addressed together through one group address, acting as a
/// single dimmer.
pub struct DaliBusDeviceGroup {
    pub group_no: u8,
    pub members: Vec<GroupMember>,
    /// First present member; queried on behalf of the whole group.
    pub master: Option<u8>,
    pub stable_id: Uuid,
    mix: [u8; 16],
}

impl DaliBusDeviceGroup {
    pub fn new(group_no: u8) -> Self {
        DaliBusDeviceGroup {
            group_no,
            members: Vec::new(),
            master: None,
            stable_id: Uuid::nil(),
            mix: [0u8; 16],
        }
    }

    pub fn address(&self) -> DaliAddress {
        DaliAddress::Group(self.group_no)
    }

    /// Add a member, mixing its identifier into the group identifier. The
    /// mix is XOR-based, so the resulting identity does not depend on the
    /// order members are added in.
    pub fn add_member(&mut self, member: GroupMember) {
        for (m, b) in self.mix.iter_mut().zip(member.stable_id.as_bytes()) {
            *m ^= b;
        }
        if self.master.is_none() {
            if let Some(addr) = member.short_address {
                self.master = Some(addr);
            }
        }
        self.members.push(member);
        self.derive_stable_id();
    }

    fn derive_stable_id(&mut self) {
        let mut name = Vec::with_capacity(10 + 16);
        name.extend_from_slice(b"daligroup:");
        name.extend_from_slice(&self.mix);
        self.stable_id = Uuid::new_v5(&DALIBUS_NAMESPACE, &name);
    }

    /// Addresses of the members actually on the bus.
    pub fn present_member_addresses(&self) -> Vec<u8> {
        self.members.iter().filter_map(|m| m.short_address).collect()
    }

    /// Address to use for read queries: the group master, since all members
    /// are supposed to track the same level.
    pub fn address_for_query(&self) -> Option<DaliAddress> {
        self.master.map(DaliAddress::Short)
    }

    /// Converge actual bus group membership with the configured one: each
    /// present member is added to this group and removed from every other
    /// group it strayed into.
    pub fn align_membership(
        &self,
        comm: &mut DaliComm,
        cb: impl FnOnce(&mut TransactionQueue, Result<()>) + 'static,
    ) {
        let members = self.present_member_addresses();
        align_next_member(comm.queue_mut(), self.group_no, members, 0, Box::new(cb));
        comm.process();
    }
}

fn align_next_member(
    queue: &mut TransactionQueue,
    group_no: u8,
    members: Vec<u8>,
    index: usize,
    cb: Box<dyn FnOnce(&mut TransactionQueue, Result<()>)>,
) {
    let Some(&addr) = members.get(index) else {
        return cb(queue, Ok(()));
    };
    comm::query_group_mask_on(
        queue,
        addr,
        Box::new(move |q, res| {
            match res {
                Ok(mask) => {
                    if mask & (1 << group_no) == 0 {
                        tracing::info!(short_address = addr, group_no, "adding device to group");
                        comm::send_config_command_on(
                            q,
                            DaliAddress::Short(addr),
                            u16::from(opcode::ADD_TO_GROUP | group_no),
                            None,
                            None,
                        );
                    }
                    let stray = mask & !(1u16 << group_no);
                    for g in 0..crate::defs::GROUP_COUNT {
                        if stray & (1 << g) != 0 {
                            tracing::info!(
                                short_address = addr,
                                group_no = g,
                                "removing device from stray group"
                            );
                            comm::send_config_command_on(
                                q,
                                DaliAddress::Short(addr),
                                u16::from(opcode::REMOVE_FROM_GROUP | g),
                                None,
                                None,
                            );
                        }
                    }
                }
                Err(e) => return cb(q, Err(e)),
            }
            align_next_member(q, group_no, members, index + 1, cb);
        }),
    );
}

/// Remove a single (non-grouped) device from every group that is in use by
/// grouped devices, so group commands cannot drag it along.
pub fn remove_from_used_groups(
    comm: &mut DaliComm,
    short_address: u8,
    used_groups_mask: u16,
    cb: impl FnOnce(&mut TransactionQueue, Result<()>) + 'static,
) {
    if used_groups_mask == 0 {
        cb(comm.queue_mut(), Ok(()));
        comm.process();
        return;
    }
    comm::query_group_mask_on(
        comm.queue_mut(),
        short_address,
        Box::new(move |q, res| match res {
            Ok(mask) => {
                for g in 0..crate::defs::GROUP_COUNT {
                    if used_groups_mask & mask & (1 << g) != 0 {
                        tracing::info!(
                            short_address,
                            group_no = g,
                            "removing single device from in-use group"
                        );
                        comm::send_config_command_on(
                            q,
                            DaliAddress::Short(short_address),
                            u16::from(opcode::REMOVE_FROM_GROUP | g),
                            None,
                            None,
                        );
                    }
                }
                cb(q, Ok(()))
            }
            Err(e) => cb(q, Err(e)),
        }),
    );
    comm.process();
}

/// A scan-pass-scoped dimmer unit: either one physical device or a group
/// aggregate, over the same capability surface.
pub enum DimmerUnit {
    Single(DaliBusDevice),
    Group(DaliBusDeviceGroup),
}

impl DimmerUnit {
    pub fn stable_id(&self) -> Uuid {
        match self {
            DimmerUnit::Single(d) => d.stable_id,
            DimmerUnit::Group(g) => g.stable_id,
        }
    }
}

/// Resolve identifier collisions within one collection pass.
///
/// Equal identifiers on two different short addresses mean at least one of
/// the two carries ambiguous or garbage identity data that happened to hash
/// equal; since there is no way to tell which, both are demoted to their
/// address-derived identifiers. A device's logical identity may therefore
/// change between passes, which is accepted over silently merging two
/// physical devices into one.
pub fn reconcile_stable_ids(devices: &mut [DaliBusDevice]) {
    let mut demote = vec![false; devices.len()];
    for i in 0..devices.len() {
        for j in (i + 1)..devices.len() {
            if devices[i].stable_id == devices[j].stable_id {
                tracing::error!(
                    a = devices[i].info.short_address,
                    b = devices[j].info.short_address,
                    "devices share a stable identifier, reverting both to address-derived identity"
                );
                demote[i] = true;
                demote[j] = true;
            }
        }
    }
    for (device, demote) in devices.iter_mut().zip(demote) {
        if demote {
            device.clear_device_info();
        }
    }
}

/// Pure grouping transform: distribute scanned devices into group aggregates
/// according to persisted membership, leaving the rest as single units.
///
/// A group is instantiated as soon as at least one member is on the bus;
/// members not found become inert placeholders so the group's identity stays
/// stable with hardware temporarily missing.
pub fn group_devices(
    scanned: Vec<DaliBusDevice>,
    memberships: &[GroupMembership],
) -> Vec<DimmerUnit> {
    let mut remaining = scanned;
    let mut units = Vec::new();
    for membership in memberships {
        let any_present = membership
            .member_ids
            .iter()
            .any(|id| remaining.iter().any(|d| d.stable_id == *id));
        if !any_present {
            tracing::warn!(
                group_no = membership.group_no,
                "no member of configured group is on the bus, skipping"
            );
            continue;
        }
        let mut group = DaliBusDeviceGroup::new(membership.group_no);
        for id in &membership.member_ids {
            match remaining.iter().position(|d| d.stable_id == *id) {
                Some(pos) => {
                    let device = remaining.remove(pos);
                    group.add_member(GroupMember {
                        stable_id: device.stable_id,
                        short_address: Some(device.info.short_address),
                    });
                }
                None => {
                    tracing::warn!(group_no = membership.group_no, member = %id, "group member missing on bus");
                    group.add_member(GroupMember {
                        stable_id: *id,
                        short_address: None,
                    });
                }
            }
        }
        units.push(DimmerUnit::Group(group));
    }
    units.extend(remaining.into_iter().map(DimmerUnit::Single));
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn solid_info(addr: u8, gtin: u64, serial: u64) -> DaliDeviceInfo {
        let mut info = DaliDeviceInfo::new(addr);
        info.gtin = gtin;
        info.serial_no = serial;
        info.status = DevInfStatus::Solid;
        info
    }

    fn bank0_bytes(gtin: u64, serial: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; BANK0_MIN_LEN];
        bytes[BANK_LAST_ADDRESSABLE] = (BANK0_MIN_LEN - 1) as u8;
        for i in 0..6 {
            bytes[BANK0_GTIN + i] = (gtin >> (8 * (5 - i))) as u8;
        }
        bytes[BANK0_FW] = 1;
        bytes[BANK0_FW + 1] = 7;
        for i in 0..8 {
            bytes[BANK0_SERIAL + i] = (serial >> (8 * (7 - i))) as u8;
        }
        // make the running sum close to zero over checksum..end
        let sum: u8 = bytes[BANK_CHECKSUM + 1..]
            .iter()
            .fold(0u8, |a, b| a.wrapping_add(*b));
        bytes[BANK_CHECKSUM] = 0u8.wrapping_sub(sum);
        bytes
    }

    #[test]
    fn parse_valid_bank0() {
        let bytes = bank0_bytes(4_012_345_000_123, 0xDEAD_BEEF);
        let info = parse_bank0(12, &bytes, false).unwrap();
        assert_eq!(info.status, DevInfStatus::Solid);
        assert_eq!(info.gtin, 4_012_345_000_123);
        assert_eq!(info.serial_no, 0xDEAD_BEEF);
        assert_eq!(info.short_address, 12);
        assert_eq!((info.fw_version_major, info.fw_version_minor), (1, 7));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut bytes = bank0_bytes(4_012_345_000_123, 1);
        bytes[BANK_CHECKSUM] = bytes[BANK_CHECKSUM].wrapping_add(7);
        assert_eq!(parse_bank0(1, &bytes, false), Err(Error::BadChecksum));
        assert_eq!(parse_bank0(1, &bytes, true), Err(Error::BadChecksum));
    }

    #[test]
    fn legacy_checksum_signature_needs_compat_mode() {
        // recreate the historical readout bug: a checksum that only closes
        // when the trailing byte is left out of the sum
        let mut bytes = bank0_bytes(4_012_345_000_123, 1);
        let last = bytes.len() - 1;
        bytes[last] = 5;
        let sum_rest: u8 = bytes[BANK_CHECKSUM + 1..last]
            .iter()
            .fold(0u8, |a, b| a.wrapping_add(*b));
        bytes[BANK_CHECKSUM] = 0u8.wrapping_sub(sum_rest);
        assert_eq!(parse_bank0(1, &bytes, false), Err(Error::BadChecksum));
        let info = parse_bank0(1, &bytes, true).unwrap();
        assert_eq!(info.status, DevInfStatus::LegacyMaybe);
    }

    #[test]
    fn zero_gtin_means_no_devinf() {
        let bytes = bank0_bytes(0, 1234);
        let info = parse_bank0(3, &bytes, false).unwrap();
        assert_eq!(info.status, DevInfStatus::None);
    }

    #[test]
    fn invalid_serial_downgrades_to_gtin_only() {
        let bytes = bank0_bytes(4_012_345_000_123, 0);
        let info = parse_bank0(3, &bytes, false).unwrap();
        assert_eq!(info.status, DevInfStatus::GtinOnly);
    }

    #[test]
    fn short_readout_is_missing_data() {
        assert_eq!(parse_bank0(3, &[0u8; 4], false), Err(Error::MissingData));
    }

    #[test]
    fn reconcile_demotes_both_collision_partners() {
        let mut devices = vec![
            DaliBusDevice::new("bus1", solid_info(1, 77, 99)),
            DaliBusDevice::new("bus1", solid_info(2, 77, 99)),
            DaliBusDevice::new("bus1", solid_info(3, 77, 1234)),
        ];
        assert_eq!(devices[0].stable_id, devices[1].stable_id);
        let third = devices[2].stable_id;
        reconcile_stable_ids(&mut devices);
        assert_ne!(devices[0].stable_id, devices[1].stable_id);
        assert_eq!(devices[0].stable_id, address_stable_id("bus1", 1));
        assert_eq!(devices[1].stable_id, address_stable_id("bus1", 2));
        assert_eq!(devices[0].info.status, DevInfStatus::None);
        // the untangled third device is untouched
        assert_eq!(devices[2].stable_id, third);
        assert_eq!(devices[2].info.status, DevInfStatus::Solid);
    }

    #[test]
    fn group_identifier_is_order_independent() {
        let ids: Vec<Uuid> = (0..3u8)
            .map(|i| address_stable_id("bus1", i))
            .collect();
        let mut forward = DaliBusDeviceGroup::new(4);
        for id in &ids {
            forward.add_member(GroupMember {
                stable_id: *id,
                short_address: None,
            });
        }
        let mut shuffled = DaliBusDeviceGroup::new(4);
        for id in [ids[2], ids[0], ids[1]] {
            shuffled.add_member(GroupMember {
                stable_id: id,
                short_address: None,
            });
        }
        assert_eq!(forward.stable_id, shuffled.stable_id);
    }

    #[test]
    fn grouping_inserts_placeholders_for_missing_members() {
        let on_bus = DaliBusDevice::new("bus1", solid_info(1, 77, 99));
        let on_bus_id = on_bus.stable_id;
        let missing_id = address_stable_id("bus1", 9);
        let memberships = [GroupMembership {
            group_no: 2,
            member_ids: vec![missing_id, on_bus_id],
        }];
        let units = group_devices(vec![on_bus], &memberships);
        assert_eq!(units.len(), 1);
        match &units[0] {
            DimmerUnit::Group(g) => {
                assert_eq!(g.members.len(), 2);
                assert_eq!(g.members[0].short_address, None);
                assert_eq!(g.members[1].short_address, Some(1));
                assert_eq!(g.master, Some(1));
            }
            DimmerUnit::Single(_) => panic!("expected a group"),
        }
    }

    #[test]
    fn grouping_skips_fully_absent_groups() {
        let dev = DaliBusDevice::new("bus1", solid_info(1, 77, 99));
        let memberships = [GroupMembership {
            group_no: 0,
            member_ids: vec![address_stable_id("bus1", 40)],
        }];
        let units = group_devices(vec![dev], &memberships);
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0], DimmerUnit::Single(_)));
    }

    #[test]
    fn equal_brightness_target_is_suppressed() {
        use crate::test_support::ScriptedBridge;
        let scripted = ScriptedBridge::new();
        let mut comm = scripted.comm();
        let mut device = DaliBusDevice::new("bus1", solid_info(2, 1, 2));
        let power_frames = |scripted: &ScriptedBridge| {
            scripted
                .sent()
                .iter()
                .filter(|f| f[1] == 0x04) // direct arc power to device 2
                .count()
        };
        device.set_brightness(&mut comm, 50.0);
        assert_eq!(power_frames(&scripted), 1);
        // same target again: no bus traffic
        device.set_brightness(&mut comm, 50.0);
        assert_eq!(power_frames(&scripted), 1);
        device.set_brightness(&mut comm, 51.0);
        assert_eq!(power_frames(&scripted), 2);
    }

    #[test]
    fn dim_reissues_until_stopped() {
        use crate::test_support::ScriptedBridge;
        let scripted = ScriptedBridge::new();
        let mut comm = scripted.comm();
        let mut device = DaliBusDevice::new("bus1", solid_info(2, 1, 2));
        let up_commands = |scripted: &ScriptedBridge| {
            scripted
                .sent()
                .iter()
                .filter(|f| f[1] == 0x05 && f[2] == opcode::UP)
                .count()
        };
        device.dim(&mut comm, DimMode::Up, 0.044);
        scripted.run(&mut comm, Duration::from_millis(500));
        assert!(device.is_dimming());
        assert_eq!(up_commands(&scripted), 1);
        // the fade rate was programmed once, as a config double-send
        let rate_frames = scripted
            .sent()
            .iter()
            .filter(|f| f[2] == opcode::STORE_DTR_AS_FADE_RATE)
            .count();
        assert_eq!(rate_frames, 2);

        // not due yet: nothing is reissued
        device.service_dimming(&mut comm, Instant::now());
        assert_eq!(up_commands(&scripted), 1);
        thread::sleep(Duration::from_millis(160));
        device.service_dimming(&mut comm, Instant::now());
        assert_eq!(up_commands(&scripted), 2);

        device.dim(&mut comm, DimMode::Stop, 0.0);
        assert!(!device.is_dimming());
        let last = scripted.sent().last().unwrap().clone();
        assert_eq!(last, vec![crate::defs::bridge::CMD_SEND, 0x04, ARC_POWER_MASK]);
    }

    #[test]
    fn placeholder_generates_no_traffic() {
        let mut comm = DaliComm::for_testing();
        let mut device = DaliBusDevice::placeholder(Uuid::nil());
        device.set_brightness(&mut comm, 50.0);
        device.dim(&mut comm, DimMode::Up, 0.044);
        assert!(comm.queue_mut().is_empty());
    }
}
