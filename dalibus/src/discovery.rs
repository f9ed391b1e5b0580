//! Device collection: scan the bus, read identities, reconcile.
//!
//! One collection pass runs a bus scan, reads (or recalls from the cache)
//! every found device's identity record, builds [`DaliBusDevice`] records
//! and reconciles identifier collisions. Grouping into aggregates is the
//! caller's pure transform over the result, see
//! [`crate::device::group_devices`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::cache::DeviceInfoCache;
use crate::comm::{self, DaliComm, IdentityContext};
use crate::device::{reconcile_stable_ids, DaliBusDevice, DaliDeviceInfo};
use crate::error::Result;
use crate::sansio::TransactionQueue;

pub type CollectCallback = Box<dyn FnOnce(&mut TransactionQueue, Result<Vec<DaliBusDevice>>)>;

/// Drives collection passes and owns the identity cache between them.
pub struct Collector {
    cache: Rc<RefCell<DeviceInfoCache>>,
}

impl Collector {
    pub fn new(cache: DeviceInfoCache) -> Self {
        Collector {
            cache: Rc::new(RefCell::new(cache)),
        }
    }

    /// Snapshot of the cache, e.g. for persisting after a pass.
    pub fn cache_snapshot(&self) -> DeviceInfoCache {
        self.cache.borrow().clone()
    }

    /// Rebuild device records from the cache alone, without any bus
    /// traffic; used after grouping changes when the bus state is known
    /// unchanged.
    pub fn recollect_from_cache(&self, bus_instance: &str) -> Vec<DaliBusDevice> {
        let mut devices: Vec<DaliBusDevice> = self
            .cache
            .borrow()
            .iter()
            .map(|info| DaliBusDevice::new(bus_instance, info.clone()))
            .collect();
        reconcile_stable_ids(&mut devices);
        devices
    }

    /// Run one collection pass.
    ///
    /// `incremental` reuses cached terminal identity records; otherwise the
    /// cache is cleared for fresh reads. `exhaustive` forces the full
    /// binary-search scan even when a quick scan would look clean.
    ///
    /// Identity anomalies degrade individual devices, they never abort the
    /// pass; only queue-level failures (timeout, abort, transmit) do.
    pub fn collect(
        &self,
        comm: &mut DaliComm,
        incremental: bool,
        exhaustive: bool,
        cb: impl FnOnce(&mut TransactionQueue, Result<Vec<DaliBusDevice>>) + 'static,
    ) {
        if !incremental {
            self.cache.borrow_mut().clear();
        }
        let cache = self.cache.clone();
        let ctx = comm.identity_context();
        comm.full_bus_scan(!exhaustive, move |q, res| match res {
            Ok(scan) => {
                if !scan.unreliable.is_empty() {
                    tracing::warn!(
                        addresses = ?scan.unreliable,
                        "addresses remain unreliable after scan"
                    );
                }
                // every observed short address gets a cache entry right away
                {
                    let mut cache = cache.borrow_mut();
                    for &addr in &scan.reliable {
                        if cache.get(addr).is_none() {
                            cache.insert(DaliDeviceInfo::new(addr));
                        }
                    }
                }
                read_next_identity(
                    q,
                    scan.reliable.into(),
                    Vec::new(),
                    cache,
                    ctx,
                    Box::new(cb),
                );
            }
            Err(e) => cb(q, Err(e)),
        });
    }
}

fn read_next_identity(
    queue: &mut TransactionQueue,
    mut pending: VecDeque<u8>,
    mut collected: Vec<DaliDeviceInfo>,
    cache: Rc<RefCell<DeviceInfoCache>>,
    ctx: IdentityContext,
    cb: CollectCallback,
) {
    let Some(addr) = pending.pop_front() else {
        let mut devices: Vec<DaliBusDevice> = collected
            .into_iter()
            .map(|info| DaliBusDevice::new(&ctx.bus_instance, info))
            .collect();
        reconcile_stable_ids(&mut devices);
        tracing::info!(count = devices.len(), "collection pass complete");
        return cb(queue, Ok(devices));
    };
    let cached = cache.borrow().terminal(addr).cloned();
    if let Some(info) = cached {
        tracing::info!(short_address = addr, "using cached device info");
        collected.push(info);
        return read_next_identity(queue, pending, collected, cache, ctx, cb);
    }
    comm::read_device_info_on(
        queue,
        addr,
        ctx.clone(),
        Box::new(move |q, res| match res {
            Ok(info) => {
                cache.borrow_mut().insert(info.clone());
                collected.push(info);
                read_next_identity(q, pending, collected, cache, ctx, cb);
            }
            Err(e) => {
                tracing::error!(short_address = addr, error = %e, "identity read failed");
                cb(q, Err(e))
            }
        }),
    );
}
