//! `dm-core`: a block-level I/O remapping engine.
//!
//! A [`DmCore`] owns a fixed-size table of devices (spec §4.5), each of
//! which can be blank, active (bound to an immutable [`table::MappingTable`]),
//! or suspended. The control plane drives devices through their lifecycle
//! ([`DmCore::create`], [`DmCore::activate`], [`DmCore::suspend`],
//! [`DmCore::deactivate`], [`DmCore::remove`]); the data plane submits
//! [`request::Request`]s through [`DmCore::submit`], which looks the
//! request's sector up in the device's bound table, dispatches it to the
//! resolved [`target::TargetType`], and installs a completion trampoline
//! that accounts for in-flight drainage (spec §4.7-§4.8).
//!
//! This crate ships no concrete targets (linear, striped, mirror,
//! snapshot are out of scope, spec §1) and does not talk to a real host
//! block layer; [`request::Request`] stands in for whatever the embedder's
//! actual I/O stack hands the core.

pub mod config;
pub mod deferred;
pub mod device;
pub mod error;
pub mod geometry;
pub mod hook;
pub mod param;
pub mod registry;
pub mod request;
pub mod sync;
pub mod table;
pub mod target;

use std::sync::{Arc, Mutex, RwLock};

pub use config::Config;
pub use device::{Device, DeviceHandle, DeviceInfo, DeviceState};
pub use error::{DmError, Result};
pub use geometry::Geometry;
pub use registry::TargetRegistry;
pub use request::{Completion, Direction, Request};
pub use table::{MappingTable, TableBuilder};
pub use target::{BmapResult, ErrAction, MapResult, TargetFeatures, TargetType};

use device::DeviceRegistry;
use hook::{Hook, HookPool};

/// Outcome of [`DmCore::submit`], mirroring the block layer's 0/1 return
/// convention (spec §6) as a named enum instead of a raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The request was handled entirely by the core: deferred, failed, or
    /// completed synchronously by a target. The caller does nothing more.
    Handled,
    /// The request was remapped and handed off; the trampoline installed
    /// on it will call back through to the original completion when the
    /// underlying I/O finishes.
    MappedThrough,
}

/// The runtime: target registry, device slot table, and I/O hook pool for
/// one independent remapping domain.
///
/// `MAX` bounds the compile-time capacity of the device slot array (spec
/// §4.5); [`Config::max_devices`] may configure a smaller runtime limit
/// but never a larger one. Defaults to 64, matching the original driver's
/// `MAX_DEVICES`.
pub struct DmCore<const MAX: usize = { param::MAX_DEVICES }> {
    config: Config,
    registry: RwLock<DeviceRegistry<MAX>>,
    target_registry: Mutex<TargetRegistry>,
    hook_pool: Arc<HookPool>,
}

impl<const MAX: usize> DmCore<MAX> {
    pub fn new(config: Config) -> Self {
        let hook_pool = Arc::new(HookPool::new(config.hook_pool_capacity));
        let registry = RwLock::new(DeviceRegistry::new(config.max_devices));
        Self {
            config,
            registry,
            target_registry: Mutex::new(TargetRegistry::new()),
            hook_pool,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a target-type implementation, making it available to
    /// subsequent [`DmCore::build_table`] calls by name.
    pub fn register_target(&self, target_type: Arc<dyn TargetType>) -> Result<()> {
        self.target_registry.lock().unwrap().register(target_type)
    }

    pub fn unregister_target(&self, name: &str) -> Result<()> {
        self.target_registry.lock().unwrap().unregister(name)
    }

    /// Resolves a [`TableBuilder`] against this core's target registry,
    /// producing an immutable [`MappingTable`] ready for [`DmCore::activate`].
    pub fn build_table(&self, builder: TableBuilder) -> Result<MappingTable> {
        builder.finalize(&mut self.target_registry.lock().unwrap())
    }

    /// Creates a blank device in a free slot (spec §4.6 `create`).
    pub fn create(&self, name: impl Into<String>, minor: Option<u32>) -> Result<DeviceHandle> {
        let mut registry = self.registry.write().unwrap();
        let minor = registry.allocate(name.into(), minor)?;
        log::info!("dm-core: created device minor={minor}");
        Ok(DeviceHandle { minor })
    }

    /// Reads a point-in-time snapshot of a device's control-plane state.
    pub fn find_by_minor(&self, minor: u32) -> Option<DeviceInfo> {
        let registry = self.registry.read().unwrap();
        registry.find_by_minor(minor).map(DeviceInfo::from)
    }

    /// Registers an open handle against a device, as the original
    /// driver's `dm_blk_open` does, gating `suspend`/`deactivate`/`remove`
    /// while any handle remains open (spec §3 invariant ii).
    pub fn open(&self, handle: DeviceHandle) -> Result<()> {
        let mut registry = self.registry.write().unwrap();
        let device = registry
            .find_by_minor_mut(handle.minor)
            .ok_or(DmError::NoSuchDevice)?;
        device.use_count += 1;
        Ok(())
    }

    /// The `dm_blk_close` counterpart to [`DmCore::open`].
    pub fn close(&self, handle: DeviceHandle) -> Result<()> {
        let mut registry = self.registry.write().unwrap();
        let device = registry
            .find_by_minor_mut(handle.minor)
            .ok_or(DmError::NoSuchDevice)?;
        device.use_count = device.use_count.saturating_sub(1);
        Ok(())
    }

    /// Binds `table` to `handle` and flushes any requests parked while it
    /// was blank or suspended (spec §4.6 `activate`).
    ///
    /// Errors: [`DmError::NoSuchDevice`] if the handle is stale,
    /// [`DmError::Busy`] if the device is already active.
    pub fn activate(&self, handle: DeviceHandle, table: MappingTable) -> Result<()> {
        let table = Arc::new(table);
        let deferred = {
            let mut registry = self.registry.write().unwrap();
            let device = registry
                .find_by_minor_mut(handle.minor)
                .ok_or(DmError::NoSuchDevice)?;
            if device.state == DeviceState::Active {
                return Err(DmError::Busy);
            }
            let last_high = table.last_high();
            device.block_size_kb = u32::try_from((last_high + 1) / 2).unwrap_or(u32::MAX);
            device.hardsect_size = table.hardsect_size();
            device.table = Some(Arc::clone(&table));
            device.state = DeviceState::Active;
            device.deferred.drain_all()
        };
        log::info!(
            "dm-core: activated device minor={} targets={} flushing={}",
            handle.minor,
            table.num_targets(),
            deferred.len()
        );
        for entry in deferred {
            self.submit(entry.request);
        }
        Ok(())
    }

    /// Quiesces a device (spec §4.6 `suspend`): clears ACTIVE so new
    /// submissions begin to defer, then blocks until every in-flight
    /// request against the old table has completed. A no-op if the
    /// device isn't currently active.
    ///
    /// The table stays bound for the whole drain (only `submit`'s ACTIVE
    /// check, not its "has a table" check, is what makes new submissions
    /// defer during this window); it is detached only once the drain
    /// completes, matching spec §4.6's "table pointer is cleared" landing
    /// on "on return", not at the start of the call.
    pub fn suspend(&self, handle: DeviceHandle) -> Result<()> {
        let table = {
            let mut registry = self.registry.write().unwrap();
            let device = registry
                .find_by_minor_mut(handle.minor)
                .ok_or(DmError::NoSuchDevice)?;
            if device.state != DeviceState::Active {
                return Ok(());
            }
            device.state = DeviceState::Suspended;
            Arc::clone(device.table.as_ref().expect("Active implies a bound table"))
        };
        table.drain();
        self.detach_drained_table(handle.minor);
        self.release_table(&table);
        log::info!("dm-core: suspended device minor={}", handle.minor);
        Ok(())
    }

    /// Tears a device down (spec testable property 8: rejects data-path
    /// requests outright until re-activated — by the time this returns,
    /// the table is detached the same way [`DmCore::suspend`] leaves it),
    /// performing the same drain `suspend` does but with the use-count
    /// precondition and double-checked locking spec §4.6 specifies for
    /// `deactivate`.
    pub fn deactivate(&self, handle: DeviceHandle) -> Result<()> {
        {
            let registry = self.registry.read().unwrap();
            let device = registry
                .find_by_minor(handle.minor)
                .ok_or(DmError::NoSuchDevice)?;
            if device.use_count > 0 {
                return Err(DmError::Busy);
            }
            if device.state != DeviceState::Active {
                return Ok(());
            }
        }
        // Host-level device sync belongs here, outside the write lock;
        // the host block layer is out of scope for this crate (spec §1).
        log::debug!("dm-core: syncing device minor={} before deactivate", handle.minor);
        let table = {
            let mut registry = self.registry.write().unwrap();
            let device = registry
                .find_by_minor_mut(handle.minor)
                .ok_or(DmError::NoSuchDevice)?;
            // Re-check: a racing open may have landed while we held no lock.
            if device.use_count > 0 {
                return Err(DmError::Busy);
            }
            if device.state != DeviceState::Active {
                return Ok(());
            }
            device.state = DeviceState::Suspended;
            Arc::clone(device.table.as_ref().expect("Active implies a bound table"))
        };
        table.drain();
        self.detach_drained_table(handle.minor);
        self.release_table(&table);
        log::info!("dm-core: deactivated device minor={}", handle.minor);
        Ok(())
    }

    /// Detaches a device's table once its drain has completed, unless a
    /// concurrent `activate` already raced ahead and bound a new one (in
    /// which case the device is `Active` again and there is nothing of
    /// ours left to detach).
    fn detach_drained_table(&self, minor: u32) {
        let mut registry = self.registry.write().unwrap();
        if let Some(device) = registry.find_by_minor_mut(minor) {
            if device.state == DeviceState::Suspended {
                device.table = None;
            }
        }
    }

    /// Frees a device's slot (spec §4.6 `remove`).
    ///
    /// Errors: [`DmError::Busy`] if the device has open handles or is
    /// still active.
    pub fn remove(&self, handle: DeviceHandle) -> Result<()> {
        let mut registry = self.registry.write().unwrap();
        let device = registry
            .find_by_minor(handle.minor)
            .ok_or(DmError::NoSuchDevice)?;
        if device.use_count > 0 || device.state == DeviceState::Active {
            return Err(DmError::Busy);
        }
        registry.release(handle.minor);
        log::info!("dm-core: removed device minor={}", handle.minor);
        Ok(())
    }

    /// The request path entry point (spec §4.7): looks up `request`'s
    /// device, and either dispatches it against the bound table or parks
    /// it on the deferred queue.
    pub fn submit(&self, request: Request) -> SubmitOutcome {
        let minor = request.minor;
        let table_if_active = {
            let registry = self.registry.read().unwrap();
            if minor as usize >= registry.limit() {
                return self.fail_io(request);
            }
            let device = match registry.find_by_minor(minor) {
                Some(device) => device,
                None => return self.fail_io(request),
            };
            let table = match &device.table {
                Some(table) => table,
                None => return self.fail_io(request),
            };
            if device.is_active() {
                Some(Arc::clone(table))
            } else {
                None
            }
        };
        match table_if_active {
            Some(table) => self.dispatch(request, table),
            None => self.defer(request),
        }
    }

    /// The `bmap` control operation (spec §4.9): resolves the physical
    /// device/sector a logical sector maps to, without submitting I/O.
    ///
    /// Resolved through the same [`TargetType::map`] real I/O dispatches
    /// through, against a stub [`Request`] that is built, mapped, and
    /// discarded under the read lock without ever reaching `submit` — a
    /// hook is allocated around the call exactly as dispatch does, so a
    /// target's `map` can assume one is always outstanding while it runs.
    pub fn bmap_query(&self, handle: DeviceHandle, sector: u64) -> Result<BmapResult> {
        let registry = self.registry.read().unwrap();
        let device = registry
            .find_by_minor(handle.minor)
            .ok_or(DmError::NoSuchDevice)?;
        if !device.is_active() {
            return Err(DmError::NoSuchDevice);
        }
        let table = device.table.as_ref().expect("is_active implies a bound table");
        let idx = table.lookup(sector);
        let instance = table.target(idx);
        if !instance
            .target_type
            .features()
            .contains(TargetFeatures::SUPPORTS_BMAP)
        {
            return Err(DmError::Unsupported);
        }
        let offset = sector - instance.start;
        let hook = self
            .hook_pool
            .alloc(
                Arc::clone(table),
                Arc::clone(&instance.target_type),
                Arc::clone(&instance.ctx),
                Direction::Read,
            )
            .ok_or(DmError::OutOfMemory)?;
        let mut stub = Request::new(
            handle.minor,
            sector,
            1,
            Direction::Read,
            Completion::new(|_| {}),
        );
        let result = instance.target_type.map(instance.ctx.as_ref(), offset, &mut stub);
        self.hook_pool.free(hook);
        match result {
            MapResult::Remapped => Ok(BmapResult {
                device: u64::from(stub.minor),
                sector: stub.sector,
            }),
            MapResult::DeferredByTarget | MapResult::Error => Err(DmError::Unsupported),
        }
    }

    /// Synthesized CHS geometry for a device's currently bound table
    /// (spec §4.10); an ambient helper the core doesn't call internally.
    pub fn geometry(&self, handle: DeviceHandle) -> Result<Geometry> {
        let registry = self.registry.read().unwrap();
        let device = registry
            .find_by_minor(handle.minor)
            .ok_or(DmError::NoSuchDevice)?;
        let table = device.table.as_ref().ok_or(DmError::NoSuchDevice)?;
        Ok(geometry::synthesize(table.last_high()))
    }

    fn fail_io(&self, request: Request) -> SubmitOutcome {
        log::trace!("dm-core: io-error minor={} sector={}", request.minor, request.sector);
        request.signal_completion(false);
        SubmitOutcome::Handled
    }

    /// Parks `request` on its device's deferred queue, re-checking under
    /// the write lock whether the device became active in the window
    /// between the read lock releasing and this call acquiring the write
    /// lock (spec §4.7 step 3; the known race documented in spec §5: the
    /// re-entry into mapping here doesn't re-validate table identity,
    /// which is accepted as-is per the original's own acknowledged
    /// behavior).
    fn defer(&self, request: Request) -> SubmitOutcome {
        let minor = request.minor;
        let direction = request.direction;
        let mut registry = self.registry.write().unwrap();
        let device = match registry.find_by_minor_mut(minor) {
            Some(device) => device,
            None => {
                drop(registry);
                return self.fail_io(request);
            }
        };
        if device.is_active() {
            let table = Arc::clone(device.table.as_ref().expect("is_active implies a bound table"));
            drop(registry);
            return self.dispatch(request, table);
        }
        device.deferred.push(request, direction);
        SubmitOutcome::Handled
    }

    /// Looks up the target owning `request`'s sector in `table`, allocates
    /// a hook, and either installs a completion trampoline (remapped),
    /// frees the hook with no further action (the target owns completion
    /// itself), or fails the request (spec §4.7 step 4 / §4.8).
    fn dispatch(&self, mut request: Request, table: Arc<MappingTable>) -> SubmitOutcome {
        let idx = table.lookup(request.sector);
        let (target_type, target_ctx, offset) = {
            let instance = table.target(idx);
            (
                Arc::clone(&instance.target_type),
                Arc::clone(&instance.ctx),
                request.sector - instance.start,
            )
        };
        let direction = request.direction;
        let mut hook = match self.hook_pool.alloc(
            Arc::clone(&table),
            Arc::clone(&target_type),
            Arc::clone(&target_ctx),
            direction,
        ) {
            Some(hook) => hook,
            None => {
                log::warn!("dm-core: hook pool exhausted, minor={}", request.minor);
                return self.fail_io(request);
            }
        };

        match target_type.map(target_ctx.as_ref(), offset, &mut request) {
            MapResult::Remapped => {
                table.begin_io();
                hook.original = request.take_completion();
                let pool = Arc::clone(&self.hook_pool);
                let err_probe_request = request.clone();
                let trampoline = make_trampoline(hook, err_probe_request, pool);
                request.set_completion(trampoline);
                SubmitOutcome::MappedThrough
            }
            MapResult::DeferredByTarget => {
                self.hook_pool.free(hook);
                SubmitOutcome::Handled
            }
            MapResult::Error => {
                self.hook_pool.free(hook);
                self.fail_io(request)
            }
        }
    }

    fn release_table(&self, table: &MappingTable) {
        table.release(&mut self.target_registry.lock().unwrap());
    }
}

/// Builds the completion trampoline installed on a dispatched request
/// (spec §4.8 step 1).
///
/// On a `false` completion the target's `err` hook may ask for a retry;
/// when it does, the hook must not be freed here (it's still backing the
/// in-flight request) but the `Completion` it came wrapped in has already
/// fired and can't be reused. Instead a fresh trampoline, closing back
/// over the same hook, is reinstalled on `err_probe_request`'s shared
/// completion slot — `err_probe_request` is a clone of the dispatched
/// request, so whatever backend redelivers the retried I/O's completion
/// fires into this new trampoline and eventually frees the hook and
/// decrements in-flight exactly once (spec invariants 3 and 4).
fn make_trampoline(hook: Hook, err_probe_request: Request, pool: Arc<HookPool>) -> Completion {
    Completion::new(move |uptodate| {
        let mut hook = hook;
        if !uptodate {
            let action = hook
                .target_type
                .err(hook.target_ctx.as_ref(), hook.direction, &err_probe_request);
            if action == Some(ErrAction::Retry) {
                let retry_probe = err_probe_request.clone();
                let retry = make_trampoline(hook, retry_probe, pool);
                err_probe_request.set_completion(retry);
                return;
            }
        }
        hook.table.end_io();
        let original = hook.original.take();
        pool.free(hook);
        if let Some(original) = original {
            original.fire(uptodate);
        }
    })
}
