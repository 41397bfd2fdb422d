//! The device slot table and the per-device state machine (spec §4.5,
//! §4.6): create / activate / suspend / deactivate / remove.
//!
//! The original driver indexes a process-wide array by minor number under
//! one global spinlock (spec §9); here that becomes a single owner type,
//! [`DeviceRegistry`], holding a fixed-size slot array sized by a const
//! generic so embedders that know their device count at compile time pay
//! no heap allocation for the table itself. [`crate::DmCore`] is the sole
//! owner of one `RwLock<DeviceRegistry<MAX>>` (spec §5); this module does
//! no locking of its own.

use std::sync::Arc;

use crate::{deferred::DeferredQueue, error::DmError, table::MappingTable};

/// A device's lifecycle state (spec §4.6 lists exactly these four:
/// Blank, Active, Suspended, Removed; `Removed` isn't representable here
/// since removal frees the slot entirely, see [`DeviceRegistry::release`]).
///
/// `deactivate` (spec §4.6) has the same effect on this state as
/// `suspend` — both clear ACTIVE and detach the table after draining —
/// so it also lands the device in `Suspended` rather than a separate
/// state of its own; the two operations differ only in their
/// preconditions (`deactivate` additionally requires use-count = 0 and
/// performs a host-level sync) and are otherwise the same transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Blank,
    Active,
    Suspended,
}

/// One device slot (spec §3 "Device").
pub struct Device {
    pub minor: u32,
    pub name: String,
    pub use_count: usize,
    pub state: DeviceState,
    pub table: Option<Arc<MappingTable>>,
    pub deferred: DeferredQueue,
    pub block_size_kb: u32,
    pub hardsect_size: u32,
}

impl Device {
    fn blank(minor: u32, name: String) -> Self {
        Self {
            minor,
            name,
            use_count: 0,
            state: DeviceState::Blank,
            table: None,
            deferred: DeferredQueue::new(),
            block_size_kb: 0,
            hardsect_size: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        // ACTIVE implies a bound table (the converse doesn't hold: a
        // `Suspended` device keeps its table bound for the duration of the
        // drain, per spec §4.6, only detaching it once `suspend`/
        // `deactivate` return).
        debug_assert!(self.state != DeviceState::Active || self.table.is_some());
        self.state == DeviceState::Active
    }
}

/// A stable handle to a device slot, returned by [`crate::DmCore::create`]
/// and accepted by every other control-plane operation. Mirrors the
/// original driver's `mapped_device *`, minus the identity: here the minor
/// number alone is the handle (the major number is process-wide and not
/// modeled, per spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub minor: u32,
}

/// A read-only snapshot of a device's control-plane-visible state, handed
/// back by [`crate::DmCore::find_by_minor`] without holding the registry
/// lock open past the call.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub minor: u32,
    pub name: String,
    pub use_count: usize,
    pub state: DeviceState,
    pub num_targets: usize,
    pub block_size_kb: u32,
    pub hardsect_size: u32,
    pub deferred_len: usize,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            minor: device.minor,
            name: device.name.clone(),
            use_count: device.use_count,
            state: device.state,
            num_targets: device.table.as_ref().map_or(0, |t| t.num_targets()),
            block_size_kb: device.block_size_kb,
            hardsect_size: device.hardsect_size,
            deferred_len: device.deferred.len(),
        }
    }
}

/// Fixed-size minor-number -> device slot table.
///
/// `MAX` bounds the compiled-in array size; `limit` (<= `MAX`, set from
/// [`crate::config::Config::max_devices`]) bounds how many of those slots
/// a particular `DmCore` instance actually hands out, so one binary can
/// serve embedders with different configured limits off the same
/// monomorphized type.
pub struct DeviceRegistry<const MAX: usize = 64> {
    limit: usize,
    slots: Box<[Option<Device>; MAX]>,
}

impl<const MAX: usize> DeviceRegistry<MAX> {
    pub fn new(limit: usize) -> Self {
        assert!(limit <= MAX, "configured max_devices exceeds const capacity MAX={MAX}");
        Self {
            limit,
            slots: Box::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn find_by_minor(&self, minor: u32) -> Option<&Device> {
        self.slots.get(minor as usize)?.as_ref()
    }

    pub fn find_by_minor_mut(&mut self, minor: u32) -> Option<&mut Device> {
        self.slots.get_mut(minor as usize)?.as_mut()
    }

    /// Allocates a slot for a new device: a specific `minor` if given
    /// (fails if occupied or out of the configured range), else the
    /// first free slot found by linear scan.
    pub fn allocate(&mut self, name: String, minor: Option<u32>) -> Result<u32, DmError> {
        let minor = match minor {
            Some(minor) => {
                if minor as usize >= self.limit {
                    return Err(DmError::SlotExhausted);
                }
                if self.slots[minor as usize].is_some() {
                    return Err(DmError::MinorInUse);
                }
                minor
            }
            None => {
                let free = (0..self.limit as u32).find(|&m| self.slots[m as usize].is_none());
                free.ok_or(DmError::SlotExhausted)?
            }
        };
        self.slots[minor as usize] = Some(Device::blank(minor, name));
        Ok(minor)
    }

    /// Frees a slot. Precondition (checked by the caller, `DmCore::remove`):
    /// use-count = 0 and not ACTIVE.
    pub fn release(&mut self, minor: u32) {
        if let Some(slot) = self.slots.get_mut(minor as usize) {
            *slot = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_specific_minor_then_reject_duplicate() {
        let mut registry: DeviceRegistry<8> = DeviceRegistry::new(8);
        registry.allocate("a".into(), Some(3)).unwrap();
        assert!(matches!(
            registry.allocate("b".into(), Some(3)),
            Err(DmError::MinorInUse)
        ));
    }

    #[test]
    fn allocate_any_picks_first_free() {
        let mut registry: DeviceRegistry<4> = DeviceRegistry::new(4);
        registry.allocate("a".into(), Some(0)).unwrap();
        let minor = registry.allocate("b".into(), None).unwrap();
        assert_eq!(minor, 1);
    }

    #[test]
    fn exhaustion_reported_once_limit_reached() {
        let mut registry: DeviceRegistry<2> = DeviceRegistry::new(2);
        registry.allocate("a".into(), None).unwrap();
        registry.allocate("b".into(), None).unwrap();
        assert!(matches!(
            registry.allocate("c".into(), None),
            Err(DmError::SlotExhausted)
        ));
    }

    #[test]
    fn release_frees_slot_for_reuse() {
        let mut registry: DeviceRegistry<2> = DeviceRegistry::new(2);
        let minor = registry.allocate("a".into(), None).unwrap();
        registry.release(minor);
        assert!(registry.find_by_minor(minor).is_none());
        assert!(registry.allocate("b".into(), Some(minor)).is_ok());
    }

    #[test]
    fn configured_limit_below_max_is_enforced() {
        let mut registry: DeviceRegistry<8> = DeviceRegistry::new(2);
        registry.allocate("a".into(), None).unwrap();
        registry.allocate("b".into(), None).unwrap();
        assert!(matches!(
            registry.allocate("c".into(), None),
            Err(DmError::SlotExhausted)
        ));
    }
}
