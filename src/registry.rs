//! The target-type registry: name -> implementation, with a live-instance
//! refcount so a target type can't be unregistered out from under a table
//! that still references it.

use std::{collections::HashMap, sync::Arc};

use crate::{error::DmError, target::TargetType};

struct Entry {
    target_type: Arc<dyn TargetType>,
    live_instances: usize,
}

/// Maps target-type names to their implementations.
///
/// A single `TargetRegistry` is owned by one [`crate::DmCore`]; unlike the
/// original driver's single process-wide `_target_types` list, nothing here
/// is global.
#[derive(Default)]
pub struct TargetRegistry {
    entries: HashMap<String, Entry>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target_type: Arc<dyn TargetType>) -> Result<(), DmError> {
        let name = target_type.name().to_owned();
        if self.entries.contains_key(&name) {
            return Err(DmError::DuplicateTarget(name));
        }
        self.entries.insert(
            name,
            Entry {
                target_type,
                live_instances: 0,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), DmError> {
        match self.entries.get(name) {
            Some(entry) if entry.live_instances > 0 => {
                Err(DmError::TargetInUse(name.to_owned()))
            }
            Some(_) => {
                self.entries.remove(name);
                Ok(())
            }
            None => Err(DmError::UnknownTarget(name.to_owned())),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn TargetType>, DmError> {
        self.entries
            .get(name)
            .map(|entry| Arc::clone(&entry.target_type))
            .ok_or_else(|| DmError::UnknownTarget(name.to_owned()))
    }

    /// Called when a table binds a new instance of `name`, so a subsequent
    /// `unregister` is rejected while the instance is live.
    pub fn mark_instantiated(&mut self, name: &str) -> Result<(), DmError> {
        self.entries
            .get_mut(name)
            .map(|entry| entry.live_instances += 1)
            .ok_or_else(|| DmError::UnknownTarget(name.to_owned()))
    }

    /// Called when a table holding an instance of `name` is torn down.
    pub fn mark_released(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.live_instances = entry.live_instances.saturating_sub(1);
        }
    }
}
