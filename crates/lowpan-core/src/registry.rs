//! Interface registry: records the one active virtual interface so other
//! components can look it up without owning it.
//!
//! Each slot is set once. Recording a second descriptor or name fails with
//! `AlreadyInitialized` instead of overwriting. The registry never opens or
//! closes anything; `reset` is called by the interface owner after close.

use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} already recorded for this process")]
    AlreadyInitialized(&'static str),
}

#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    descriptor: Mutex<Option<RawFd>>,
    name: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Slots hold plain values, so a poisoned lock is still usable.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_descriptor(&self, fd: RawFd) -> Result<(), RegistryError> {
        let mut slot = lock(&self.descriptor);
        if slot.is_some() {
            return Err(RegistryError::AlreadyInitialized("interface descriptor"));
        }
        *slot = Some(fd);
        Ok(())
    }

    pub fn set_name(&self, name: &str) -> Result<(), RegistryError> {
        let mut slot = lock(&self.name);
        if slot.is_some() {
            return Err(RegistryError::AlreadyInitialized("interface name"));
        }
        *slot = Some(name.to_owned());
        Ok(())
    }

    /// `None` until a descriptor has been recorded.
    pub fn descriptor(&self) -> Option<RawFd> {
        *lock(&self.descriptor)
    }

    /// `None` until a name has been recorded.
    pub fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    /// Forget the recorded interface.
    pub fn reset(&self) {
        *lock(&self.descriptor) = None;
        *lock(&self.name) = None;
    }
}
