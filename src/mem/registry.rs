//! Process-wide registry of memory domains, keyed by 16-bit id.
//!
//! The registry owns id assignment (wrap-around scan from the last
//! assigned id, skipping 0, which is reserved as an error value), lookup,
//! and the domain reference counts. A domain stays in the registry while
//! its count is positive; the last put removes it and releases its pools.
//!
//! Lock order: the registry lock may be held while a domain mutex is
//! taken (domain creation runs configure), never the reverse.

use super::cluster::{ClusterBackend, MmapBackend};
use super::global::GlobalMem;
use super::passthrough::{PassthroughMem, PtMemDev};
use super::{MemAllocator, PoolParams, PrivateSpec, MEM_HIDDEN, POOLS_NR};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

struct Entry {
    domain: Arc<dyn MemAllocator>,
    refcount: u32,
}

struct RegInner {
    domains: BTreeMap<u16, Entry>,
    last_id: u16,
}

impl RegInner {
    /// Reserve the first free id after the last assigned one, wrapping
    /// around and skipping 0.
    fn assign_id(&mut self) -> Result<u16> {
        let mut id = self.last_id;
        loop {
            id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.domains.contains_key(&id) {
                self.last_id = id;
                return Ok(id);
            }
            if id == self.last_id {
                return Err(Error::OutOfMemory("no free memory domain id".into()));
            }
        }
    }

    fn install(&mut self, domain: Arc<dyn MemAllocator>) {
        self.domains.insert(
            domain.id(),
            Entry {
                domain,
                refcount: 1,
            },
        );
    }
}

/// Registry of all memory domains of a process.
///
/// Construction installs the global domain under id 1; it stays present
/// for the registry's lifetime.
pub struct MemRegistry {
    inner: Mutex<RegInner>,
    global: Arc<GlobalMem>,
}

impl MemRegistry {
    /// Create a registry with the global domain installed.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MmapBackend))
    }

    /// Create a registry whose global domain uses `backend` for cluster
    /// memory.
    pub fn with_backend(backend: Arc<dyn ClusterBackend>) -> Self {
        let global = GlobalMem::new_global(backend);
        let mut inner = RegInner {
            domains: BTreeMap::new(),
            last_id: 1,
        };
        inner.install(global.clone());
        Self {
            inner: Mutex::new(inner),
            global,
        }
    }

    /// The global domain (id 1).
    pub fn global(&self) -> Arc<GlobalMem> {
        self.global.clone()
    }

    /// Look up a domain by id and take a reference on it. Domains still
    /// being prepared (HIDDEN) are invisible.
    pub fn find(&self, id: u16) -> Option<Arc<dyn MemAllocator>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.domains.get_mut(&id)?;
        if entry.domain.flags() & MEM_HIDDEN != 0 {
            return None;
        }
        entry.refcount += 1;
        Some(entry.domain.clone())
    }

    /// Take an additional reference on a domain already held.
    pub fn get(&self, domain: &Arc<dyn MemAllocator>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.domains.get_mut(&domain.id()) {
            entry.refcount += 1;
        }
    }

    /// Drop a reference; the last one removes the domain from the
    /// registry and releases its pools.
    pub fn put(&self, domain: &Arc<dyn MemAllocator>) {
        let last = {
            let mut inner = self.inner.lock().unwrap();
            match inner.domains.get_mut(&domain.id()) {
                Some(entry) => {
                    entry.refcount -= 1;
                    if entry.refcount == 0 {
                        inner.domains.remove(&domain.id());
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last {
            domain.delete();
        }
    }

    /// Current reference count of a domain, 0 if absent.
    pub fn refcount(&self, id: u16) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .domains
            .get(&id)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    /// Create a private domain sized for one port.
    pub fn create_private(&self, spec: &PrivateSpec) -> Result<Arc<GlobalMem>> {
        self.create_private_with(spec.pool_params(), Arc::new(MmapBackend))
    }

    /// Create a private domain from explicit parameters and a cluster
    /// backend.
    pub fn create_private_with(
        &self,
        params: [PoolParams; POOLS_NR],
        backend: Arc<dyn ClusterBackend>,
    ) -> Result<Arc<GlobalMem>> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.assign_id()?;
        match GlobalMem::new_private(id, params, backend) {
            Ok(d) => {
                inner.install(d.clone());
                Ok(d)
            }
            Err(e) => {
                // The id was never installed; the cursor simply moves on.
                Err(e)
            }
        }
    }

    /// Find the passthrough domain for a host-side id, creating it if
    /// this is the first time the host memory shows up in the guest.
    pub fn pt_guest_get(&self, host_mem_id: u16) -> Result<Arc<PassthroughMem>> {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.domains.values_mut() {
            if entry.domain.pt_host_id() == Some(host_mem_id) {
                entry.refcount += 1;
                let d = entry.domain.clone();
                return d.as_passthrough().ok_or(Error::PeerNotFound);
            }
        }
        let id = inner.assign_id()?;
        let d = PassthroughMem::new(id, host_mem_id);
        inner.install(d.clone());
        Ok(d)
    }

    /// Attach the memory device to the passthrough domain for
    /// `host_mem_id`, creating the domain on first sight.
    pub fn pt_guest_attach(
        &self,
        dev: Arc<dyn PtMemDev>,
        host_mem_id: u16,
    ) -> Result<Arc<PassthroughMem>> {
        let d = self.pt_guest_get(host_mem_id)?;
        d.set_device(dev);
        Ok(d)
    }
}

impl Default for MemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_params() -> [PoolParams; POOLS_NR] {
        [
            PoolParams::new(1024, 2),
            PoolParams::new(5 * 4096, 4),
            PoolParams::new(2048, 4098),
        ]
    }

    #[test]
    fn global_domain_is_id_one() {
        let reg = MemRegistry::new();
        assert_eq!(reg.global().id(), 1);
        let found = reg.find(1).unwrap();
        assert_eq!(found.id(), 1);
        assert_eq!(reg.refcount(1), 2);
    }

    #[test]
    fn ids_are_assigned_after_the_cursor() {
        let reg = MemRegistry::new();
        let a = reg
            .create_private_with(tiny_params(), Arc::new(MmapBackend))
            .unwrap();
        let b = reg
            .create_private_with(tiny_params(), Arc::new(MmapBackend))
            .unwrap();
        assert_eq!(a.id(), 2);
        assert_eq!(b.id(), 3);
    }

    #[test]
    fn put_removes_on_last_reference() {
        let reg = MemRegistry::new();
        let d = reg
            .create_private_with(tiny_params(), Arc::new(MmapBackend))
            .unwrap();
        let id = d.id();
        let dyn_d: Arc<dyn MemAllocator> = d;
        reg.get(&dyn_d);
        assert_eq!(reg.refcount(id), 2);
        reg.put(&dyn_d);
        assert_eq!(reg.refcount(id), 1);
        reg.put(&dyn_d);
        assert_eq!(reg.refcount(id), 0);
        assert!(reg.find(id).is_none());
    }

    #[test]
    fn released_ids_are_reused_after_wrap() {
        let reg = MemRegistry::new();
        let a = reg
            .create_private_with(tiny_params(), Arc::new(MmapBackend))
            .unwrap();
        let b = reg
            .create_private_with(tiny_params(), Arc::new(MmapBackend))
            .unwrap();
        let a_id = a.id();
        let dyn_a: Arc<dyn MemAllocator> = a;
        reg.put(&dyn_a);

        // The cursor has moved past the hole; the freed id comes back
        // only once the scan wraps around to it.
        let c = reg
            .create_private_with(tiny_params(), Arc::new(MmapBackend))
            .unwrap();
        assert_ne!(c.id(), b.id());
        assert!(c.id() > b.id() || c.id() == a_id);
    }

    #[test]
    fn find_skips_absent_ids() {
        let reg = MemRegistry::new();
        assert!(reg.find(42).is_none());
    }
}
