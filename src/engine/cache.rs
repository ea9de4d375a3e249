//! In-memory metadata of the known virtual machines, indexed by uuid,
//! descriptor path and name. The VM record is stored once, under its uuid,
//! the two other indices resolve to that uuid so they can never disagree.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use super::VirtualMachine;

#[derive(Debug, Default)]
pub struct VmCache {
    by_uuid: HashMap<String, VirtualMachine>,
    by_path: HashMap<PathBuf, String>,
    by_name: HashMap<String, String>,
}

impl VmCache {
    pub fn new() -> VmCache {
        VmCache::default()
    }

    /// Insert or replace a VM, all indices are updated
    pub fn insert(&mut self, vm: VirtualMachine) {
        self.remove(&vm.uuid);
        self.by_path.insert(vm.path.clone(), vm.uuid.clone());
        self.by_name.insert(vm.name.clone(), vm.uuid.clone());
        self.by_uuid.insert(vm.uuid.clone(), vm);
    }

    pub fn remove(&mut self, uuid: &str) -> Option<VirtualMachine> {
        let vm = self.by_uuid.remove(uuid)?;
        if self.by_path.get(&vm.path).map(String::as_str) == Some(uuid) {
            self.by_path.remove(&vm.path);
        }
        if self.by_name.get(&vm.name).map(String::as_str) == Some(uuid) {
            self.by_name.remove(&vm.name);
        }
        Some(vm)
    }

    pub fn get(&self, uuid: &str) -> Option<&VirtualMachine> {
        self.by_uuid.get(uuid)
    }

    pub fn by_name(&self, name: &str) -> Option<&VirtualMachine> {
        self.by_name.get(name).and_then(|uuid| self.by_uuid.get(uuid))
    }

    pub fn by_path(&self, path: &Path) -> Option<&VirtualMachine> {
        self.by_path.get(path).and_then(|uuid| self.by_uuid.get(uuid))
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.by_uuid.contains_key(uuid)
    }

    /// Apply `f` to a cached VM, re-indexing it in case its name or path
    /// changed. Returns the updated VM.
    pub fn update<F>(&mut self, uuid: &str, f: F) -> Option<VirtualMachine>
    where
        F: FnOnce(&mut VirtualMachine),
    {
        let mut vm = self.remove(uuid)?;
        f(&mut vm);
        self.insert(vm.clone());
        Some(vm)
    }

    /// Swap the whole content with a freshly enumerated set
    pub fn replace(&mut self, fresh: VmCache) {
        *self = fresh;
    }

    /// Cached VMs sorted by name
    pub fn list(&self) -> Vec<VirtualMachine> {
        let mut vms: Vec<VirtualMachine> = self.by_uuid.values().cloned().collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.uuid.cmp(&b.uuid)));
        vms
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}
