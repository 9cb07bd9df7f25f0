//! Resource diff: decides whether a declared resource changed since it was last applied.

use std::collections::BTreeSet;

use crate::model::{
    DiskSpec, MachineSpec, RecordedResource, Resource, ResourceKey, ZdbSpec,
};

/// Outcome of comparing one declared resource against the recorded list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diff<'a> {
    pub changed: bool,
    /// `None` means the resource is new.
    pub prior: Option<&'a RecordedResource>,
}

impl Diff<'_> {
    /// Version the resource gets in the next deployment.
    pub fn next_version(&self) -> u32 {
        match self.prior {
            None => 0,
            Some(prior) if self.changed => prior.version + 1,
            Some(prior) => prior.version,
        }
    }

    pub fn is_new(&self) -> bool {
        self.prior.is_none()
    }
}

/// Compare `declared` against `prior` by identity key.
///
/// A resource without a prior match is reported as unchanged with no prior;
/// removals are not reported here (see [`removed`]).
pub fn diff<'a>(declared: &Resource, prior: &'a [RecordedResource]) -> Diff<'a> {
    let key = declared.key();
    match prior.iter().find(|p| p.resource.key() == key) {
        None => Diff {
            changed: false,
            prior: None,
        },
        Some(p) => Diff {
            changed: has_changed(declared, &p.resource),
            prior: Some(p),
        },
    }
}

fn has_changed(declared: &Resource, recorded: &Resource) -> bool {
    match (declared, recorded) {
        (Resource::Disk(d), Resource::Disk(r)) => disk_changed(d, r),
        (Resource::StorageNode(d), Resource::StorageNode(r)) => zdb_changed(d, r),
        (Resource::Machine(d), Resource::Machine(r)) => machine_changed(d, r),
        // keys match only within a kind
        _ => true,
    }
}

fn disk_changed(declared: &DiskSpec, recorded: &DiskSpec) -> bool {
    declared.size != recorded.size || declared.description != recorded.description
}

fn zdb_changed(declared: &ZdbSpec, recorded: &ZdbSpec) -> bool {
    declared.size != recorded.size
        || declared.mode != recorded.mode
        || declared.description != recorded.description
        || declared.password != recorded.password
}

fn machine_changed(declared: &MachineSpec, recorded: &MachineSpec) -> bool {
    declared.cpu != recorded.cpu
        || declared.memory != recorded.memory
        || declared.entrypoint != recorded.entrypoint
        || declared.mount_set() != recorded.mount_set()
        || declared.env() != recorded.env()
        // only an explicit request moves a machine
        || declared.ip.is_some_and(|ip| recorded.ip != Some(ip))
}

/// Recorded resources whose identity no longer appears in the declared set.
pub fn removed<'a>(
    declared: &[Resource],
    prior: &'a [RecordedResource],
) -> Vec<&'a RecordedResource> {
    let keys: BTreeSet<ResourceKey> = declared.iter().map(Resource::key).collect();
    prior
        .iter()
        .filter(|p| !keys.contains(&p.resource.key()))
        .collect()
}
