//! Workload builder: turns a declared resource and its version into a workload.
//!
//! The builder is pure. Secrets arrive already encrypted, and cross-references
//! (machine mounts to disks) are checked here rather than left to the node.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::grid::{
    ComputeCapacity, MachineInterface, MachineMount, MachineNetwork, NetworkData, Peer, Workload,
    WorkloadData, ZMachine, ZMount, Zdb, GIGABYTE, MEGABYTE,
};
use crate::model::{DiskSpec, MachineSpec, Resource, ZdbSpec};
use crate::validation::{validate_name, Result, ValidationError};

/// Builds workloads for the resources of one deployment.
#[derive(Debug, Clone)]
pub struct WorkloadBuilder {
    network_name: String,
    disks: BTreeSet<String>,
}

impl WorkloadBuilder {
    /// `resources` is the full declared set; disk names are taken from it to
    /// resolve machine mounts.
    pub fn new(network_name: impl Into<String>, resources: &[Resource]) -> Self {
        let disks = resources
            .iter()
            .filter_map(|r| match r {
                Resource::Disk(d) => Some(d.name.clone()),
                _ => None,
            })
            .collect();
        Self {
            network_name: network_name.into(),
            disks,
        }
    }

    /// Build the workload of one resource.
    ///
    /// `ip` is required for machines, `encrypted_password` (hex ciphertext)
    /// for storage nodes; both are ignored for other kinds.
    pub fn build(
        &self,
        resource: &Resource,
        version: u32,
        ip: Option<Ipv4Addr>,
        encrypted_password: Option<&str>,
    ) -> Result<Workload> {
        validate_name(resource.name())?;
        match resource {
            Resource::Disk(disk) => disk_workload(disk, version),
            Resource::StorageNode(zdb) => {
                let password = encrypted_password.ok_or_else(|| missing(&zdb.name, "password"))?;
                zdb_workload(zdb, version, password)
            }
            Resource::Machine(vm) => {
                let ip = ip.ok_or_else(|| missing(&vm.name, "ip"))?;
                self.machine_workload(vm, version, ip)
            }
        }
    }

    fn machine_workload(&self, vm: &MachineSpec, version: u32, ip: Ipv4Addr) -> Result<Workload> {
        if vm.flist.trim().is_empty() {
            return Err(missing(&vm.name, "flist"));
        }
        if vm.cpu == 0 {
            return Err(missing(&vm.name, "cpu"));
        }
        if vm.memory == 0 {
            return Err(missing(&vm.name, "memory"));
        }

        let mut mounts = Vec::with_capacity(vm.mounts.len());
        for mount in &vm.mounts {
            if !self.disks.contains(&mount.disk_name) {
                return Err(ValidationError::UnknownDisk {
                    machine: vm.name.clone(),
                    disk: mount.disk_name.clone(),
                });
            }
            mounts.push(MachineMount {
                name: mount.disk_name.clone(),
                mountpoint: mount.mount_point.clone(),
            });
        }

        let data = ZMachine {
            flist: vm.flist.clone(),
            network: MachineNetwork {
                planetary: vm.planetary,
                interfaces: vec![MachineInterface {
                    network: self.network_name.clone(),
                    ip,
                }],
            },
            compute_capacity: ComputeCapacity {
                cpu: vm.cpu,
                memory: vm.memory * MEGABYTE,
            },
            entrypoint: vm.entrypoint.clone(),
            mounts,
            env: vm.env(),
        };
        Ok(Workload::new(
            vm.name.clone(),
            version,
            vm.description.clone(),
            WorkloadData::ZMachine(data),
        ))
    }
}

fn missing(name: &str, field: &str) -> ValidationError {
    ValidationError::InvalidResource {
        name: name.to_string(),
        reason: format!("{} is required", field),
    }
}

fn disk_workload(disk: &DiskSpec, version: u32) -> Result<Workload> {
    if disk.size == 0 {
        return Err(missing(&disk.name, "size"));
    }
    Ok(Workload::new(
        disk.name.clone(),
        version,
        disk.description.clone(),
        WorkloadData::ZMount(ZMount {
            size: disk.size * GIGABYTE,
        }),
    ))
}

fn zdb_workload(zdb: &ZdbSpec, version: u32, password: &str) -> Result<Workload> {
    if zdb.size == 0 {
        return Err(missing(&zdb.name, "size"));
    }
    if password.is_empty() {
        return Err(missing(&zdb.name, "password"));
    }
    Ok(Workload::new(
        zdb.name.clone(),
        version,
        zdb.description.clone(),
        WorkloadData::Zdb(Zdb {
            size: zdb.size * GIGABYTE,
            mode: zdb.mode,
            password: password.to_string(),
            public: false,
        }),
    ))
}

/// Network workload of one mesh member.
pub struct NetworkWorkload<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub version: u32,
    pub ip_range: Ipv4Net,
    pub subnet: Ipv4Net,
    pub private_key: &'a str,
    pub listen_port: u16,
    pub peers: Vec<Peer>,
}

impl NetworkWorkload<'_> {
    pub fn build(self) -> Result<Workload> {
        validate_name(self.name)?;
        if self.private_key.is_empty() {
            return Err(missing(self.name, "private key"));
        }
        Ok(Workload::new(
            self.name,
            self.version,
            self.description,
            WorkloadData::Network(NetworkData {
                ip_range: self.ip_range,
                subnet: self.subnet,
                wg_private_key: self.private_key.to_string(),
                wg_listen_port: self.listen_port,
                peers: self.peers,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{WorkloadKind, ZdbMode};
    use crate::model::{EnvVar, MountSpec};

    fn disk(name: &str) -> DiskSpec {
        DiskSpec {
            name: name.to_string(),
            size: 10,
            description: "data".to_string(),
        }
    }

    fn vm(mounts: &[(&str, &str)], env: &[(&str, &str)]) -> MachineSpec {
        MachineSpec {
            name: "web1".to_string(),
            flist: "https://hub.grid.tf/tf-official-apps/base:latest.flist".to_string(),
            cpu: 2,
            memory: 1024,
            entrypoint: "/sbin/zinit init".to_string(),
            description: "frontend".to_string(),
            mounts: mounts
                .iter()
                .map(|(d, p)| MountSpec {
                    disk_name: d.to_string(),
                    mount_point: p.to_string(),
                })
                .collect(),
            env_vars: env
                .iter()
                .map(|(k, v)| EnvVar {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            ip: None,
            planetary: true,
        }
    }

    #[test]
    fn test_disk_size_in_bytes() {
        let builder = WorkloadBuilder::new("net1", &[]);
        let wl = builder
            .build(&Resource::Disk(disk("data")), 3, None, None)
            .unwrap();
        assert_eq!(wl.kind(), WorkloadKind::ZMount);
        assert_eq!(wl.version, 3);
        assert_eq!(wl.description, "data");
        match wl.data {
            WorkloadData::ZMount(m) => assert_eq!(m.size, 10 * GIGABYTE),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_zdb_takes_ciphertext() {
        let zdb = ZdbSpec {
            name: "kv".to_string(),
            size: 2,
            description: String::new(),
            password: "plain".to_string(),
            mode: ZdbMode::Seq,
        };
        let builder = WorkloadBuilder::new("net1", &[]);
        let wl = builder
            .build(&Resource::StorageNode(zdb.clone()), 0, None, Some("a1b2"))
            .unwrap();
        match wl.data {
            WorkloadData::Zdb(z) => {
                assert_eq!(z.password, "a1b2");
                assert_eq!(z.mode, ZdbMode::Seq);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        assert!(matches!(
            builder.build(&Resource::StorageNode(zdb), 0, None, None),
            Err(ValidationError::InvalidResource { .. })
        ));
    }

    #[test]
    fn test_machine_resolves_mounts_in_order() {
        let resources = vec![
            Resource::Disk(disk("data")),
            Resource::Disk(disk("logs")),
        ];
        let builder = WorkloadBuilder::new("net1", &resources);
        let machine = vm(&[("logs", "/var/log"), ("data", "/data")], &[]);
        let ip = Ipv4Addr::new(10, 1, 3, 2);
        let wl = builder
            .build(&Resource::Machine(machine), 0, Some(ip), None)
            .unwrap();
        let WorkloadData::ZMachine(data) = wl.data else {
            panic!("expected machine payload");
        };
        let names: Vec<_> = data.mounts.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["logs", "data"]);
        assert_eq!(data.compute_capacity.memory, 1024 * MEGABYTE);
        assert_eq!(data.network.interfaces[0].network, "net1");
        assert_eq!(data.network.interfaces[0].ip, ip);
        assert!(data.network.planetary);
    }

    #[test]
    fn test_machine_env_last_write_wins() {
        let builder = WorkloadBuilder::new("net1", &[]);
        let machine = vm(&[], &[("SSH_KEY", "old"), ("MODE", "x"), ("SSH_KEY", "new")]);
        let wl = builder
            .build(&Resource::Machine(machine), 0, Some(Ipv4Addr::new(10, 1, 3, 2)), None)
            .unwrap();
        let WorkloadData::ZMachine(data) = wl.data else {
            panic!("expected machine payload");
        };
        assert_eq!(data.env.len(), 2);
        assert_eq!(data.env["SSH_KEY"], "new");
    }

    #[test]
    fn test_machine_unknown_disk() {
        let builder = WorkloadBuilder::new("net1", &[Resource::Disk(disk("data"))]);
        let machine = vm(&[("missing", "/mnt")], &[]);
        assert_eq!(
            builder.build(&Resource::Machine(machine), 0, Some(Ipv4Addr::new(10, 1, 3, 2)), None),
            Err(ValidationError::UnknownDisk {
                machine: "web1".to_string(),
                disk: "missing".to_string()
            })
        );
    }

    #[test]
    fn test_machine_requires_fields() {
        let builder = WorkloadBuilder::new("net1", &[]);
        let ip = Some(Ipv4Addr::new(10, 1, 3, 2));

        let mut no_flist = vm(&[], &[]);
        no_flist.flist.clear();
        assert!(builder.build(&Resource::Machine(no_flist), 0, ip, None).is_err());

        let mut no_cpu = vm(&[], &[]);
        no_cpu.cpu = 0;
        assert!(builder.build(&Resource::Machine(no_cpu), 0, ip, None).is_err());

        assert!(builder.build(&Resource::Machine(vm(&[], &[])), 0, None, None).is_err());
    }

    #[test]
    fn test_network_workload() {
        let wl = NetworkWorkload {
            name: "net1",
            description: "mesh",
            version: 2,
            ip_range: "10.1.0.0/16".parse().unwrap(),
            subnet: "10.1.3.0/24".parse().unwrap(),
            private_key: "sk",
            listen_port: 4000,
            peers: vec![],
        }
        .build()
        .unwrap();
        assert_eq!(wl.kind(), WorkloadKind::Network);
        assert_eq!(wl.version, 2);
    }
}
