use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CpuTopologyError {
    #[error("could not detect number of cpus")]
    NoCpus,
    #[error("failed to read {path}: {err}")]
    Sysfs { path: String, err: std::io::Error },
    #[error("unexpected value in {path}: {value}")]
    SysfsParse { path: String, value: String },
}

/// The socket and core a logical CPU belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuInfo {
    pub socket_id: usize,
    pub core_id: usize,
}

/// Map from logical CPU id to its placement.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuDetails(BTreeMap<usize, CpuInfo>);

impl CpuDetails {
    pub fn insert(&mut self, cpu: usize, info: CpuInfo) {
        self.0.insert(cpu, info);
    }

    pub fn get(&self, cpu: usize) -> Option<&CpuInfo> {
        self.0.get(&cpu)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A copy restricted to the supplied cpus.
    pub fn keep_only(&self, cpus: &BTreeSet<usize>) -> CpuDetails {
        CpuDetails(
            self.0
                .iter()
                .filter(|(cpu, _)| cpus.contains(cpu))
                .map(|(cpu, info)| (*cpu, *info))
                .collect(),
        )
    }

    pub fn cpus(&self) -> BTreeSet<usize> {
        self.0.keys().copied().collect()
    }

    pub fn sockets(&self) -> BTreeSet<usize> {
        self.0.values().map(|i| i.socket_id).collect()
    }

    pub fn cores(&self) -> BTreeSet<usize> {
        self.0.values().map(|i| i.core_id).collect()
    }

    pub fn cpus_in_socket(&self, socket_id: usize) -> BTreeSet<usize> {
        self.0
            .iter()
            .filter(|(_, info)| info.socket_id == socket_id)
            .map(|(cpu, _)| *cpu)
            .collect()
    }

    pub fn cores_in_socket(&self, socket_id: usize) -> BTreeSet<usize> {
        self.0
            .values()
            .filter(|info| info.socket_id == socket_id)
            .map(|info| info.core_id)
            .collect()
    }

    pub fn cpus_in_core(&self, core_id: usize) -> BTreeSet<usize> {
        self.0
            .iter()
            .filter(|(_, info)| info.core_id == core_id)
            .map(|(cpu, _)| *cpu)
            .collect()
    }
}

impl FromIterator<(usize, CpuInfo)> for CpuDetails {
    fn from_iter<T: IntoIterator<Item = (usize, CpuInfo)>>(iter: T) -> Self {
        CpuDetails(iter.into_iter().collect())
    }
}

/// Node CPU layout: logical CPUs (threads), physical cores, sockets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CpuTopology {
    pub num_cpus: usize,
    pub num_cores: usize,
    pub num_sockets: usize,
    pub hyper_threading: bool,
    pub details: CpuDetails,
}

impl CpuTopology {
    pub fn cpus_per_core(&self) -> usize {
        if self.num_cores == 0 {
            return 0;
        }
        self.num_cpus / self.num_cores
    }

    pub fn cpus_per_socket(&self) -> usize {
        if self.num_sockets == 0 {
            return 0;
        }
        self.num_cpus / self.num_sockets
    }
}

/// Raw machine layout as reported by the host, either parsed from a probe's
/// JSON output or read from sysfs.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct MachineInfo {
    pub num_cpus: usize,
    pub sockets: Vec<SocketInfo>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct SocketInfo {
    pub id: usize,
    pub cores: Vec<CoreInfo>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CoreInfo {
    pub id: usize,
    pub threads: Vec<usize>,
}

/// Builds a [CpuTopology] from machine info.
///
/// Hyperthreading detection is knowingly naive: HT is reported as enabled as
/// soon as any core carries more than one thread.
pub fn discover(machine: &MachineInfo) -> Result<CpuTopology, CpuTopologyError> {
    if machine.num_cpus == 0 {
        return Err(CpuTopologyError::NoCpus);
    }

    let mut details = CpuDetails::default();
    let mut ht_enabled = false;
    let mut num_physical_cores = 0;

    for socket in &machine.sockets {
        num_physical_cores += socket.cores.len();
        for core in &socket.cores {
            for cpu in &core.threads {
                details.insert(
                    *cpu,
                    CpuInfo {
                        socket_id: socket.id,
                        core_id: core.id,
                    },
                );
                if !ht_enabled && core.threads.len() != 1 {
                    ht_enabled = true;
                }
            }
        }
    }

    Ok(CpuTopology {
        num_cpus: machine.num_cpus,
        num_sockets: machine.sockets.len(),
        num_cores: num_physical_cores,
        hyper_threading: ht_enabled,
        details,
    })
}

#[cfg(target_os = "linux")]
impl MachineInfo {
    /// Reads the CPU layout from /sys/devices/system/cpu.
    pub fn from_sysfs() -> Result<MachineInfo, CpuTopologyError> {
        Self::from_sysfs_root("/sys/devices/system/cpu")
    }

    fn from_sysfs_root(root: &str) -> Result<MachineInfo, CpuTopologyError> {
        let mut cpus: Vec<(usize, usize, usize)> = vec![];

        let entries = std::fs::read_dir(root).map_err(|err| CpuTopologyError::Sysfs {
            path: root.to_string(),
            err,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name
                .strip_prefix("cpu")
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            let topo = entry.path().join("topology");
            if !topo.exists() {
                // offline cpus expose no topology directory
                continue;
            }
            let socket_id = read_sysfs_id(&topo.join("physical_package_id"))?;
            let core_id = read_sysfs_id(&topo.join("core_id"))?;
            cpus.push((id, socket_id, core_id));
        }

        let num_cpus = cpus.len();
        let mut sockets: BTreeMap<usize, BTreeMap<usize, Vec<usize>>> = BTreeMap::new();
        for (cpu, socket_id, core_id) in cpus {
            sockets
                .entry(socket_id)
                .or_default()
                .entry(core_id)
                .or_default()
                .push(cpu);
        }

        Ok(MachineInfo {
            num_cpus,
            sockets: sockets
                .into_iter()
                .map(|(id, cores)| SocketInfo {
                    id,
                    cores: cores
                        .into_iter()
                        .map(|(id, threads)| CoreInfo { id, threads })
                        .collect(),
                })
                .collect(),
        })
    }
}

#[cfg(target_os = "linux")]
fn read_sysfs_id(path: &std::path::Path) -> Result<usize, CpuTopologyError> {
    let raw = std::fs::read_to_string(path).map_err(|err| CpuTopologyError::Sysfs {
        path: path.display().to_string(),
        err,
    })?;
    raw.trim()
        .parse::<usize>()
        .map_err(|_| CpuTopologyError::SysfsParse {
            path: path.display().to_string(),
            value: raw.trim().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_socket_ht() -> MachineInfo {
        MachineInfo {
            num_cpus: 8,
            sockets: vec![
                SocketInfo {
                    id: 0,
                    cores: vec![
                        CoreInfo {
                            id: 0,
                            threads: vec![0, 4],
                        },
                        CoreInfo {
                            id: 1,
                            threads: vec![1, 5],
                        },
                    ],
                },
                SocketInfo {
                    id: 1,
                    cores: vec![
                        CoreInfo {
                            id: 2,
                            threads: vec![2, 6],
                        },
                        CoreInfo {
                            id: 3,
                            threads: vec![3, 7],
                        },
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_discover_dual_socket_ht() {
        let topo = discover(&dual_socket_ht()).unwrap();
        assert_eq!(topo.num_cpus, 8);
        assert_eq!(topo.num_cores, 4);
        assert_eq!(topo.num_sockets, 2);
        assert!(topo.hyper_threading);
        assert_eq!(topo.cpus_per_core(), 2);
        assert_eq!(topo.cpus_per_socket(), 4);
        assert_eq!(
            topo.details.get(6),
            Some(&CpuInfo {
                socket_id: 1,
                core_id: 2
            })
        );
    }

    #[test]
    fn test_discover_no_ht() {
        let machine = MachineInfo {
            num_cpus: 2,
            sockets: vec![SocketInfo {
                id: 0,
                cores: vec![
                    CoreInfo {
                        id: 0,
                        threads: vec![0],
                    },
                    CoreInfo {
                        id: 1,
                        threads: vec![1],
                    },
                ],
            }],
        };
        let topo = discover(&machine).unwrap();
        assert!(!topo.hyper_threading);
        assert_eq!(topo.cpus_per_core(), 1);
    }

    #[test]
    fn test_discover_rejects_zero_cpus() {
        let result = discover(&MachineInfo::default());
        assert!(matches!(result, Err(CpuTopologyError::NoCpus)));
    }

    #[test]
    fn test_details_queries() {
        let topo = discover(&dual_socket_ht()).unwrap();
        let details = &topo.details;

        assert_eq!(details.sockets(), BTreeSet::from([0, 1]));
        assert_eq!(details.cores(), BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(details.cpus_in_socket(0), BTreeSet::from([0, 1, 4, 5]));
        assert_eq!(details.cores_in_socket(1), BTreeSet::from([2, 3]));
        assert_eq!(details.cpus_in_core(1), BTreeSet::from([1, 5]));

        let kept = details.keep_only(&BTreeSet::from([0, 4]));
        assert_eq!(kept.cpus(), BTreeSet::from([0, 4]));
        assert_eq!(kept.sockets(), BTreeSet::from([0]));
    }
}
