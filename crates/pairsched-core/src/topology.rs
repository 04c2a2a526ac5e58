//! CPU topology: physical cores, their SMT siblings, and socket placement.
//!
//! Read straight from sysfs so the daemon has no external tool dependency.
//! A physical core is keyed by `(package, core_id)` because `core_id` alone
//! repeats across sockets.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::{ControlError, Result};

/// `(physical_package_id, core_id)`: globally unique physical core key.
pub type CoreKey = (u32, u32);

/// Sibling and socket maps for one machine.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Physical core → sorted logical CPUs sharing it.
    siblings: BTreeMap<CoreKey, Vec<u32>>,
    /// Logical CPU → socket (package) id.
    sockets: HashMap<u32, u32>,
}

impl Topology {
    /// Detect the running machine's topology.
    pub fn detect() -> Result<Self> {
        Self::from_sysfs(Path::new("/sys/devices/system/cpu"))
    }

    /// Build a topology from a sysfs-shaped directory tree (`cpuN/topology/
    /// core_id` and `cpuN/topology/physical_package_id` files).
    pub fn from_sysfs(root: &Path) -> Result<Self> {
        let mut siblings: BTreeMap<CoreKey, Vec<u32>> = BTreeMap::new();
        let mut sockets = HashMap::new();

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(cpu) = name
                .strip_prefix("cpu")
                .and_then(|rest| rest.parse::<u32>().ok())
            else {
                continue;
            };

            let topo = entry.path().join("topology");
            if !topo.is_dir() {
                // Offline CPUs may have no topology directory.
                continue;
            }
            let core_id = read_u32(&topo.join("core_id"))?;
            let package = read_u32(&topo.join("physical_package_id"))?;

            siblings.entry((package, core_id)).or_default().push(cpu);
            sockets.insert(cpu, package);
        }

        if siblings.is_empty() {
            return Err(ControlError::Config(format!(
                "no CPUs found under {}",
                root.display()
            )));
        }
        for cpus in siblings.values_mut() {
            cpus.sort_unstable();
        }
        Ok(Topology { siblings, sockets })
    }

    /// All logical CPUs, ascending.
    pub fn cpus(&self) -> Vec<u32> {
        let mut all: Vec<u32> = self.sockets.keys().copied().collect();
        all.sort_unstable();
        all
    }

    /// Socket id of a logical CPU.
    pub fn socket_of(&self, cpu: u32) -> Option<u32> {
        self.sockets.get(&cpu).copied()
    }

    /// Physical core → sorted sibling CPUs, every core.
    pub fn sibling_map(&self) -> &BTreeMap<CoreKey, Vec<u32>> {
        &self.siblings
    }

    /// Cores that expose exactly two SMT siblings, as `(core, [cpu0, cpu1])`
    /// with `cpu0 < cpu1`. Cores without SMT (or with more than two
    /// siblings) are not usable for pairing and are skipped.
    pub fn smt_pairs(&self) -> Vec<(CoreKey, [u32; 2])> {
        self.siblings
            .iter()
            .filter_map(|(core, cpus)| match cpus.as_slice() {
                [a, b] => Some((*core, [*a, *b])),
                _ => None,
            })
            .collect()
    }

    /// The sibling pair of the first SMT core, the conventional home of
    /// profiling sessions.
    pub fn first_pair(&self) -> Result<[u32; 2]> {
        self.smt_pairs()
            .first()
            .map(|(_, cpus)| *cpus)
            .ok_or_else(|| ControlError::Config("machine has no SMT sibling pair".into()))
    }
}

fn read_u32(path: &Path) -> Result<u32> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse::<u32>()
        .map_err(|_| ControlError::Config(format!("{}: expected integer, got {raw:?}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_cpu(root: &Path, cpu: u32, package: u32, core: u32) {
        let topo = root.join(format!("cpu{cpu}")).join("topology");
        fs::create_dir_all(&topo).unwrap();
        fs::write(topo.join("core_id"), format!("{core}\n")).unwrap();
        fs::write(topo.join("physical_package_id"), format!("{package}\n")).unwrap();
    }

    #[test]
    fn builds_sibling_and_socket_maps() {
        let dir = tempfile::tempdir().unwrap();
        // Two SMT cores on socket 0, enumerated in the common
        // "second thread numbered after all first threads" order.
        fake_cpu(dir.path(), 0, 0, 0);
        fake_cpu(dir.path(), 1, 0, 1);
        fake_cpu(dir.path(), 2, 0, 0);
        fake_cpu(dir.path(), 3, 0, 1);
        // Non-CPU entries are ignored.
        fs::create_dir_all(dir.path().join("cpufreq")).unwrap();

        let topo = Topology::from_sysfs(dir.path()).unwrap();
        assert_eq!(topo.cpus(), vec![0, 1, 2, 3]);
        assert_eq!(topo.socket_of(3), Some(0));

        let pairs = topo.smt_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ((0, 0), [0, 2]));
        assert_eq!(pairs[1], ((0, 1), [1, 3]));
        assert_eq!(topo.first_pair().unwrap(), [0, 2]);
    }

    #[test]
    fn single_threaded_cores_are_not_pairs() {
        let dir = tempfile::tempdir().unwrap();
        fake_cpu(dir.path(), 0, 0, 0);
        fake_cpu(dir.path(), 1, 0, 1);
        let topo = Topology::from_sysfs(dir.path()).unwrap();
        assert!(topo.smt_pairs().is_empty());
        assert!(topo.first_pair().is_err());
    }

    #[test]
    fn empty_tree_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Topology::from_sysfs(dir.path()).is_err());
    }
}
