//! Resctrl control-filesystem driver.
//!
//! Maps a CLOS and its computed masks onto the kernel's resource-group
//! pseudo-filesystem: one directory per group, a `schemata` file encoding
//! per-resource masks and a `tasks` file listing bound PIDs. The driver
//! trusts what it is told to write; cross-group consistency is the
//! planner's responsibility. I/O failures are surfaced with the failing
//! path attached, never retried.

mod schemata;

pub use schemata::{Domain, L3, L3_CODE, L3_DATA, MB, Schemata, SchemataLine};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cachet_common::{Bitmap, CachetError, CachetResult};

/// The root group's name: the kernel's default class, living directly at
/// the mount point.
pub const ROOT_GROUP: &str = "";

// Kernel-managed directories that are not resource groups.
const NON_GROUP_DIRS: [&str; 3] = ["info", "mon_data", "mon_groups"];

/// A group's current association, rebuilt from the filesystem on demand.
#[derive(Debug, Clone)]
pub struct ResAssociation {
    /// Parsed schemata of the group.
    pub schemata: Schemata,
    /// PIDs currently bound to the group.
    pub tasks: Vec<String>,
}

/// Hardware allocation limits read from the resctrl info directory.
#[derive(Debug, Clone)]
pub struct CosInfo {
    /// The full capacity bitmask, verbatim.
    pub cbm_mask: String,
    /// Total cache ways (set bits of `cbm_mask`).
    pub cbm_len: u32,
    /// Number of classes of service the hardware supports.
    pub num_closids: u32,
}

/// Driver over a resctrl mount point.
#[derive(Debug, Clone)]
pub struct ResctrlDriver {
    root: PathBuf,
}

impl ResctrlDriver {
    /// Create a driver for the given control root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The control root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        if group.is_empty() {
            self.root.clone()
        } else {
            self.root.join(group)
        }
    }

    /// Create the group directory if absent and write its schemata.
    ///
    /// # Errors
    ///
    /// Surfaces filesystem failures with the failing path; permission
    /// failures map to [`CachetError::PermissionDenied`].
    pub fn apply(&self, group: &str, schemata: &Schemata) -> CachetResult<()> {
        let dir = self.group_dir(group);
        if !group.is_empty() {
            std::fs::create_dir_all(&dir).map_err(|source| {
                if source.kind() == std::io::ErrorKind::PermissionDenied {
                    CachetError::PermissionDenied {
                        operation: format!("create resctrl group {group}"),
                    }
                } else {
                    CachetError::file_io(&dir, source)
                }
            })?;
        }

        let path = dir.join("schemata");
        std::fs::write(&path, schemata.render())
            .map_err(|source| CachetError::file_io(&path, source))?;

        // The kernel materializes the group files on mkdir; make sure a
        // fresh group always reads back even with no task bound yet.
        let tasks = dir.join("tasks");
        if !tasks.exists() {
            std::fs::write(&tasks, "").map_err(|source| CachetError::file_io(&tasks, source))?;
        }

        tracing::debug!(
            group = %group,
            path = %path.display(),
            "Applied schemata"
        );
        Ok(())
    }

    /// Append task IDs to the group's membership file, one write per PID
    /// as the kernel interface expects.
    ///
    /// # Errors
    ///
    /// Surfaces filesystem failures with the failing path.
    pub fn bind(&self, group: &str, tasks: &[String]) -> CachetResult<()> {
        use std::io::Write;

        let path = self.group_dir(group).join("tasks");
        for pid in tasks {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| CachetError::file_io(&path, source))?;
            writeln!(file, "{pid}").map_err(|source| CachetError::file_io(&path, source))?;
        }

        tracing::debug!(group = %group, count = tasks.len(), "Bound tasks");
        Ok(())
    }

    /// Read one group's association back from the filesystem.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed schemata/tasks files.
    pub fn read_group(&self, group: &str) -> CachetResult<ResAssociation> {
        let dir = self.group_dir(group);

        let schemata_path = dir.join("schemata");
        let text = std::fs::read_to_string(&schemata_path)
            .map_err(|source| CachetError::file_io(&schemata_path, source))?;
        let schemata = Schemata::parse(&text)?;

        let tasks_path = dir.join("tasks");
        let tasks = std::fs::read_to_string(&tasks_path)
            .map_err(|source| CachetError::file_io(&tasks_path, source))?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();

        Ok(ResAssociation { schemata, tasks })
    }

    /// Enumerate existing groups (the root group included) and parse their
    /// associations, optionally restricted to group names containing
    /// `filter`.
    ///
    /// # Errors
    ///
    /// Fails on unreadable directories or malformed group files.
    pub fn read_associations(
        &self,
        filter: Option<&str>,
    ) -> CachetResult<BTreeMap<String, ResAssociation>> {
        let matches = |name: &str| filter.is_none_or(|needle| name.contains(needle));

        let mut associations = BTreeMap::new();
        if matches(ROOT_GROUP) {
            associations.insert(ROOT_GROUP.to_string(), self.read_group(ROOT_GROUP)?);
        }

        let entries = std::fs::read_dir(&self.root)
            .map_err(|source| CachetError::file_io(&self.root, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| CachetError::file_io(&self.root, source))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if NON_GROUP_DIRS.contains(&name.as_str()) || !matches(&name) {
                continue;
            }
            associations.insert(name.clone(), self.read_group(&name)?);
        }

        Ok(associations)
    }

    /// Remove a group directory, unbinding its tasks back to the root
    /// group (kernel semantics of rmdir on a resource group).
    ///
    /// # Errors
    ///
    /// The root group cannot be removed; filesystem failures are surfaced.
    pub fn remove(&self, group: &str) -> CachetResult<()> {
        if group.is_empty() {
            return Err(CachetError::InvalidState {
                message: "the root resctrl group cannot be removed".to_string(),
            });
        }
        let dir = self.group_dir(group);
        std::fs::remove_dir(&dir).map_err(|source| CachetError::file_io(&dir, source))?;
        tracing::debug!(group = %group, "Removed resctrl group");
        Ok(())
    }

    /// Read the hardware allocation limits from the info directory. Under
    /// CDP the `L3` resource splits into `L3CODE`/`L3DATA`; the code
    /// directory is consulted as the fallback.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::NotFound`] when neither info directory
    /// exists and surfaces read/parse failures otherwise.
    pub fn read_cos_info(&self) -> CachetResult<CosInfo> {
        let info_root = self.root.join("info");
        let dir = [L3, L3_CODE]
            .iter()
            .map(|resource| info_root.join(resource))
            .find(|candidate| candidate.is_dir())
            .ok_or_else(|| CachetError::NotFound {
                what: format!("L3 info directory under {}", info_root.display()),
            })?;

        let cbm_path = dir.join("cbm_mask");
        let cbm_mask = std::fs::read_to_string(&cbm_path)
            .map_err(|source| CachetError::file_io(&cbm_path, source))?
            .trim()
            .to_string();
        let cbm_len = Bitmap::from_hex(&cbm_mask, cachet_common::AFFINITY_BITS)?.count_ones() as u32;

        let closids_path = dir.join("num_closids");
        let raw = std::fs::read_to_string(&closids_path)
            .map_err(|source| CachetError::file_io(&closids_path, source))?;
        let num_closids: u32 = raw.trim().parse().map_err(|_| CachetError::Config {
            message: format!("malformed num_closids: {:?}", raw.trim()),
        })?;

        Ok(CosInfo {
            cbm_mask,
            cbm_len,
            num_closids,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn fixture() -> (TempDir, ResctrlDriver) {
        let dir = TempDir::new().unwrap();
        // The root group always carries schemata and tasks files.
        std::fs::write(dir.path().join("schemata"), "L3:0=fffff\n").unwrap();
        std::fs::write(dir.path().join("tasks"), "1\n").unwrap();
        let driver = ResctrlDriver::new(dir.path());
        (dir, driver)
    }

    fn cache_schemata(offset: usize, count: usize) -> Schemata {
        let mask = Bitmap::contiguous(20, offset, count).unwrap();
        let mut schemata = Schemata::new();
        schemata.push_cache(L3, &[0], &mask);
        schemata
    }

    #[test]
    fn apply_creates_group_and_writes_schemata() {
        let (dir, driver) = fixture();

        driver.apply("CG1", &cache_schemata(0, 4)).unwrap();

        let written = std::fs::read_to_string(dir.path().join("CG1").join("schemata")).unwrap();
        assert_eq!(written, "L3:0=f\n");

        // Re-applying an existing group overwrites in place.
        driver.apply("CG1", &cache_schemata(4, 4)).unwrap();
        let written = std::fs::read_to_string(dir.path().join("CG1").join("schemata")).unwrap();
        assert_eq!(written, "L3:0=f0\n");
    }

    #[test]
    fn apply_to_root_group() {
        let (dir, driver) = fixture();
        driver.apply(ROOT_GROUP, &cache_schemata(0, 2)).unwrap();
        let written = std::fs::read_to_string(dir.path().join("schemata")).unwrap();
        assert_eq!(written, "L3:0=3\n");
    }

    #[test]
    fn bind_appends_pids() {
        let (dir, driver) = fixture();
        driver.apply("CG1", &cache_schemata(0, 4)).unwrap();

        driver
            .bind("CG1", &["100".to_string(), "200".to_string()])
            .unwrap();
        let tasks = std::fs::read_to_string(dir.path().join("CG1").join("tasks")).unwrap();
        assert_eq!(tasks, "100\n200\n");
    }

    #[test]
    fn read_associations_round_trip() {
        let (_dir, driver) = fixture();
        driver.apply("CG1", &cache_schemata(0, 4)).unwrap();
        driver.bind("CG1", &["100".to_string()]).unwrap();
        driver.apply("CG2", &cache_schemata(4, 4)).unwrap();
        driver.bind("CG2", &[]).unwrap();

        let all = driver.read_associations(None).unwrap();
        assert_eq!(all.len(), 3); // root + CG1 + CG2

        let cg1 = &all["CG1"];
        assert_eq!(cg1.tasks, vec!["100".to_string()]);
        assert_eq!(cg1.schemata.line(L3).unwrap().domains[0].value, "f");

        let filtered = driver.read_associations(Some("CG2")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("CG2"));
    }

    #[test]
    fn read_associations_skips_kernel_dirs() {
        let (dir, driver) = fixture();
        std::fs::create_dir_all(dir.path().join("info").join("L3")).unwrap();
        std::fs::create_dir(dir.path().join("mon_groups")).unwrap();

        let all = driver.read_associations(None).unwrap();
        assert_eq!(all.len(), 1); // only the root group
    }

    #[test]
    fn remove_group() {
        let (dir, driver) = fixture();
        driver.apply("CG1", &cache_schemata(0, 4)).unwrap();
        assert!(dir.path().join("CG1").exists());

        driver.remove("CG1").unwrap();
        assert!(!dir.path().join("CG1").exists());

        assert!(matches!(
            driver.remove(ROOT_GROUP),
            Err(CachetError::InvalidState { .. })
        ));
        assert!(driver.remove("CG1").is_err());
    }

    #[test]
    fn cos_info_from_l3() {
        let (dir, driver) = fixture();
        let info = dir.path().join("info").join("L3");
        std::fs::create_dir_all(&info).unwrap();
        std::fs::write(info.join("cbm_mask"), "fffff\n").unwrap();
        std::fs::write(info.join("num_closids"), "16\n").unwrap();

        let cos = driver.read_cos_info().unwrap();
        assert_eq!(cos.cbm_mask, "fffff");
        assert_eq!(cos.cbm_len, 20);
        assert_eq!(cos.num_closids, 16);
    }

    #[test]
    fn cos_info_falls_back_to_l3code_under_cdp() {
        let (dir, driver) = fixture();
        let info = dir.path().join("info").join("L3CODE");
        std::fs::create_dir_all(&info).unwrap();
        std::fs::write(info.join("cbm_mask"), "7ff\n").unwrap();
        std::fs::write(info.join("num_closids"), "8\n").unwrap();

        let cos = driver.read_cos_info().unwrap();
        assert_eq!(cos.cbm_len, 11);
        assert_eq!(cos.num_closids, 8);
    }

    #[test]
    fn cos_info_missing_is_not_found() {
        let (_dir, driver) = fixture();
        assert!(matches!(
            driver.read_cos_info(),
            Err(CachetError::NotFound { .. })
        ));
    }

    #[test]
    fn missing_schemata_surfaces_the_path() {
        let (dir, driver) = fixture();
        std::fs::create_dir(dir.path().join("broken")).unwrap();

        match driver.read_group("broken") {
            Err(CachetError::FileIo { path, .. }) => {
                assert!(path.ends_with("broken/schemata"));
            }
            other => panic!("expected FileIo, got {other:?}"),
        }
    }

    // Writing to the real mount requires privileges and RDT hardware.
    #[test]
    #[ignore = "requires root and a mounted resctrl filesystem"]
    fn apply_on_real_mount() {
        let driver = ResctrlDriver::new("/sys/fs/resctrl");
        let info = driver.read_cos_info().unwrap();
        assert!(info.cbm_len > 0);
    }
}
