//! Read-only detection of RDT hardware features and resctrl mount state.
//!
//! Detection never escalates "not found" to an error: only a genuine I/O
//! failure on the descriptor files is surfaced. Everything here is pure
//! inspection; nothing is written.

mod processes;

pub use processes::{Process, list_processes};

use std::path::Path;

use cachet_common::{CachetError, CachetResult, MbaMode};

/// CPU feature descriptor consulted for availability flags.
pub const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Mount table consulted for resctrl mount presence.
pub const MOUNTS_PATH: &str = "/proc/self/mounts";

/// Mount table consulted for the mount-options line.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

// rdt_a, cat_l3, cdp_l3, cqm, mba
const RDT_FLAG: &str = "rdt_a";
const CAT_FLAG: &str = "cat_l3";
const CDP_FLAG: &str = "cdp_l3";
const CQM_FLAG: &str = "cqm";
const MBA_FLAG: &str = "mba";

/// Scan the CPU feature descriptor for an exact feature token.
///
/// # Errors
///
/// Fails only when the descriptor file cannot be read; an absent token is
/// `Ok(false)`.
pub fn detect_feature(flag: &str) -> CachetResult<bool> {
    scan_feature_file(Path::new(CPUINFO_PATH), flag)
}

fn scan_feature_file(path: &Path, flag: &str) -> CachetResult<bool> {
    let content =
        std::fs::read_to_string(path).map_err(|source| CachetError::file_io(path, source))?;
    Ok(content
        .lines()
        .any(|line| line.split_whitespace().any(|token| token == flag)))
}

/// Whether RDT allocation is available on this host.
pub fn is_rdt_available() -> CachetResult<bool> {
    detect_feature(RDT_FLAG)
}

/// Whether L3 CAT is available.
pub fn is_cat_available() -> CachetResult<bool> {
    detect_feature(CAT_FLAG)
}

/// Whether L3 CDP is available.
pub fn is_cdp_available() -> CachetResult<bool> {
    detect_feature(CDP_FLAG)
}

/// Whether cache monitoring (CQM) is available.
pub fn is_cqm_available() -> CachetResult<bool> {
    detect_feature(CQM_FLAG)
}

/// Whether MBA is available.
pub fn is_mba_available() -> CachetResult<bool> {
    detect_feature(MBA_FLAG)
}

/// Whether a resctrl filesystem is mounted exactly at `root`.
///
/// Absence of a resctrl entry and a path mismatch both yield `false`;
/// there is no error channel.
#[must_use]
pub fn is_resctrl_mounted(root: &Path) -> bool {
    scan_mount_table(Path::new(MOUNTS_PATH), root)
}

fn scan_mount_table(table: &Path, root: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(table) else {
        return false;
    };
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() > 3 && fields[2] == "resctrl" {
            return Path::new(fields[1]) == root;
        }
    }
    false
}

fn find_mount_options(table: &Path, root: &Path) -> Option<String> {
    let content = std::fs::read_to_string(table).ok()?;
    let needle = root.to_string_lossy();
    content
        .lines()
        .find(|line| line.contains(needle.as_ref()))
        .map(ToString::to_string)
}

/// Whether CDP is enabled on the mount at `root` (the options line carries
/// the `cdp` marker).
#[must_use]
pub fn is_cdp_enabled(root: &Path) -> bool {
    cdp_enabled_per_table(Path::new(MOUNTINFO_PATH), root)
}

fn cdp_enabled_per_table(table: &Path, root: &Path) -> bool {
    find_mount_options(table, root).is_some_and(|line| line.contains("cdp"))
}

/// Whether plain CAT is enabled on the mount at `root` (mounted, and the
/// options line does not carry `cdp` — the two are mutually exclusive).
#[must_use]
pub fn is_cat_enabled(root: &Path) -> bool {
    cat_enabled_per_table(Path::new(MOUNTINFO_PATH), root)
}

fn cat_enabled_per_table(table: &Path, root: &Path) -> bool {
    find_mount_options(table, root).is_some_and(|line| !line.contains("cdp"))
}

/// Whether MBA is enabled: the mount must be present and the kernel must
/// expose the MBA bandwidth info subdirectory under the control root.
#[must_use]
pub fn is_mba_enabled(root: &Path) -> bool {
    mba_enabled_per_table(Path::new(MOUNTINFO_PATH), root)
}

fn mba_enabled_per_table(table: &Path, root: &Path) -> bool {
    if find_mount_options(table, root).is_none() {
        return false;
    }
    root.join("info").join("MB").is_dir()
}

/// Whether the mount at `root` runs MBA in MBps mode (`mba_MBps` mount
/// option).
#[must_use]
pub fn is_mba_mbps_enabled(root: &Path) -> bool {
    find_mount_options(Path::new(MOUNTINFO_PATH), root).is_some_and(|line| line.contains("mba_MBps"))
}

/// Snapshot of hardware availability and current mount enablement, taken
/// once at startup and passed into the components that need it.
#[derive(Debug, Clone, Default)]
pub struct RdtCapabilities {
    /// RDT allocation available in hardware.
    pub rdt: bool,
    /// L3 CAT available in hardware.
    pub cat: bool,
    /// L3 CDP available in hardware.
    pub cdp: bool,
    /// Cache monitoring available in hardware.
    pub cqm: bool,
    /// MBA available in hardware.
    pub mba: bool,
    /// CAT enabled on the current mount.
    pub cat_on: bool,
    /// CDP enabled on the current mount.
    pub cdp_on: bool,
    /// MBA enabled on the current mount.
    pub mba_on: bool,
    /// MBA running in MBps (absolute-bandwidth) mode.
    pub mba_mbps: bool,
}

impl RdtCapabilities {
    /// Probe availability and enablement for the control root.
    ///
    /// # Errors
    ///
    /// Fails only on I/O errors reading the CPU feature descriptor.
    pub fn probe(root: &Path) -> CachetResult<Self> {
        let caps = Self {
            rdt: is_rdt_available()?,
            cat: is_cat_available()?,
            cdp: is_cdp_available()?,
            cqm: is_cqm_available()?,
            mba: is_mba_available()?,
            cat_on: is_cat_enabled(root),
            cdp_on: is_cdp_enabled(root),
            mba_on: is_mba_enabled(root),
            mba_mbps: is_mba_mbps_enabled(root),
        };
        tracing::debug!(?caps, root = %root.display(), "Probed RDT capabilities");
        Ok(caps)
    }

    /// Check that the configured MBA mode matches what the mount provides.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::Unsupported`] when a throttling mode is
    /// configured but MBA is off, or the percentage/MBps flavor mismatches
    /// the mount options.
    pub fn check_mba_mode(&self, mode: MbaMode) -> CachetResult<()> {
        match mode {
            MbaMode::None => Ok(()),
            MbaMode::Percentage if self.mba_on && !self.mba_mbps => Ok(()),
            MbaMode::Mbps if self.mba_on && self.mba_mbps => Ok(()),
            other => Err(CachetError::Unsupported {
                feature: format!("MBA mode [{other:?}] on this mount"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn feature_token_exact_match() {
        let dir = TempDir::new().unwrap();
        let cpuinfo = write_file(
            &dir,
            "cpuinfo",
            "processor : 0\nflags : fpu vme rdt_a cat_l3 mba\n",
        );

        assert!(scan_feature_file(&cpuinfo, "rdt_a").unwrap());
        assert!(scan_feature_file(&cpuinfo, "cat_l3").unwrap());
        assert!(scan_feature_file(&cpuinfo, "mba").unwrap());
        // Substrings of a token do not match.
        assert!(!scan_feature_file(&cpuinfo, "cat").unwrap());
        assert!(!scan_feature_file(&cpuinfo, "cdp_l3").unwrap());
    }

    #[test]
    fn feature_scan_io_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan_feature_file(&missing, "rdt_a").is_err());
    }

    #[test]
    fn resctrl_mount_presence() {
        let dir = TempDir::new().unwrap();
        let mounts = write_file(
            &dir,
            "mounts",
            "sysfs /sys sysfs rw 0 0\nresctrl /sys/fs/resctrl resctrl rw 0 0\n",
        );

        assert!(scan_mount_table(&mounts, Path::new("/sys/fs/resctrl")));
        assert!(!scan_mount_table(&mounts, Path::new("/mnt/resctrl")));

        let no_entry = write_file(&dir, "mounts2", "sysfs /sys sysfs rw 0 0\n");
        assert!(!scan_mount_table(&no_entry, Path::new("/sys/fs/resctrl")));
        // Unreadable table is non-fatal.
        assert!(!scan_mount_table(
            &dir.path().join("nope"),
            Path::new("/sys/fs/resctrl")
        ));
    }

    #[test]
    fn cdp_and_cat_are_mutually_exclusive() {
        let dir = TempDir::new().unwrap();
        let with_cdp = write_file(
            &dir,
            "mountinfo-cdp",
            "36 25 0:31 / /sys/fs/resctrl rw - resctrl resctrl rw,cdp\n",
        );
        let without_cdp = write_file(
            &dir,
            "mountinfo-cat",
            "36 25 0:31 / /sys/fs/resctrl rw - resctrl resctrl rw\n",
        );
        let root = Path::new("/sys/fs/resctrl");

        assert!(cdp_enabled_per_table(&with_cdp, root));
        assert!(!cat_enabled_per_table(&with_cdp, root));

        assert!(!cdp_enabled_per_table(&without_cdp, root));
        assert!(cat_enabled_per_table(&without_cdp, root));

        // Not mounted at all: neither is enabled.
        let other = Path::new("/mnt/elsewhere");
        assert!(!cdp_enabled_per_table(&with_cdp, other));
        assert!(!cat_enabled_per_table(&with_cdp, other));
    }

    #[test]
    fn mba_needs_mount_and_info_dir() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("resctrl");
        std::fs::create_dir_all(root.join("info").join("MB")).unwrap();

        let mountinfo = write_file(
            &dir,
            "mountinfo",
            &format!("36 25 0:31 / {} rw - resctrl resctrl rw\n", root.display()),
        );

        assert!(mba_enabled_per_table(&mountinfo, &root));

        // Mounted but no info/MB directory.
        let bare_root = dir.path().join("bare");
        std::fs::create_dir_all(&bare_root).unwrap();
        let mountinfo2 = write_file(
            &dir,
            "mountinfo2",
            &format!(
                "36 25 0:31 / {} rw - resctrl resctrl rw\n",
                bare_root.display()
            ),
        );
        assert!(!mba_enabled_per_table(&mountinfo2, &bare_root));

        // info/MB present but not mounted.
        let empty = write_file(&dir, "mountinfo3", "");
        assert!(!mba_enabled_per_table(&empty, &root));
    }

    #[test]
    fn mba_mode_check() {
        let caps = RdtCapabilities {
            mba_on: true,
            mba_mbps: false,
            ..RdtCapabilities::default()
        };
        assert!(caps.check_mba_mode(MbaMode::None).is_ok());
        assert!(caps.check_mba_mode(MbaMode::Percentage).is_ok());
        assert!(caps.check_mba_mode(MbaMode::Mbps).is_err());

        let off = RdtCapabilities::default();
        assert!(off.check_mba_mode(MbaMode::None).is_ok());
        assert!(off.check_mba_mode(MbaMode::Percentage).is_err());
    }
}
