//! Session workspaces extracted from user archives.
//!
//! Every archive is unpacked into its own timestamped directory under a
//! dedicated base directory:
//!
//! ```text
//! <base>/<session-id>/project/...
//! ```
//!
//! Nothing outside `<base>` is ever written or removed, and the source
//! archive is only read.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{IacError, IacResult};

/// Subdirectory of a session that holds the unpacked archive.
pub const PROJECT_DIR: &str = "project";

/// Sessions older than this are removed by the stale sweep.
pub const DEFAULT_RETENTION_HOURS: u64 = 24;

/// Directories never searched for definition files.
const SKIPPED_DIRS: &[&str] = &[".terraform", "__MACOSX", ".git"];

const MAX_DEPTH: usize = 32;

/// One extraction lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Filesystem-safe timestamp identifier
    pub id: String,
    /// Archive the session was extracted from
    pub archive_path: PathBuf,
    /// `<base>/<id>`
    pub session_dir: PathBuf,
    /// `<base>/<id>/project`
    pub extraction_root: PathBuf,
    /// Common ancestor of all definition files
    pub root: PathBuf,
    /// Discovered `*.tf` files, sorted
    pub definition_files: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn definition_file_count(&self) -> usize {
        self.definition_files.len()
    }
}

/// Outcome of a stale-session sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StaleSweepReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Owns the base temp directory and the single active session.
pub struct WorkspaceManager {
    base_dir: PathBuf,
    active: Option<Session>,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            active: None,
        }
    }

    /// `<system temp>/tfpilot-sessions`
    pub fn default_base_dir() -> PathBuf {
        std::env::temp_dir().join("tfpilot-sessions")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    /// Unpack an archive into a fresh session, replacing any active one.
    pub fn extract(&mut self, archive_path: &Path) -> IacResult<&Session> {
        if !archive_path.is_file() {
            return Err(IacError::ExtractionFailed(format!(
                "archive not found: {}",
                archive_path.display()
            )));
        }
        let kind = ArchiveKind::detect(archive_path).ok_or_else(|| {
            IacError::ExtractionFailed(format!(
                "unsupported archive type (expected .zip, .tar.gz, .tgz or .tar): {}",
                archive_path.display()
            ))
        })?;

        self.cleanup_active()?;

        fs::create_dir_all(&self.base_dir)?;
        let (id, session_dir) = self.allocate_session_dir()?;
        let extraction_root = session_dir.join(PROJECT_DIR);

        info!("Extracting {:?} into session {}", archive_path, id);

        let populated = fs::create_dir_all(&extraction_root)
            .map_err(IacError::from)
            .and_then(|_| unpack(archive_path, kind, &extraction_root))
            .and_then(|_| discover_definition_files(&extraction_root));

        let definition_files = match populated {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => {
                remove_quietly(&session_dir);
                return Err(IacError::NoDefinitionFilesFound(
                    archive_path.display().to_string(),
                ));
            }
            Err(e) => {
                remove_quietly(&session_dir);
                return Err(match e {
                    IacError::Io(io) => IacError::ExtractionFailed(io.to_string()),
                    other => other,
                });
            }
        };

        let root = provisioning_root(&extraction_root, &definition_files);
        info!(
            "Session {} ready: {} definition file(s), root {:?}",
            id,
            definition_files.len(),
            root
        );

        Ok(&*self.active.insert(Session {
            id,
            archive_path: archive_path.to_path_buf(),
            session_dir,
            extraction_root,
            root,
            definition_files,
            created_at: Utc::now(),
        }))
    }

    /// Remove a session's directory tree. Missing directories are fine.
    pub fn cleanup(&self, session: &Session) -> IacResult<()> {
        if !session.session_dir.starts_with(&self.base_dir) {
            warn!("Refusing to remove {:?}: outside base dir", session.session_dir);
            return Ok(());
        }
        match fs::remove_dir_all(&session.session_dir) {
            Ok(()) => {
                info!("Removed session {}", session.id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the active session, if any.
    pub fn cleanup_active(&mut self) -> IacResult<()> {
        if let Some(session) = self.active.take() {
            self.cleanup(&session)?;
        }
        Ok(())
    }

    /// Remove session directories older than `max_age_hours`.
    ///
    /// Individual failures are logged and reported; the sweep continues.
    pub fn cleanup_stale(&self, max_age_hours: u64) -> StaleSweepReport {
        self.sweep(
            Duration::from_secs(max_age_hours.saturating_mul(3600)),
            SystemTime::now(),
            |path| fs::remove_dir_all(path),
        )
    }

    fn sweep<F>(&self, max_age: Duration, now: SystemTime, mut remove: F) -> StaleSweepReport
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        let mut report = StaleSweepReport::default();

        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No session base dir to sweep ({:?}): {}", self.base_dir, e);
                return report;
            }
        };

        let active_dir = self.active.as_ref().map(|s| s.session_dir.clone());

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || Some(&path) == active_dir.as_ref() {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Cannot read age of {:?}: {}", path, e);
                    report.failed.push((path, e.to_string()));
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match remove(&path) {
                Ok(()) => {
                    info!("Removed stale session {:?}", path);
                    report.removed.push(path);
                }
                Err(e) => {
                    let err = IacError::StaleSessionCleanupFailed {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    };
                    warn!("{}", err);
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        report
    }

    fn allocate_session_dir(&self) -> IacResult<(String, PathBuf)> {
        let stamp = session_id(Utc::now());
        let mut id = stamp.clone();
        let mut suffix = 1;
        while self.base_dir.join(&id).exists() {
            id = format!("{}-{}", stamp, suffix);
            suffix += 1;
        }
        let dir = self.base_dir.join(&id);
        fs::create_dir(&dir)?;
        Ok((id, dir))
    }
}

/// Filesystem-safe session identifier for a timestamp.
pub fn session_id(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

fn remove_quietly(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("Failed to remove partial session {:?}: {}", dir, e);
    }
}

fn unpack(archive_path: &Path, kind: ArchiveKind, dest: &Path) -> IacResult<()> {
    let file = File::open(archive_path)?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Zip => return unpack_zip(file, dest),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveKind::Tar => Box::new(file),
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);

    let entries = archive
        .entries()
        .map_err(|e| IacError::ExtractionFailed(format!("unreadable archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| IacError::ExtractionFailed(format!("corrupt entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();

        let unpacked = entry.unpack_in(dest).map_err(|e| {
            IacError::ExtractionFailed(format!("{}: {}", entry_path.display(), e))
        })?;
        if !unpacked {
            return Err(IacError::ExtractionFailed(format!(
                "entry escapes extraction root: {}",
                entry_path.display()
            )));
        }
    }

    Ok(())
}

fn unpack_zip(file: File, dest: &Path) -> IacResult<()> {
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| IacError::ExtractionFailed(format!("unreadable archive: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| IacError::ExtractionFailed(format!("corrupt entry: {}", e)))?;

        // Absolute paths and `..` components yield no enclosed name.
        let relative = entry.enclosed_name().map(|p| p.to_path_buf()).ok_or_else(|| {
            IacError::ExtractionFailed(format!(
                "entry escapes extraction root: {}",
                entry.name()
            ))
        })?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out).map_err(|e| {
            IacError::ExtractionFailed(format!("{}: {}", relative.display(), e))
        })?;
    }

    Ok(())
}

/// All `*.tf` files under `root`, sorted.
pub fn discover_definition_files(root: &Path) -> IacResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !SKIPPED_DIRS.iter().any(|skipped| *skipped == name)
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            IacError::ExtractionFailed(format!("failed to scan workspace: {}", e))
        })?;
        let is_definition = entry.file_type().is_file()
            && entry.path().extension().map_or(false, |ext| ext == "tf");
        if is_definition {
            debug!("Found definition file {:?} (depth {})", entry.path(), entry.depth());
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Nearest common ancestor directory of all files, or `fallback`.
pub fn provisioning_root(fallback: &Path, files: &[PathBuf]) -> PathBuf {
    let dirs: Vec<&Path> = files.iter().filter_map(|f| f.parent()).collect();
    match common_ancestor(&dirs) {
        Some(ancestor) if ancestor.starts_with(fallback) => ancestor,
        _ => fallback.to_path_buf(),
    }
}

fn common_ancestor(dirs: &[&Path]) -> Option<PathBuf> {
    let (first, rest) = dirs.split_first()?;
    let mut common: Vec<Component> = first.components().collect();

    for dir in rest {
        let shared = common
            .iter()
            .zip(dir.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        common.truncate(shared);
    }

    if common.is_empty() {
        None
    } else {
        Some(common.iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_id_is_filesystem_safe() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:20:30.456Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = session_id(at);
        assert_eq!(id, "2024-05-01T10-20-30-456Z");
        assert!(!id.contains(':') && !id.contains('.'));
    }

    #[test]
    fn test_archive_kind_detection() {
        assert_eq!(ArchiveKind::detect(Path::new("a/infra.tar.gz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("INFRA.TGZ")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("infra.tar")), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::detect(Path::new("infra.zip")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("Infra.ZIP")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("infra.rar")), None);
        assert_eq!(ArchiveKind::detect(Path::new("zip")), None);
    }

    #[test]
    fn test_common_ancestor() {
        let a = Path::new("/s/project/app/env/dev");
        let b = Path::new("/s/project/app/modules/net");
        let c = Path::new("/s/project/app");
        assert_eq!(common_ancestor(&[a, b, c]), Some(PathBuf::from("/s/project/app")));
        assert_eq!(common_ancestor(&[a]), Some(PathBuf::from("/s/project/app/env/dev")));
        assert_eq!(common_ancestor(&[]), None);
    }

    #[test]
    fn test_common_ancestor_relative_disjoint() {
        let a = Path::new("left/a");
        let b = Path::new("right/b");
        assert_eq!(common_ancestor(&[a, b]), None);
    }

    #[test]
    fn test_provisioning_root_falls_back() {
        let fallback = Path::new("/s/project");
        let files = vec![PathBuf::from("left/main.tf"), PathBuf::from("right/main.tf")];
        assert_eq!(provisioning_root(fallback, &files), PathBuf::from("/s/project"));
    }

    #[test]
    fn test_discover_skips_plugin_cache() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("infra/.terraform/modules/x")).unwrap();
        fs::write(root.join("infra/main.tf"), "").unwrap();
        fs::write(root.join("infra/.terraform/modules/x/main.tf"), "").unwrap();
        fs::write(root.join("infra/README.md"), "").unwrap();

        let files = discover_definition_files(root).unwrap();
        assert_eq!(files, vec![root.join("infra/main.tf")]);
    }

    fn make_session_dir(base: &Path, name: &str) -> PathBuf {
        let dir = base.join(name);
        fs::create_dir_all(dir.join(PROJECT_DIR)).unwrap();
        dir
    }

    #[test]
    fn test_sweep_removes_only_old_sessions() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());
        let old = make_session_dir(base.path(), "old");

        // Everything was just created, so "now" is moved forward instead.
        let later = SystemTime::now() + Duration::from_secs(25 * 3600);
        let report = manager.sweep(Duration::from_secs(24 * 3600), later, |p| {
            fs::remove_dir_all(p)
        });
        assert_eq!(report.removed, vec![old.clone()]);
        assert!(!old.exists());

        let fresh = make_session_dir(base.path(), "fresh");
        let report = manager.cleanup_stale(DEFAULT_RETENTION_HOURS);
        assert!(report.removed.is_empty());
        assert!(fresh.exists());
    }

    #[test]
    fn test_sweep_continues_after_failure() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());
        let a = make_session_dir(base.path(), "a");
        let b = make_session_dir(base.path(), "b");
        let c = make_session_dir(base.path(), "c");

        let later = SystemTime::now() + Duration::from_secs(48 * 3600);
        let report = manager.sweep(Duration::from_secs(24 * 3600), later, |p| {
            if p.ends_with("b") {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"))
            } else {
                fs::remove_dir_all(p)
            }
        });

        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, b);
        assert!(!a.exists());
        assert!(b.exists());
        assert!(!c.exists());
    }

    #[test]
    fn test_sweep_without_base_dir() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().join("missing"));
        let report = manager.cleanup_stale(24);
        assert!(report.removed.is_empty() && report.failed.is_empty());
    }

    #[test]
    fn test_cleanup_stale_with_huge_retention() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());
        let session = make_session_dir(base.path(), "kept");

        let report = manager.cleanup_stale(u64::MAX);
        assert!(report.removed.is_empty() && report.failed.is_empty());
        assert!(session.exists());
    }
}
