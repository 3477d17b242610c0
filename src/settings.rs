//! # Settings Store
//!
//! One `ZxScriptSettings.json` may live in any directory. It declares the
//! package references, project references and extra source files that every
//! script at or below that directory should be built with.
//!
//! This module only knows about a single directory at a time: loading,
//! editing and saving one record. Walking up the tree and merging records is
//! the job of [`crate::resolver`].
//!
//! Every operation takes the settings directory explicitly. Nothing here reads
//! or changes the process working directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ZxError;
use crate::paths;
use crate::toolchain::PackageResolver;

/// Fixed name of the per-directory settings file.
pub const SETTINGS_FILE_NAME: &str = "ZxScriptSettings.json";

/// A package dependency, e.g. `Newtonsoft.Json` at `13.0.3`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Version")]
    pub version: String,
}

/// A sibling project the script links against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Relative to the directory holding the settings file, as written.
    #[serde(alias = "ProjectPath")]
    pub path: String,
}

/// An extra source file compiled alongside the script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Relative to the directory holding the settings file, as written.
    #[serde(alias = "FilePath")]
    pub path: String,
}

/// Common access to the two path-valued reference kinds.
pub trait PathRef {
    fn path(&self) -> &str;
    fn from_path(path: String) -> Self;
}

impl PathRef for ProjectRef {
    fn path(&self) -> &str {
        &self.path
    }
    fn from_path(path: String) -> Self {
        ProjectRef { path }
    }
}

impl PathRef for FileRef {
    fn path(&self) -> &str {
        &self.path
    }
    fn from_path(path: String) -> Self {
        FileRef { path }
    }
}

/// Result of adding a path reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// An entry resolving to the same absolute path was already recorded.
    AlreadyPresent,
}

/// Result of [`SettingsRecord::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// The record was empty and the file on disk (if any) was removed.
    Removed,
}

/// The contents of one settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRecord {
    #[serde(default, alias = "PackageRefList")]
    pub package_refs: Vec<PackageRef>,

    #[serde(default, alias = "ProjectRefList")]
    pub project_refs: Vec<ProjectRef>,

    #[serde(default, alias = "CsRefList")]
    pub file_refs: Vec<FileRef>,

    /// Absolute path of the file this record came from. Only set by the
    /// chain walk; never persisted.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Location of the settings file for `dir`.
pub fn settings_path(dir: &Path) -> PathBuf {
    dir.join(SETTINGS_FILE_NAME)
}

/// Reads and parses the settings file at `path`.
///
/// Returns `Ok(None)` when the file does not exist, including when it vanished
/// after a directory listing said it was there, or when the name is taken by
/// a directory.
pub fn read_settings_file(path: &Path) -> Result<Option<SettingsRecord>, ZxError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        // A directory that happens to carry the settings name is not a settings file.
        Err(_) if path.is_dir() => return Ok(None),
        Err(e) => return Err(ZxError::io(path, e)),
    };
    SettingsRecord::from_json(&text, path).map(Some)
}

impl SettingsRecord {
    /// Loads the record for `dir`, or a fresh empty one if it has no settings file.
    pub fn load(dir: &Path) -> Result<Self, ZxError> {
        let path = settings_path(dir);
        let record = read_settings_file(&path)?.unwrap_or_default();
        debug!("Loaded settings for {:?}: {} packages, {} projects, {} files",
            dir, record.package_refs.len(), record.project_refs.len(), record.file_refs.len());
        Ok(record)
    }

    /// Persists the record into `dir`.
    ///
    /// An empty record is never written: the settings file is deleted instead,
    /// so "no settings" and "empty settings" are the same state on disk.
    pub fn save(&self, dir: &Path) -> Result<SaveOutcome, ZxError> {
        let path = settings_path(dir);

        if self.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => info!("Removed empty settings file {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ZxError::io(&path, e)),
            }
            return Ok(SaveOutcome::Removed);
        }

        fs::write(&path, self.to_json()).map_err(|e| ZxError::io(&path, e))?;
        debug!("Wrote settings file {:?}", path);
        Ok(SaveOutcome::Written)
    }

    pub fn is_empty(&self) -> bool {
        self.package_refs.is_empty() && self.project_refs.is_empty() && self.file_refs.is_empty()
    }

    /// Directory of the file this record was loaded from.
    pub fn source_dir(&self) -> Option<&Path> {
        self.source_path.as_deref().and_then(Path::parent)
    }

    /// Pretty JSON; non-ASCII text is written as-is, not `\u` escaped.
    pub fn to_json(&self) -> String {
        // Only strings and vectors of plain structs: serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Parses settings JSON. `origin` only feeds the error message.
    pub fn from_json(text: &str, origin: &Path) -> Result<Self, ZxError> {
        serde_json::from_str(text).map_err(|source| ZxError::MalformedSettings {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Adds `name` or updates its version in place.
    ///
    /// An empty `version` asks `resolver` for the latest one. Returns `false`
    /// when that lookup fails; the record is left untouched in that case.
    pub fn add_package_ref(&mut self, name: &str, version: &str, resolver: &impl PackageResolver) -> bool {
        match self.try_add_package_ref(name, version, resolver) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to resolve a version for {}: {}", name, e);
                false
            }
        }
    }

    /// Same as [`add_package_ref`](Self::add_package_ref), but hands back the
    /// resolver's error so a failed package search keeps its own exit code.
    pub fn try_add_package_ref(
        &mut self,
        name: &str,
        version: &str,
        resolver: &impl PackageResolver,
    ) -> Result<(), ZxError> {
        let version = if version.is_empty() {
            let resolved = resolver.resolve_version(name)?;
            info!("Resolved {} to version {}", name, resolved);
            resolved
        } else {
            version.to_string()
        };

        match self.package_refs.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                info!("Updating {} from {} to {}", name, existing.version, version);
                existing.version = version;
            }
            None => {
                info!("Adding package {} {}", name, version);
                self.package_refs.push(PackageRef { name: name.to_string(), version });
            }
        }
        Ok(())
    }

    /// Returns `false` (and warns) when no package of that name is recorded.
    pub fn remove_package_ref(&mut self, name: &str) -> bool {
        let before = self.package_refs.len();
        self.package_refs.retain(|p| p.name != name);
        if self.package_refs.len() == before {
            warn!("Package {} is not referenced", name);
            return false;
        }
        true
    }

    /// Adds a project reference; `path` is interpreted relative to `dir`.
    pub fn add_project_ref(&mut self, dir: &Path, path: &str) -> Result<AddOutcome, ZxError> {
        add_path_ref(&mut self.project_refs, dir, path, "project")
    }

    pub fn remove_project_ref(&mut self, dir: &Path, path: &str) -> bool {
        remove_path_ref(&mut self.project_refs, dir, path, "project")
    }

    /// Adds an extra source file; `path` is interpreted relative to `dir`.
    pub fn add_file_ref(&mut self, dir: &Path, path: &str) -> Result<AddOutcome, ZxError> {
        add_path_ref(&mut self.file_refs, dir, path, "source file")
    }

    pub fn remove_file_ref(&mut self, dir: &Path, path: &str) -> bool {
        remove_path_ref(&mut self.file_refs, dir, path, "source file")
    }
}

/// Absolute form of `dir`, without touching the process working directory
/// unless `dir` itself is relative.
fn absolute_dir(dir: &Path) -> Result<PathBuf, ZxError> {
    std::path::absolute(dir)
        .map(|p| paths::normalize(&p))
        .map_err(|e| ZxError::io(dir, e))
}

fn add_path_ref<T: PathRef>(refs: &mut Vec<T>, dir: &Path, path: &str, what: &'static str) -> Result<AddOutcome, ZxError> {
    let base = absolute_dir(dir)?;
    let target = paths::resolve(&base, Path::new(path));

    if !target.exists() {
        return Err(ZxError::NotFound { what, path: target });
    }

    if refs.iter().any(|r| paths::resolve(&base, Path::new(r.path())) == target) {
        info!("{} {:?} is already referenced", what, target);
        return Ok(AddOutcome::AlreadyPresent);
    }

    let stored = paths::relative_to(&target, &base);
    info!("Adding {} {:?}", what, stored);
    refs.push(T::from_path(stored.to_string_lossy().into_owned()));
    Ok(AddOutcome::Added)
}

fn remove_path_ref<T: PathRef>(refs: &mut Vec<T>, dir: &Path, path: &str, what: &'static str) -> bool {
    // Matching is lexical; fall back to the raw directory if it cannot be made absolute.
    let base = absolute_dir(dir).unwrap_or_else(|_| dir.to_path_buf());
    let target = paths::resolve(&base, Path::new(path));

    let before = refs.len();
    refs.retain(|r| paths::resolve(&base, Path::new(r.path())) != target);
    if refs.len() == before {
        warn!("{} {} is not referenced", what, path);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::MockToolchain;
    use tempfile::TempDir;

    fn sample() -> SettingsRecord {
        SettingsRecord {
            package_refs: vec![PackageRef { name: "Newtonsoft.Json".into(), version: "13.0.3".into() }],
            project_refs: vec![ProjectRef { path: "lib/Test/Test.csproj".into() }],
            file_refs: vec![FileRef { path: "Util.cs".into() }],
            source_path: None,
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let record = SettingsRecord::load(temp.path()).unwrap();
        assert!(record.is_empty());
        assert!(record.source_path.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let record = sample();
        assert_eq!(record.save(temp.path()).unwrap(), SaveOutcome::Written);

        let loaded = SettingsRecord::load(temp.path()).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_saving_empty_record_deletes_file() {
        let temp = TempDir::new().unwrap();
        sample().save(temp.path()).unwrap();
        assert!(settings_path(temp.path()).exists());

        let outcome = SettingsRecord::default().save(temp.path()).unwrap();
        assert_eq!(outcome, SaveOutcome::Removed);
        assert!(!settings_path(temp.path()).exists());

        // Nothing there any more: still fine.
        assert_eq!(SettingsRecord::default().save(temp.path()).unwrap(), SaveOutcome::Removed);
    }

    #[test]
    fn test_json_field_names_and_unicode() {
        let mut record = sample();
        record.file_refs[0].path = "ユーティリティ.cs".into();
        let json = record.to_json();

        assert!(json.contains("\"packageRefs\""));
        assert!(json.contains("\"projectRefs\""));
        assert!(json.contains("\"fileRefs\""));
        assert!(json.contains("ユーティリティ.cs"));
        assert!(!json.contains("sourcePath"));
    }

    #[test]
    fn test_legacy_field_names_are_accepted() {
        let legacy = r#"{
            "PackageRefList": [{"Name": "ProcessX", "Version": "1.5.3"}],
            "ProjectRefList": [{"ProjectPath": "../Util/Util.csproj"}],
            "CsRefList": [{"FilePath": "Helpers.cs"}]
        }"#;
        let record = SettingsRecord::from_json(legacy, Path::new("legacy.json")).unwrap();
        assert_eq!(record.package_refs[0].name, "ProcessX");
        assert_eq!(record.project_refs[0].path, "../Util/Util.csproj");
        assert_eq!(record.file_refs[0].path, "Helpers.cs");
    }

    #[test]
    fn test_malformed_file_reports_its_path() {
        let temp = TempDir::new().unwrap();
        fs::write(settings_path(temp.path()), "{ not json").unwrap();

        let err = SettingsRecord::load(temp.path()).unwrap_err();
        match err {
            ZxError::MalformedSettings { path, .. } => assert_eq!(path, settings_path(temp.path())),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_add_package_updates_version_in_place() {
        let resolver = MockToolchain::default();
        let mut record = sample();

        assert!(record.add_package_ref("Newtonsoft.Json", "12.0.1", &resolver));
        assert!(record.add_package_ref("Hoge", "1.0.0", &resolver));

        assert_eq!(record.package_refs.len(), 2);
        assert_eq!(record.package_refs[0].version, "12.0.1");
        assert_eq!(record.package_refs[1].name, "Hoge");
    }

    #[test]
    fn test_add_package_without_version_uses_resolver() {
        let resolver = MockToolchain::with_package("ProcessX", "1.5.3");
        let mut record = SettingsRecord::default();

        assert!(record.add_package_ref("ProcessX", "", &resolver));
        assert_eq!(record.package_refs[0].version, "1.5.3");

        assert!(!record.add_package_ref("Unknown.Package", "", &resolver));
        assert_eq!(record.package_refs.len(), 1);
    }

    /// A package feed whose search command always exits with `code`.
    struct FailingSearch(i32);

    impl PackageResolver for FailingSearch {
        fn resolve_version(&self, _name: &str) -> Result<String, ZxError> {
            Err(ZxError::ToolFailed { tool: "dotnet package search".into(), code: self.0 })
        }
    }

    #[test]
    fn test_failed_search_keeps_its_exit_code() {
        let mut record = sample();
        let err = record.try_add_package_ref("ProcessX", "", &FailingSearch(4)).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(record, sample());

        assert!(!record.add_package_ref("ProcessX", "", &FailingSearch(4)));
        assert!(record.try_add_package_ref("ProcessX", "1.5.3", &FailingSearch(4)).is_ok());
    }

    #[test]
    fn test_directory_named_like_settings_is_ignored() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(settings_path(temp.path())).unwrap();

        assert!(read_settings_file(&settings_path(temp.path())).unwrap().is_none());
        assert!(SettingsRecord::load(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_remove_package_not_found() {
        let mut record = sample();
        assert!(!record.remove_package_ref("Missing"));
        assert!(record.remove_package_ref("Newtonsoft.Json"));
        assert!(record.package_refs.is_empty());
    }

    #[test]
    fn test_add_project_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let lib = temp.path().join("lib/Test");
        fs::create_dir_all(&lib).unwrap();
        fs::write(lib.join("Test.csproj"), "<Project />").unwrap();
        let scripts = temp.path().join("scripts");
        fs::create_dir_all(&scripts).unwrap();

        let mut record = SettingsRecord::default();
        let first = record.add_project_ref(&scripts, "../lib/Test/Test.csproj").unwrap();
        let second = record.add_project_ref(&scripts, "./../lib/Test/../Test/Test.csproj").unwrap();

        assert_eq!(first, AddOutcome::Added);
        assert_eq!(second, AddOutcome::AlreadyPresent);
        assert_eq!(record.project_refs.len(), 1);
        assert_eq!(Path::new(&record.project_refs[0].path), Path::new("../lib/Test/Test.csproj"));
    }

    #[test]
    fn test_add_project_stores_path_relative_to_settings_dir() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("lib/A.csproj");
        fs::create_dir_all(project.parent().unwrap()).unwrap();
        fs::write(&project, "<Project />").unwrap();

        let mut record = SettingsRecord::default();
        record.add_project_ref(temp.path(), project.to_str().unwrap()).unwrap();
        assert_eq!(Path::new(&record.project_refs[0].path), Path::new("lib/A.csproj"));
    }

    #[test]
    fn test_add_missing_project_is_not_found() {
        let temp = TempDir::new().unwrap();
        let mut record = SettingsRecord::default();
        let err = record.add_project_ref(temp.path(), "nope/Nope.csproj").unwrap_err();
        assert!(matches!(err, ZxError::NotFound { what: "project", .. }));
        assert!(record.project_refs.is_empty());
    }

    #[test]
    fn test_remove_path_refs_match_by_resolved_path() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("Util.cs"), "// util").unwrap();

        let mut record = SettingsRecord::default();
        record.add_file_ref(temp.path(), "Util.cs").unwrap();

        assert!(!record.remove_file_ref(temp.path(), "Other.cs"));
        assert!(record.remove_file_ref(temp.path(), "./Util.cs"));
        assert!(record.file_refs.is_empty());
        assert!(!record.remove_project_ref(temp.path(), "lib/A.csproj"));
    }
}
