//! # Settings Resolver
//!
//! Builds the effective configuration for a script by combining every
//! settings file between the script's directory and the filesystem root.
//!
//! ## Rules
//!
//! 1.  **Chain order**: records are kept ancestor-first. The outermost
//!     directory that has a settings file comes first, the script's own
//!     directory last.
//! 2.  **Ancestor wins**: a package name declared by an ancestor is kept and
//!     the same name declared further down is dropped, not overridden. A
//!     parent directory can pin a version for everything below it.
//! 3.  **Paths are absolute**: project and file references are resolved
//!     against the directory of the settings file that declared them, then
//!     de-duplicated by that absolute path (first seen wins, same order).

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::error::ZxError;
use crate::invariant_ppt::assert_invariant;
use crate::paths;
use crate::settings::{PackageRef, SettingsRecord, read_settings_file, settings_path};

pub const INV_UNIQUE_PACKAGES: &str = "Effective package names are unique";
pub const INV_UNIQUE_PATHS: &str = "Effective reference paths are unique";
pub const INV_ABSOLUTE_PATHS: &str = "Effective reference paths are absolute";
pub const INV_CHAINED_SOURCE: &str = "Chained settings records carry their source path";

/// The settings records found on the way from a directory up to the root,
/// ordered ancestor-first.
#[derive(Debug, Clone, Default)]
pub struct SettingsChain {
    records: Vec<SettingsRecord>,
}

/// The merged view of a [`SettingsChain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub package_refs: Vec<PackageRef>,
    pub project_refs: Vec<PathBuf>,
    pub file_refs: Vec<PathBuf>,
}

impl EffectiveSettings {
    pub fn is_empty(&self) -> bool {
        self.package_refs.is_empty() && self.project_refs.is_empty() && self.file_refs.is_empty()
    }
}

/// Walks from `start` up to the filesystem root collecting settings files.
///
/// Returns `Ok(None)` when no directory on the way has one; callers treat that
/// as an empty configuration. A file that fails to parse aborts the walk with
/// [`ZxError::MalformedSettings`].
pub fn resolve_chain(start: &Path) -> Result<Option<SettingsChain>, ZxError> {
    let start = std::path::absolute(start).map_err(|e| ZxError::io(start, e))?;
    let start = paths::normalize(&start);

    // `ancestors` yields nearest first; the chain wants the root first.
    let mut records = Vec::new();
    for dir in start.ancestors() {
        let path = settings_path(dir);
        trace!("Looking for settings at {:?}", path);
        if let Some(mut record) = read_settings_file(&path)? {
            debug!("Found settings file {:?}", path);
            record.source_path = Some(path);
            records.push(record);
        }
    }
    records.reverse();

    if records.is_empty() {
        debug!("No settings files above {:?}", start);
        return Ok(None);
    }
    Ok(Some(SettingsChain { records }))
}

/// Flattens an optional chain; an absent chain is the empty configuration.
pub fn flatten(chain: Option<&SettingsChain>) -> EffectiveSettings {
    chain.map(SettingsChain::flatten).unwrap_or_default()
}

impl SettingsChain {
    /// Builds a chain from records already in ancestor-first order.
    ///
    /// Every record must have `source_path` set.
    #[cfg(test)]
    pub fn from_records(records: Vec<SettingsRecord>) -> Self {
        SettingsChain { records }
    }

    pub fn records(&self) -> &[SettingsRecord] {
        &self.records
    }

    /// Merges the chain into one de-duplicated, absolute configuration.
    ///
    /// Pure: all file reads happened in [`resolve_chain`].
    pub fn flatten(&self) -> EffectiveSettings {
        let mut result = EffectiveSettings::default();
        let mut seen_packages: HashSet<&str> = HashSet::new();
        let mut seen_projects: HashSet<PathBuf> = HashSet::new();
        let mut seen_files: HashSet<PathBuf> = HashSet::new();

        for record in &self.records {
            for package in &record.package_refs {
                if seen_packages.insert(package.name.as_str()) {
                    result.package_refs.push(package.clone());
                } else {
                    debug!("Ignoring {} {} from {:?}: already declared by an ancestor",
                        package.name, package.version, record.source_path);
                }
            }

            let source_dir = record.source_dir();
            assert_invariant(source_dir.is_some(), INV_CHAINED_SOURCE, Some("Resolver"));
            let Some(dir) = source_dir else {
                continue;
            };

            for project in &record.project_refs {
                let full = paths::resolve(dir, Path::new(&project.path));
                if seen_projects.insert(full.clone()) {
                    result.project_refs.push(full);
                }
            }

            for file in &record.file_refs {
                let full = paths::resolve(dir, Path::new(&file.path));
                if seen_files.insert(full.clone()) {
                    result.file_refs.push(full);
                }
            }
        }

        check_effective(&result);
        result
    }

    /// Prints every reference grouped by the settings file that declared it.
    pub fn write_listing(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "Package List")?;
        for record in self.records.iter().filter(|r| !r.package_refs.is_empty()) {
            writeln!(out, "  {}", display_source(record))?;
            for package in &record.package_refs {
                writeln!(out, "    {} {}", package.name, package.version)?;
            }
        }

        writeln!(out)?;
        writeln!(out, "Project List")?;
        for record in self.records.iter().filter(|r| !r.project_refs.is_empty()) {
            writeln!(out, "  {}", display_source(record))?;
            for project in &record.project_refs {
                writeln!(out, "    {}", project.path)?;
            }
        }

        writeln!(out)?;
        writeln!(out, "File List")?;
        for record in self.records.iter().filter(|r| !r.file_refs.is_empty()) {
            writeln!(out, "  {}", display_source(record))?;
            for file in &record.file_refs {
                writeln!(out, "    {}", file.path)?;
            }
        }
        Ok(())
    }
}

fn display_source(record: &SettingsRecord) -> String {
    record
        .source_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn check_effective(result: &EffectiveSettings) {
    let names: HashSet<&str> = result.package_refs.iter().map(|p| p.name.as_str()).collect();
    assert_invariant(names.len() == result.package_refs.len(), INV_UNIQUE_PACKAGES, Some("Resolver"));

    let projects: HashSet<&PathBuf> = result.project_refs.iter().collect();
    let files: HashSet<&PathBuf> = result.file_refs.iter().collect();
    assert_invariant(
        projects.len() == result.project_refs.len() && files.len() == result.file_refs.len(),
        INV_UNIQUE_PATHS,
        Some("Resolver"),
    );

    assert_invariant(
        result.project_refs.iter().chain(&result.file_refs).all(|p| p.is_absolute()),
        INV_ABSOLUTE_PATHS,
        Some("Resolver"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariant_ppt::contract_test;
    use crate::settings::{FileRef, ProjectRef};
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn pkg(name: &str, version: &str) -> PackageRef {
        PackageRef { name: name.into(), version: version.into() }
    }

    fn record_at(dir: &str, packages: Vec<PackageRef>, projects: &[&str], files: &[&str]) -> SettingsRecord {
        SettingsRecord {
            package_refs: packages,
            project_refs: projects.iter().map(|p| ProjectRef { path: p.to_string() }).collect(),
            file_refs: files.iter().map(|f| FileRef { path: f.to_string() }).collect(),
            source_path: Some(settings_path(Path::new(dir))),
        }
    }

    fn write_settings(dir: &Path, record: &SettingsRecord) {
        fs::create_dir_all(dir).unwrap();
        record.save(dir).unwrap();
    }

    #[test]
    fn test_ancestor_version_wins() {
        let chain = SettingsChain::from_records(vec![
            record_at("/root", vec![pkg("A", "1.0")], &[], &[]),
            record_at("/root/sub", vec![pkg("A", "2.0"), pkg("B", "1.0")], &[], &[]),
        ]);

        let effective = chain.flatten();
        assert_eq!(effective.package_refs, vec![pkg("A", "1.0"), pkg("B", "1.0")]);
    }

    #[test]
    fn test_paths_resolve_against_declaring_directory() {
        let chain = SettingsChain::from_records(vec![
            record_at("/work", vec![], &["lib/Util/Util.csproj"], &["Shared.cs"]),
            record_at("/work/scripts", vec![], &["../lib/Foo.proj", "../lib/Util/Util.csproj"], &["./Local.cs"]),
        ]);

        let effective = chain.flatten();
        assert_eq!(
            effective.project_refs,
            vec![PathBuf::from("/work/lib/Util/Util.csproj"), PathBuf::from("/work/lib/Foo.proj")]
        );
        assert_eq!(
            effective.file_refs,
            vec![PathBuf::from("/work/Shared.cs"), PathBuf::from("/work/scripts/Local.cs")]
        );
    }

    #[test]
    fn test_flatten_checks_its_invariants() {
        let chain = SettingsChain::from_records(vec![record_at("/x", vec![pkg("A", "1")], &["a.proj"], &["a.cs"])]);
        chain.flatten();
        contract_test("flatten", &[INV_UNIQUE_PACKAGES, INV_UNIQUE_PATHS, INV_ABSOLUTE_PATHS, INV_CHAINED_SOURCE]);
    }

    #[test]
    fn test_absent_chain_flattens_to_empty() {
        assert!(flatten(None).is_empty());
    }

    #[test]
    fn test_resolve_chain_scenario_from_disk() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let sub = root.join("sub");
        write_settings(&root, &SettingsRecord { package_refs: vec![pkg("A", "1.0")], ..Default::default() });
        write_settings(&sub, &SettingsRecord {
            package_refs: vec![pkg("A", "2.0"), pkg("B", "1.0")],
            ..Default::default()
        });

        let chain = resolve_chain(&sub).unwrap().expect("two settings files");
        let sources: Vec<_> = chain.records().iter().map(|r| r.source_path.clone().unwrap()).collect();
        assert_eq!(sources, vec![settings_path(&root), settings_path(&sub)]);

        let effective = chain.flatten();
        assert_eq!(effective.package_refs, vec![pkg("A", "1.0"), pkg("B", "1.0")]);

        // From the parent only its own file is seen.
        let chain = resolve_chain(&root).unwrap().unwrap();
        assert_eq!(chain.records().len(), 1);
    }

    #[test]
    fn test_resolve_chain_skips_directories_without_settings() {
        let temp = TempDir::new().unwrap();
        let deep = temp.path().join("a/b/c");
        fs::create_dir_all(&deep).unwrap();
        write_settings(&temp.path().join("a"), &SettingsRecord {
            file_refs: vec![FileRef { path: "b/Helper.cs".into() }],
            ..Default::default()
        });

        let chain = resolve_chain(&deep).unwrap().unwrap();
        assert_eq!(chain.records().len(), 1);
        assert_eq!(chain.flatten().file_refs, vec![paths::normalize(&temp.path().join("a/b/Helper.cs"))]);
    }

    #[test]
    fn test_resolve_chain_skips_directory_named_like_settings() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir_all(settings_path(temp.path())).unwrap();
        write_settings(&sub, &SettingsRecord { package_refs: vec![pkg("A", "1.0")], ..Default::default() });

        let chain = resolve_chain(&sub).unwrap().unwrap();
        assert_eq!(chain.records().len(), 1);
        assert_eq!(chain.records()[0].source_path, Some(settings_path(&sub)));
    }

    #[test]
    fn test_resolve_chain_without_any_settings() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("empty/tree");
        fs::create_dir_all(&dir).unwrap();

        // Only meaningful when nothing above the temp dir carries a settings file.
        let above_has_settings = temp.path().ancestors().any(|d| settings_path(d).exists());
        if !above_has_settings {
            assert!(resolve_chain(&dir).unwrap().is_none());
        }
    }

    #[test]
    fn test_malformed_settings_abort_resolution() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir_all(&sub).unwrap();
        fs::write(settings_path(temp.path()), "[1, 2").unwrap();

        let err = resolve_chain(&sub).unwrap_err();
        assert!(matches!(err, ZxError::MalformedSettings { ref path, .. } if *path == settings_path(temp.path())));
    }

    #[test]
    fn test_listing_groups_by_source() {
        let chain = SettingsChain::from_records(vec![
            record_at("/root", vec![pkg("A", "1.0")], &[], &[]),
            record_at("/root/sub", vec![pkg("B", "2.0")], &["../lib/L.csproj"], &[]),
        ]);
        let mut out = Vec::new();
        chain.write_listing(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let root_pos = text.find(&settings_path(Path::new("/root")).display().to_string()).unwrap();
        let b_pos = text.find("    B 2.0").unwrap();
        assert!(root_pos < b_pos);
        assert!(text.contains("    ../lib/L.csproj"));
        assert!(text.contains("File List"));
    }

    fn arb_record(depth: usize) -> impl Strategy<Value = SettingsRecord> {
        (
            prop::collection::vec(("[A-D]", "[0-9]"), 0..5),
            prop::collection::vec("(\\.\\./)?[a-c]/[a-c]\\.proj", 0..4),
            prop::collection::vec("(\\./)?[a-c]\\.cs", 0..4),
        )
            .prop_map(move |(packages, projects, files)| {
                let dir: PathBuf = std::iter::once("/".to_string())
                    .chain((0..depth).map(|i| format!("d{i}")))
                    .collect();
                SettingsRecord {
                    package_refs: packages.into_iter().map(|(n, v)| pkg(&n, &v)).collect(),
                    project_refs: projects.into_iter().map(|path| ProjectRef { path }).collect(),
                    file_refs: files.into_iter().map(|path| FileRef { path }).collect(),
                    source_path: Some(settings_path(&dir)),
                }
            })
    }

    fn arb_chain() -> impl Strategy<Value = SettingsChain> {
        (1usize..5)
            .prop_flat_map(|len| (0..len).map(arb_record).collect::<Vec<_>>())
            .prop_map(SettingsChain::from_records)
    }

    proptest! {
        #[test]
        fn test_flatten_never_grows_and_never_duplicates(chain in arb_chain()) {
            let effective = chain.flatten();

            let total_packages: usize = chain.records().iter().map(|r| r.package_refs.len()).sum();
            let total_projects: usize = chain.records().iter().map(|r| r.project_refs.len()).sum();
            let total_files: usize = chain.records().iter().map(|r| r.file_refs.len()).sum();
            prop_assert!(effective.package_refs.len() <= total_packages);
            prop_assert!(effective.project_refs.len() <= total_projects);
            prop_assert!(effective.file_refs.len() <= total_files);

            let names: HashSet<&str> = effective.package_refs.iter().map(|p| p.name.as_str()).collect();
            prop_assert_eq!(names.len(), effective.package_refs.len());
            prop_assert!(effective.project_refs.iter().all(|p| p.is_absolute()));
        }

        #[test]
        fn test_first_declaration_in_chain_order_wins(chain in arb_chain()) {
            let effective = chain.flatten();
            for package in &effective.package_refs {
                let first = chain.records()
                    .iter()
                    .flat_map(|r| r.package_refs.iter())
                    .find(|p| p.name == package.name)
                    .unwrap();
                prop_assert_eq!(&first.version, &package.version);
            }
        }
    }
}
