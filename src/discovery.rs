//! # Discovery Module
//!
//! Finds every settings file below a directory and checks it for problems the
//! build would otherwise only surface as confusing compiler errors:
//!
//! - the file does not parse,
//! - a project or source file reference points at nothing,
//! - a package is listed twice in the same file,
//! - a package is shadowed: an ancestor settings file already declares the
//!   same name, so this declaration is ignored when merging.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::debug;
use walkdir::WalkDir;

use crate::paths;
use crate::resolver;
use crate::settings::{SETTINGS_FILE_NAME, SettingsRecord, read_settings_file};

/// A single problem found in one settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    Unreadable(String),
    MissingProject(String),
    MissingFile(String),
    DuplicatePackage(String),
    /// Package name, version written here, version an ancestor pins.
    ShadowedPackage { name: String, ignored: String, effective: String },
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Issue::Unreadable(e) => write!(f, "cannot be loaded: {}", e),
            Issue::MissingProject(p) => write!(f, "project reference does not exist: {}", p),
            Issue::MissingFile(p) => write!(f, "source file reference does not exist: {}", p),
            Issue::DuplicatePackage(n) => write!(f, "package listed more than once: {}", n),
            Issue::ShadowedPackage { name, ignored, effective } => write!(
                f,
                "package {} {} is ignored, an ancestor pins {}",
                name, ignored, effective
            ),
        }
    }
}

/// Findings for one settings file.
#[derive(Debug, Clone)]
pub struct SettingsReport {
    pub path: PathBuf,
    pub issues: Vec<Issue>,
}

/// Lists settings files at or below `root`, at most `max_depth` levels deep.
pub fn find_settings_files(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    let walker = WalkDir::new(root).max_depth(max_depth).sort_by_file_name();
    let mut found = Vec::new();

    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.file_name() == SETTINGS_FILE_NAME {
            debug!("Found settings file {:?}", entry.path());
            found.push(entry.path().to_path_buf());
        }
    }
    found
}

/// Checks one settings file.
pub fn inspect(path: &Path) -> SettingsReport {
    let mut issues = Vec::new();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let record = match read_settings_file(path) {
        Ok(Some(record)) => record,
        Ok(None) => SettingsRecord::default(),
        Err(e) => {
            issues.push(Issue::Unreadable(e.to_string()));
            return SettingsReport { path: path.to_path_buf(), issues };
        }
    };

    let mut names = HashSet::new();
    for package in &record.package_refs {
        if !names.insert(package.name.as_str()) {
            issues.push(Issue::DuplicatePackage(package.name.clone()));
        }
    }

    for project in &record.project_refs {
        if !paths::resolve(dir, Path::new(&project.path)).exists() {
            issues.push(Issue::MissingProject(project.path.clone()));
        }
    }
    for file in &record.file_refs {
        if !paths::resolve(dir, Path::new(&file.path)).exists() {
            issues.push(Issue::MissingFile(file.path.clone()));
        }
    }

    // Packages an ancestor settings file already pins win over this file's.
    if let Ok(Some(chain)) = resolver::resolve_chain(dir) {
        let own = std::path::absolute(path).map(|p| paths::normalize(&p)).ok();
        let ancestors: Vec<&SettingsRecord> = chain
            .records()
            .iter()
            .filter(|r| r.source_path.is_some() && r.source_path != own)
            .collect();

        for package in &record.package_refs {
            let pinned = ancestors
                .iter()
                .flat_map(|r| r.package_refs.iter())
                .find(|p| p.name == package.name);
            if let Some(winner) = pinned.filter(|w| w.version != package.version) {
                issues.push(Issue::ShadowedPackage {
                    name: package.name.clone(),
                    ignored: package.version.clone(),
                    effective: winner.version.clone(),
                });
            }
        }
    }

    SettingsReport { path: path.to_path_buf(), issues }
}

/// Inspects every settings file below `root` and prints a report.
///
/// Returns the number of files with at least one issue.
pub fn doctor(root: &Path, max_depth: usize) -> Result<usize> {
    let root = paths::normalize(&std::path::absolute(root)?);
    let files = find_settings_files(&root, max_depth);

    println!();
    println!("Settings health report for {}", root.display());
    println!();

    if files.is_empty() {
        println!("No {} files found.", SETTINGS_FILE_NAME);
        return Ok(0);
    }

    let mut unhealthy = 0;
    for path in &files {
        let report = inspect(path);
        if report.issues.is_empty() {
            println!("  ✓ {}", report.path.display());
            continue;
        }
        unhealthy += 1;
        println!("  ⚠ {}", report.path.display());
        for issue in &report.issues {
            println!("      - {}", issue);
        }
    }

    println!();
    println!("{} settings files checked, {} with problems.", files.len(), unhealthy);
    Ok(unhealthy)
}
