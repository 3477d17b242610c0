use std::path::{Path, PathBuf};
use std::process::Stdio;
use log::{debug, warn};
use serde_json::Value;
use tokio::process::Command;

use crate::error::ZxError;
use crate::project::PROJECT_NAME;

/// Looks up a concrete version for a package when the user did not give one.
pub trait PackageResolver {
    /// Latest stable version of `name`, or why none could be found.
    fn resolve_version(&self, name: &str) -> Result<String, ZxError>;
}

/// Abstraction over the external build system.
/// The runner owns spawning, output capture and cancellation; a toolchain only
/// describes which processes to start, so tests can swap in a shell.
pub trait Toolchain {
    /// Command that builds `project_file` with its output in `out_dir`.
    fn build_command(&self, project_file: &Path, out_dir: &Path) -> Command;

    /// Command that launches the artifact previously built into `out_dir`.
    fn run_command(&self, out_dir: &Path, args: &[String]) -> Command;
}

/// The real toolchain: the `dotnet` CLI.
#[derive(Debug, Clone)]
pub struct DotnetToolchain {
    pub program: PathBuf,
}

impl Default for DotnetToolchain {
    fn default() -> Self {
        Self { program: PathBuf::from("dotnet") }
    }
}

impl Toolchain for DotnetToolchain {
    fn build_command(&self, project_file: &Path, out_dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("build")
            .arg(project_file)
            .args(["-c", "Release", "--nologo", "-o"])
            .arg(out_dir);
        command
    }

    fn run_command(&self, out_dir: &Path, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.arg(out_dir.join(format!("{PROJECT_NAME}.dll"))).args(args);
        command
    }
}

impl PackageResolver for DotnetToolchain {
    fn resolve_version(&self, name: &str) -> Result<String, ZxError> {
        let output = std::process::Command::new(&self.program)
            .args(["package", "search", name, "--exact-match", "--format", "json"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ZxError::PackageResolution { name: name.to_string(), reason: e.to_string() })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("package search for {} failed: {}", name, stderr.trim());
            return Err(match output.status.code() {
                Some(code) => ZxError::ToolFailed { tool: "dotnet package search".to_string(), code },
                None => ZxError::PackageResolution {
                    name: name.to_string(),
                    reason: "package search was terminated by a signal".to_string(),
                },
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("package search output: {}", stdout);
        latest_version_from_search(&stdout, name).ok_or_else(|| ZxError::PackageResolution {
            name: name.to_string(),
            reason: "no matching package in search results".to_string(),
        })
    }
}

/// Picks the highest version of `name` from `dotnet package search --format json` output.
///
/// Stable versions are preferred; pre-releases only count when nothing else matches.
pub fn latest_version_from_search(json: &str, name: &str) -> Option<String> {
    let doc: Value = serde_json::from_str(json).ok()?;
    let mut versions: Vec<String> = Vec::new();

    for source in doc.get("searchResult")?.as_array()? {
        let Some(packages) = source.get("packages").and_then(Value::as_array) else {
            continue;
        };
        for package in packages {
            let id = package.get("id").and_then(Value::as_str).unwrap_or_default();
            if !id.eq_ignore_ascii_case(name) {
                continue;
            }
            let version = package
                .get("version")
                .or_else(|| package.get("latestVersion"))
                .and_then(Value::as_str);
            if let Some(v) = version {
                versions.push(v.to_string());
            }
        }
    }

    let stable = versions.iter().filter(|v| !v.contains('-')).max_by_key(|v| version_key(v));
    stable
        .or_else(|| versions.iter().max_by_key(|v| version_key(v)))
        .cloned()
}

fn version_key(version: &str) -> Vec<u64> {
    version
        .split(['.', '-', '+'])
        .map_while(|part| part.parse().ok())
        .collect()
}

/// A shell-backed toolchain for tests.
///
/// Build and run are `sh -c` snippets. `$OUT` is the output directory and
/// `$PROJECT` the project file; run arguments arrive as `$1..`.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockToolchain {
    pub packages: std::collections::HashMap<String, String>,
    pub build_script: String,
    pub run_script: String,
    pub builds: std::sync::Mutex<usize>,
}

#[cfg(test)]
impl MockToolchain {
    pub fn with_package(name: &str, version: &str) -> Self {
        let mut mock = Self::default();
        mock.packages.insert(name.to_string(), version.to_string());
        mock
    }

    pub fn with_scripts(build: &str, run: &str) -> Self {
        Self {
            build_script: build.to_string(),
            run_script: run.to_string(),
            ..Default::default()
        }
    }

    pub fn build_count(&self) -> usize {
        *self.builds.lock().unwrap()
    }
}

#[cfg(test)]
impl PackageResolver for MockToolchain {
    fn resolve_version(&self, name: &str) -> Result<String, ZxError> {
        self.packages.get(name).cloned().ok_or_else(|| ZxError::PackageResolution {
            name: name.to_string(),
            reason: "not in mock feed".to_string(),
        })
    }
}

#[cfg(test)]
impl Toolchain for MockToolchain {
    fn build_command(&self, project_file: &Path, out_dir: &Path) -> Command {
        *self.builds.lock().unwrap() += 1;
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.build_script)
            .env("OUT", out_dir)
            .env("PROJECT", project_file);
        command
    }

    fn run_command(&self, out_dir: &Path, args: &[String]) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.run_script)
            .arg("sh")
            .args(args)
            .env("OUT", out_dir);
        command
    }
}
