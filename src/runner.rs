//! # Script Runner
//!
//! Orchestrates one script invocation:
//! 1. Locate the script (`hello` finds `hello.cszx` or `hello.cs`).
//! 2. Resolve the settings chain from the script's directory and flatten it.
//! 3. Write the generated project into the script's work directory.
//! 4. Rebuild only if the script text (or the generated project) changed.
//! 5. Run the artifact with inherited stdio and hand back its exit code.
//!
//! Both the build and the run race a cancellation future. When it fires the
//! child process is killed and [`ZxError::Cancelled`] is returned.

use std::ffi::OsString;
use std::fs;
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::process::Command;

use crate::cache::{BuildCache, SNAPSHOT_FILE_NAME};
use crate::error::ZxError;
use crate::paths;
use crate::project::{self, ProjectOptions};
use crate::resolver::{self, EffectiveSettings};
use crate::toolchain::Toolchain;

/// Extensions tried, in order, when the script is named without one.
pub const SCRIPT_EXTENSIONS: [&str; 2] = ["cszx", "cs"];

/// Written by `edit` when the script does not exist yet.
pub const SCRIPT_TEMPLATE: &str = "using Zx;\nusing static Zx.Env;\n\nawait $\"echo {\"Hello World\"}\";\n";

/// Prepended to code passed to `inline`.
pub const INLINE_PREAMBLE: &str = "using System;
using System.Diagnostics;
using System.IO;
using System.Net;
using Cysharp.Diagnostics;
using Zx;
using static Zx.Env;
";

/// Resolves a user-supplied script path to an absolute, existing file.
pub fn locate_script(path: &Path) -> Result<PathBuf, ZxError> {
    let not_found = || ZxError::NotFound { what: "script", path: path.to_path_buf() };

    let candidate = if path.extension().is_some() {
        path.to_path_buf()
    } else {
        SCRIPT_EXTENSIONS
            .iter()
            .map(|ext| {
                let mut name = OsString::from(path.as_os_str());
                name.push(".");
                name.push(ext);
                PathBuf::from(name)
            })
            .find(|p| p.is_file())
            .ok_or_else(not_found)?
    };

    if !candidate.is_file() {
        return Err(not_found());
    }
    let absolute = std::path::absolute(&candidate).map_err(|e| ZxError::io(&candidate, e))?;
    Ok(paths::normalize(&absolute))
}

/// Root directory holding one generated project per script.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<cache dir>/zxscript/work`, or a temp-dir fallback when the platform
    /// has no notion of a cache directory.
    pub fn default_root() -> PathBuf {
        directories::ProjectDirs::from("", "", "zxscript")
            .map(|dirs| dirs.cache_dir().join("work"))
            .unwrap_or_else(|| std::env::temp_dir().join("zxscript").join("work"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Work directory for `script`, keyed by its file stem.
    pub fn project_dir(&self, script: &Path) -> PathBuf {
        let stem = script.file_stem().map(|s| s.to_os_string()).unwrap_or_else(|| "script".into());
        self.root.join(stem)
    }

    /// Deletes every generated project and build output.
    pub fn reset(&self) -> Result<(), ZxError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!("Removed work directory {:?}", self.root);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("Work directory {:?} does not exist", self.root);
                Ok(())
            }
            Err(e) => Err(ZxError::io(&self.root, e)),
        }
    }
}

/// One script bound to its work directory.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    script: PathBuf,
    project_dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(script: &Path, workspace: &Workspace) -> Result<Self, ZxError> {
        let script = locate_script(script)?;
        let project_dir = workspace.project_dir(&script);
        Ok(Self { script, project_dir })
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Directory the script lives in; settings are resolved from here and the
    /// script runs with it as working directory.
    pub fn script_dir(&self) -> &Path {
        self.script.parent().unwrap_or_else(|| Path::new("/"))
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn out_dir(&self) -> PathBuf {
        self.project_dir.join("bin")
    }

    pub fn cache(&self) -> BuildCache {
        BuildCache::new(self.out_dir().join(SNAPSHOT_FILE_NAME))
    }

    /// Resolves settings and (re)writes the generated project.
    pub fn prepare(&self, options: &ProjectOptions) -> Result<EffectiveSettings> {
        let chain = resolver::resolve_chain(self.script_dir())
            .with_context(|| format!("Failed to resolve settings for {:?}", self.script))?;
        let effective = resolver::flatten(chain.as_ref());
        info!(
            "Effective settings: {} packages, {} projects, {} files ({} settings files)",
            effective.package_refs.len(),
            effective.project_refs.len(),
            effective.file_refs.len(),
            chain.as_ref().map_or(0, |c| c.records().len())
        );
        if effective.is_empty() {
            debug!("No settings apply to {:?}", self.script_dir());
        }

        let changed = project::write_project(&self.project_dir, &self.script, &effective, options)?;
        if changed {
            debug!("Generated project changed, dropping build snapshot");
            self.cache().invalidate()?;
        }
        Ok(effective)
    }

    /// Builds if stale, then runs. Returns the script's own exit code.
    pub async fn run<F>(&self, toolchain: &impl Toolchain, args: &[String], cancel: F) -> Result<i32>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);

        let cache = self.cache();
        let staleness = cache.check(&self.script)?;
        if staleness.needs_rebuild {
            self.build(toolchain, cancel.as_mut()).await?;
            cache.record(&staleness.contents)?;
        } else {
            info!("{:?} unchanged since last build, skipping build", self.script);
        }

        self.execute(toolchain, args, cancel.as_mut()).await
    }

    async fn build<F>(&self, toolchain: &impl Toolchain, cancel: Pin<&mut F>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut command = toolchain.build_command(&project::project_file(&self.project_dir), &self.out_dir());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Building {:?}", self.script);
        let child = spawn(&mut command)?;

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.context("Failed to wait for the build")?;
                if output.status.success() {
                    debug!("Build succeeded");
                    return Ok(());
                }
                // Show what the build tool said, untouched.
                let _ = std::io::stdout().write_all(&output.stdout);
                let _ = std::io::stderr().write_all(&output.stderr);
                Err(ZxError::ToolFailed { tool: "build".to_string(), code: exit_code(output.status) }.into())
            }
            _ = cancel => {
                warn!("Build cancelled");
                Err(ZxError::Cancelled.into())
            }
        }
    }

    async fn execute<F>(&self, toolchain: &impl Toolchain, args: &[String], cancel: Pin<&mut F>) -> Result<i32>
    where
        F: Future<Output = ()>,
    {
        let mut command = toolchain.run_command(&self.out_dir(), args);
        command.current_dir(self.script_dir()).kill_on_drop(true);

        debug!("Running {:?} with {:?}", self.script, args);
        let mut child = spawn(&mut command)?;

        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for the script")?;
                Ok(exit_code(status))
            }
            _ = cancel => {
                warn!("Script cancelled, stopping it");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill script process: {}", e);
                }
                Err(ZxError::Cancelled.into())
            }
        }
    }
}

fn spawn(command: &mut Command) -> Result<tokio::process::Child> {
    let program = PathBuf::from(command.as_std().get_program());
    command.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => ZxError::NotFound { what: "program", path: program }.into(),
        _ => anyhow::Error::new(e).context(format!("Failed to start {:?}", program)),
    })
}

/// Exit code of a finished child; signals map to `128 + signal` on unix.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Creates `path` from [`SCRIPT_TEMPLATE`] unless it already exists.
pub fn create_from_template(path: &Path) -> Result<bool, ZxError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ZxError::io(parent, e))?;
    }
    fs::write(path, SCRIPT_TEMPLATE).map_err(|e| ZxError::io(path, e))?;
    info!("Created {:?} from template", path);
    Ok(true)
}

/// A temporary script holding inline code; removed again on drop.
#[derive(Debug)]
pub struct InlineScript {
    path: PathBuf,
}

impl InlineScript {
    /// Writes `code` (after the standard preamble) into `dir`.
    ///
    /// The file lives in `dir` rather than a temp directory so that it picks
    /// up the settings chain of the caller's location.
    pub fn create(dir: &Path, code: &str) -> Result<Self, ZxError> {
        let path = dir.join("zxscript_inline.cs");
        let text = format!("{INLINE_PREAMBLE}\n{code}\n");
        fs::write(&path, text).map_err(|e| ZxError::io(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InlineScript {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove inline script {:?}: {}", self.path, e);
        }
    }
}
