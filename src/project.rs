//! Generation of the throwaway build project for a script.
//!
//! The merge engine hands over an [`EffectiveSettings`]; this module only turns
//! it into three XML fragments and splices them into a `Run.csproj`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::ZxError;
use crate::resolver::EffectiveSettings;

/// Name of the generated project (and therefore of the built assembly).
pub const PROJECT_NAME: &str = "Run";

/// Knobs for the generated project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectOptions {
    pub target_framework: String,
    /// Version of the ProcessX package every script gets for free.
    pub processx_version: String,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            target_framework: "net8.0".to_string(),
            processx_version: "1.5.3".to_string(),
        }
    }
}

/// The effective references rendered as project-file items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceFragments {
    pub packages: String,
    pub projects: String,
    pub files: String,
}

impl ReferenceFragments {
    pub fn render(effective: &EffectiveSettings) -> Self {
        let mut fragments = Self::default();
        for package in &effective.package_refs {
            fragments.packages.push_str(&format!(
                "    <PackageReference Include=\"{}\" Version=\"{}\" />\n",
                xml_escape(&package.name),
                xml_escape(&package.version)
            ));
        }
        for project in &effective.project_refs {
            fragments.projects.push_str(&format!(
                "    <ProjectReference Include=\"{}\" />\n",
                xml_escape(&project.to_string_lossy())
            ));
        }
        for file in &effective.file_refs {
            fragments.files.push_str(&format!(
                "    <Compile Include=\"{}\" />\n",
                xml_escape(&file.to_string_lossy())
            ));
        }
        fragments
    }
}

pub fn project_file(project_dir: &Path) -> PathBuf {
    project_dir.join(format!("{PROJECT_NAME}.csproj"))
}

/// Full text of the project file for `script`.
pub fn render_project(script: &Path, effective: &EffectiveSettings, options: &ProjectOptions) -> String {
    let refs = ReferenceFragments::render(effective);
    format!(
        r#"<Project Sdk="Microsoft.NET.Sdk">

  <PropertyGroup>
    <OutputType>Exe</OutputType>
    <TargetFramework>{framework}</TargetFramework>
    <AssemblyName>{name}</AssemblyName>
    <EnableDefaultCompileItems>false</EnableDefaultCompileItems>
  </PropertyGroup>

  <ItemGroup>
    <Compile Include="{script}" />
{files}  </ItemGroup>

  <ItemGroup>
    <PackageReference Include="ProcessX" Version="{processx}" />
{packages}  </ItemGroup>

  <ItemGroup>
{projects}  </ItemGroup>
</Project>
"#,
        framework = xml_escape(&options.target_framework),
        name = PROJECT_NAME,
        script = xml_escape(&script.to_string_lossy()),
        files = refs.files,
        processx = xml_escape(&options.processx_version),
        packages = refs.packages,
        projects = refs.projects,
    )
}

/// Writes the project file into `project_dir`.
///
/// Returns `true` when the file content changed (or did not exist), which is
/// the caller's cue that the last build no longer matches the references.
pub fn write_project(
    project_dir: &Path,
    script: &Path,
    effective: &EffectiveSettings,
    options: &ProjectOptions,
) -> Result<bool, ZxError> {
    fs::create_dir_all(project_dir).map_err(|e| ZxError::io(project_dir, e))?;

    let path = project_file(project_dir);
    let text = render_project(script, effective, options);

    match fs::read_to_string(&path) {
        Ok(existing) if existing == text => {
            debug!("Project {:?} unchanged", path);
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(ZxError::io(&path, e)),
    }

    fs::write(&path, text).map_err(|e| ZxError::io(&path, e))?;
    debug!("Wrote project {:?}", path);
    Ok(true)
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
