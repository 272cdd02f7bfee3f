//! Build artifact sources.
//!
//! The build server is an external collaborator; the engine only needs the
//! four operations of the [`ArtifactSource`] trait. A local artifact
//! directory implementation ships in-tree for offline provisioning and for
//! tests; the registered artifact naming convention is
//! `<version>_<file_type><extension>` under `<root>/<category>/<platform>/`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};

use anyhow::Result;
use camino::Utf8PathBuf;
use regex::Regex;
use tracing::debug;

use crate::error::FlashwrightError;
use crate::prompt::Prompt;
use crate::recipe::ProductCategory;

/// Reference to one artifact on a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub category: ProductCategory,
    pub platform: String,
    /// Registered name (`<version>_<file_type><extension>`).
    pub name: String,
}

impl ArtifactRef {
    /// The version prefix: everything before the last underscore.
    pub fn version(&self) -> &str {
        match self.name.rfind('_') {
            Some(index) => &self.name[..index],
            None => &self.name,
        }
    }
}

/// Progress callback: (bytes done, bytes total).
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// Abstract artifact provider (build server or local directory).
pub trait ArtifactSource {
    /// Lists registered artifact names per product category for a platform.
    fn list_builds(&self, platform: &str) -> Result<BTreeMap<ProductCategory, Vec<String>>>;

    /// Returns the artifacts of a category whose names match the filter.
    ///
    /// The filter is a regex fragment matched anywhere in the name; an empty
    /// filter matches everything.
    fn resolve_matches(
        &self,
        category: ProductCategory,
        platform: &str,
        name_filter: &str,
    ) -> Result<Vec<ArtifactRef>>;

    /// Returns the artifact's byte size without downloading it.
    fn remote_size(&self, artifact: &ArtifactRef) -> Result<u64>;

    /// Downloads the artifact, returning its local path and byte size.
    fn fetch(&self, artifact: &ArtifactRef, progress: ProgressFn) -> Result<(Utf8PathBuf, u64)>;
}

/// Picks one version among the matching artifacts.
///
/// Versions are the distinct version prefixes of the matches, sorted. With
/// more than one, automatic mode takes the lexicographically greatest
/// (newest) and interactive mode asks the user.
pub fn select_version(
    matches: &[ArtifactRef],
    auto: bool,
    prompt: &dyn Prompt,
) -> Result<String> {
    let mut versions: Vec<String> = matches.iter().map(|m| m.version().to_string()).collect();
    versions.sort();
    versions.dedup();

    match versions.len() {
        0 => Err(FlashwrightError::ArtifactFetch(
            "no artifact matches the requested name".to_string(),
        )
        .into()),
        1 => Ok(versions.pop().expect("one version")),
        _ if auto => {
            let newest = versions.pop().expect("multiple versions");
            tracing::info!("multiple versions found, taking newest: {}", newest);
            Ok(newest)
        }
        _ => {
            let index = prompt.select("Please select a build version", &versions)?;
            Ok(versions.swap_remove(index))
        }
    }
}

/// Finds the artifact of a version carrying a given file type.
pub fn artifact_for_file_type<'a>(
    matches: &'a [ArtifactRef],
    version: &str,
    file_type: &str,
) -> Option<&'a ArtifactRef> {
    let prefix = format!("{}_{}", version, file_type);
    matches.iter().find(|artifact| {
        artifact.name.starts_with(&prefix)
            && artifact
                .name[prefix.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_ascii_alphanumeric())
    })
}

/// Artifact source over a local directory tree.
///
/// Layout: `<root>/<category>/<platform>/<artifact>`. Fetches are staged
/// into a per-instance staging directory so delivery can delete them freely.
#[derive(Debug)]
pub struct DirectorySource {
    root: Utf8PathBuf,
    staging: Utf8PathBuf,
}

impl DirectorySource {
    /// Opens a local artifact directory, staging downloads under `staging`.
    pub fn new(root: Utf8PathBuf, staging: Utf8PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(FlashwrightError::ArtifactFetch(format!(
                "local artifact directory {} does not exist",
                root
            ))
            .into());
        }
        Ok(Self { root, staging })
    }

    fn artifact_path(&self, artifact: &ArtifactRef) -> Utf8PathBuf {
        self.root
            .join(artifact.category.to_string())
            .join(&artifact.platform)
            .join(&artifact.name)
    }
}

impl ArtifactSource for DirectorySource {
    fn list_builds(&self, platform: &str) -> Result<BTreeMap<ProductCategory, Vec<String>>> {
        let mut builds = BTreeMap::new();

        for category in ProductCategory::LOAD_ORDER {
            let dir = self.root.join(category.to_string()).join(platform);
            let Ok(entries) = fs::read_dir(&dir) else {
                debug!("no builds for category {} at {}", category, dir);
                continue;
            };

            let mut names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect();
            names.sort();

            if !names.is_empty() {
                builds.insert(category, names);
            }
        }

        Ok(builds)
    }

    fn resolve_matches(
        &self,
        category: ProductCategory,
        platform: &str,
        name_filter: &str,
    ) -> Result<Vec<ArtifactRef>> {
        let pattern = Regex::new(&format!(".*{}.*", name_filter)).map_err(|e| {
            FlashwrightError::ArtifactFetch(format!("invalid name filter {:?}: {}", name_filter, e))
        })?;

        let builds = self.list_builds(platform)?;
        let names = builds.get(&category).cloned().unwrap_or_default();

        Ok(names
            .into_iter()
            .filter(|name| pattern.is_match(name))
            .map(|name| ArtifactRef {
                category,
                platform: platform.to_string(),
                name,
            })
            .collect())
    }

    fn remote_size(&self, artifact: &ArtifactRef) -> Result<u64> {
        let path = self.artifact_path(artifact);
        let metadata = fs::metadata(&path)
            .map_err(|e| FlashwrightError::io(format!("failed to stat artifact: {}", path), e))?;
        Ok(metadata.len())
    }

    fn fetch(&self, artifact: &ArtifactRef, progress: ProgressFn) -> Result<(Utf8PathBuf, u64)> {
        let source = self.artifact_path(artifact);
        let dest_dir = self.staging.join(artifact.category.to_string());
        fs::create_dir_all(&dest_dir).map_err(|e| {
            FlashwrightError::io(format!("failed to create staging directory: {}", dest_dir), e)
        })?;
        let dest = dest_dir.join(&artifact.name);

        let total = self.remote_size(artifact)?;
        let mut reader = fs::File::open(&source)
            .map_err(|e| FlashwrightError::io(format!("failed to open artifact: {}", source), e))?;
        let mut writer = fs::File::create(&dest)
            .map_err(|e| FlashwrightError::io(format!("failed to create file: {}", dest), e))?;

        let mut buf = vec![0u8; 1024 * 1024];
        let mut done: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| FlashwrightError::io(format!("failed to read artifact: {}", source), e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| FlashwrightError::io(format!("failed to write file: {}", dest), e))?;
            done += n as u64;
            progress(done, total);
        }

        Ok((dest, done))
    }
}
