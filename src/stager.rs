//! Build Stager - Per-Attempt Build Directory
//!
//! Creates the staging directory beside the chosen archive, copies the
//! variant's recipe files into it, pins the recipe version to the one in the
//! archive filename and moves the archive into `<staging>/src`.
//! [`BuildStage::rollback`] puts everything back.

use dvr_common::config::{InstallerConfig, RecipeSets, StagingConfig};
use dvr_common::paths::safety;
use dvr_common::request::{InstallRequest, PatternError, VersionPattern};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Staging failures; fatal to the attempt
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Could not extract version number from filename: {0}")]
    UnparseableVersion(String),

    #[error("Required file not found at {}", .0.display())]
    MissingRecipeFile(PathBuf),

    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid product token: {0}")]
    Pattern(#[from] PatternError),
}

impl StageError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| StageError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Prepares staging directories from the configured recipe sets
#[derive(Debug, Clone)]
pub struct BuildStager {
    recipes: RecipeSets,
    staging: StagingConfig,
    version: VersionPattern,
}

impl BuildStager {
    pub fn new(config: &InstallerConfig) -> Result<Self, StageError> {
        Ok(Self {
            recipes: config.recipes.clone(),
            staging: config.staging.clone(),
            version: VersionPattern::new(&config.product.token)?,
        })
    }

    /// Extract the recipe version from an archive filename
    pub fn version_for(&self, filename: &str) -> Result<String, StageError> {
        self.version
            .extract(filename)
            .ok_or_else(|| StageError::UnparseableVersion(filename.to_string()))
    }

    /// Stage a build for `request`.
    ///
    /// The filename and recipe inputs are checked before anything touches
    /// the disk. If a later step fails, the directory is removed again
    /// (unless it predates this attempt) and the archive stays where it was.
    pub fn prepare(&self, request: &InstallRequest) -> Result<BuildStage, StageError> {
        let filename = request.filename();
        let version = self.version_for(filename)?;

        let recipe_set = self.recipes.for_variant(request.variant());
        let sources = recipe_set.source_paths();
        if let Some(missing) = sources.iter().find(|p| !p.is_file()) {
            return Err(StageError::MissingRecipeFile(missing.clone()));
        }

        let archive = request.source_archive();
        let parent = archive.parent().ok_or_else(|| StageError::Io {
            action: "No parent directory for",
            path: archive.to_path_buf(),
            source: io::ErrorKind::NotFound.into(),
        })?;
        let staging_dir = parent.join(&self.staging.dir_name);
        let src_dir = staging_dir.join(&self.staging.source_subdir);

        let preexisting = staging_dir.exists();
        if preexisting {
            tracing::warn!("Reusing stale staging directory {:?}", staging_dir);
        }

        fs::create_dir_all(&src_dir).map_err(StageError::io("Failed to create", &src_dir))?;

        let populate = || -> Result<PathBuf, StageError> {
            for (source, name) in sources.iter().zip(recipe_set.file_names()) {
                let dest = staging_dir.join(name);
                fs::copy(source, &dest).map_err(StageError::io("Failed to copy", source))?;
            }

            let recipe = staging_dir.join(&recipe_set.recipe);
            let content =
                fs::read_to_string(&recipe).map_err(StageError::io("Failed to read", &recipe))?;
            let rewritten = rewrite_version(&content, &self.staging.version_key, &version);
            fs::write(&recipe, rewritten).map_err(StageError::io("Failed to write", &recipe))?;

            let staged = src_dir.join(filename);
            move_file(archive, &staged).map_err(StageError::io("Failed to move", archive))?;
            Ok(staged)
        };

        match populate() {
            Ok(staged_archive) => {
                tracing::info!(
                    "Staged {} {} in {:?}",
                    request.product_name(),
                    version,
                    staging_dir
                );
                Ok(BuildStage {
                    staging_dir,
                    recipe_version: version,
                    original_archive: archive.to_path_buf(),
                    staged_archive: Some(staged_archive),
                    dir_name: self.staging.dir_name.clone(),
                    finished: false,
                })
            }
            Err(e) => {
                if !preexisting {
                    if let Err(cleanup) = fs::remove_dir_all(&staging_dir) {
                        tracing::warn!(
                            "Failed to remove partial staging directory {:?}: {}",
                            staging_dir,
                            cleanup
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

/// One staged attempt, owned exclusively by the flow that created it
#[derive(Debug)]
pub struct BuildStage {
    staging_dir: PathBuf,
    recipe_version: String,
    original_archive: PathBuf,
    staged_archive: Option<PathBuf>,
    dir_name: String,
    finished: bool,
}

impl BuildStage {
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn recipe_version(&self) -> &str {
        &self.recipe_version
    }

    /// Where the archive returns on rollback
    pub fn original_archive(&self) -> &Path {
        &self.original_archive
    }

    /// Current archive location inside staging, until rolled back
    pub fn staged_archive(&self) -> Option<&Path> {
        self.staged_archive.as_deref()
    }

    /// Restore the archive and remove the staging directory.
    ///
    /// Never fails: problems are logged and returned as warnings. Safe to
    /// call any number of times. If the archive cannot be moved back, the
    /// staging directory is kept so the archive is not lost.
    pub fn rollback(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.finished {
            return warnings;
        }
        self.finished = true;

        let mut archive_safe = true;
        if let Some(staged) = self.staged_archive.take() {
            if staged.exists() {
                match move_file(&staged, &self.original_archive) {
                    Ok(()) => tracing::info!("Restored {:?}", self.original_archive),
                    Err(e) => {
                        archive_safe = false;
                        warnings.push(format!(
                            "Failed to restore {} to {}: {}",
                            staged.display(),
                            self.original_archive.display(),
                            e
                        ));
                    }
                }
            }
        }

        if !archive_safe {
            warnings.push(format!(
                "Keeping {} because it still holds the installer",
                self.staging_dir.display()
            ));
        } else if self.staging_dir.exists() {
            if safety::is_safe_staging_dir(&self.staging_dir, &self.dir_name) {
                if let Err(e) = fs::remove_dir_all(&self.staging_dir) {
                    warnings.push(format!(
                        "Failed to remove {}: {}",
                        self.staging_dir.display(),
                        e
                    ));
                }
            } else {
                warnings.push(format!(
                    "Refusing to delete unexpected path {}",
                    self.staging_dir.display()
                ));
            }
        }

        for warning in &warnings {
            tracing::warn!("Warning: Failed to clean up temporary build files: {}", warning);
        }

        warnings
    }
}

impl Drop for BuildStage {
    fn drop(&mut self) {
        self.rollback();
    }
}

/// Replace the value of every `key=` line, keeping all other bytes intact
pub fn rewrite_version(content: &str, key: &str, version: &str) -> String {
    let prefix = format!("{}=", key);

    content
        .split_inclusive('\n')
        .map(|line| {
            if !line.trim_start().starts_with(&prefix) {
                return line.to_string();
            }
            let ending = if line.ends_with("\r\n") {
                "\r\n"
            } else if line.ends_with('\n') {
                "\n"
            } else {
                ""
            };
            format!("{}{}{}", prefix, version, ending)
        })
        .collect()
}

/// Rename, falling back to copy + remove across filesystems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    move_file_with(from, to, |from, to| fs::rename(from, to))
}

fn move_file_with<R>(from: &Path, to: &Path, rename: R) -> io::Result<()>
where
    R: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}
