//! Installer Configuration Parser
//!
//! Parses `config.toml` files describing the product, the recipe sets,
//! the build commands and the pin directive. Every field has a default
//! so an empty file yields the stock configuration.

use crate::paths;
use crate::request::Variant;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The main configuration structure matching config.toml
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallerConfig {
    #[serde(default)]
    pub product: ProductConfig,
    #[serde(default)]
    pub recipes: RecipeSets,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub pin: PinConfig,
}

/// Product naming and filename conventions
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProductConfig {
    /// Leading filename token (e.g., "DaVinci_Resolve")
    pub token: String,

    /// Human-readable product name
    pub display_name: String,

    /// Filename substring selecting the Studio edition
    pub studio_marker: String,
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            token: "DaVinci_Resolve".to_string(),
            display_name: "DaVinci Resolve".to_string(),
            studio_marker: "_Studio_".to_string(),
        }
    }
}

/// Recipe sets keyed by variant
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecipeSets {
    pub standard: RecipeSet,
    pub studio: RecipeSet,
}

impl Default for RecipeSets {
    fn default() -> Self {
        Self {
            standard: RecipeSet {
                source_dir: PathBuf::from(paths::recipes::STANDARD_DIR),
                recipe: paths::recipes::RECIPE.to_string(),
                install_hook: "davinci-resolve.install".to_string(),
                setup_script: paths::recipes::SETUP_SCRIPT.to_string(),
                package: "davinci-resolve".to_string(),
            },
            studio: RecipeSet {
                source_dir: PathBuf::from(paths::recipes::STUDIO_DIR),
                recipe: paths::recipes::RECIPE.to_string(),
                install_hook: "davinci-resolve-studio.install".to_string(),
                setup_script: paths::recipes::SETUP_SCRIPT.to_string(),
                package: "davinci-resolve-studio".to_string(),
            },
        }
    }
}

impl RecipeSets {
    /// Get the recipe set for a variant
    pub fn for_variant(&self, variant: Variant) -> &RecipeSet {
        match variant {
            Variant::Standard => &self.standard,
            Variant::StudioEdition => &self.studio,
        }
    }
}

/// The three files staged for one variant
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeSet {
    /// Directory holding the recipe files
    pub source_dir: PathBuf,

    /// Build recipe file name (carries the version key)
    pub recipe: String,

    /// Install hook file name
    pub install_hook: String,

    /// Auxiliary setup script file name
    pub setup_script: String,

    /// Package name produced by the recipe
    pub package: String,
}

impl RecipeSet {
    /// File names in staging order: recipe, install hook, setup script
    pub fn file_names(&self) -> [&str; 3] {
        [&self.recipe, &self.install_hook, &self.setup_script]
    }

    /// Absolute source paths in staging order
    pub fn source_paths(&self) -> [PathBuf; 3] {
        self.file_names().map(|name| self.source_dir.join(name))
    }
}

/// Staging directory layout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Staging directory name, created beside the source archive
    pub dir_name: String,

    /// Subdirectory receiving the relocated archive
    pub source_subdir: String,

    /// Recipe key whose value is replaced by the extracted version
    pub version_key: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir_name: "davinci_tmp".to_string(),
            source_subdir: "src".to_string(),
            version_key: "pkgver".to_string(),
        }
    }
}

/// Build and dependency commands, as argument lists
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Interpreter used to run the composed command line
    pub shell: PathBuf,

    /// Repository refresh, run through the escalation wrapper
    pub refresh: Vec<String>,

    /// Extra packages installed before building
    pub dependencies: Vec<String>,

    /// Command prefix used to install `dependencies`
    pub dependency_install: Vec<String>,

    /// Build-and-install command, run unprivileged inside staging
    pub build: Vec<String>,

    /// Variable the builder reads to find its escalation helper
    pub auth_env: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(paths::system::SHELL),
            refresh: strings(&["pacman", "-Sy"]),
            dependencies: Vec::new(),
            dependency_install: strings(&["pacman", "-S", "--needed", "--noconfirm"]),
            build: strings(&["makepkg", "-si", "--noconfirm", "--skipinteg"]),
            auth_env: "PACMAN_AUTH".to_string(),
        }
    }
}

/// Privilege escalation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Escalation program (sudo-compatible: -k, -S, -p)
    pub program: PathBuf,

    /// Environment variable carrying the secret to the wrapper
    pub secret_env: String,

    /// Directory for the generated wrapper (default: XDG runtime dir)
    pub wrapper_dir: Option<PathBuf>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("sudo"),
            secret_env: "DVR_INSTALLER_AUTH".to_string(),
            wrapper_dir: None,
        }
    }
}

impl EscalationConfig {
    /// Resolved wrapper directory
    pub fn wrapper_dir(&self) -> PathBuf {
        self.wrapper_dir
            .clone()
            .unwrap_or_else(paths::user::runtime_dir)
    }
}

/// Package pinning after a successful install
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    /// Whether to pin at all
    pub enabled: bool,

    /// Package manager configuration file
    pub config_file: PathBuf,

    /// Section header holding the directive (without brackets)
    pub section: String,

    /// Directive name
    pub directive: String,

    /// Runtime shim packages pinned alongside the product
    pub runtime_shims: Vec<String>,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_file: paths::system::pacman_conf(),
            section: "options".to_string(),
            directive: "IgnorePkg".to_string(),
            runtime_shims: strings(&["libxcrypt-compat", "qt5-x11extras"]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl InstallerConfig {
    /// Load configuration from a file path
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_str(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Failed to parse config.toml")
    }

    /// Load from an explicit path, else the user config file, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match paths::user::config_file().filter(|p| p.exists()) {
                Some(path) => {
                    tracing::debug!("Using config file {:?}", path);
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.product.token.trim().is_empty() {
            anyhow::bail!("[product] token must not be empty");
        }

        if self.build.build.is_empty() {
            anyhow::bail!("[build] build command must not be empty");
        }

        if !self.build.dependencies.is_empty() && self.build.dependency_install.is_empty() {
            anyhow::bail!("[build] dependencies are listed but dependency_install is empty");
        }

        if self.escalation.program.as_os_str().is_empty() {
            anyhow::bail!("[escalation] program must not be empty");
        }

        let secret_env = &self.escalation.secret_env;
        if secret_env.is_empty()
            || !secret_env.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "[escalation] secret_env must be a plain variable name, got: {:?}",
                secret_env
            );
        }

        if self.staging.dir_name.is_empty() || self.staging.dir_name.contains('/') {
            anyhow::bail!(
                "[staging] dir_name must be a single path component, got: {:?}",
                self.staging.dir_name
            );
        }

        if self.pin.enabled && self.pin.directive.is_empty() {
            anyhow::bail!("[pin] directive must not be empty when pinning is enabled");
        }

        Ok(())
    }
}
