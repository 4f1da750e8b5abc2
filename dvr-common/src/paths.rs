//! Centralized Path Definitions
//!
//! This module contains all system and user paths used by the installer.
//! Centralizing these prevents hardcoded strings scattered across the codebase.

/// Recipe sources shipped with the distribution
pub mod recipes {
    /// Build recipe set for the free edition
    pub const STANDARD_DIR: &str = "/usr/share/linexin/davinci";

    /// Build recipe set for the Studio edition
    pub const STUDIO_DIR: &str = "/usr/share/linexin/davincistudio";

    /// Build recipe file name (same for both editions)
    pub const RECIPE: &str = "PKGBUILD";

    /// Control panels setup script (same for both editions)
    pub const SETUP_SCRIPT: &str = "davinci-control-panels-setup.sh";
}

/// System-wide paths touched after a successful install
pub mod system {
    use std::path::PathBuf;

    /// Package manager configuration holding the ignore directive
    pub const PACMAN_CONF: &str = "/etc/pacman.conf";

    /// Shell used to run composed build commands
    pub const SHELL: &str = "/bin/sh";

    /// Get the package manager configuration as PathBuf
    pub fn pacman_conf() -> PathBuf {
        PathBuf::from(PACMAN_CONF)
    }
}

/// Per-user paths (no privileges required)
pub mod user {
    use std::path::PathBuf;

    /// Directory name used under the XDG config directory
    pub const APP_DIR: &str = "dvr-installer";

    /// Get the user's configuration file (~/.config/dvr-installer/config.toml)
    pub fn config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR).join("config.toml"))
    }

    /// Directory for short-lived private helper files.
    ///
    /// Prefers `$XDG_RUNTIME_DIR`, which is owner-only and tmpfs-backed,
    /// and falls back to the system temp directory.
    pub fn runtime_dir() -> PathBuf {
        dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
    }
}

/// Safety validation for paths before deletion
pub mod safety {
    use std::path::Path;

    /// Validate that a staging directory is safe to remove recursively
    ///
    /// Returns true if the path:
    /// - Is not a root-level or home directory
    /// - Ends with the expected staging directory name
    pub fn is_safe_staging_dir(path: &Path, dir_name: &str) -> bool {
        if dir_name.is_empty() || path.parent().is_none() {
            return false;
        }

        let path_str = path.to_string_lossy();
        if path_str == "/" || path_str == "/home" || path_str == "/usr" || path_str == "/etc" {
            return false;
        }

        path.file_name()
            .map(|name| name == dir_name)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_safety_blocks_root() {
        assert!(!safety::is_safe_staging_dir(Path::new("/"), "davinci_tmp"));
        assert!(!safety::is_safe_staging_dir(Path::new("/home"), "home"));
        assert!(!safety::is_safe_staging_dir(Path::new("/usr"), "usr"));
    }

    #[test]
    fn test_safety_requires_dir_name() {
        let path = Path::new("/home/user/Downloads");
        assert!(!safety::is_safe_staging_dir(path, "davinci_tmp"));
        assert!(!safety::is_safe_staging_dir(path, ""));
    }

    #[test]
    fn test_safety_allows_staging_dir() {
        let path = Path::new("/home/user/Downloads/davinci_tmp");
        assert!(safety::is_safe_staging_dir(path, "davinci_tmp"));
    }

    #[test]
    fn test_pacman_conf_constant() {
        assert_eq!(system::pacman_conf(), Path::new("/etc/pacman.conf"));
    }
}
