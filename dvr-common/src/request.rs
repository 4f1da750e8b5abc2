//! Install Requests
//!
//! An [`InstallRequest`] is created when the user picks a `.run` archive.
//! Only the filename is inspected, never the archive contents.

use crate::config::ProductConfig;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use regex::Error as PatternError;

/// Edition of the product, selecting the recipe set to stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Variant {
    Standard,
    StudioEdition,
}

impl Variant {
    /// Derive the variant from an archive filename
    pub fn from_filename(filename: &str, product: &ProductConfig) -> Self {
        if !product.studio_marker.is_empty() && filename.contains(&product.studio_marker) {
            Variant::StudioEdition
        } else {
            Variant::Standard
        }
    }

    /// Human-readable product name for this variant
    pub fn product_name(&self, product: &ProductConfig) -> String {
        match self {
            Variant::Standard => product.display_name.clone(),
            Variant::StudioEdition => format!("{} Studio", product.display_name),
        }
    }
}

/// Errors raised while accepting a chosen file
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Installer path must be absolute: {0}")]
    NotAbsolute(PathBuf),

    #[error("Not a .run installer file: {0}")]
    NotRunFile(PathBuf),
}

/// A user-selected archive, immutable once created
#[derive(Debug, Clone, Serialize)]
pub struct InstallRequest {
    source_archive: PathBuf,
    variant: Variant,
    product_name: String,
}

impl InstallRequest {
    /// Accept a chosen path, validating only its `.run` filename pattern
    pub fn new(path: impl Into<PathBuf>, product: &ProductConfig) -> Result<Self, RequestError> {
        let path = path.into();

        if !path.is_absolute() {
            return Err(RequestError::NotAbsolute(path));
        }

        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.ends_with(".run") && name.len() > ".run".len() => name,
            _ => return Err(RequestError::NotRunFile(path)),
        };

        let variant = Variant::from_filename(filename, product);

        Ok(Self {
            product_name: variant.product_name(product),
            variant,
            source_archive: path,
        })
    }

    /// Absolute path to the selected archive
    pub fn source_archive(&self) -> &Path {
        &self.source_archive
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    /// Archive filename (always valid UTF-8, checked in `new`)
    pub fn filename(&self) -> &str {
        self.source_archive
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Strict matcher for `<Token>[_Studio]_<version>_Linux.run`
#[derive(Debug, Clone)]
pub struct VersionPattern {
    regex: Regex,
}

impl VersionPattern {
    pub fn new(product_token: &str) -> Result<Self, PatternError> {
        let pattern = format!(
            r"^{}(?:_Studio)?_(\d+(?:\.\d+)*)_Linux\.run$",
            regex::escape(product_token)
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    /// Extract the numeric-dot version from an archive filename
    pub fn extract(&self, filename: &str) -> Option<String> {
        self.regex
            .captures(filename)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> ProductConfig {
        ProductConfig::default()
    }

    #[test]
    fn test_extract_version() {
        let pattern = VersionPattern::new("DaVinci_Resolve").unwrap();
        assert_eq!(
            pattern.extract("DaVinci_Resolve_19.1.3_Linux.run").as_deref(),
            Some("19.1.3")
        );
        assert_eq!(
            pattern.extract("DaVinci_Resolve_Studio_18.6.0_Linux.run").as_deref(),
            Some("18.6.0")
        );
        assert_eq!(pattern.extract("DaVinci_Resolve_20_Linux.run").as_deref(), Some("20"));
    }

    #[test]
    fn test_extract_version_rejects_loose_names() {
        let pattern = VersionPattern::new("DaVinci_Resolve").unwrap();
        assert_eq!(pattern.extract("DaVinci_Resolve_Linux.run"), None);
        assert_eq!(pattern.extract("DaVinci_Resolve_19.1_beta_Linux.run"), None);
        assert_eq!(pattern.extract("copy of DaVinci_Resolve_19.1_Linux.run"), None);
        assert_eq!(pattern.extract("DaVinci_Resolve_19.1_Linux.run.bak"), None);
        assert_eq!(pattern.extract("DaVinci_Resolve_19..1_Linux.run"), None);
    }

    #[test]
    fn test_product_token_is_escaped() {
        let pattern = VersionPattern::new("Pro.duct").unwrap();
        assert_eq!(pattern.extract("Pro.duct_1.0_Linux.run").as_deref(), Some("1.0"));
        assert_eq!(pattern.extract("ProXduct_1.0_Linux.run"), None);
    }

    #[test]
    fn test_request_variant_and_name() {
        let request =
            InstallRequest::new("/tmp/DaVinci_Resolve_Studio_18.6.0_Linux.run", &product()).unwrap();
        assert_eq!(request.variant(), Variant::StudioEdition);
        assert_eq!(request.product_name(), "DaVinci Resolve Studio");
        assert_eq!(request.filename(), "DaVinci_Resolve_Studio_18.6.0_Linux.run");

        let request = InstallRequest::new("/tmp/DaVinci_Resolve_18.6.0_Linux.run", &product()).unwrap();
        assert_eq!(request.variant(), Variant::Standard);
        assert_eq!(request.product_name(), "DaVinci Resolve");
    }

    #[test]
    fn test_request_rejects_bad_paths() {
        assert!(matches!(
            InstallRequest::new("DaVinci_Resolve_18.6.0_Linux.run", &product()),
            Err(RequestError::NotAbsolute(_))
        ));
        assert!(matches!(
            InstallRequest::new("/tmp/archive.tar.gz", &product()),
            Err(RequestError::NotRunFile(_))
        ));
        assert!(matches!(
            InstallRequest::new("/tmp/.run", &product()),
            Err(RequestError::NotRunFile(_))
        ));
    }
}
