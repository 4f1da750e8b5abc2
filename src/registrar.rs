//! Post-Install Registrar
//!
//! Pins the installed package (and its runtime shims) in the package manager
//! configuration so routine upgrades leave it alone. The edited file is
//! written to a private temp file and installed as root through the session's
//! escalation capability. Failures are reported to the caller, who only logs
//! them.

use crate::credentials::Escalation;
use dvr_common::config::PinConfig;
use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write the updated configuration: {0}")]
    Write(#[source] io::Error),

    #[error("Installing {} failed ({status}): {stderr}", .path.display())]
    Install {
        path: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// What `pin` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutcome {
    Disabled,
    /// Every name was already pinned
    Unchanged,
    Updated,
}

/// Pin `package` plus the configured runtime shims
pub async fn pin(
    config: &PinConfig,
    package: &str,
    escalation: &Escalation<'_>,
) -> Result<PinOutcome, RegistrarError> {
    if !config.enabled {
        return Ok(PinOutcome::Disabled);
    }

    let mut names = vec![package.to_string()];
    names.extend(config.runtime_shims.iter().cloned());

    let path = &config.config_file;
    let current = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RegistrarError::Read {
            path: path.clone(),
            source,
        })?;

    let merged = merge_ignore_directive(&current, &config.section, &config.directive, &names);
    if merged == current {
        tracing::info!("{} already pins {}", path.display(), names.join(" "));
        return Ok(PinOutcome::Unchanged);
    }

    let mut staged = tempfile::Builder::new()
        .prefix("dvr-pin-")
        .tempfile()
        .map_err(RegistrarError::Write)?;
    staged
        .write_all(merged.as_bytes())
        .and_then(|_| staged.as_file().sync_all())
        .map_err(RegistrarError::Write)?;
    let staged = staged.into_temp_path();

    let output = escalation
        .command([
            OsStr::new("install"),
            OsStr::new("-m"),
            OsStr::new("644"),
            staged.as_os_str(),
            path.as_os_str(),
        ])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(RegistrarError::Write)?;

    if !output.status.success() {
        return Err(RegistrarError::Install {
            path: path.clone(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    tracing::info!("Pinned {} in {}", names.join(" "), path.display());
    Ok(PinOutcome::Updated)
}

/// Merge `names` into the `directive` line of `[section]`.
///
/// An existing directive keeps its values and gains the missing names; a
/// commented-out one is re-enabled the same way, and an active one wins over
/// a commented one. A trailing `# comment` stays after the values. Without
/// any directive, it goes directly below the section header, and without a
/// header both are appended. Every other line is left untouched.
pub fn merge_ignore_directive(
    content: &str,
    section: &str,
    directive: &str,
    names: &[String],
) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let header = format!("[{}]", section);

    let mut in_section = false;
    let mut header_at = None;
    let mut active_at = None;
    let mut commented_at = None;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            in_section = trimmed == header;
            if in_section && header_at.is_none() {
                header_at = Some(i);
            }
            continue;
        }
        if !in_section {
            continue;
        }
        match parse_directive(trimmed, directive) {
            Some(found) if !found.commented && active_at.is_none() => active_at = Some(i),
            Some(found) if found.commented && commented_at.is_none() => commented_at = Some(i),
            _ => {}
        }
    }

    let mut out = String::with_capacity(content.len() + 64);

    if let Some(at) = active_at.or(commented_at) {
        let (existing, comment) = match parse_directive(lines[at].trim(), directive) {
            Some(found) => (found.values, found.comment),
            None => (Vec::new(), None),
        };
        let merged = merge_names(existing, names);

        for (i, line) in lines.iter().enumerate() {
            if i == at {
                out.push_str(&directive_line(directive, &merged));
                if let Some(comment) = comment {
                    out.push(' ');
                    out.push_str(comment);
                }
                out.push_str(line_ending(line));
            } else {
                out.push_str(line);
            }
        }
        return out;
    }

    let merged = merge_names(Vec::new(), names);

    if let Some(at) = header_at {
        for (i, line) in lines.iter().enumerate() {
            out.push_str(line);
            if i == at {
                if !line.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&directive_line(directive, &merged));
                out.push('\n');
            }
        }
        return out;
    }

    out.push_str(content);
    if !content.is_empty() && !content.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&header);
    out.push('\n');
    out.push_str(&directive_line(directive, &merged));
    out.push('\n');
    out
}

/// A directive line found in the target section
struct Directive<'a> {
    commented: bool,
    values: Vec<&'a str>,
    /// Trailing `# ...` after the values
    comment: Option<&'a str>,
}

/// Parse `line` (already trimmed) if it sets `directive`, commented or not
fn parse_directive<'a>(line: &'a str, directive: &str) -> Option<Directive<'a>> {
    let uncommented = line.trim_start_matches('#');
    let commented = uncommented.len() != line.len();

    let rest = uncommented.trim_start().strip_prefix(directive)?;
    let value = rest.trim_start().strip_prefix('=')?;

    // pacman ignores everything after '#'
    let (value, comment) = match value.find('#') {
        Some(at) => (&value[..at], Some(value[at..].trim_end())),
        None => (value, None),
    };

    Some(Directive {
        commented,
        values: value.split_whitespace().collect(),
        comment,
    })
}

fn merge_names(existing: Vec<&str>, names: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + names.len());
    for name in existing.into_iter().chain(names.iter().map(String::as_str)) {
        if !name.is_empty() && !merged.iter().any(|n| n == name) {
            merged.push(name.to_string());
        }
    }
    merged
}

fn directive_line(directive: &str, names: &[String]) -> String {
    format!("{} = {}", directive, names.join(" "))
}

fn line_ending(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}
