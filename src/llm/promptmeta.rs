//! Prompt template version enforcement.
//!
//! Templates declare their schema version in a comment near the top, e.g.
//! `{{/* Version: v1.0.0 */}}`. Only the first 8 KiB are scanned.

use crate::errors::FleetError;
use crate::logger::{self, LogTag};
use std::fs;
use std::path::Path;

const DEFAULT_HEADER_SCAN_LIMIT: usize = 8 * 1024;

/// Validates that prompt templates declare the expected schema version.
#[derive(Debug, Clone, Default)]
pub struct TemplateVersionGuard {
    pub component: String,
    pub expected_version: String,
    pub require_version_header: bool,
    pub strict_mode: bool,
    pub scan_limit: usize,
}

impl TemplateVersionGuard {
    /// Checks the template at `path` and returns the parsed version.
    /// A missing header errors only when `require_version_header`; a
    /// mismatch errors only under strict mode, otherwise it is logged.
    pub fn enforce(&self, path: impl AsRef<Path>) -> Result<String, FleetError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(FleetError::PromptRender("prompt template path is empty".into()));
        }
        let version = match extract_template_version(path, self.scan_limit()) {
            Ok(v) => v,
            Err(err) => {
                if self.require_version_header {
                    return Err(err);
                }
                logger::warn(LogTag::Executor, &err.to_string());
                return Ok(String::new());
            }
        };
        let expected = self.expected_version.trim();
        if !expected.is_empty() && version != expected {
            let msg = format!(
                "{} template {} declared version {} but expected {}",
                self.component_name(),
                path.display(),
                version,
                expected
            );
            if self.strict_mode {
                return Err(FleetError::PromptRender(msg));
            }
            logger::warn(LogTag::Executor, &msg);
        }
        Ok(version)
    }

    fn scan_limit(&self) -> usize {
        if self.scan_limit > 0 {
            self.scan_limit
        } else {
            DEFAULT_HEADER_SCAN_LIMIT
        }
    }

    fn component_name(&self) -> &str {
        if self.component.trim().is_empty() {
            "prompt"
        } else {
            &self.component
        }
    }
}

/// Scans the file head for a `Version: <semver>` header.
pub fn extract_template_version(
    path: impl AsRef<Path>,
    scan_limit: usize,
) -> Result<String, FleetError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|e| {
        FleetError::PromptRender(format!("read prompt template {}: {}", path.display(), e))
    })?;
    let limit = if scan_limit == 0 { DEFAULT_HEADER_SCAN_LIMIT } else { scan_limit };
    let head = &data[..floor_char_boundary(&data, limit.min(data.len()))];
    match scan_version_header(head) {
        Some(version) => Ok(version),
        None => Err(FleetError::PromptRender(format!(
            "prompt template {} missing Version header (expected {{{{/* Version: <semver> */}}}})",
            path.display()
        ))),
    }
}

/// Case-insensitive scan for `version:` followed by a version token.
fn scan_version_header(content: &str) -> Option<String> {
    let lower = content.to_lowercase();
    let idx = lower.find("version:")?;
    let rest = &content[idx + "version:".len()..];
    let token: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_template(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn extracts_version_header() {
        let file = write_template("{{/* Version: v1.2.3 */}}\nprompt body");
        let version = extract_template_version(file.path(), 0).unwrap();
        assert_eq!(version, "v1.2.3");
    }

    #[test]
    fn missing_header_errors_when_required() {
        let file = write_template("no metadata here");
        let guard = TemplateVersionGuard {
            expected_version: "v1.0.0".into(),
            require_version_header: true,
            strict_mode: true,
            ..Default::default()
        };
        let err = guard.enforce(file.path()).unwrap_err();
        assert!(err.to_string().contains("missing Version header"));
    }

    #[test]
    fn mismatch_strict_errors() {
        let file = write_template("{{/* Version: v0.9.0 */}}\nbody");
        let guard = TemplateVersionGuard {
            expected_version: "v1.0.0".into(),
            require_version_header: true,
            strict_mode: true,
            ..Default::default()
        };
        let err = guard.enforce(file.path()).unwrap_err();
        assert!(err.to_string().contains("declared version v0.9.0"));
    }

    #[test]
    fn mismatch_lenient_passes() {
        let file = write_template("{{/* Version: v0.9.0 */}}\nbody");
        let guard = TemplateVersionGuard {
            expected_version: "v1.0.0".into(),
            require_version_header: true,
            strict_mode: false,
            ..Default::default()
        };
        assert_eq!(guard.enforce(file.path()).unwrap(), "v0.9.0");
    }

    #[test]
    fn missing_header_lenient_returns_empty() {
        let file = write_template("plain body");
        let guard = TemplateVersionGuard::default();
        assert_eq!(guard.enforce(file.path()).unwrap(), "");
    }
}
