//! Runtime mode helpers and version resolution.

use std::path::Path;

/// True when the configured mode names the privileged system deployment.
pub fn is_system_mode(mode: &str) -> bool {
    matches!(mode.trim().to_lowercase().as_str(), "system" | "sys")
}

/// Map the internal mode string to the short form shown to users.
pub fn to_external_mode(mode: &str) -> &'static str {
    if is_system_mode(mode) {
        "sys"
    } else {
        "user"
    }
}

/// Resolve the runtime version: `$CLI_GATEWAY_VERSION` wins, then the
/// `.runtime-version` file next to the working directory, then "unknown".
pub fn resolve_version(version_file: &Path) -> String {
    if let Ok(v) = std::env::var("CLI_GATEWAY_VERSION") {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return v;
        }
    }
    match std::fs::read_to_string(version_file) {
        Ok(raw) => {
            let v = raw.trim().to_string();
            if v.is_empty() {
                "unknown".to_string()
            } else {
                v
            }
        }
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_mode_accepts_both_spellings() {
        assert!(is_system_mode("system"));
        assert!(is_system_mode("sys"));
        assert!(is_system_mode(" SYSTEM "));
        assert!(!is_system_mode("session"));
        assert!(!is_system_mode(""));
    }

    #[test]
    fn external_mode_maps_to_short_form() {
        assert_eq!(to_external_mode("system"), "sys");
        assert_eq!(to_external_mode("session"), "user");
    }

    #[test]
    fn version_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".runtime-version");
        std::fs::write(&path, "0.3.1\n").unwrap();
        assert_eq!(resolve_version(&path), "0.3.1");
    }

    #[test]
    fn missing_version_file_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_version(&dir.path().join("nope")), "unknown");
    }
}
