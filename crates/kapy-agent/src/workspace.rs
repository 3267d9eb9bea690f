//! Session workspace directory management.
//!
//! Every session owns a `sess_<id>` directory with a fixed tree:
//! `user/` for uploads, `ai/` for agent outputs, `system/temp/` for
//! scratch space.

use std::path::{Path, PathBuf};

use crate::error::{AgentError, Result};

/// Create the standard workspace tree under `work_dir`.
pub fn init_workspace(work_dir: &Path) -> Result<()> {
    for sub in ["user", "ai", "system/temp"] {
        std::fs::create_dir_all(work_dir.join(sub))
            .map_err(|e| AgentError::Workspace(format!("{}: {e}", work_dir.display())))?;
    }
    Ok(())
}

/// Upload directory for a session workspace.
pub fn user_upload_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("user")
}

/// Output directory for a session workspace.
pub fn ai_output_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("ai")
}

/// Pick a non-colliding destination for `filename` inside `dir`
/// (`name.ext`, `name_1.ext`, `name_2.ext`, …).
pub fn safe_filename(dir: &Path, filename: &str) -> PathBuf {
    // Strip any path components a hostile filename might carry.
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let candidate = dir.join(&base);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (base.clone(), None),
    };
    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 exhausted while picking a filename")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_standard_tree() {
        let dir = tempfile::tempdir().unwrap();
        init_workspace(dir.path()).unwrap();
        assert!(dir.path().join("user").is_dir());
        assert!(dir.path().join("ai").is_dir());
        assert!(dir.path().join("system/temp").is_dir());
    }

    #[test]
    fn safe_filename_renames_on_conflict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), "x").unwrap();
        std::fs::write(dir.path().join("report_1.pdf"), "x").unwrap();
        let picked = safe_filename(dir.path(), "report.pdf");
        assert_eq!(picked.file_name().unwrap(), "report_2.pdf");
    }

    #[test]
    fn safe_filename_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let picked = safe_filename(dir.path(), "../../etc/passwd");
        assert_eq!(picked.file_name().unwrap(), "passwd");
        assert!(picked.starts_with(dir.path()));
    }

    #[test]
    fn safe_filename_handles_extensionless_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "x").unwrap();
        let picked = safe_filename(dir.path(), "Makefile");
        assert_eq!(picked.file_name().unwrap(), "Makefile_1");
    }
}
