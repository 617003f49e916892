//! Pure path normalization.
//!
//! `resolve()` on the virtual filesystem is exactly this function: it never
//! touches storage, it only rewrites strings.

use crate::{FsError, FsResult};

/// Normalizes `path` into an absolute, clean form.
///
/// - `~` and `~/...` expand against `home` (or `/` when no home is set)
/// - relative paths are anchored at `/`
/// - `.` segments and duplicate slashes are dropped
/// - `..` pops one segment, never escaping the root
pub fn normalize_path(path: &str, home: Option<&str>) -> FsResult<String> {
    if path.is_empty() {
        return Err(FsError::BadRequest("missing path".into()));
    }

    let home = home.unwrap_or("/");
    let expanded = if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{}/{}", home.trim_end_matches('/'), rest)
    } else {
        path.to_string()
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in expanded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchors_relative_paths() {
        assert_eq!(normalize_path("etc/hosts", None).unwrap(), "/etc/hosts");
        assert_eq!(normalize_path("/", None).unwrap(), "/");
    }

    #[test]
    fn expands_home() {
        assert_eq!(normalize_path("~", Some("/home")).unwrap(), "/home");
        assert_eq!(
            normalize_path("~/notes.txt", Some("/home")).unwrap(),
            "/home/notes.txt"
        );
        assert_eq!(normalize_path("~/x", None).unwrap(), "/x");
    }

    #[test]
    fn cleans_segments() {
        assert_eq!(normalize_path("//var//log/", None).unwrap(), "/var/log");
        assert_eq!(normalize_path("/tmp/./a/../b", None).unwrap(), "/tmp/b");
        assert_eq!(normalize_path("/../..", None).unwrap(), "/");
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            normalize_path("", None),
            Err(FsError::BadRequest(_))
        ));
    }
}
