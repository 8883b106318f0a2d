//! File storage.
//!
//! Objects are stored under `{root}/{file system}/{study}/{file}`:
//!
//! - a *file system* is a named partition of the store, chosen per object;
//! - a *study* groups the objects sharing a study identifier;
//! - the file name is derived from the object's unique identifier, so storing
//!   the same object twice lands on the same file.
//!
//! Each level keeps an in-memory index of what is on disk. The index is
//! rebuilt from the directory tree on startup and on every monitor pass.

pub mod file_system;
pub mod manager;
pub mod monitor;
pub mod study;

use std::path::{Path, PathBuf};

use pipeline_common::{FileObject, ObjectKind};
use serde::Serialize;

pub use file_system::FileSystem;
pub use manager::{DEFAULT_FILE_SYSTEM, FileSystemManager, StoredLocation};
pub use monitor::StorageMonitor;
pub use study::{Study, UNKNOWN_STUDY};

/// Prefix of partially written files inside a study.
pub(crate) const TEMP_PREFIX: &str = ".tmp-";

/// A stored copy of an object and the URL it is served at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub file: PathBuf,
    pub url: String,
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
///
/// Leading dots become `_` as well, so the result is never `.`, `..` or a
/// hidden name.
pub fn normalize_name(raw: &str) -> String {
    let mut leading = true;
    raw.trim()
        .chars()
        .map(|c| {
            let keep = if leading && c == '.' {
                false
            } else {
                c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
            };
            leading &= c == '.';
            if keep { c } else { '_' }
        })
        .collect()
}

/// Name under which `object` is kept inside its study.
///
/// Objects with an identifier are stored as `{uid}{ext}`, anything else keeps
/// its (normalized) original name.
pub fn stored_file_name(object: &FileObject) -> String {
    let original = object.file_name();
    let Some(uid) = object.uid().map(normalize_name).filter(|u| !u.is_empty()) else {
        return normalize_name(original);
    };
    let ext = match object.kind() {
        ObjectKind::Dicom => ".dcm".to_string(),
        ObjectKind::Xml => ".xml".to_string(),
        ObjectKind::Zip => ".zip".to_string(),
        ObjectKind::File => Path::new(original)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", normalize_name(e)))
            .unwrap_or_default(),
    };
    if uid.ends_with(&ext) {
        uid
    } else {
        format!("{}{}", uid, ext)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::ObjectMetadata;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("1.2.840.10008"), "1.2.840.10008");
        assert_eq!(normalize_name(" a b/c\\d "), "a_b_c_d");
        assert_eq!(normalize_name("x-y_z"), "x-y_z");
        assert_eq!(normalize_name(".."), "__");
        assert_eq!(normalize_name("."), "_");
        assert_eq!(normalize_name("../etc"), "___etc");
        assert_eq!(normalize_name(".hidden.v2"), "_hidden.v2");
        assert_eq!(normalize_name("a..b"), "a..b");
    }

    #[test]
    fn test_stored_file_name() {
        let dicom = FileObject::new(
            "/q/0000000000000001_img",
            ObjectKind::Dicom,
            ObjectMetadata::default().with_uid("1.2.3"),
        );
        assert_eq!(stored_file_name(&dicom), "1.2.3.dcm");

        let file = FileObject::new(
            "/q/0000000000000002_report.pdf",
            ObjectKind::File,
            ObjectMetadata::default().with_uid("report"),
        );
        assert_eq!(stored_file_name(&file), "report.pdf");

        let anonymous = FileObject::new(
            "/q/0000000000000003_my scan.bin",
            ObjectKind::File,
            ObjectMetadata::default(),
        );
        assert_eq!(stored_file_name(&anonymous), "my_scan.bin");
    }
}
