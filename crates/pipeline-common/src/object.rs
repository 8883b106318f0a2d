//! Objects flowing through a pipeline.
//!
//! A [`FileObject`] is a file on disk plus its detected [`ObjectKind`] and the
//! metadata extracted by an [`ObjectInspector`]. Parsing DICOM tags is left to
//! inspectors supplied by the embedding application.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::{PipelineError, Result};

/// Offset of the `DICM` magic in a DICOM Part 10 file.
const DICOM_PREAMBLE: usize = 128;
const DICOM_MAGIC: &[u8; 4] = b"DICM";
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Kind of payload held by a file object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Dicom,
    Xml,
    Zip,
    File,
}

impl ObjectKind {
    /// Detect the kind of `path` by sniffing its leading bytes.
    pub async fn detect(path: &Path) -> Result<Self> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| PipelineError::io_path("opening object", path, e))?;
        let mut head = vec![0u8; DICOM_PREAMBLE + DICOM_MAGIC.len()];
        let mut filled = 0;
        while filled < head.len() {
            let n = file
                .read(&mut head[filled..])
                .await
                .map_err(|e| PipelineError::io_path("reading object", path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        head.truncate(filled);
        Ok(Self::from_header(&head))
    }

    /// Classify a file from its first bytes.
    pub fn from_header(head: &[u8]) -> Self {
        if head.len() >= DICOM_PREAMBLE + 4 && &head[DICOM_PREAMBLE..DICOM_PREAMBLE + 4] == DICOM_MAGIC
        {
            return ObjectKind::Dicom;
        }
        if head.starts_with(ZIP_MAGIC) {
            return ObjectKind::Zip;
        }
        let text = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
        if text
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'<')
        {
            return ObjectKind::Xml;
        }
        ObjectKind::File
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Dicom => write!(f, "DICOM"),
            ObjectKind::Xml => write!(f, "XML"),
            ObjectKind::Zip => write!(f, "ZIP"),
            ObjectKind::File => write!(f, "FILE"),
        }
    }
}

/// Identifiers and named attributes extracted from an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub uid: Option<String>,
    pub study_uid: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_study_uid(mut self, study_uid: impl Into<String>) -> Self {
        self.study_uid = Some(study_uid.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Extracts metadata from an object on disk.
#[async_trait]
pub trait ObjectInspector: Send + Sync {
    async fn inspect(&self, path: &Path, kind: ObjectKind) -> Result<ObjectMetadata>;
}

/// Inspector that understands XML root-element attributes.
///
/// For XML objects the root attributes become metadata attributes, with the
/// uid taken from `uid` or `SOPInstanceUID` and the study from `studyUID` or
/// `StudyInstanceUID`. Any object without a uid falls back to its file stem.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicInspector;

#[async_trait]
impl ObjectInspector for BasicInspector {
    async fn inspect(&self, path: &Path, kind: ObjectKind) -> Result<ObjectMetadata> {
        let mut metadata = ObjectMetadata::default();
        if kind == ObjectKind::Xml {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| PipelineError::io_path("reading object", path, e))?;
            metadata.attributes = root_attributes(&text)?;
            metadata.uid = first_of(&metadata.attributes, &["uid", "SOPInstanceUID"]);
            metadata.study_uid = first_of(&metadata.attributes, &["studyUID", "StudyInstanceUID"]);
        }
        if metadata.uid.is_none() {
            metadata.uid = object_name(path)
                .and_then(|n| Path::new(n).file_stem())
                .and_then(|s| s.to_str())
                .map(str::to_string);
        }
        Ok(metadata)
    }
}

fn first_of(attributes: &BTreeMap<String, String>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| attributes.get(*n))
        .filter(|v| !v.trim().is_empty())
        .cloned()
}

fn root_attributes(text: &str) -> Result<BTreeMap<String, String>> {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let mut attributes = BTreeMap::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| PipelineError::Object(e.to_string()))?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| PipelineError::Object(e.to_string()))?
                        .into_owned();
                    attributes.insert(key, value);
                }
                return Ok(attributes);
            }
            Ok(Event::Eof) => return Ok(BTreeMap::new()),
            Ok(_) => {}
            Err(e) => return Err(PipelineError::Object(format!("invalid XML: {e}"))),
        }
    }
}

/// Original file name of `path`, looking through a queue entry prefix.
fn object_name(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    Some(crate::queue::QueueManager::embedded_filename(name).unwrap_or(name))
}

/// A file on disk moving through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileObject {
    path: PathBuf,
    kind: ObjectKind,
    metadata: ObjectMetadata,
}

impl FileObject {
    pub fn new(path: impl Into<PathBuf>, kind: ObjectKind, metadata: ObjectMetadata) -> Self {
        Self {
            path: path.into(),
            kind,
            metadata,
        }
    }

    /// Detect the kind of `path` and extract its metadata.
    pub async fn open(path: impl Into<PathBuf>, inspector: &dyn ObjectInspector) -> Result<Self> {
        let path = path.into();
        let kind = ObjectKind::detect(&path).await?;
        let metadata = inspector.inspect(&path, kind).await?;
        Ok(Self {
            path,
            kind,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn metadata(&self) -> &ObjectMetadata {
        &self.metadata
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    pub fn study_uid(&self) -> Option<&str> {
        self.metadata.study_uid.as_deref()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.metadata.attributes.get(name).map(String::as_str)
    }

    /// Original name of the object: the on-disk name with any queue prefix removed.
    pub fn file_name(&self) -> &str {
        object_name(&self.path).unwrap_or_default()
    }

    /// The same object relocated to `path` (e.g. after being stored).
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: self.kind,
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kind_from_header() {
        let mut dicom = vec![0u8; 128];
        dicom.extend_from_slice(b"DICM");
        assert_eq!(ObjectKind::from_header(&dicom), ObjectKind::Dicom);
        assert_eq!(ObjectKind::from_header(b"PK\x03\x04rest"), ObjectKind::Zip);
        assert_eq!(ObjectKind::from_header(b"  \n<root/>"), ObjectKind::Xml);
        assert_eq!(ObjectKind::from_header(b"\xEF\xBB\xBF<root/>"), ObjectKind::Xml);
        assert_eq!(ObjectKind::from_header(b"plain text"), ObjectKind::File);
        assert_eq!(ObjectKind::from_header(b""), ObjectKind::File);
    }

    #[tokio::test]
    async fn test_open_xml_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0000000000000007_report.xml");
        tokio::fs::write(
            &path,
            r#"<?xml version="1.0"?><report uid="1.2.3" StudyInstanceUID="9.8" source="ct&amp;mr"/>"#,
        )
        .await
        .unwrap();

        let object = FileObject::open(&path, &BasicInspector).await.unwrap();
        assert_eq!(object.kind(), ObjectKind::Xml);
        assert_eq!(object.uid(), Some("1.2.3"));
        assert_eq!(object.study_uid(), Some("9.8"));
        assert_eq!(object.attribute("source"), Some("ct&mr"));
        assert_eq!(object.file_name(), "report.xml");
    }

    #[tokio::test]
    async fn test_uid_falls_back_to_file_stem() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image-42.bin");
        tokio::fs::write(&path, b"binary").await.unwrap();

        let object = FileObject::open(&path, &BasicInspector).await.unwrap();
        assert_eq!(object.kind(), ObjectKind::File);
        assert_eq!(object.uid(), Some("image-42"));
        assert_eq!(object.study_uid(), None);

        let moved = object.with_path(dir.path().join("elsewhere.bin"));
        assert_eq!(moved.uid(), Some("image-42"));
        assert_eq!(moved.file_name(), "elsewhere.bin");
    }
}
