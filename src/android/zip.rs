use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::Path;
use zip::read::ZipArchive;

/// Location of the compiled manifest inside an APK.
pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

/// Upper bound on the buffer reserved up front for an entry. The declared
/// size comes from the central directory and cannot be trusted.
const MAX_PREALLOCATION: u64 = 1 << 20;

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the APK reading helpers.
#[derive(Debug)]
pub enum ApkZipError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    MissingEntry(String),
}

impl std::fmt::Display for ApkZipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApkZipError::Io(err) => write!(f, "I/O error: {err}"),
            ApkZipError::Zip(err) => write!(f, "ZIP error: {err}"),
            ApkZipError::MissingEntry(name) => write!(f, "APK has no entry named {name}"),
        }
    }
}

impl std::error::Error for ApkZipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApkZipError::Io(err) => Some(err),
            ApkZipError::Zip(err) => Some(err),
            ApkZipError::MissingEntry(_) => None,
        }
    }
}

impl From<io::Error> for ApkZipError {
    fn from(value: io::Error) -> Self {
        ApkZipError::Io(value)
    }
}

impl From<zip::result::ZipError> for ApkZipError {
    fn from(value: zip::result::ZipError) -> Self {
        ApkZipError::Zip(value)
    }
}

/// Read-only view over an APK (ZIP) file.
///
/// Entries are decompressed on demand, so only the entries you ask for are read.
pub struct ApkArchive<R = BufReader<File>> {
    archive: ZipArchive<R>,
}

impl ApkArchive {
    /// Open an APK from disk.
    pub fn open(path: impl AsRef<Path>) -> ApkZipResult<Self> {
        let file = File::open(path.as_ref())?;
        ApkArchive::from_reader(BufReader::new(file))
    }
}

impl<R: Read + Seek> ApkArchive<R> {
    pub fn from_reader(reader: R) -> ApkZipResult<Self> {
        Ok(ApkArchive {
            archive: ZipArchive::new(reader)?,
        })
    }

    /// Names of all file entries, skipping directory records.
    #[cfg(test)]
    pub(crate) fn entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.archive.index_for_name(name).is_some()
    }

    /// Decompress a single entry into memory.
    pub fn read_entry(&mut self, name: &str) -> ApkZipResult<Vec<u8>> {
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ApkZipError::MissingEntry(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let mut data = Vec::with_capacity(entry.size().min(MAX_PREALLOCATION) as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }

    /// The raw binary XML bytes of `AndroidManifest.xml`.
    pub fn read_manifest(&mut self) -> ApkZipResult<Vec<u8>> {
        self.read_entry(MANIFEST_ENTRY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{build_apk, build_apk_with_declared_size};
    use crate::{scan_apk, try_scan_apk, ScanError};
    use std::io::Cursor;

    #[test]
    fn reads_entries_from_memory() {
        let apk = build_apk(&[
            ("classes.dex", &b"dex\n035\0"[..]),
            (MANIFEST_ENTRY, &b"manifest bytes"[..]),
            ("res/layout/main.xml", &b"layout"[..]),
        ]);
        let mut archive = ApkArchive::from_reader(Cursor::new(apk)).expect("open apk");
        assert_eq!(
            archive.entry_names(),
            vec!["AndroidManifest.xml", "classes.dex", "res/layout/main.xml"]
        );
        assert!(archive.contains("classes.dex"));
        assert!(!archive.contains("resources.arsc"));
        assert_eq!(archive.read_manifest().unwrap(), b"manifest bytes");
    }

    #[test]
    fn missing_entries_are_reported_by_name() {
        let apk = build_apk(&[("classes.dex", &b"dex\n035\0"[..])]);
        let mut archive = ApkArchive::from_reader(Cursor::new(apk)).expect("open apk");
        match archive.read_manifest() {
            Err(ApkZipError::MissingEntry(name)) => assert_eq!(name, MANIFEST_ENTRY),
            other => panic!("unexpected result: {:?}", other.map(|data| data.len())),
        }
    }

    #[test]
    fn oversized_declared_entry_is_not_preallocated() {
        let apk = build_apk_with_declared_size(MANIFEST_ENTRY, 1 << 46);
        let mut archive = ApkArchive::from_reader(Cursor::new(apk.clone())).expect("open apk");
        match archive.read_manifest() {
            Ok(data) => assert!(data.is_empty()),
            Err(ApkZipError::Zip(_)) | Err(ApkZipError::Io(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }

        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("oversized.apk");
        std::fs::write(&path, &apk).expect("write apk");
        assert!(matches!(
            try_scan_apk(&path),
            Err(ScanError::Decode(_)) | Err(ScanError::Archive(_))
        ));
        assert!(!matches!(scan_apk(&path), Ok(Some(_))));
    }

    #[test]
    fn rejects_non_zip_input() {
        let result = ApkArchive::from_reader(Cursor::new(b"definitely not a zip".to_vec()));
        assert!(matches!(result, Err(ApkZipError::Zip(_))));
    }
}
