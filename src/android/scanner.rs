//! Pulls the package, application and app component factory names out of a
//! compiled `AndroidManifest.xml` without building a DOM.
//!
//! The scan is a single forward pass over the parser events. It stops as soon
//! as all three names are known with non-empty values, so the components that
//! follow `<application>` are usually never decoded.
use crate::android::binary_xml::{BinaryXmlError, BinaryXmlParser, XmlEvent, XmlEventSource};
use crate::android::zip::{ApkArchive, ApkZipError};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Component factory LSPatch swaps into patched applications.
pub const PROXY_APP_COMPONENT_FACTORY: &str =
    "org.lsposed.lspatch.metaloader.LSPAppComponentFactoryStub";

/// Result alias for manifest scans.
pub type ScanResult<T> = Result<T, ScanError>;

/// Errors surfaced by the scanning entry points.
#[derive(Debug)]
pub enum ScanError {
    /// The byte source could not be opened or read.
    Io(io::Error),
    /// The document is not well-formed binary XML.
    Decode(BinaryXmlError),
    /// The APK could not be read or does not contain a manifest.
    Archive(ApkZipError),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Io(err) => write!(f, "I/O error: {err}"),
            ScanError::Decode(err) => write!(f, "{err}"),
            ScanError::Archive(err) => write!(f, "APK error: {err}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Io(err) => Some(err),
            ScanError::Decode(err) => Some(err),
            ScanError::Archive(err) => Some(err),
        }
    }
}

impl From<io::Error> for ScanError {
    fn from(value: io::Error) -> Self {
        ScanError::Io(value)
    }
}

impl From<BinaryXmlError> for ScanError {
    fn from(value: BinaryXmlError) -> Self {
        ScanError::Decode(value)
    }
}

impl From<ApkZipError> for ScanError {
    fn from(value: ApkZipError) -> Self {
        ScanError::Archive(value)
    }
}

/// The identifying names declared by a manifest.
///
/// Each field is `None` when the document never declared it. A declared but
/// empty attribute is reported as `Some("")`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestIdentity {
    pub package_name: Option<String>,
    pub application_name: Option<String>,
    pub component_factory_name: Option<String>,
}

impl ManifestIdentity {
    /// True once every field holds a non-empty value.
    pub fn is_complete(&self) -> bool {
        [
            &self.package_name,
            &self.application_name,
            &self.component_factory_name,
        ]
        .iter()
        .all(|field| field.as_deref().is_some_and(|value| !value.is_empty()))
    }

    /// True when the manifest already routes component creation through the
    /// LSPatch proxy factory, i.e. the APK has been patched before.
    pub fn uses_proxy_factory(&self) -> bool {
        self.component_factory_name.as_deref() == Some(PROXY_APP_COMPONENT_FACTORY)
    }

    fn slot_mut(&mut self, field: IdentityField) -> &mut Option<String> {
        match field {
            IdentityField::PackageName => &mut self.package_name,
            IdentityField::ApplicationName => &mut self.application_name,
            IdentityField::ComponentFactoryName => &mut self.component_factory_name,
        }
    }

    /// Record `value` unless the field already holds a non-empty value.
    fn offer(&mut self, field: IdentityField, value: String) -> bool {
        let slot = self.slot_mut(field);
        if slot.as_deref().is_some_and(|current| !current.is_empty()) {
            return false;
        }
        *slot = Some(value);
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IdentityField {
    PackageName,
    ApplicationName,
    ComponentFactoryName,
}

impl IdentityField {
    /// The field governed by attribute `attribute` on tag `tag`, if any.
    fn lookup(tag: &str, attribute: &str) -> Option<Self> {
        match (tag, attribute) {
            ("manifest", "package") => Some(IdentityField::PackageName),
            ("application", "name") => Some(IdentityField::ApplicationName),
            ("application", "appComponentFactory") => Some(IdentityField::ComponentFactoryName),
            _ => None,
        }
    }
}

/// Scan parser events until all three names are known or the document ends.
///
/// Decode faults are returned as-is; whatever was collected before the fault
/// is discarded.
pub fn scan_events<S: XmlEventSource + ?Sized>(source: &mut S) -> Result<ManifestIdentity, BinaryXmlError> {
    let mut identity = ManifestIdentity::default();
    loop {
        match source.next_event()? {
            XmlEvent::StartTag => {
                for index in 0..source.attribute_count() {
                    let field = match (source.tag_name(), source.attribute_name(index)) {
                        (Some(tag), Some(attribute)) => IdentityField::lookup(tag, attribute),
                        _ => None,
                    };
                    if let Some(field) = field {
                        let value = String::from(source.attribute_value(index)?);
                        trace!("{field:?} candidate {value:?}");
                        identity.offer(field, value);
                    }
                    if identity.is_complete() {
                        debug!("All manifest identity fields found, stopping early");
                        return Ok(identity);
                    }
                }
            }
            XmlEvent::EndDocument => return Ok(identity),
            XmlEvent::EndTag | XmlEvent::Text => {}
        }
    }
}

/// Scan an in-memory binary manifest, surfacing decode faults.
pub fn try_scan_manifest_bytes(data: &[u8]) -> ScanResult<ManifestIdentity> {
    debug!("Scanning {} bytes of binary XML", data.len());
    let mut parser = BinaryXmlParser::open(data)?;
    let identity = scan_events(&mut parser)?;
    debug!("Manifest identity: {identity:?}");
    Ok(identity)
}

/// Scan a binary manifest read from `reader`, surfacing decode faults as
/// [`ScanError::Decode`].
pub fn try_scan_manifest<R: Read>(mut reader: R) -> ScanResult<ManifestIdentity> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    try_scan_manifest_bytes(&data)
}

/// Scan the binary manifest stored at `path`, surfacing decode faults.
pub fn try_scan_manifest_file(path: impl AsRef<Path>) -> ScanResult<ManifestIdentity> {
    let file = File::open(path.as_ref())?;
    try_scan_manifest(file)
}

/// Scan the `AndroidManifest.xml` entry of an APK, surfacing decode faults.
///
/// A path that cannot be opened is an [`ScanError::Io`]; a corrupt archive or
/// one without a manifest is an [`ScanError::Archive`].
pub fn try_scan_apk(path: impl AsRef<Path>) -> ScanResult<ManifestIdentity> {
    let file = File::open(path.as_ref())?;
    let mut archive = ApkArchive::from_reader(BufReader::new(file))?;
    let data = archive.read_manifest()?;
    try_scan_manifest_bytes(&data)
}

/// Decode faults become `Ok(None)`; everything else passes through.
fn soften(result: ScanResult<ManifestIdentity>) -> ScanResult<Option<ManifestIdentity>> {
    match result {
        Ok(identity) => Ok(Some(identity)),
        Err(ScanError::Decode(err)) => {
            warn!("Ignoring undecodable manifest: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Scan an in-memory binary manifest.
///
/// Returns `Ok(None)` when the bytes are not a decodable binary XML document.
pub fn scan_manifest_bytes(data: &[u8]) -> ScanResult<Option<ManifestIdentity>> {
    soften(try_scan_manifest_bytes(data))
}

/// Scan a binary manifest read from `reader`.
///
/// Returns `Ok(None)` when the document cannot be decoded, and an
/// [`ScanError::Io`] when reading the stream itself fails.
///
/// # Examples
///
/// ```no_run
///  use axml_identity::scan_manifest;
///  use std::fs::File;
///
///  let file = File::open("AndroidManifest.xml").unwrap();
///  if let Some(identity) = scan_manifest(file).unwrap() {
///      println!("package: {:?}", identity.package_name);
///  }
/// ```
pub fn scan_manifest<R: Read>(reader: R) -> ScanResult<Option<ManifestIdentity>> {
    soften(try_scan_manifest(reader))
}

/// Scan the binary manifest stored at `path`.
///
/// A path that cannot be opened is an [`ScanError::Io`]; an undecodable file
/// yields `Ok(None)`. The file is closed before returning.
pub fn scan_manifest_file(path: impl AsRef<Path>) -> ScanResult<Option<ManifestIdentity>> {
    soften(try_scan_manifest_file(path))
}

/// Scan the manifest inside the APK at `path`.
pub fn scan_apk(path: impl AsRef<Path>) -> ScanResult<Option<ManifestIdentity>> {
    soften(try_scan_apk(path))
}
