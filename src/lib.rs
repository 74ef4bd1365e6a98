//! # axml-identity
//!
//! Reads the package name, application class and app component factory class
//! from a compiled (binary XML) `AndroidManifest.xml`, either on its own or
//! straight out of an APK.
//!
use std::path::Path;

pub mod android;
#[cfg(test)]
mod tests;

pub use crate::android::binary_xml::{
    AttributeValue, BinaryXmlError, BinaryXmlParser, BinaryXmlResult, XmlEvent, XmlEventSource,
};
pub use crate::android::scanner::{
    scan_apk, scan_events, scan_manifest, scan_manifest_bytes, scan_manifest_file, try_scan_apk,
    try_scan_manifest, try_scan_manifest_bytes, try_scan_manifest_file, ManifestIdentity,
    ScanError, ScanResult, PROXY_APP_COMPONENT_FACTORY,
};
pub use crate::android::zip::{ApkArchive, ApkZipError, MANIFEST_ENTRY};

/// Scan `path` as an APK when it looks like one, otherwise as a bare binary manifest.
///
/// # Examples
///
/// ```no_run
///  use axml_identity::scan_path;
///
///  let identity = scan_path("app-release.apk").unwrap();
///  println!("{:?}", identity.and_then(|id| id.package_name));
/// ```
pub fn scan_path(path: impl AsRef<Path>) -> ScanResult<Option<ManifestIdentity>> {
    let path = path.as_ref();
    if is_apk_path(path) {
        scan_apk(path)
    } else {
        scan_manifest_file(path)
    }
}

/// True when `path` carries an `.apk` or `.zip` extension (case-insensitive).
pub fn is_apk_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "apk" | "zip"))
}

#[cfg(test)]
mod path_tests {
    use super::is_apk_path;
    use std::path::Path;

    #[test]
    fn apk_detection_follows_extension() {
        assert!(is_apk_path(Path::new("app-release.apk")));
        assert!(is_apk_path(Path::new("bundle/Base.ZIP")));
        assert!(!is_apk_path(Path::new("AndroidManifest.xml")));
        assert!(!is_apk_path(Path::new("apk")));
    }
}
