//! Android container formats: binary XML and APK archives.
pub mod binary_xml;
pub mod scanner;
pub mod zip;
