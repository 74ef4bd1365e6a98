
#[cfg(test)]
mod tests {
    use crate::tests::fixtures::Element;
    use crate::{scan_manifest_bytes, ManifestIdentity};

    #[test]
    fn scans_typical_manifest() {
        let doc = Element::new("manifest")
            .android_attr("versionCode", 7i32)
            .attr("package", "com.basic.test")
            .child(Element::new("uses-sdk").android_attr("minSdkVersion", 24i32))
            .child(
                Element::new("application")
                    .android_attr("label", "Test")
                    .android_attr("name", "com.basic.test.App")
                    .android_attr(
                        "appComponentFactory",
                        "androidx.core.app.CoreComponentFactory",
                    ),
            )
            .encode();

        let identity = scan_manifest_bytes(&doc).unwrap().expect("decodable manifest");
        assert_eq!(
            identity,
            ManifestIdentity {
                package_name: Some("com.basic.test".into()),
                application_name: Some("com.basic.test.App".into()),
                component_factory_name: Some("androidx.core.app.CoreComponentFactory".into()),
            }
        );
    }
}
