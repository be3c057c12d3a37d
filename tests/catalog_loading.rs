//! Integration tests for loading site catalogs from disk

use siteplan::runtime::{ConfigError, SiteCatalog};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn loads_catalog_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "tube": {{
                "name": "Tube",
                "get_name": [{{"set": "Tube", "dest": "n"}}, {{"return": "n"}}]
            }},
            "clips": {{
                "compatibility": [{{"match": "=", "v": ["DOMAIN", "clips.test"]}}]
            }}
        }}"#
    )
    .unwrap();

    let catalog = SiteCatalog::load_file(file.path()).unwrap();
    assert_eq!(catalog.len(), 2);
    let tube = catalog.get("tube").unwrap();
    assert_eq!(tube.title(), "Tube");
    assert!(tube.has_plan("get_name"));
    assert_eq!(catalog.get("clips").unwrap().title(), "clips");
}

#[test]
fn invalid_plan_names_file_and_action() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"tube": {{"get_name": [{{"get": "a", "set": "b"}}]}}}}"#).unwrap();

    let err = SiteCatalog::load_file(file.path()).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("parsing site catalog"));
    assert!(message.contains("get_name"));

    let source = err.downcast_ref::<ConfigError>().unwrap();
    assert!(matches!(source, ConfigError::Plan { action, .. } if action == "get_name"));
}

#[test]
fn missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = SiteCatalog::load_file(dir.path().join("absent.json")).unwrap_err();
    assert!(format!("{err:#}").contains("reading site catalog"));
}
