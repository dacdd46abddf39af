//! Loading device databases from disk.

use mx_core::{CallbackSender, DriverRegistry, FieldValue};
use mx_driver_soft::{register_all, LIST_HEAD_RECORD_NAME};
use rust_mx::database::{load_database, DatabaseError};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    register_all(&mut registry).unwrap();
    registry.verify_all().unwrap();
    registry
}

fn write_database(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn example_database_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/mxserver.db.toml");
    let (notifier, _rx) = CallbackSender::channel(16);
    let records = load_database(&registry(), &path, Some(notifier)).await.unwrap();

    assert!(records.len() > 1);
    let energy = records.get_by_name("energy").unwrap();
    assert_eq!(energy.value_by_name("value").unwrap(), &FieldValue::Double(12.4));
    assert_eq!(
        records
            .get_by_name(LIST_HEAD_RECORD_NAME)
            .unwrap()
            .value_by_name("status")
            .unwrap(),
        &FieldValue::String("ready".to_string())
    );
    assert!(records
        .iter()
        .filter(|record| record.name != LIST_HEAD_RECORD_NAME)
        .all(|record| record.is_open()));
}

#[tokio::test]
async fn missing_file_is_an_io_error() {
    let err = load_database(&registry(), Path::new("/nonexistent/db.toml"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Io { .. }));
}

#[tokio::test]
async fn constructor_failure_names_the_record() {
    let file = write_database(
        r#"
        [[record]]
        name = "big_mca"
        type = "soft_mca"
        [record.fields]
        num_channels = 1000000
        "#,
    );
    let err = load_database(&registry(), file.path(), None).await.unwrap_err();
    match err {
        DatabaseError::Record { record, .. } => assert_eq!(record, "big_mca"),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn unknown_field_is_reported() {
    let file = write_database(
        "[[record]]\nname = \"v\"\ntype = \"long_variable\"\n[record.fields]\nwavelength = 3\n",
    );
    let err = load_database(&registry(), file.path(), None).await.unwrap_err();
    assert!(err.to_string().contains("wavelength"), "{err}");
}
