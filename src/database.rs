//! Device database loading.
//!
//! A database is a TOML file with one `[[record]]` table per record:
//!
//! ```toml
//! [[record]]
//! name = "m1"
//! type = "soft_motor"
//! label = "Sample X"
//! precision = 3
//!
//! [record.fields]
//! speed = 2000.0
//! position = 0.0
//! ```
//!
//! Records are created in file order after the list head, their field
//! values applied, and then each is constructed and opened. Any failure
//! aborts the load and names the record involved.

use mx_core::{CallbackSender, ConstructContext, DriverRegistry, FieldValue, MxError, RecordList};
use mx_driver_soft::LIST_HEAD_RECORD_NAME;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Fields a database may not set.
const PROTECTED_FIELDS: [&str; 4] = ["name", "mx_superclass", "mx_class", "mx_type"];

/// Database loading errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The file could not be read.
    #[error("Cannot read database {path}: {source}")]
    Io {
        /// Database path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML or has the wrong shape.
    #[error("Cannot parse database: {0}")]
    Parse(#[from] toml::de::Error),

    /// The registry has no list-head driver.
    #[error("No list head driver is registered")]
    NoListHead,

    /// A record names a driver that is not registered.
    #[error("Record '{record}': unknown driver type '{driver}'")]
    UnknownDriver {
        /// Record name.
        record: String,
        /// Driver name.
        driver: String,
    },

    /// Two records share a name.
    #[error("Record '{0}' is defined more than once")]
    Duplicate(String),

    /// A field value in the file cannot be used.
    #[error("Record '{record}', field '{field}': {reason}")]
    Field {
        /// Record name.
        record: String,
        /// Field name.
        field: String,
        /// What is wrong.
        reason: String,
    },

    /// Creating, constructing or opening a record failed.
    #[error("Record '{record}': {source}")]
    Record {
        /// Record name.
        record: String,
        /// Underlying error.
        source: MxError,
    },
}

/// The file as written.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseFile {
    /// Records in file order.
    #[serde(default, rename = "record")]
    pub records: Vec<RecordEntry>,
}

/// One `[[record]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordEntry {
    /// Record name.
    pub name: String,
    /// Driver name.
    #[serde(rename = "type")]
    pub driver: String,
    /// Human-readable label.
    pub label: Option<String>,
    /// ACL description.
    pub acl_description: Option<String>,
    /// Display precision.
    pub precision: Option<i64>,
    /// Initial field values.
    #[serde(default)]
    pub fields: toml::Table,
}

impl DatabaseFile {
    /// Parse database text.
    pub fn parse(text: &str) -> Result<Self, DatabaseError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a database file.
    pub fn read(path: &Path) -> Result<Self, DatabaseError> {
        let text = std::fs::read_to_string(path).map_err(|source| DatabaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }
}

/// Load the database at `path`. See [`build_records`].
pub async fn load_database(
    registry: &DriverRegistry,
    path: &Path,
    notifier: Option<CallbackSender>,
) -> Result<RecordList, DatabaseError> {
    let file = DatabaseFile::read(path)?;
    let records = build_records(registry, &file, notifier).await?;
    info!(path = %path.display(), records = records.len(), "Database loaded");
    Ok(records)
}

/// Create, construct and open every record in `file`.
///
/// `notifier` is handed to every constructor so drivers can post
/// value-changed messages.
pub async fn build_records(
    registry: &DriverRegistry,
    file: &DatabaseFile,
    notifier: Option<CallbackSender>,
) -> Result<RecordList, DatabaseError> {
    let head = registry.list_head().ok_or(DatabaseError::NoListHead)?.clone();
    let mut list = RecordList::new(head, LIST_HEAD_RECORD_NAME).map_err(|source| {
        DatabaseError::Record {
            record: LIST_HEAD_RECORD_NAME.to_string(),
            source,
        }
    })?;

    for entry in &file.records {
        let record_err = |source| DatabaseError::Record {
            record: entry.name.clone(),
            source,
        };
        if list.find(&entry.name).is_some() {
            return Err(DatabaseError::Duplicate(entry.name.clone()));
        }
        let driver = registry
            .lookup_type_by_name(&entry.driver)
            .ok_or_else(|| DatabaseError::UnknownDriver {
                record: entry.name.clone(),
                driver: entry.driver.clone(),
            })?
            .clone();

        let id = list.create_record(driver, &entry.name).map_err(record_err)?;
        let record = list.get_mut(id).map_err(record_err)?;

        let standard = [
            ("label", entry.label.clone().map(FieldValue::String)),
            ("acl_description", entry.acl_description.clone().map(FieldValue::String)),
            ("precision", entry.precision.map(FieldValue::Long)),
        ];
        let assignments = standard
            .into_iter()
            .filter_map(|(field, value)| value.map(|v| (field.to_string(), v)))
            .map(Ok::<_, DatabaseError>)
            .chain(entry.fields.iter().map(|(field, value)| {
                toml_to_value(value)
                    .map(|v| (field.clone(), v))
                    .map_err(|reason| DatabaseError::Field {
                        record: entry.name.clone(),
                        field: field.clone(),
                        reason,
                    })
            }));

        for assignment in assignments {
            let (field, value) = assignment?;
            if PROTECTED_FIELDS.contains(&field.as_str()) {
                return Err(DatabaseError::Field {
                    record: entry.name.clone(),
                    field,
                    reason: "set by the server".to_string(),
                });
            }
            record
                .set_value_by_name(&field, value)
                .map_err(|err| DatabaseError::Field {
                    record: entry.name.clone(),
                    field: field.clone(),
                    reason: err.to_string(),
                })?;
        }

        record
            .construct(&ConstructContext {
                record_id: Some(id),
                notifier: notifier.clone(),
            })
            .map_err(record_err)?;
        record.open().await.map_err(record_err)?;
        debug!(record = %entry.name, driver = %entry.driver, "Record ready");
    }

    fill_list_head(&mut list)?;
    Ok(list)
}

/// Publish database-wide values on the list head record.
fn fill_list_head(list: &mut RecordList) -> Result<(), DatabaseError> {
    let num_records = list.len() as i64;
    let head_err = |source| DatabaseError::Record {
        record: LIST_HEAD_RECORD_NAME.to_string(),
        source,
    };
    let head = list
        .list_head()
        .ok_or_else(|| head_err(MxError::NotFound("list head".to_string())))?;
    let head = list.get_mut(head).map_err(head_err)?;
    head.set_value_by_name(
        "mx_version",
        FieldValue::String(env!("CARGO_PKG_VERSION").to_string()),
    )
    .map_err(head_err)?;
    head.set_value_by_name("num_records", FieldValue::Long(num_records))
        .map_err(head_err)?;
    head.set_value_by_name("status", FieldValue::String("ready".to_string()))
        .map_err(head_err)?;
    Ok(())
}

/// Convert a TOML value into the nearest field value; the record then
/// converts it to the field's exact type.
fn toml_to_value(value: &toml::Value) -> Result<FieldValue, String> {
    match value {
        toml::Value::Boolean(v) => Ok(FieldValue::Bool(*v)),
        toml::Value::Integer(v) => Ok(FieldValue::Long(*v)),
        toml::Value::Float(v) => Ok(FieldValue::Double(*v)),
        toml::Value::String(v) => Ok(FieldValue::String(v.clone())),
        toml::Value::Array(items) => {
            if items.iter().all(|item| item.is_integer()) {
                Ok(FieldValue::LongArray(
                    items.iter().filter_map(toml::Value::as_integer).collect(),
                ))
            } else if items.iter().all(|item| item.is_integer() || item.is_float()) {
                Ok(FieldValue::DoubleArray(
                    items
                        .iter()
                        .filter_map(|item| item.as_float().or_else(|| item.as_integer().map(|i| i as f64)))
                        .collect(),
                ))
            } else {
                Err("arrays must hold only numbers".to_string())
            }
        }
        other => Err(format!("unsupported value type {}", other.type_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_driver_soft::register_all;
    use tracing_test::traced_test;

    fn registry() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        register_all(&mut registry).unwrap();
        registry
    }

    #[tokio::test]
    async fn builds_records_in_file_order() {
        let file = DatabaseFile::parse(
            r#"
            [[record]]
            name = "gain"
            type = "double_variable"
            label = "Amplifier gain"
            [record.fields]
            value = 2

            [[record]]
            name = "m1"
            type = "soft_motor"
            precision = 4
            "#,
        )
        .unwrap();
        let list = build_records(&registry(), &file, None).await.unwrap();

        let names: Vec<&str> = list.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, [LIST_HEAD_RECORD_NAME, "gain", "m1"]);

        let gain = list.get_by_name("gain").unwrap();
        assert_eq!(gain.value_by_name("value").unwrap(), &FieldValue::Double(2.0));
        assert_eq!(gain.label(), "Amplifier gain");
        assert!(list.get_by_name("m1").unwrap().is_open());

        let head = list.get_by_name(LIST_HEAD_RECORD_NAME).unwrap();
        assert_eq!(head.value_by_name("num_records").unwrap(), &FieldValue::Long(3));
    }

    #[tokio::test]
    async fn unknown_driver_names_the_record() {
        let file = DatabaseFile::parse("[[record]]\nname = \"x\"\ntype = \"warp_drive\"\n").unwrap();
        let err = build_records(&registry(), &file, None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::UnknownDriver { ref record, .. } if record == "x"));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let text = "[[record]]\nname = \"a\"\ntype = \"long_variable\"\n\
                    [[record]]\nname = \"a\"\ntype = \"long_variable\"\n";
        let file = DatabaseFile::parse(text).unwrap();
        let err = build_records(&registry(), &file, None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Duplicate(name) if name == "a"));
    }

    #[tokio::test]
    async fn bad_field_values_are_reported() {
        let text = "[[record]]\nname = \"t\"\ntype = \"long_variable\"\n[record.fields]\nvalue = \"ten\"\n";
        let file = DatabaseFile::parse(text).unwrap();
        let err = build_records(&registry(), &file, None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Field { ref field, .. } if field == "value"));

        let text = "[[record]]\nname = \"t\"\ntype = \"long_variable\"\n[record.fields]\nmx_type = 3\n";
        let file = DatabaseFile::parse(text).unwrap();
        let err = build_records(&registry(), &file, None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Field { ref field, .. } if field == "mx_type"));
    }

    #[tokio::test]
    #[traced_test]
    async fn each_record_is_logged_when_ready() {
        let file = DatabaseFile::parse("[[record]]\nname = \"title\"\ntype = \"string_variable\"\n").unwrap();
        build_records(&registry(), &file, None).await.unwrap();
        assert!(logs_contain("Record ready"));
        assert!(logs_contain("string_variable"));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let err = DatabaseFile::parse("[[record]]\nname = \"a\"\ntype = \"x\"\ncolour = 1\n");
        assert!(matches!(err, Err(DatabaseError::Parse(_))));
    }

    #[test]
    fn toml_arrays_become_numeric_arrays() {
        use toml::Value;

        let ints = Value::Array(vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(toml_to_value(&ints), Ok(FieldValue::LongArray(vec![1, 2])));
        let mixed = Value::Array(vec![Value::Integer(1), Value::Float(2.5)]);
        assert_eq!(toml_to_value(&mixed), Ok(FieldValue::DoubleArray(vec![1.0, 2.5])));
        let bad = Value::Array(vec![Value::String("a".to_string())]);
        assert!(toml_to_value(&bad).is_err());
    }
}
