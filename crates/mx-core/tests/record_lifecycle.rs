//! End-to-end record lifecycle through the public API: register a driver,
//! build a record list, construct and open records, give them network
//! handles and access fields through GET/PUT dispatch.

use async_trait::async_trait;
use mx_core::{
    get_field_value, put_field_value, standard_fields, unknown_label, ClassId, ConstructContext,
    Constructible, DeviceComponents, DriverEntry, DriverRegistry, FieldDefault, FieldFlags,
    FieldProcessable, FieldType, FieldValue, HandleTable, MxError, MxResult, Openable, ProcessOp,
    Record, RecordId, RecordList, StorageLocation, SuperclassId,
};
use mx_core::limits::{handle_blocks_for_records, RECORD_HANDLE_BLOCK_SIZE};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const LABEL_TEMPERATURE: i64 = 10;
const LABEL_SETPOINT: i64 = 11;

/// A heater whose temperature jumps to the setpoint on every read.
#[derive(Default)]
struct Heater {
    opened: AtomicBool,
    closed: AtomicBool,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
}

#[async_trait]
impl FieldProcessable for Heater {
    fn processed_labels(&self) -> &'static [i64] {
        &[LABEL_TEMPERATURE, LABEL_SETPOINT]
    }

    async fn process(&self, record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
        match (record.fields[ordinal].label_value, op) {
            (LABEL_TEMPERATURE, ProcessOp::Get) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                if self.fail_reads.load(Ordering::SeqCst) {
                    return Err(MxError::DeviceIo("thermocouple open".to_string()));
                }
                let setpoint = record.f64_or("setpoint", 0.0);
                record.set_value(ordinal, FieldValue::Double(setpoint))
            }
            (LABEL_SETPOINT, ProcessOp::Put) => Ok(()),
            _ => unknown_label(record, ordinal, op),
        }
    }
}

#[async_trait]
impl Openable for Heater {
    async fn open(&self, _record: &mut Record) -> MxResult<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _record: &mut Record) -> MxResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct HeaterDriver(Arc<Heater>);

impl Constructible for HeaterDriver {
    fn create(&self, _record: &Record, _ctx: &ConstructContext) -> MxResult<DeviceComponents> {
        Ok(DeviceComponents::new()
            .with_processor(self.0.clone())
            .with_openable(self.0.clone()))
    }
}

fn heater_fields() -> Vec<FieldDefault> {
    let mut fields = standard_fields();
    fields.push(
        FieldDefault::new("temperature", FieldType::Double, StorageLocation::type_struct(0x00))
            .label(LABEL_TEMPERATURE)
            .flags(FieldFlags::READ_ONLY | FieldFlags::POLL),
    );
    fields.push(
        FieldDefault::new("setpoint", FieldType::Double, StorageLocation::type_struct(0x08))
            .label(LABEL_SETPOINT),
    );
    fields.push(FieldDefault::new("notes", FieldType::String, StorageLocation::type_struct(0x10)).string(16));
    fields
}

fn setup() -> (DriverRegistry, RecordList, Arc<Heater>) {
    let heater = Arc::new(Heater::default());
    let mut registry = DriverRegistry::new();
    registry
        .register_table(vec![
            DriverEntry::new("list_head", SuperclassId::LIST_HEAD, ClassId::LIST_HEAD, 1)
                .fields(standard_fields()),
            DriverEntry::new("heater", SuperclassId::DEVICE, ClassId::ANALOG_OUTPUT, 20)
                .constructor(Arc::new(HeaterDriver(heater.clone())))
                .fields(heater_fields()),
            DriverEntry::sentinel(),
        ])
        .unwrap();
    registry.verify_all().unwrap();
    let list = RecordList::new(registry.list_head().unwrap().clone(), "mx_database").unwrap();
    (registry, list, heater)
}

async fn add_heater(registry: &DriverRegistry, list: &mut RecordList, name: &str) -> RecordId {
    let driver = registry.lookup_type_by_name("heater").unwrap().clone();
    let id = list.create_record(driver, name).unwrap();
    let record = list.get_mut(id).unwrap();
    record
        .set_value_by_name("setpoint", FieldValue::Double(21.5))
        .unwrap();
    let ctx = ConstructContext {
        record_id: Some(id),
        notifier: None,
    };
    record.construct(&ctx).unwrap();
    record.open().await.unwrap();
    id
}

#[tokio::test]
async fn database_values_reach_the_device_on_first_read() {
    let (registry, mut list, heater) = setup();
    let id = add_heater(&registry, &mut list, "oven").await;
    assert!(heater.opened.load(Ordering::SeqCst));

    let record = list.get_mut(id).unwrap();
    let ordinal = record.field_index("temperature").unwrap();
    assert_eq!(
        get_field_value(record, ordinal).await.unwrap(),
        FieldValue::Double(21.5)
    );
}

#[tokio::test]
async fn put_then_get_goes_through_the_device() {
    let (registry, mut list, heater) = setup();
    let id = add_heater(&registry, &mut list, "oven").await;
    let record = list.get_mut(id).unwrap();

    let setpoint = record.field_index("setpoint").unwrap();
    put_field_value(record, setpoint, FieldValue::Long(80))
        .await
        .unwrap();
    let temperature = record.field_index("temperature").unwrap();
    assert_eq!(
        get_field_value(record, temperature).await.unwrap(),
        FieldValue::Double(80.0)
    );
    assert_eq!(heater.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_read_returns_the_error_not_a_stale_value() {
    let (registry, mut list, heater) = setup();
    let id = add_heater(&registry, &mut list, "oven").await;
    let record = list.get_mut(id).unwrap();
    let temperature = record.field_index("temperature").unwrap();
    get_field_value(record, temperature).await.unwrap();

    heater.fail_reads.store(true, Ordering::SeqCst);
    let err = get_field_value(record, temperature).await.unwrap_err();
    assert!(matches!(err, MxError::DeviceIo(_)));
}

#[tokio::test]
async fn read_only_and_oversized_puts_are_refused() {
    let (registry, mut list, _) = setup();
    let id = add_heater(&registry, &mut list, "oven").await;
    let record = list.get_mut(id).unwrap();

    let temperature = record.field_index("temperature").unwrap();
    assert!(matches!(
        put_field_value(record, temperature, FieldValue::Double(1.0)).await,
        Err(MxError::PermissionDenied(_))
    ));

    let notes = record.field_index("notes").unwrap();
    assert!(matches!(
        put_field_value(record, notes, FieldValue::String("x".repeat(17))).await,
        Err(MxError::WouldExceedLimit(_))
    ));
    assert_eq!(record.value(notes).unwrap(), &FieldValue::String(String::new()));
}

#[tokio::test]
async fn records_get_lazy_network_handles() {
    let (registry, mut list, _) = setup();
    let a = add_heater(&registry, &mut list, "a").await;
    let b = add_heater(&registry, &mut list, "b").await;

    let mut handles: HandleTable<RecordId> =
        HandleTable::new(RECORD_HANDLE_BLOCK_SIZE, handle_blocks_for_records(list.len())).unwrap();
    for id in [b, a, b] {
        let record = list.get_mut(id).unwrap();
        if record.handle.is_none() {
            record.handle = Some(handles.alloc(id).unwrap());
        }
    }
    assert_eq!(list.get(b).unwrap().handle, Some(0));
    assert_eq!(list.get(a).unwrap().handle, Some(1));
    assert_eq!(handles.get(1).unwrap(), &a);
    assert_eq!(handles.len(), 2);
}

#[tokio::test]
async fn close_all_closes_open_devices() {
    let (registry, mut list, heater) = setup();
    let id = add_heater(&registry, &mut list, "oven").await;
    list.close_all().await;
    assert!(heater.closed.load(Ordering::SeqCst));
    assert!(!list.get(id).unwrap().is_open());
}
