//! A small database of every soft driver, built and exercised through the
//! record list the way the server does it.

use mx_core::{
    get_field_value, put_field_value, verify_driver_type, ClassId, ConstructContext, DriverRegistry,
    FieldValue, RecordList, SuperclassId, ANY_TYPE,
};
use mx_driver_soft::{register_all_with, FaultInjector, LIST_HEAD_RECORD_NAME};

async fn database(faults: &FaultInjector) -> (DriverRegistry, RecordList) {
    let mut registry = DriverRegistry::new();
    register_all_with(&mut registry, faults).unwrap();
    registry.verify_all().unwrap();

    let head = registry.list_head().unwrap().clone();
    let mut list = RecordList::new(head, LIST_HEAD_RECORD_NAME).unwrap();
    for (name, driver) in [
        ("m1", "soft_motor"),
        ("m2", "dynamic_motor"),
        ("sc1", "soft_scaler"),
        ("mca1", "soft_mca"),
        ("ai1", "soft_ainput"),
        ("count", "long_variable"),
        ("gain", "double_variable"),
        ("title", "string_variable"),
    ] {
        let descriptor = registry.lookup_type_by_name(driver).unwrap().clone();
        let id = list.create_record(descriptor, name).unwrap();
        let record = list.get_mut(id).unwrap();
        record
            .construct(&ConstructContext {
                record_id: Some(id),
                notifier: None,
            })
            .unwrap();
        record.open().await.unwrap();
    }
    (registry, list)
}

#[tokio::test]
async fn every_driver_builds_a_working_record() {
    let (_, mut list) = database(&FaultInjector::none()).await;
    assert_eq!(list.len(), 9);

    let names: Vec<String> = list.iter().map(|r| r.name.clone()).collect();
    assert_eq!(names[0], LIST_HEAD_RECORD_NAME);

    let gain = list.get_by_name_mut("gain").unwrap();
    let ordinal = gain.field_index("value").unwrap();
    put_field_value(gain, ordinal, FieldValue::Double(2.0)).await.unwrap();
    assert_eq!(get_field_value(gain, ordinal).await.unwrap(), FieldValue::Double(2.0));
}

#[tokio::test]
async fn motors_match_the_motor_class_regardless_of_type() {
    let (registry, list) = database(&FaultInjector::none()).await;
    let motors: Vec<&str> = list
        .iter()
        .filter(|r| verify_driver_type(r, SuperclassId::DEVICE, ClassId::MOTOR, ANY_TYPE))
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(motors, ["m1", "m2"]);

    let m2 = list.get_by_name("m2").unwrap();
    let driver = registry.driver_for_record(m2).unwrap();
    assert_eq!(driver.name, "dynamic_motor");
    assert!(driver.dynamic);
}

#[tokio::test]
async fn failing_open_surfaces_the_device_error() {
    let faults = FaultInjector::none();
    let mut registry = DriverRegistry::new();
    register_all_with(&mut registry, &faults).unwrap();
    let head = registry.list_head().unwrap().clone();
    let mut list = RecordList::new(head, LIST_HEAD_RECORD_NAME).unwrap();
    let motor = registry.lookup_type_by_name("soft_motor").unwrap().clone();
    let id = list.create_record(motor, "m1").unwrap();
    let record = list.get_mut(id).unwrap();
    record.construct(&ConstructContext::default()).unwrap();

    faults.fail_next("open");
    assert!(record.open().await.is_err());
    assert!(!record.is_open());
    record.open().await.unwrap();
    assert!(record.is_open());
}
