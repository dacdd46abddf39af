//! Request/reply behavior over a real TCP connection.

mod common;

use common::TestServer;
use mx_core::{FieldShape, FieldType, FieldValue, MxError};
use mx_server::protocol::words;
use mx_server::{DataFormat, MessageType, NetworkOption};

#[tokio::test]
async fn get_and_put_by_name() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.put("gain.value", FieldValue::Double(2.5)).await.unwrap();
    assert_eq!(client.get("gain.value").await.unwrap(), FieldValue::Double(2.5));

    client
        .put("title.value", FieldValue::String("alignment scan".into()))
        .await
        .unwrap();
    assert_eq!(
        client.get("title.value").await.unwrap(),
        FieldValue::String("alignment scan".into())
    );

    server.stop().await;
}

#[tokio::test]
async fn network_handles_are_stable_and_usable() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let first = client.network_handle("count.value").await.unwrap();
    let again = client.get_network_handle("count.value").await.unwrap();
    assert_eq!((first.record_handle, first.field_ordinal), again);
    assert_eq!(first.field_type, FieldType::Long);

    client.put_by_handle(&first, FieldValue::Long(-42)).await.unwrap();
    assert_eq!(client.get_by_handle(&first).await.unwrap(), FieldValue::Long(-42));
    assert_eq!(client.get("count.value").await.unwrap(), FieldValue::Long(-42));

    let other = client.network_handle("gain.value").await.unwrap();
    assert_ne!(other.record_handle, first.record_handle);

    server.stop().await;
}

#[tokio::test]
async fn field_type_reports_string_length() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let (field_type, shape) = client.get_field_type("title.value").await.unwrap();
    assert_eq!(field_type, FieldType::String);
    assert!(matches!(shape, FieldShape::String { max_len } if max_len > 0));

    let (field_type, shape) = client.get_field_type("mca1.channel_array").await.unwrap();
    assert_eq!(field_type, FieldType::ULong);
    assert!(matches!(shape, FieldShape::Array { .. }));

    server.stop().await;
}

#[tokio::test]
async fn request_errors_do_not_close_the_connection() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let err = client.get("nosuch.value").await.unwrap_err();
    assert!(matches!(err, MxError::NotFound(_)), "{err}");

    let err = client.get("gain.nosuch").await.unwrap_err();
    assert!(matches!(err, MxError::NotFound(_)), "{err}");

    let err = client.get("gain").await.unwrap_err();
    assert!(matches!(err, MxError::IllegalArgument(_)), "{err}");

    let err = client.put("sc1.value", FieldValue::Long(5)).await.unwrap_err();
    assert!(matches!(err, MxError::PermissionDenied(_)), "{err}");

    let err = client
        .request(MessageType::GetArrayByHandle, words(&[999, 0]))
        .await
        .unwrap_err();
    assert!(matches!(err, MxError::NotFound(_)), "{err}");

    client.put("gain.value", FieldValue::Double(1.0)).await.unwrap();
    assert_eq!(client.get("gain.value").await.unwrap(), FieldValue::Double(1.0));

    server.stop().await;
}

#[tokio::test]
async fn data_format_is_per_connection() {
    let server = TestServer::start().await;
    let mut raw = server.connect().await;
    let mut ascii = server.connect().await;

    assert_eq!(
        raw.get_option(NetworkOption::DataFormat).await.unwrap(),
        DataFormat::Ascii.code()
    );
    raw.set_data_format(DataFormat::Raw).await.unwrap();
    assert_eq!(
        raw.get_option(NetworkOption::DataFormat).await.unwrap(),
        DataFormat::Raw.code()
    );

    raw.put("gain.value", FieldValue::Double(0.125)).await.unwrap();
    assert_eq!(raw.get("gain.value").await.unwrap(), FieldValue::Double(0.125));
    assert_eq!(ascii.get("gain.value").await.unwrap(), FieldValue::Double(0.125));
    assert_eq!(ascii.data_format(), DataFormat::Ascii);

    server.stop().await;
}

#[tokio::test]
async fn option_validation() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let err = client.set_option(NetworkOption::DataFormat, 99).await.unwrap_err();
    assert!(matches!(err, MxError::IllegalArgument(_)), "{err}");

    let err = client
        .set_option(NetworkOption::NativeDataFormat, DataFormat::Xdr.code())
        .await
        .unwrap_err();
    assert!(matches!(err, MxError::IllegalArgument(_)), "{err}");

    let err = client
        .request(MessageType::GetOption, words(&[77]))
        .await
        .unwrap_err();
    assert!(matches!(err, MxError::NotFound(_)), "{err}");

    assert_eq!(client.get_option(NetworkOption::Long64).await.unwrap(), 1);
    client.set_option(NetworkOption::Long64, 0).await.unwrap();
    assert_eq!(client.get_option(NetworkOption::Long64).await.unwrap(), 0);

    server.stop().await;
}

#[tokio::test]
async fn truncated_longs_round_trip_in_xdr() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.set_data_format(DataFormat::Xdr).await.unwrap();
    client.set_option(NetworkOption::Long64, 0).await.unwrap();
    client.put("count.value", FieldValue::Long(-7)).await.unwrap();
    assert_eq!(client.get("count.value").await.unwrap(), FieldValue::Long(-7));

    server.stop().await;
}

#[tokio::test]
async fn client_info_is_accepted_once_named() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.set_client_info("operator", "scan_gui", 4242).await.unwrap();
    let err = client
        .request(MessageType::SetClientInfo, "")
        .await
        .unwrap_err();
    assert!(matches!(err, MxError::NullArgument(_)), "{err}");

    server.stop().await;
}
