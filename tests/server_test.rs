//! A database loaded from disk served to a real client.

use mx_core::{CallbackSender, DriverRegistry, FieldValue, MxError};
use mx_driver_soft::register_all;
use mx_server::{ConnectionAcl, MxClient, MxServer, ServerOptions};
use rust_mx::config::ServerConfig;
use rust_mx::database::load_database;
use std::path::Path;
use std::sync::Arc;

#[tokio::test]
async fn serves_the_example_database() {
    let mut config = ServerConfig::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    let options: ServerOptions = config.server_options().unwrap();

    let mut registry = DriverRegistry::new();
    register_all(&mut registry).unwrap();

    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/mxserver.db.toml");
    let (notifier, callbacks_rx) = CallbackSender::channel(options.callback_queue_capacity);
    let records = load_database(&registry, &path, Some(notifier.clone()))
        .await
        .unwrap();

    let server = MxServer::bind(
        options,
        Arc::new(registry),
        records,
        ConnectionAcl::allow_all(),
        (notifier, callbacks_rx),
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    let stop = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    let mut client = MxClient::connect(addr).await.unwrap();
    assert_eq!(
        client.get("energy.value").await.unwrap(),
        FieldValue::Double(12.4)
    );
    client
        .put("operator.value", FieldValue::String("night shift".to_string()))
        .await
        .unwrap();
    assert_eq!(
        client.get("operator.value").await.unwrap(),
        FieldValue::String("night shift".to_string())
    );
    assert_eq!(
        client.get("mx_database.num_records").await.unwrap(),
        FieldValue::Long(8)
    );

    let err = client.get("nosuch.value").await.unwrap_err();
    assert!(matches!(err, MxError::NotFound(_)), "{err}");

    stop.shutdown();
    task.await.unwrap().unwrap();
}
