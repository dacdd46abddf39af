//! A running server over a small soft-driver database.

#![allow(dead_code)]

use mx_core::limits::CALLBACK_QUEUE_CAPACITY;
use mx_core::{CallbackSender, ConstructContext, DriverRegistry, FieldValue, MxResult, RecordList};
use mx_driver_soft::{register_all, LIST_HEAD_RECORD_NAME};
use mx_server::{ConnectionAcl, MxClient, MxServer, ServerNotice, ServerOptions, ShutdownHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Records, their drivers, and the settings applied before construction.
const RECORDS: &[(&str, &str)] = &[
    ("m1", "soft_motor"),
    ("sc1", "soft_scaler"),
    ("mca1", "soft_mca"),
    ("gain", "double_variable"),
    ("count", "long_variable"),
    ("title", "string_variable"),
];

pub async fn database(sender: &CallbackSender) -> (Arc<DriverRegistry>, RecordList) {
    let mut registry = DriverRegistry::new();
    register_all(&mut registry).unwrap();
    registry.verify_all().unwrap();

    let head = registry.list_head().unwrap().clone();
    let mut list = RecordList::new(head, LIST_HEAD_RECORD_NAME).unwrap();
    for (name, driver) in RECORDS {
        let descriptor = registry.lookup_type_by_name(driver).unwrap().clone();
        let id = list.create_record(descriptor, name).unwrap();
        let record = list.get_mut(id).unwrap();
        match *name {
            "sc1" => record
                .set_value_by_name("count_rate", FieldValue::Double(10_000.0))
                .unwrap(),
            "mca1" => {
                record
                    .set_value_by_name("num_channels", FieldValue::Long(64))
                    .unwrap();
                record
                    .set_value_by_name("preset_real_time", FieldValue::Double(0.3))
                    .unwrap();
                record
                    .set_value_by_name("count_rate", FieldValue::Double(1.0e5))
                    .unwrap();
            }
            _ => {}
        }
        record
            .construct(&ConstructContext {
                record_id: Some(id),
                notifier: Some(sender.clone()),
            })
            .unwrap();
        record.open().await.unwrap();
    }
    (Arc::new(registry), list)
}

pub fn local_options() -> ServerOptions {
    ServerOptions {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..ServerOptions::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub notices: broadcast::Receiver<ServerNotice>,
    stop: ShutdownHandle,
    task: JoinHandle<MxResult<()>>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        TestServer::start_with(local_options(), ConnectionAcl::allow_all()).await
    }

    pub async fn start_with(options: ServerOptions, acl: ConnectionAcl) -> TestServer {
        let (sender, receiver) = CallbackSender::channel(CALLBACK_QUEUE_CAPACITY);
        let (registry, records) = database(&sender).await;
        let server = MxServer::bind(options, registry, records, acl, (sender, receiver))
            .await
            .unwrap();
        let addr = server.local_addr();
        let notices = server.subscribe();
        let stop = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        TestServer {
            addr,
            notices,
            stop,
            task,
        }
    }

    pub async fn connect(&self) -> MxClient<TcpStream> {
        MxClient::connect(self.addr).await.unwrap()
    }

    /// Connect and wait until the server has given the connection a slot.
    pub async fn connect_accepted(&mut self) -> (MxClient<TcpStream>, usize) {
        let client = self.connect().await;
        match self.next_notice().await {
            ServerNotice::Accepted { slot, .. } => (client, slot),
            other => panic!("expected an accepted connection, got {:?}", other),
        }
    }

    pub async fn next_notice(&mut self) -> ServerNotice {
        tokio::time::timeout(TIMEOUT, self.notices.recv())
            .await
            .expect("no server notice in time")
            .expect("notice channel closed")
    }

    pub async fn stop(self) {
        self.stop.shutdown();
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("server did not stop in time")
            .unwrap()
            .unwrap();
    }
}
