pub mod resolver;
pub mod telemetry;
pub mod dispatcher;
pub mod publisher;
pub mod device_service;
pub mod mqtt_client;
pub mod storage;

use hub_shared::{DeviceRepository, LocationRepository, QoS, TelemetryRepository, Transport};
use std::sync::Arc;

pub use device_service::DeviceService;
pub use dispatcher::{DispatchOutcome, DropReason, IngestionDispatcher};
pub use publisher::CommandPublisher;
pub use resolver::DeviceResolver;
pub use telemetry::TelemetrySink;

/// 组装好的入站和出站处理组件
#[derive(Clone)]
pub struct Hub {
    pub dispatcher: Arc<IngestionDispatcher>,
    pub devices: Arc<DeviceService>,
}

impl Hub {
    pub fn new<S>(store: Arc<S>, transport: Arc<dyn Transport>, qos: QoS) -> Self
    where
        S: LocationRepository + DeviceRepository + TelemetryRepository + 'static,
    {
        let resolver = DeviceResolver::new(store.clone());
        let sink = TelemetrySink::new(store.clone());
        let dispatcher = IngestionDispatcher::new(resolver, sink, store.clone());

        let publisher = CommandPublisher::new(transport, qos);
        let devices = DeviceService::new(store.clone(), store.clone(), store, publisher);

        Self {
            dispatcher: Arc::new(dispatcher),
            devices: Arc::new(devices),
        }
    }
}
