use std::sync::Arc;

use portlease::{
    ports::PortConfiguration,
    service::{RegistryCommand, RegistryService},
    store::{ManualClock, ReservationStore},
};

fn service() -> RegistryService {
    let store = ReservationStore::with_catalog(vec![
        PortConfiguration::builder(0)
            .port("http", 8080)
            .port("https", 8443)
            .build(),
        PortConfiguration::builder(1)
            .port("http", 9080)
            .port("https", 9443)
            .build(),
        PortConfiguration::builder(2)
            .port("http", 10080)
            .port("https", 10443)
            .build(),
    ])
    .with_clock(Arc::new(ManualClock::new(0)));
    store.initialize().unwrap();
    RegistryService::new(Arc::new(store))
}

#[test]
fn snapshot_reserve_contract() {
    let service = service();
    let reserved = service.handle(RegistryCommand::Reserve {
        client_key: Some("A".into()),
        ttl_ms: None,
    });
    insta::assert_yaml_snapshot!("registry_reserve_contract", reserved);
}

#[test]
fn snapshot_status_contract() {
    let service = service();
    service.handle(RegistryCommand::Reserve {
        client_key: Some("A".into()),
        ttl_ms: None,
    });
    service.handle(RegistryCommand::Ban { key: 1 });

    let status = service.handle(RegistryCommand::Status);
    insta::assert_yaml_snapshot!("registry_status_contract", status);
}
