use std::{
    sync::{Arc, mpsc},
    thread::JoinHandle,
};

use portlease::{
    catalog::standard_configuration,
    client::RegistryClient,
    ports::PortConfiguration,
    provision::{
        ConfiguratorKind, NoOpConfigurator, PortConfigurator, PortShiftConfigurator,
        ProvisionError, ProvisionRequest, ReservationConfigurator, export_properties, provision,
        substitute_ports, teardown,
    },
    server::serve,
    service::RegistryService,
    store::ReservationStore,
};
use tempfile::{TempDir, tempdir};
use tokio::sync::oneshot;

const TEMPLATE: &str = r#"<socket-binding-group name="standard-sockets">
    <socket-binding name="http" port="${port.http}"/>
    <socket-binding name="https" port="${port.https}"/>
    <socket-binding name="custom" port="${port.custom}"/>
</socket-binding-group>
"#;

struct Registry {
    address: String,
    store: Arc<ReservationStore>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn start_registry() -> Registry {
    let store = ReservationStore::with_catalog(vec![
        PortConfiguration::builder(0)
            .port("http", 8080)
            .port("https", 8443)
            .build(),
    ]);
    store.initialize().unwrap();
    let store = Arc::new(store);
    let service = RegistryService::new(store.clone());

    let (address_tx, address_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let thread = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            address_tx
                .send(listener.local_addr().unwrap().to_string())
                .unwrap();
            serve(listener, service, shutdown_rx).await.unwrap();
        });
    });

    Registry {
        address: address_rx.recv().unwrap(),
        store,
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
    }
}

fn request(dir: &TempDir) -> ProvisionRequest {
    let template = dir.path().join("standalone.xml.template");
    std::fs::write(&template, TEMPLATE).unwrap();
    ProvisionRequest {
        template,
        output: dir.path().join("out/standalone.xml"),
        exports: dir.path().join("out/ports.properties"),
        export_prefix: "it.".into(),
    }
}

#[test]
fn substitution_replaces_known_placeholders_and_reports_unknown() {
    let configuration = PortConfiguration::builder(3)
        .port("http", 11080)
        .port("https", 11443)
        .build();

    let substitution = substitute_ports(TEMPLATE, &configuration);

    assert_eq!(substitution.replaced, 2);
    assert_eq!(substitution.unresolved, vec!["custom".to_string()]);
    assert!(substitution.text.contains(r#"name="http" port="11080""#));
    assert!(substitution.text.contains(r#"name="https" port="11443""#));
    assert!(substitution.text.contains("${port.custom}"));
}

#[test]
fn exports_are_sorted_and_prefixed() {
    let configuration = PortConfiguration::builder(2)
        .port("https", 10443)
        .port("http", 10080)
        .build();

    assert_eq!(
        export_properties(&configuration, "it."),
        "it.configuration.key=2\nit.port.http=10080\nit.port.https=10443\n"
    );
}

#[test]
fn port_shift_provisioning_rewrites_template_and_exports() {
    let dir = tempdir().unwrap();
    let request = request(&dir);

    let summary = provision(&PortShiftConfigurator { shift: 100 }, &request).unwrap();

    assert_eq!(summary.configurator, ConfiguratorKind::Shift);
    assert_eq!(summary.configuration_key, Some(0));
    assert_eq!(summary.replaced, 2);

    let written = std::fs::read_to_string(&request.output).unwrap();
    assert!(written.contains(r#"port="8180""#));
    assert!(written.contains(r#"port="8543""#));

    let exports = std::fs::read_to_string(&request.exports).unwrap();
    assert!(exports.contains("it.port.http=8180\n"));
    let standard = standard_configuration();
    assert_eq!(
        exports.lines().count(),
        standard.ports().len() + 1
    );
}

#[test]
fn no_op_provisioning_copies_template_untouched() {
    let dir = tempdir().unwrap();
    let request = request(&dir);

    let summary = provision(&NoOpConfigurator, &request).unwrap();

    assert_eq!(summary.configuration_key, None);
    assert_eq!(std::fs::read_to_string(&request.output).unwrap(), TEMPLATE);
    assert_eq!(std::fs::read_to_string(&request.exports).unwrap(), "");
}

#[test]
fn reservation_provisioning_leases_and_teardown_releases() {
    let registry = start_registry();
    let dir = tempdir().unwrap();
    let request = request(&dir);
    let configurator = ReservationConfigurator {
        client: RegistryClient::new(registry.address.clone()),
        client_key: "build-42".into(),
        ttl: None,
    };

    let summary = provision(&configurator, &request).unwrap();
    assert_eq!(summary.configuration_key, Some(0));
    assert_eq!(
        registry.store.get_reservation("build-42").map(|c| c.key()),
        Some(0)
    );
    assert!(
        std::fs::read_to_string(&request.output)
            .unwrap()
            .contains(r#"port="8443""#)
    );

    teardown(&configurator);
    assert!(registry.store.get_reservation("build-42").is_none());
}

#[test]
fn failure_after_reservation_still_releases_the_lease() {
    let registry = start_registry();
    let dir = tempdir().unwrap();
    let mut request = request(&dir);
    request.template = dir.path().join("missing.template");

    let configurator = ReservationConfigurator {
        client: RegistryClient::new(registry.address.clone()),
        client_key: "build-43".into(),
        ttl: None,
    };

    let error = provision(&configurator, &request).unwrap_err();
    assert!(matches!(error, ProvisionError::Io { .. }));
    assert!(registry.store.get_reservation("build-43").is_none());
    assert_eq!(registry.store.snapshot().available, vec![0]);
}

#[test]
fn exhausted_registry_fails_provisioning_without_writing() {
    let registry = start_registry();
    registry.store.ban_key(0);
    let dir = tempdir().unwrap();
    let request = request(&dir);

    let configurator = ReservationConfigurator {
        client: RegistryClient::new(registry.address.clone()),
        client_key: "build-44".into(),
        ttl: None,
    };

    let error = provision(&configurator, &request).unwrap_err();
    assert!(matches!(error, ProvisionError::Client(_)));
    assert!(!request.output.exists());
    assert_eq!(configurator.kind(), ConfiguratorKind::Reservation);
}
