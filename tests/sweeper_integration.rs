use std::{sync::Arc, time::Duration};

use portlease::{ports::PortConfiguration, store::ReservationStore, sweeper::spawn_sweeper};

fn single_configuration_store() -> Arc<ReservationStore> {
    let store = ReservationStore::with_catalog(vec![
        PortConfiguration::builder(0).port("http", 8080).build(),
    ]);
    store.initialize().unwrap();
    Arc::new(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrenewed_lease_is_reclaimed_by_the_sweeper() {
    let store = single_configuration_store();
    let sweeper = spawn_sweeper(store.clone(), Duration::from_millis(100));

    let granted = store.reserve("A", Some(Duration::from_millis(1000))).unwrap();
    assert_eq!(granted.key(), 0);
    assert!(store.reserve("B", None).is_none());

    tokio::time::sleep(Duration::from_millis(1300)).await;

    assert!(store.get_reservation("A").is_none());
    assert_eq!(store.reserve("A", None).unwrap().key(), 0);

    store.destroy();
    tokio::time::timeout(Duration::from_secs(2), sweeper)
        .await
        .expect("sweeper should stop after destroy")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renewed_lease_survives_past_its_first_deadline() {
    let store = single_configuration_store();
    let sweeper = spawn_sweeper(store.clone(), Duration::from_millis(50));

    store.reserve_or_renew("A", Some(Duration::from_millis(600))).unwrap();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        store.reserve_or_renew("A", Some(Duration::from_millis(600))).unwrap();
    }

    assert_eq!(store.get_reservation("A").map(|c| c.key()), Some(0));

    store.destroy();
    sweeper.await.unwrap();
}

#[tokio::test]
async fn sweeper_exits_immediately_for_destroyed_store() {
    let store = single_configuration_store();
    store.destroy();
    assert!(store.is_destroyed());

    let sweeper = spawn_sweeper(store.clone(), Duration::from_secs(60));
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("sweeper should not wait for a tick")
        .unwrap();
}
