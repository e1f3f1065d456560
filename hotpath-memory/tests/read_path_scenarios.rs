//! Read path scenarios across several instances sharing one backend.

mod common;

use std::time::Duration;

use common::{shop, Cluster};
use futures::future::join_all;
use hotpath::errors::ShopError;
use hotpath::store::{NewShop, ShopRepository};
use hotpath::types::ShopId;

#[tokio::test]
async fn unknown_id_is_rejected_without_touching_the_store() {
    let cluster = Cluster::new();
    cluster.shops.put(shop(1, "Tea House"));
    let node = cluster.node();
    node.shops.warm_up().await.unwrap();

    let result = node.shops.get_by_id(ShopId::new(42)).await;

    assert_eq!(result, Err(ShopError::NotFound(ShopId::new(42))));
    assert_eq!(cluster.shops.reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_across_instances_read_the_store_once() {
    let cluster = Cluster::with_shop_latency(Duration::from_millis(50));
    cluster.shops.put(shop(7, "Noodle Bar"));
    let nodes: Vec<_> = (0..3).map(|_| cluster.node()).collect();
    nodes[0].shops.warm_up().await.unwrap();

    let reads = (0..30).map(|i| {
        let orchestrator = nodes[i % nodes.len()].shops.clone();
        tokio::spawn(async move { orchestrator.get_by_id(ShopId::new(7)).await })
    });
    let results = join_all(reads).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap().name, "Noodle Bar");
    }
    assert_eq!(cluster.shops.reads(), 1);
}

#[tokio::test]
async fn stale_entry_is_served_then_rebuilt_in_background() {
    let cluster = Cluster::new();
    cluster.shops.put(shop(3, "Old Name"));
    let node = cluster.node();
    node.shops.warm_up().await.unwrap();

    assert_eq!(node.shops.get_by_id(ShopId::new(3)).await.unwrap().name, "Old Name");
    cluster.shops.put(shop(3, "New Name"));
    cluster.clock.advance(Duration::from_secs(36 * 60));

    let stale = node.shops.get_by_id(ShopId::new(3)).await.unwrap();
    assert_eq!(stale.name, "Old Name");

    node.pool.wait_idle().await;
    let rebuilt = node.shops.get_by_id(ShopId::new(3)).await.unwrap();
    assert_eq!(rebuilt.name, "New Name");
    assert_eq!(cluster.shops.reads(), 2);
}

#[tokio::test]
async fn fresh_entry_survives_until_its_logical_expiry() {
    let cluster = Cluster::new();
    cluster.shops.put(shop(3, "Dumplings"));
    let node = cluster.node();
    node.shops.warm_up().await.unwrap();

    node.shops.get_by_id(ShopId::new(3)).await.unwrap();
    cluster.clock.advance(Duration::from_secs(24 * 60));
    node.shops.get_by_id(ShopId::new(3)).await.unwrap();
    node.pool.wait_idle().await;

    assert_eq!(cluster.shops.reads(), 1);
    assert!(cluster.backend.ttl("cache:shop:3").is_some());
}

#[tokio::test]
async fn update_invalidates_every_instance() {
    let cluster = Cluster::new();
    cluster.shops.put(shop(5, "Before"));
    let (writer, reader) = (cluster.node(), cluster.node());
    writer.shops.warm_up().await.unwrap();
    reader.shops.get_by_id(ShopId::new(5)).await.unwrap();

    let mut changed = cluster.shops.find_shop(ShopId::new(5)).await.unwrap().unwrap();
    changed.name = "After".to_string();
    writer.shops.update(&changed).await.unwrap();

    assert_eq!(reader.shops.get_by_id(ShopId::new(5)).await.unwrap().name, "After");
}

#[tokio::test]
async fn created_shop_is_readable_on_other_instances_after_registration() {
    let cluster = Cluster::new();
    let (creator, other) = (cluster.node(), cluster.node());

    let created = creator
        .shops
        .create(NewShop {
            name: "Night Market".to_string(),
            type_id: 2,
            images: String::new(),
            area: "Old Town".to_string(),
            address: "8 Lantern Lane".to_string(),
            x: 120.2,
            y: 30.3,
            avg_price: 35,
            open_hours: "18:00-02:00".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(creator.shops.get_by_id(created.id).await.unwrap().name, "Night Market");

    creator.pool.wait_idle().await;
    assert_eq!(other.shops.get_by_id(created.id).await.unwrap().name, "Night Market");
}

#[tokio::test]
async fn filter_outage_fails_open() {
    let cluster = Cluster::new();
    cluster.shops.put(shop(9, "Bakery"));
    let node = cluster.node();

    cluster.backend.set_unavailable(true);
    assert!(
        node.filter
            .might_exist(hotpath::EntityKind::Shop, 9)
            .await
    );
    cluster.backend.set_unavailable(false);
}
