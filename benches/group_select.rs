use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;

use openworld_outbound::app::outbound_manager::OutboundManager;
use openworld_outbound::app::registry::{OutboundRegistry, Services};
use openworld_outbound::common::Address;
use openworld_outbound::proxy::group::balancer::Balancer;
use openworld_outbound::proxy::group::history::{HistoryStorage, UrlTestHistory};
use openworld_outbound::proxy::group::urltest::UrlTest;
use openworld_outbound::proxy::{Network, StartStage};

const MEMBERS: usize = 64;

fn build(rt: &tokio::runtime::Runtime, group_type: &str) -> Arc<OutboundManager> {
    let history = Arc::new(HistoryStorage::new());
    for i in 0..MEMBERS {
        history.store_url_test_history(&format!("node{}", i), UrlTestHistory::new(50 + i as u16));
    }
    let services = Services::default().with_history(history);
    let manager = OutboundManager::new(Arc::new(OutboundRegistry::with_defaults()), services, None);

    let tags: Vec<String> = (0..MEMBERS).map(|i| format!("node{}", i)).collect();
    rt.block_on(async {
        for tag in &tags {
            manager.create(tag, "direct", json!({})).await.unwrap();
        }
        manager
            .create("group", group_type, json!({ "outbounds": tags }))
            .await
            .unwrap();
        manager.start(StartStage::Initialize).await.unwrap();
        manager.start(StartStage::Start).await.unwrap();
    });
    manager
}

fn bench_urltest_select(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manager = build(&rt, "urltest");
    let outbound = manager.outbound("group").unwrap();
    let urltest = outbound.as_any().downcast_ref::<UrlTest>().unwrap();
    let group = urltest.group().unwrap();

    c.bench_function("urltest_select_64", |b| {
        b.iter(|| {
            black_box(group.select(Network::Tcp));
        });
    });

    c.bench_function("urltest_update_check_64", |b| {
        b.iter(|| {
            group.perform_update_check();
        });
    });
}

fn bench_balancer_select(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manager = build(&rt, "balancer");
    let outbound = manager.outbound("group").unwrap();
    let balancer = outbound.as_any().downcast_ref::<Balancer>().unwrap();

    let sticky: Address = "example.com:443".parse().unwrap();
    c.bench_function("balancer_select_affinity_hit", |b| {
        b.iter(|| {
            black_box(balancer.select_outbound(&sticky, Network::Tcp).unwrap());
        });
    });

    let destinations: Vec<Address> = (0..1000)
        .map(|i| format!("host{}.example.com:443", i).parse().unwrap())
        .collect();
    c.bench_function("balancer_select_1000_destinations", |b| {
        b.iter(|| {
            for dest in &destinations {
                black_box(balancer.select_outbound(dest, Network::Tcp).unwrap());
            }
        });
    });
}

criterion_group!(benches, bench_urltest_select, bench_balancer_select);
criterion_main!(benches);
