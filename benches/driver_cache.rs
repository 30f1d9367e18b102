//! Benchmark for the driver instance cache
//!
//! Compares a cached lookup against building a fresh session for every call.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage_array_manager::domain::ports::{AccessInfoStore, CredentialCipher, DatabaseRef};
use storage_array_manager::drivers::fake::{FAKE_MODEL, FAKE_VENDOR};
use storage_array_manager::drivers::{DriverManagerConfig, FakeDriverPlugin};
use storage_array_manager::{
    AccessInfo, Base64Cipher, DriverLookup, DriverManager, DriverRegistry, MemoryDatabase,
    Metrics, ProtocolAccess,
};
use tokio::runtime::Runtime;

const STORAGE_ID: &str = "bench-storage";

fn setup(rt: &Runtime) -> Arc<DriverManager> {
    let db: DatabaseRef = Arc::new(MemoryDatabase::new());
    let cipher = Arc::new(Base64Cipher);

    let access = AccessInfo {
        storage_id: STORAGE_ID.to_string(),
        driver_id: STORAGE_ID.to_string(),
        vendor: FAKE_VENDOR.to_string(),
        model: FAKE_MODEL.to_string(),
        rest: Some(ProtocolAccess {
            host: "10.0.0.1".to_string(),
            port: 8088,
            username: "admin".to_string(),
            password: cipher.encrypt("secret").unwrap(),
        }),
        ssh: None,
        smis: None,
        extra_attributes: BTreeMap::new(),
    };
    rt.block_on(db.create_access_info(access)).unwrap();

    let registry = DriverRegistry::new();
    registry
        .register(Arc::new(FakeDriverPlugin::default()))
        .unwrap();
    let metrics = Arc::new(Metrics::new(&prometheus::Registry::new()).unwrap());

    DriverManager::new(
        DriverManagerConfig::default(),
        Arc::new(registry),
        db,
        cipher,
        metrics,
    )
}

fn bench_get_driver(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let drivers = setup(&rt);

    let mut group = c.benchmark_group("driver_cache");
    group.throughput(Throughput::Elements(1));

    // Warm the cache once
    rt.block_on(drivers.get_driver(DriverLookup::Storage(STORAGE_ID), true))
        .unwrap();

    group.bench_function("cached_lookup", |b| {
        b.iter(|| {
            rt.block_on(drivers.get_driver(DriverLookup::Storage(black_box(STORAGE_ID)), true))
                .unwrap()
        });
    });

    group.bench_function("uncached_construction", |b| {
        b.iter(|| {
            rt.block_on(drivers.get_driver(DriverLookup::Storage(black_box(STORAGE_ID)), false))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_concurrent_lookups(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let drivers = setup(&rt);

    let mut group = c.benchmark_group("driver_cache");
    group.throughput(Throughput::Elements(64));

    group.bench_function("concurrent_cached_lookups_64", |b| {
        b.iter(|| {
            rt.block_on(async {
                let lookups = (0..64).map(|_| {
                    let drivers = drivers.clone();
                    tokio::spawn(async move {
                        drivers
                            .get_driver(DriverLookup::Storage(STORAGE_ID), true)
                            .await
                            .map(|_| ())
                    })
                });
                for result in futures::future::join_all(lookups).await {
                    result.unwrap().unwrap();
                }
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_get_driver, bench_concurrent_lookups);
criterion_main!(benches);
