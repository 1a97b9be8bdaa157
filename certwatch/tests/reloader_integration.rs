mod support;

use certwatch::{Reloader, ReloaderConfig, load_cert_pair};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use support::{handshake, pair_name, pem_to_der, server_config, set_modified, wait_for, write_pair};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn watching(dir: &Path) -> ReloaderConfig {
    ReloaderConfig::default()
        .with_dir(dir)
        .with_reload_interval(Duration::from_secs(3600))
        .with_watch(true)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rotated_pair_is_picked_up_from_watch() {
    let temp = TempDir::new().unwrap();
    write_pair(temp.path(), "site", &["old.example.com"], "site");
    let name = pair_name(temp.path(), "site");

    let reloader = Reloader::new(watching(temp.path())).unwrap();
    let cancel = CancellationToken::new();
    let handle = reloader.start(cancel.clone());
    assert!(wait_for(Duration::from_secs(5), || reloader.is_running()).await);
    assert!(reloader.get_certificate("old.example.com").is_ok());

    write_pair(temp.path(), "site", &["new.example.com"], "site");
    let later = SystemTime::now() + Duration::from_secs(60);
    set_modified(&temp.path().join("site.key"), later);
    set_modified(&temp.path().join("site.crt"), later);

    let cache = reloader.cache();
    let rotated = wait_for(Duration::from_secs(10), || {
        cache
            .get(&name)
            .is_some_and(|cert| cert.dns_names().contains(&"new.example.com".to_string()))
    })
    .await;
    assert!(rotated);
    let current = cache.get(&name).unwrap().certified_key();
    let served = reloader.get_certificate("new.example.com").unwrap();
    assert!(Arc::ptr_eq(&current, &served));

    cancel.cancel();
    assert!(handle.await.unwrap().unwrap_err().is_cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_pair_is_picked_up_from_watch() {
    let temp = TempDir::new().unwrap();
    let reloader = Reloader::new(watching(temp.path())).unwrap();
    assert!(reloader.cache().is_empty());

    let handle = reloader.start(CancellationToken::new());
    assert!(wait_for(Duration::from_secs(5), || reloader.is_running()).await);

    write_pair(temp.path(), "fresh", &["fresh.example.com"], "fresh");
    let found = wait_for(Duration::from_secs(10), || {
        reloader.get_certificate("fresh.example.com").is_ok()
    })
    .await;
    assert!(found);

    reloader.stop().await;
    assert!(handle.await.unwrap().unwrap_err().is_cancelled());
}

#[test]
fn test_tls_handshake_uses_sni_index() {
    let temp = TempDir::new().unwrap();
    let api_pem = write_pair(temp.path(), "api", &["api.example.com"], "api");
    let wild_pem = write_pair(temp.path(), "wild", &["*.example.com"], "wild");

    let reloader = Reloader::new(
        ReloaderConfig::default()
            .with_dir(temp.path())
            .with_reload_interval(Duration::from_secs(3600)),
    )
    .unwrap();
    let server = server_config(Arc::new(reloader));

    let exact = handshake(Arc::clone(&server), "api.example.com").unwrap();
    assert_eq!(exact, pem_to_der(&api_pem));

    let wildcard = handshake(Arc::clone(&server), "WWW.Example.com").unwrap();
    assert_eq!(wildcard, pem_to_der(&wild_pem));

    assert!(handshake(Arc::clone(&server), "example.com").is_err());
    assert!(handshake(server, "unknown.test").is_err());
}

#[test]
fn test_lookups_during_concurrent_updates() {
    let temp = TempDir::new().unwrap();
    write_pair(temp.path(), "a", &["a.example.com"], "a");
    let reloader = Reloader::new(
        ReloaderConfig::default()
            .with_dir(temp.path())
            .with_reload_interval(Duration::from_secs(3600)),
    )
    .unwrap();

    let extra: Vec<_> = (0..8)
        .map(|i| {
            let stem = format!("b{i}");
            write_pair(temp.path(), &stem, &[format!("b{i}.example.com").as_str()], "b");
            load_cert_pair(&pair_name(temp.path(), &stem), None)
                .unwrap()
                .unwrap()
        })
        .collect();

    let cache = reloader.cache();
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..500 {
                    assert!(reloader.get_certificate("a.example.com").is_ok());
                }
            });
        }
        scope.spawn(|| {
            for cert in &extra {
                cache.set([cert.clone()]);
            }
        });
    });

    assert_eq!(cache.len(), 9);
    for i in 0..8 {
        assert!(reloader.get_certificate(&format!("b{i}.example.com")).is_ok());
    }
}
