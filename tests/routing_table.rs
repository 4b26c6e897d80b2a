// Routing table behaviour through the public API: matching rules, reload and URL building.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use async_trait::async_trait;
use portcullis::{
    config::models::RouteConfig,
    core::{GatewayComponents, RoutingManager},
    ports::http_client::{
        HttpClient, HttpClientError, HttpClientResult, UpstreamRequest, UpstreamResponse,
    },
};

struct UnreachableClient;

#[async_trait]
impl HttpClient for UnreachableClient {
    async fn send_request(&self, _req: UpstreamRequest) -> HttpClientResult<UpstreamResponse> {
        Err(HttpClientError::ConnectionError("not used".into()))
    }
}

fn manager() -> RoutingManager {
    RoutingManager::new(GatewayComponents::new(Arc::new(UnreachableClient)))
}

fn generation(tag: &str) -> Vec<RouteConfig> {
    let upstream = format!("http://{tag}.internal");
    vec![
        RouteConfig::new(format!("{tag}-x"), "/-/x", upstream.clone()),
        RouteConfig::new(format!("{tag}-xy"), "/-/x/y", upstream.clone()),
        RouteConfig::new(format!("{tag}-z"), "/-/z", upstream),
    ]
}

#[test]
fn test_longest_prefix_match() {
    let mgr = manager();
    mgr.set_proxies(vec![
        RouteConfig::new("a", "/a", "http://a.internal"),
        RouteConfig::new("ab", "/a/b", "http://ab.internal"),
    ]);

    assert_eq!(mgr.match_proxy("/a/b/c").unwrap().config.id, "ab");
    assert_eq!(mgr.match_proxy("/a/b").unwrap().config.id, "ab");
    assert_eq!(mgr.match_proxy("/a/bc").unwrap().config.id, "a");
    assert_eq!(mgr.match_proxy("/a").unwrap().config.id, "a");
}

#[test]
fn test_configuration_order_does_not_affect_specificity() {
    let mgr = manager();
    mgr.set_proxies(vec![
        RouteConfig::new("ab", "/a/b", "http://ab.internal"),
        RouteConfig::new("a", "/a", "http://a.internal"),
    ]);
    assert_eq!(mgr.match_proxy("/a/b/c").unwrap().config.id, "ab");

    let paths: Vec<String> = mgr.proxies().into_iter().map(|p| p.path).collect();
    assert_eq!(paths, vec!["/a/b", "/a"]);
}

#[test]
fn test_segment_boundary() {
    let mgr = manager();
    mgr.set_proxies(vec![RouteConfig::new(
        "openai",
        "/-/openai",
        "https://api.openai.com",
    )]);

    assert!(mgr.match_proxy("/-/openai").is_some());
    assert!(mgr.match_proxy("/-/openai/").is_some());
    assert!(mgr.match_proxy("/-/openai/v1/models").is_some());
    assert!(mgr.match_proxy("/-/openaiextra").is_none());
    assert!(mgr.match_proxy("/-/open").is_none());
}

#[test]
fn test_inactive_routes_never_match() {
    let mgr = manager();
    let mut inactive = RouteConfig::new("ab", "/a/b", "http://ab.internal");
    inactive.active = false;
    mgr.set_proxies(vec![
        inactive,
        RouteConfig::new("a", "/a", "http://a.internal"),
    ]);

    // Falls through to the less specific active route.
    assert_eq!(mgr.match_proxy("/a/b/c").unwrap().config.id, "a");
    assert!(mgr.table().get("ab").is_none());
}

#[test]
fn test_empty_table() {
    let mgr = manager();
    assert!(mgr.match_proxy("/-/anything").is_none());
    assert!(mgr.table().is_empty());

    mgr.set_proxies(generation("a"));
    mgr.set_proxies(Vec::new());
    assert!(mgr.match_proxy("/-/x").is_none());
}

#[test]
fn test_reload_is_atomic_for_concurrent_readers() {
    let mgr = Arc::new(manager());
    mgr.set_proxies(generation("a"));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut checks = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let table = mgr.table();
                    let xy = table.find("/-/x/y/1").expect("route present in every generation");
                    let x = table.find("/-/x/2").expect("route present in every generation");
                    let z = table.find("/-/z").expect("route present in every generation");
                    assert_eq!(table.len(), 3);
                    assert_eq!(xy.config.upstream, x.config.upstream);
                    assert_eq!(x.config.upstream, z.config.upstream);

                    let matched = mgr.match_proxy("/-/x/y").expect("never a gap during reload");
                    assert!(matched.config.id.ends_with("-xy"));
                    checks += 1;
                }
                checks
            })
        })
        .collect();

    for i in 0..500 {
        let tag = if i % 2 == 0 { "b" } else { "a" };
        mgr.set_proxies(generation(tag));
    }
    stop.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}

#[test]
fn test_in_flight_entry_survives_reload() {
    let mgr = manager();
    let mut capped = RouteConfig::new("capped", "/-/capped", "http://old.internal");
    capped.max_concurrent = 1;
    mgr.set_proxies(vec![capped.clone()]);

    let held = mgr.match_proxy("/-/capped/x").unwrap();
    let permit = held.limiter.try_permit().unwrap();

    capped.upstream = "http://new.internal".to_string();
    mgr.set_proxies(vec![capped]);

    assert_eq!(held.config.upstream, "http://old.internal");
    let fresh = mgr.match_proxy("/-/capped/x").unwrap();
    assert_eq!(fresh.config.upstream, "http://new.internal");
    assert!(fresh.limiter.try_permit().is_some());
    drop(permit);
    assert_eq!(held.limiter.in_use(), 0);
}

#[test]
fn test_upstream_url_construction() {
    let mut route = RouteConfig::new("x", "/-/x", "https://api.example.com");
    assert_eq!(
        RoutingManager::build_upstream_url(&route, "/-/x/v1/chat?model=gpt-4"),
        "https://api.example.com/v1/chat?model=gpt-4"
    );

    route.strip_path = false;
    assert_eq!(
        RoutingManager::build_upstream_url(&route, "/-/x/v1/chat?model=gpt-4"),
        "https://api.example.com/-/x/v1/chat?model=gpt-4"
    );

    let with_base = RouteConfig::new("y", "/-/y", "http://127.0.0.1:11434/api/");
    assert_eq!(
        RoutingManager::build_upstream_url(&with_base, "/-/y/tags"),
        "http://127.0.0.1:11434/api/tags"
    );
}
