use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use calico_accountant::export::health::HealthMetrics;
use calico_accountant::export::{encode, gather, router, MetricsServer};
use calico_accountant::iptables::parse::{parse_from, InterfaceMap, ParseError};
use calico_accountant::iptables::record::AccountingRecord;
use calico_accountant::iptables::{ScanError, Scanner};
use calico_accountant::metrics::{Accountant, ACCEPT_METRIC, DROP_METRIC};
use calico_accountant::watch::{PolicyId, ResourceCache, SyncEvent, Update, WorkloadEndpoint};
use http_body_util::BodyExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const DUMP: &str = r#"*filter
:cali-tw-cali5125b8e5d77 - [0:0]
[12:720] -A cali-tw-cali5125b8e5d77 -m comment --comment "cali:HqDZuW76n3mdpCix" -j MARK --set-xmark 0x0/0x10000
[3:180] -A cali-tw-cali5125b8e5d77 -m comment --comment "cali:yWm8oY1YDuoYpkS6" -m mark --mark 0x0/0x20000 -j cali-pi-_bQZyKGStyEUqsYGNFNf
[3:180] -A cali-tw-cali5125b8e5d77 -m comment --comment "cali:RnZHt9r_TDuk8NI7" -m comment --comment "Return if policy accepted" -m mark --mark 0x10000/0x10000 -j RETURN
[1:60] -A cali-tw-cali5125b8e5d77 -m comment --comment "cali:0HKmZy_mh8JT1Tl6" -m comment --comment "Drop if no policies passed packet" -m mark --mark 0x0/0x20000 -j DROP
[2:164] -A cali-fw-cali5125b8e5d77 -m comment --comment "cali:GB6NmH8AJXUChNx0" -m mark --mark 0x0/0x20000 -j cali-po-_bQZyKGStyEUqsYGNFNf
[0:0] -A cali-fw-cali5125b8e5d77 -m comment --comment "cali:EAx49aLc--OzcnGb" -m comment --comment "Return if policy accepted" -m mark --mark 0x10000/0x10000 -j RETURN
[0:0] -A cali-fw-cali5125b8e5d77 -m comment --comment "cali:mFJHSWPsX6BjHV5u" -m comment --comment "Drop if no policies passed packet" -m mark --mark 0x0/0x20000 -j DROP
[4:240] -A cali-po-_bQZyKGStyEUqsYGNFNf -m comment --comment "cali:tm2GIRj6Jh8cDGpP" -j DROP
[9:540] -A cali-tw-caliremote00000 -m comment --comment "cali:X" -m comment --comment "Drop if no policies passed packet" -j DROP
COMMIT
"#;

/// Parses a canned dump against the interfaces the accountant supplies.
struct DumpScanner(&'static str);

impl Scanner for DumpScanner {
    async fn scan(&self, interfaces: &InterfaceMap) -> Result<Vec<AccountingRecord>, ScanError> {
        Ok(parse_from(self.0.as_bytes(), interfaces)?)
    }
}

/// Fails every round with a grammar error.
struct GrammarErrorScanner;

impl Scanner for GrammarErrorScanner {
    async fn scan(&self, _: &InterfaceMap) -> Result<Vec<AccountingRecord>, ScanError> {
        Err(ScanError::Parse(ParseError::UnsupportedGrammar {
            what: "chain type",
            token: "xw".to_string(),
        }))
    }
}

fn endpoint(pod: &str, node: &str, iface: &str, ip: &str) -> WorkloadEndpoint {
    WorkloadEndpoint {
        pod: pod.to_string(),
        namespace: "default".to_string(),
        node: node.to_string(),
        interface_name: iface.to_string(),
        ip_networks: vec![ip.to_string()],
        labels: BTreeMap::from([("app".to_string(), "bar".to_string())]),
    }
}

fn synced_cache() -> Arc<ResourceCache> {
    let cache = ResourceCache::new("node-a");
    cache.handle(SyncEvent::Updates(vec![
        Update::UpsertWorkload {
            key: "default/foo".to_string(),
            endpoint: endpoint("foo", "node-a", "cali5125b8e5d77", "127.0.0.1/32"),
        },
        Update::UpsertWorkload {
            key: "default/remote".to_string(),
            endpoint: endpoint("remote", "node-b", "caliremote00000", "10.0.0.9/32"),
        },
        Update::UpsertPolicy {
            id: PolicyId::new("allow-frontend"),
        },
    ]));
    cache.handle(SyncEvent::InSync);
    Arc::new(cache)
}

fn accountant<S: Scanner>(scanner: S, minimum_counter: u64) -> Accountant<S> {
    Accountant::new(
        synced_cache(),
        scanner,
        minimum_counter,
        Arc::new(HealthMetrics::new().unwrap()),
    )
}

fn sample_lines<'a>(text: &'a str, name: &str) -> Vec<&'a str> {
    text.lines()
        .filter(|l| l.starts_with(&format!("{name}{{")))
        .collect()
}

#[tokio::test]
async fn test_dump_to_exposition() {
    let acc = accountant(DumpScanner(DUMP), 0);
    let fatal = CancellationToken::new();

    let text = encode(&gather(&acc, &fatal).await).unwrap();

    let accepts = sample_lines(&text, ACCEPT_METRIC);
    assert_eq!(accepts.len(), 2, "{text}");
    let inbound = accepts
        .iter()
        .find(|l| l.contains(r#"type="tw""#))
        .unwrap();
    assert!(inbound.contains(r#"policy="allow-frontend""#));
    assert!(inbound.contains(r#"pod="foo""#));
    assert!(inbound.contains(r#"ip="127.0.0.1""#));
    assert!(inbound.ends_with(" 3"));

    // Zero accept counter patched from the outbound policy drop chain.
    let outbound = accepts
        .iter()
        .find(|l| l.contains(r#"type="fw""#))
        .unwrap();
    assert!(outbound.contains(r#"policy="allow-frontend""#));
    assert!(outbound.ends_with(" 4"));

    let drops = sample_lines(&text, DROP_METRIC);
    assert_eq!(drops.len(), 2, "{text}");
    assert!(drops.iter().all(|l| !l.contains("policy=")));
    assert!(drops
        .iter()
        .any(|l| l.contains(r#"type="tw""#) && l.ends_with(" 1")));

    // Workloads on other nodes never reach the output.
    assert!(!text.contains("remote"));

    assert!(text.contains("calico_accountant_accepts_corrected_total 1"));
    assert!(!fatal.is_cancelled());
}

#[tokio::test]
async fn test_suppressed_round_serves_diagnostics_only() {
    let acc = accountant(DumpScanner(DUMP), 100);
    let fatal = CancellationToken::new();

    let text = encode(&gather(&acc, &fatal).await).unwrap();

    assert!(sample_lines(&text, ACCEPT_METRIC).is_empty());
    assert!(sample_lines(&text, DROP_METRIC).is_empty());
    assert!(text.contains("calico_accountant_dropped_scrapes_total 1"));
    assert!(!fatal.is_cancelled());
}

#[tokio::test]
async fn test_grammar_error_trips_fatal_token() {
    let acc = accountant(GrammarErrorScanner, 0);
    let fatal = CancellationToken::new();

    let text = encode(&gather(&acc, &fatal).await).unwrap();

    assert!(fatal.is_cancelled());
    assert!(text.contains(r#"calico_accountant_scrape_errors_total{reason="parse"} 1"#));
    assert!(sample_lines(&text, ACCEPT_METRIC).is_empty());
}

async fn get(app: Router, path: &str) -> (StatusCode, String) {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_router_endpoints() {
    let acc = Arc::new(accountant(DumpScanner(DUMP), 0));
    let app = router(acc, CancellationToken::new());

    let (status, body) = get(app.clone(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ready");

    let (status, body) = get(app.clone(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"policy="allow-frontend""#));
    assert!(body.contains("calico_accountant_scrape_duration_seconds"));

    let (status, _) = get(app, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_readyz_unavailable_before_sync() {
    let acc = Arc::new(Accountant::new(
        Arc::new(ResourceCache::new("node-a")),
        DumpScanner(DUMP),
        0,
        Arc::new(HealthMetrics::new().unwrap()),
    ));
    let app = router(Arc::clone(&acc), CancellationToken::new());

    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "resource cache not synced");

    acc.cache().handle(SyncEvent::InSync);
    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_server_binds_and_stops() {
    let acc = Arc::new(accountant(DumpScanner(DUMP), 0));
    let server = MetricsServer::new("127.0.0.1:0", acc, CancellationToken::new());
    let addr = server.start().await.unwrap();

    TcpStream::connect(addr).await.unwrap();
    let (status, _) = get(server.router(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    server.stop().await.unwrap();
}
