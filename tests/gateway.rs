use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use rttp_gateway::cache::{
    CacheError, CacheOptions, Esi, HttpCache, Origin, Store, StoreError, TRACE_HEADER,
    UpstreamOrigin,
};
use rttp_gateway::http::{Method, Request, Response, StatusCode};
use rttp_gateway::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn get(path: &str) -> Request {
    Request::new(Method::Get, path)
        .unwrap()
        .header("Host", "example.com")
}

fn date(offset_secs: u64) -> String {
    httpdate::fmt_http_date(SystemTime::now() - Duration::from_secs(offset_secs))
}

fn body(response: &Response) -> String {
    String::from_utf8(response.content().unwrap().to_vec()).unwrap()
}

// `RUST_LOG=rttp_gateway=debug` shows the cache decisions of a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn gateway<O: Origin>(origin: O, options: CacheOptions) -> (HttpCache<O>, tempfile::TempDir) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).await.unwrap();
    (HttpCache::new(origin, store, options), dir)
}

fn counted<F>(calls: &Arc<AtomicUsize>, respond: F) -> impl Origin + use<F>
where
    F: Fn(usize, &Request) -> Response + Send + Sync + 'static,
{
    let calls = Arc::clone(calls);
    move |request: Request| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        let response = respond(n, &request);
        async move { response }
    }
}

// ── Freshness ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_entry_is_served_without_origin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .header("Content-Type", "text/plain")
            .body("hello")
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;

    let (first, trace) = cache.handle_traced(get("/a")).await.unwrap();
    assert_eq!(trace.events("GET /a"), ["miss", "store"]);
    assert_eq!(body(&first), "hello");
    assert!(!first.headers().contains("x-content-digest"));

    let (second, trace) = cache.handle_traced(get("/a")).await.unwrap();
    assert_eq!(trace.events("GET /a"), ["fresh"]);
    assert_eq!(second.status(), StatusCode::Ok);
    assert_eq!(body(&second), "hello");
    assert_eq!(second.headers().get("content-length"), Some("5"));
    assert_eq!(second.headers().get("content-type"), Some("text/plain"));
    let age: i64 = second.headers().get("age").unwrap().parse().unwrap();
    assert!((0..=1).contains(&age));
    assert_eq!(second.ttl(SystemTime::now()).map(|ttl| ttl >= 59), Some(true));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_entry_is_revalidated_with_304() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, request| {
        let validated = request
            .headers()
            .get("if-none-match")
            .is_some_and(|tags| tags.contains("\"v1\""));
        if validated {
            Response::new(StatusCode::NotModified)
                .header("ETag", "\"v1\"")
                .header("Cache-Control", "max-age=60")
        } else {
            Response::new(StatusCode::Ok)
                .header("Date", date(61))
                .header("Cache-Control", "max-age=60")
                .header("ETag", "\"v1\"")
                .body("payload")
        }
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;

    let (_, trace) = cache.handle_traced(get("/b")).await.unwrap();
    assert_eq!(trace.events("GET /b"), ["miss", "store"]);

    let (response, trace) = cache.handle_traced(get("/b")).await.unwrap();
    assert_eq!(trace.events("GET /b"), ["stale", "valid", "store"]);
    assert_eq!(response.status(), StatusCode::Ok);
    assert_eq!(body(&response), "payload");
    assert!(response.is_fresh(SystemTime::now()));

    let (_, trace) = cache.handle_traced(get("/b")).await.unwrap();
    assert_eq!(trace.events("GET /b"), ["fresh"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!cache.store().is_locked(&get("/b")).await);
}

#[tokio::test]
async fn client_validators_get_304_from_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .header("ETag", "\"abc\"")
            .body("payload")
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    cache.handle(get("/c")).await.unwrap();

    let conditional = get("/c").header("If-None-Match", "\"abc\"");
    let response = cache.handle(conditional).await.unwrap();
    assert_eq!(response.status(), StatusCode::NotModified);
    assert_eq!(response.content().map(|b| b.len()), Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn default_ttl_applies_only_without_freshness_information() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, request| match request.path() {
        "/plain" => Response::new(StatusCode::Ok).body("plain"),
        _ => Response::new(StatusCode::Ok)
            .header("Cache-Control", "must-revalidate")
            .body("strict"),
    });
    let options = CacheOptions {
        default_ttl: 30,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(origin, options).await;

    let (response, trace) = cache.handle_traced(get("/plain")).await.unwrap();
    assert_eq!(trace.events("GET /plain"), ["miss", "store"]);
    assert_eq!(response.cache_control().shared_max_age(), Some(30));

    let (_, trace) = cache.handle_traced(get("/strict")).await.unwrap();
    assert_eq!(trace.events("GET /strict"), ["miss"]);
}

// ── Request classification ────────────────────────────────────────────────────

#[tokio::test]
async fn post_invalidates_stored_get() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |n, request| match *request.method() {
        Method::Post => Response::new(StatusCode::Ok).body("updated"),
        _ => Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body(format!("version {n}")),
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;

    assert_eq!(body(&cache.handle(get("/d")).await.unwrap()), "version 0");

    let post = Request::new(Method::Post, "/d")
        .unwrap()
        .header("Host", "example.com")
        .with_body("x=1");
    let (response, trace) = cache.handle_traced(post.clone()).await.unwrap();
    assert_eq!(trace.events("POST /d"), ["pass", "invalidate"]);
    assert_eq!(body(&response), "updated");

    // A second invalidation finds nothing fresh and changes nothing.
    let (_, trace) = cache.handle_traced(post).await.unwrap();
    assert_eq!(trace.events("POST /d"), ["pass", "invalidate"]);

    let (response, trace) = cache.handle_traced(get("/d")).await.unwrap();
    assert_eq!(trace.events("GET /d"), ["stale", "invalid", "store"]);
    assert_eq!(body(&response), "version 3");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn redirect_target_is_invalidated_too() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, request| match *request.method() {
        Method::Post => Response::new(StatusCode::SeeOther).header("Location", "/list"),
        _ => Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body("list"),
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    cache.handle(get("/list")).await.unwrap();

    let post = Request::new(Method::Post, "/items")
        .unwrap()
        .header("Host", "example.com");
    cache.handle(post).await.unwrap();

    let (_, trace) = cache.handle_traced(get("/list")).await.unwrap();
    assert_eq!(trace.events("GET /list")[0], "stale");
}

#[tokio::test]
async fn private_requests_are_not_stored() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, request| {
        let response = Response::new(StatusCode::Ok).body("secret");
        if request.path() == "/public" {
            response.header("Cache-Control", "public, max-age=60")
        } else {
            response.header("Cache-Control", "max-age=60")
        }
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let authorized = |path: &str| get(path).header("Authorization", "Bearer t");

    let (response, trace) = cache.handle_traced(authorized("/me")).await.unwrap();
    assert_eq!(trace.events("GET /me"), ["miss"]);
    assert!(response.cache_control().is_private());
    let (_, trace) = cache.handle_traced(authorized("/me")).await.unwrap();
    assert_eq!(trace.events("GET /me"), ["miss"]);

    let (_, trace) = cache.handle_traced(authorized("/public")).await.unwrap();
    assert_eq!(trace.events("GET /public"), ["miss", "store"]);
}

#[tokio::test]
async fn reload_needs_allow_reload() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body("x")
    });
    let no_cache = || get("/r").header("Cache-Control", "no-cache");

    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    cache.handle(get("/r")).await.unwrap();
    let (_, trace) = cache.handle_traced(no_cache()).await.unwrap();
    assert_eq!(trace.events("GET /r"), ["fresh"]);

    let origin = counted(&calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body("y")
    });
    let options = CacheOptions {
        allow_reload: true,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(origin, options).await;
    cache.handle(get("/r")).await.unwrap();
    let (response, trace) = cache.handle_traced(no_cache()).await.unwrap();
    assert_eq!(trace.events("GET /r"), ["reload", "store"]);
    assert_eq!(body(&response), "y");
}

#[tokio::test]
async fn client_max_age_forces_revalidation_when_allowed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Date", date(10))
            .header("Cache-Control", "max-age=60")
            .body("x")
    });
    let options = CacheOptions {
        allow_revalidate: true,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(origin, options).await;
    cache.handle(get("/m")).await.unwrap();

    let (_, trace) = cache
        .handle_traced(get("/m").header("Cache-Control", "max-age=30"))
        .await
        .unwrap();
    assert_eq!(trace.events("GET /m"), ["fresh"]);

    let (_, trace) = cache
        .handle_traced(get("/m").header("Cache-Control", "max-age=0"))
        .await
        .unwrap();
    assert_eq!(trace.events("GET /m")[0], "stale");
}

#[tokio::test]
async fn vary_keeps_one_entry_per_header_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, request| {
        let language = request.headers().get("accept-language").unwrap_or("en");
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .header("Vary", "Accept-Language")
            .body(format!("lang={language}"))
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let in_language = |lang: &str| get("/v").header("Accept-Language", lang);

    assert_eq!(body(&cache.handle(in_language("en")).await.unwrap()), "lang=en");
    assert_eq!(body(&cache.handle(in_language("de")).await.unwrap()), "lang=de");

    let (response, trace) = cache.handle_traced(in_language("en")).await.unwrap();
    assert_eq!(trace.events("GET /v"), ["fresh"]);
    assert_eq!(body(&response), "lang=en");
    let (response, trace) = cache.handle_traced(in_language("de")).await.unwrap();
    assert_eq!(trace.events("GET /v"), ["fresh"]);
    assert_eq!(body(&response), "lang=de");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ── Stampede protection ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stale_lookups_hit_origin_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let origin = move |_request: Request| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                return Response::new(StatusCode::Ok)
                    .header("Date", date(61))
                    .header("Cache-Control", "max-age=60")
                    .header("ETag", "\"old\"")
                    .body("old");
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            Response::new(StatusCode::Ok)
                .header("Cache-Control", "max-age=60")
                .body("new")
        }
    };
    let options = CacheOptions {
        stale_while_revalidate: 0,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(origin, options).await;
    cache.handle(get("/hot")).await.unwrap();
    let cache = Arc::new(cache);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.handle(get("/hot")).await })
        })
        .collect();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(body(&response), "new");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn lock_wait_times_out_with_503() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Date", date(120))
            .header("Cache-Control", "max-age=60")
            .header("ETag", "\"old\"")
            .body("old")
    });
    let options = CacheOptions {
        lock_timeout_ms: 200,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(origin, options).await;
    cache.handle(get("/slow")).await.unwrap();
    cache.store().lock(&get("/slow")).await.unwrap();

    let (response, trace) = cache.handle_traced(get("/slow")).await.unwrap();
    assert_eq!(response.status(), StatusCode::ServiceUnavailable);
    assert_eq!(response.headers().get("retry-after"), Some("10"));
    assert!(trace.contains("lock-timeout"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.store().unlock(&get("/slow")).await.unwrap();
}

#[tokio::test]
async fn slightly_stale_entry_is_served_while_another_request_revalidates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Date", date(60))
            .header("Cache-Control", "max-age=60")
            .header("ETag", "\"old\"")
            .body("old")
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    cache.handle(get("/swr")).await.unwrap();
    cache.store().lock(&get("/swr")).await.unwrap();

    let (response, trace) = cache.handle_traced(get("/swr")).await.unwrap();
    assert_eq!(trace.events("GET /swr"), ["stale-while-revalidate", "fresh"]);
    assert_eq!(body(&response), "old");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ── Origin failures ───────────────────────────────────────────────────────────

#[tokio::test]
async fn stale_entry_stands_in_for_failing_origin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |n, _| {
        if n == 0 {
            Response::new(StatusCode::Ok)
                .header("Date", date(61))
                .header("Cache-Control", "max-age=60")
                .header("ETag", "\"e\"")
                .body("cached")
        } else {
            Response::new(StatusCode::ServiceUnavailable).body("down")
        }
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    cache.handle(get("/sie")).await.unwrap();

    let (response, trace) = cache.handle_traced(get("/sie")).await.unwrap();
    assert!(trace.contains("stale-if-error"));
    assert_eq!(response.status(), StatusCode::Ok);
    assert_eq!(body(&response), "cached");
}

#[tokio::test]
async fn unreachable_upstream_is_a_502() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let (cache, _dir) = gateway(UpstreamOrigin::new(addr), CacheOptions::default()).await;
    let (response, trace) = cache.handle_traced(get("/down")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BadGateway);
    assert_eq!(trace.events("GET /down"), ["miss"]);
}

#[tokio::test]
async fn negative_max_age_cannot_overflow_grace_checks() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |n, _| {
        if n == 0 {
            Response::new(StatusCode::Ok)
                .header("ETag", "\"o\"")
                .header("Cache-Control", "max-age=-9223372036854775808")
                .body("kept")
        } else {
            Response::new(StatusCode::ServiceUnavailable)
        }
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    cache.handle(get("/o")).await.unwrap();

    let (response, trace) = cache.handle_traced(get("/o")).await.unwrap();
    assert!(trace.contains("stale-if-error"));
    assert_eq!(body(&response), "kept");
}

// ── Store failures ────────────────────────────────────────────────────────────

fn corrupt_metadata(store: &Store, request: &Request) {
    let path = store.path_for(&Store::cache_key(request));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, br#"{"version": 9, "variants": []}"#).unwrap();
}

fn plain_origin(calls: &Arc<AtomicUsize>) -> impl Origin {
    counted(calls, |_, _| {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body("origin")
    })
}

#[tokio::test]
async fn unreadable_metadata_passes_through() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (cache, _dir) = gateway(plain_origin(&calls), CacheOptions::default()).await;
    corrupt_metadata(cache.store(), &get("/broken"));

    let (response, trace) = cache.handle_traced(get("/broken")).await.unwrap();
    assert_eq!(trace.events("GET /broken"), ["lookup-failed", "pass"]);
    assert_eq!(body(&response), "origin");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreadable_metadata_is_an_error_in_debug_mode() {
    let calls = Arc::new(AtomicUsize::new(0));
    let options = CacheOptions {
        debug: true,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(plain_origin(&calls), options).await;
    corrupt_metadata(cache.store(), &get("/broken"));

    let err = cache.handle(get("/broken")).await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Store(StoreError::UnsupportedVersion { version: 9, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_store_write_still_answers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (cache, dir) = gateway(plain_origin(&calls), CacheOptions::default()).await;
    // Every body digest starts with `en`, so a file there blocks all blob writes.
    std::fs::write(dir.path().join("en"), b"").unwrap();

    let (response, trace) = cache.handle_traced(get("/unstored")).await.unwrap();
    assert_eq!(trace.events("GET /unstored"), ["miss", "store-failed"]);
    assert_eq!(response.status(), StatusCode::Ok);
    assert_eq!(body(&response), "origin");

    let (_, trace) = cache.handle_traced(get("/unstored")).await.unwrap();
    assert_eq!(trace.events("GET /unstored"), ["miss", "store-failed"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_invalidation_is_swallowed_unless_debugging() {
    let post = || {
        Request::new(Method::Post, "/inv")
            .unwrap()
            .header("Host", "example.com")
    };

    let calls = Arc::new(AtomicUsize::new(0));
    let (cache, _dir) = gateway(plain_origin(&calls), CacheOptions::default()).await;
    corrupt_metadata(cache.store(), &get("/inv"));
    let (response, trace) = cache.handle_traced(post()).await.unwrap();
    assert_eq!(trace.events("POST /inv"), ["pass", "invalidate-failed"]);
    assert_eq!(body(&response), "origin");

    let options = CacheOptions {
        debug: true,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(plain_origin(&calls), options).await;
    corrupt_metadata(cache.store(), &get("/inv"));
    let err = cache.handle(post()).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
}

// ── Fragment inclusion ────────────────────────────────────────────────────────

fn esi_page(fragment_status: StatusCode, tag: &'static str) -> impl Fn(usize, &Request) -> Response {
    move |_: usize, request: &Request| match request.path() {
        "/page" => Response::new(StatusCode::Ok)
            .header("Content-Type", "text/html")
            .header("Cache-Control", "max-age=60")
            .header("Surrogate-Control", r#"content="ESI/1.0""#)
            .body(format!("<p>before</p>{tag}<p>after</p>")),
        "/frag" => Response::new(fragment_status)
            .header("Cache-Control", "max-age=60")
            .body("NAV"),
        _ => Response::new(StatusCode::NotFound),
    }
}

#[tokio::test]
async fn fragments_are_included_and_cached_separately() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, esi_page(StatusCode::Ok, r#"<esi:include src="/frag" />"#));
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let cache = cache.with_esi(Esi::default());

    let (response, trace) = cache.handle_traced(get("/page")).await.unwrap();
    assert_eq!(body(&response), "<p>before</p>NAV<p>after</p>");
    assert_eq!(response.headers().get("content-length"), Some("28"));
    assert!(!response.headers().contains("x-body-eval"));
    assert!(!response.headers().contains("surrogate-control"));
    assert_eq!(trace.events("GET /page"), ["miss", "store"]);
    assert_eq!(trace.events("GET /frag"), ["miss", "store"]);

    let (response, trace) = cache.handle_traced(get("/page")).await.unwrap();
    assert_eq!(body(&response), "<p>before</p>NAV<p>after</p>");
    assert_eq!(trace.to_string(), "GET /page: fresh; GET /frag: fresh");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_fragment_with_continue_renders_empty() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(
        &calls,
        esi_page(
            StatusCode::InternalServerError,
            r#"<esi:include src="/frag" onerror="continue" />"#,
        ),
    );
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let cache = cache.with_esi(Esi::default());

    let response = cache.handle(get("/page")).await.unwrap();
    assert_eq!(response.status(), StatusCode::Ok);
    assert_eq!(body(&response), "<p>before</p><p>after</p>");
}

#[tokio::test]
async fn failed_fragment_without_continue_fails_the_page() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(
        &calls,
        esi_page(StatusCode::InternalServerError, r#"<esi:include src="/frag" />"#),
    );
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let cache = cache.with_esi(Esi::default());

    let err = cache.handle(get("/page")).await.unwrap_err();
    assert!(matches!(err, CacheError::Inclusion { .. }));

    let response = cache.respond(get("/page")).await;
    assert_eq!(response.status(), StatusCode::InternalServerError);
}

#[tokio::test]
async fn alt_source_is_tried_after_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(
        &calls,
        esi_page(
            StatusCode::NotFound,
            r#"<esi:include src="/missing" alt="/frag" />"#,
        ),
    );
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let cache = cache.with_esi(Esi::default());

    // `/frag` answers 404 here too, so only a page with `alt` pointing at a
    // working fragment renders.
    assert!(cache.handle(get("/page")).await.is_err());

    let origin = counted(&calls, |_, request| match request.path() {
        "/page" => Response::new(StatusCode::Ok)
            .header("Surrogate-Control", r#"content="ESI/1.0""#)
            .body(r#"[<esi:include src="/missing" alt="/ok" />]"#),
        "/ok" => Response::new(StatusCode::Ok).body("alt"),
        _ => Response::new(StatusCode::NotFound),
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let cache = cache.with_esi(Esi::default());
    assert_eq!(body(&cache.handle(get("/page")).await.unwrap()), "[alt]");
}

fn secret_origin(secret_hits: &Arc<AtomicUsize>) -> impl Origin {
    let calls = Arc::new(AtomicUsize::new(0));
    let secret_hits = Arc::clone(secret_hits);
    counted(&calls, move |_, request| match request.path() {
        "/secret" => {
            secret_hits.fetch_add(1, Ordering::SeqCst);
            Response::new(StatusCode::Ok).body("SECRET")
        }
        "/frag" => Response::new(StatusCode::Ok).body("NAV"),
        "/raw" => Response::new(StatusCode::Ok)
            .header("X-Body-Eval", "ESI")
            .header("X-Content-Digest", "enforged")
            .body(r#"<!--esi:deferred src="/secret"-->"#),
        _ => Response::new(StatusCode::Ok)
            .header("Surrogate-Control", r#"content="ESI/1.0""#)
            .body(r#"<p>user comment: <!--esi:deferred src="/secret"--></p><esi:include src="/frag" />"#),
    })
}

#[tokio::test]
async fn marker_text_from_the_origin_is_not_expanded() {
    let secret_hits = Arc::new(AtomicUsize::new(0));
    let (cache, _dir) = gateway(secret_origin(&secret_hits), CacheOptions::default()).await;
    let cache = cache.with_esi(Esi::default());

    let response = cache.handle(get("/comments")).await.unwrap();
    assert_eq!(
        body(&response),
        r#"<p>user comment: <!-- esi:deferred src="/secret"--></p>NAV"#
    );

    let response = cache.handle(get("/raw")).await.unwrap();
    assert_eq!(body(&response), r#"<!--esi:deferred src="/secret"-->"#);
    assert!(!response.headers().contains("x-content-digest"));

    assert_eq!(secret_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn self_including_fragment_stops_at_max_depth() {
    let origin = |_request: Request| async {
        Response::new(StatusCode::Ok)
            .header("Surrogate-Control", r#"content="ESI/1.0""#)
            .body(r#"<esi:include src="/loop" />"#)
    };
    let options = CacheOptions {
        max_depth: 3,
        ..CacheOptions::default()
    };
    let (cache, _dir) = gateway(origin, options).await;
    let cache = cache.with_esi(Esi::default());

    let err = cache.handle(get("/loop")).await.unwrap_err();
    assert!(matches!(err, CacheError::DepthExceeded { max: 3, .. }));
}

// ── Debugging and serving ─────────────────────────────────────────────────────

#[tokio::test]
async fn debug_mode_exposes_trace_header() {
    let origin = |_request: Request| async {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body("x")
    };
    let options = CacheOptions::from_json(r#"{"debug": true}"#).unwrap();
    let (cache, _dir) = gateway(origin, options).await;

    let response = cache.handle(get("/t")).await.unwrap();
    assert_eq!(response.headers().get(TRACE_HEADER), Some("GET /t: miss, store"));
    let response = cache.handle(get("/t")).await.unwrap();
    assert_eq!(response.headers().get(TRACE_HEADER), Some("GET /t: fresh"));
}

#[tokio::test]
async fn serves_cached_responses_over_tcp() {
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counted(&calls, |_, request| {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body(format!("path={}", request.path()))
    });
    let (cache, _dir) = gateway(origin, CacheOptions::default()).await;
    let cache = Arc::new(cache);

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let handler_cache = Arc::clone(&cache);
    tokio::spawn(server.run_until(
        move |request| {
            let cache = Arc::clone(&handler_cache);
            async move { cache.respond(request).await }
        },
        async move {
            let _ = stopped.await;
        },
    ));

    for _ in 0..2 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /tcp HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\npath=/tcp"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let _ = stop.send(());
}
