use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use reef_bridge::{script_spawn_handler, ExecutionBridge, Fd, HostCall, PollInterest, WakeValue};
use reef_server::{
    DispatcherConfig, Headers, RequestBody, RequestDispatcher, RewriteRule, ServeError,
    ServerRequest, SELF_REQUEST_HEADER, SELF_REQUEST_ISSUER, STATIC_MARKER_HEADER,
};
use reef_vm::{
    EngineCtx, EngineStep, InstanceFactory, InstanceParts, Runtime, RuntimeConfig, ScriptEngine,
    UploadedFile, VirtFs,
};

fn dispatcher_for(runtime: Arc<Runtime>) -> RequestDispatcher {
    RequestDispatcher::new(runtime, DispatcherConfig::default()).unwrap()
}

fn echo_runtime() -> Arc<Runtime> {
    Arc::new(
        Runtime::with_echo_engine(RuntimeConfig {
            document_root: "/www".to_string(),
            max_requests: 0,
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn get_index_script_round_trips() {
    let runtime = echo_runtime();
    runtime.write_file("/www/index.php", "Hi").unwrap();
    let dispatcher = dispatcher_for(Arc::clone(&runtime));

    let response = dispatcher
        .serve(ServerRequest {
            method: Some("GET".to_string()),
            ..ServerRequest::get("/index.php")
        })
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "Hi");
}

#[tokio::test]
async fn missing_static_file_is_404_with_fallback_marker() {
    let runtime = echo_runtime();
    let dispatcher = dispatcher_for(runtime);

    let response = dispatcher
        .serve(ServerRequest::get("/missing.png"))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.header(STATIC_MARKER_HEADER), Some("static"));
    assert_eq!(response.text(), "404 File not found");
}

#[tokio::test]
async fn static_hit_carries_inferred_content_type_and_length() {
    let runtime = echo_runtime();
    runtime.write_file("/www/style.css", "body{}").unwrap();
    let dispatcher = dispatcher_for(runtime);

    let response = dispatcher
        .serve(ServerRequest::get("/style.css"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/css"));
    assert_eq!(response.header("content-length"), Some("6"));
    assert_eq!(response.header("cache-control"), Some("public, max-age=0"));
    assert_eq!(response.text(), "body{}");
}

#[tokio::test]
async fn dynamic_path_without_script_resolves_to_404() {
    let runtime = echo_runtime();
    let dispatcher = dispatcher_for(runtime);

    let response = dispatcher
        .serve(ServerRequest::get("/no-such-dir/"))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.header(STATIC_MARKER_HEADER), None);
    assert_eq!(response.text(), "404 File not found");
}

#[tokio::test]
async fn extensionless_paths_fall_back_to_the_root_index_script() {
    let runtime = echo_runtime();
    runtime.write_file("/www/index.php", "front controller").unwrap();
    let dispatcher = dispatcher_for(runtime);

    let response = dispatcher
        .serve(ServerRequest::get("/pretty-permalink"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "front controller");
}

#[tokio::test]
async fn directory_paths_use_their_index_script() {
    let runtime = echo_runtime();
    runtime.mkdir_tree("/www/admin").unwrap();
    runtime
        .write_file("/www/admin/index.php", "admin index")
        .unwrap();
    let dispatcher = dispatcher_for(runtime);

    let response = dispatcher
        .serve(ServerRequest::get("/admin/"))
        .await
        .unwrap();
    assert_eq!(response.text(), "admin index");
}

#[tokio::test]
async fn path_info_style_urls_truncate_at_the_script_extension() {
    let runtime = echo_runtime();
    runtime.write_file("/www/handler.php", "handled").unwrap();
    let dispatcher = dispatcher_for(runtime);

    let response = dispatcher
        .serve(ServerRequest::get("/handler.php/extra/path/info"))
        .await
        .unwrap();
    assert_eq!(response.text(), "handled");
}

#[tokio::test]
async fn percent_encoded_paths_are_decoded_before_resolution() {
    let runtime = echo_runtime();
    runtime.write_file("/www/with space.php", "spaced").unwrap();
    let dispatcher = dispatcher_for(runtime);

    let response = dispatcher
        .serve(ServerRequest::get("/with%20space.php"))
        .await
        .unwrap();
    assert_eq!(response.text(), "spaced");
}

#[tokio::test]
async fn body_and_form_and_files_force_post() {
    let runtime = echo_runtime();
    runtime.write_file("/www/index.php", "x").unwrap();
    let dispatcher = dispatcher_for(runtime);

    let with_body = dispatcher
        .serve(ServerRequest {
            body: Some(RequestBody::Bytes(b"raw".to_vec())),
            ..ServerRequest::get("/index.php")
        })
        .await
        .unwrap();
    assert_eq!(with_body.header("x-request-method"), Some("POST"));

    let with_form = dispatcher
        .serve(ServerRequest {
            body: Some(RequestBody::Form(vec![(
                "field".to_string(),
                "value".to_string(),
            )])),
            ..ServerRequest::get("/index.php")
        })
        .await
        .unwrap();
    assert_eq!(with_form.header("x-request-method"), Some("POST"));

    let with_files = dispatcher
        .serve(ServerRequest {
            files: vec![UploadedFile {
                key: "upload".to_string(),
                name: "a.txt".to_string(),
                mime: "text/plain".to_string(),
                data: b"abc".to_vec(),
            }],
            ..ServerRequest::get("/index.php")
        })
        .await
        .unwrap();
    assert_eq!(with_files.header("x-request-method"), Some("POST"));

    let plain = dispatcher
        .serve(ServerRequest::get("/index.php"))
        .await
        .unwrap();
    assert_eq!(plain.header("x-request-method"), Some("GET"));

    let explicit = dispatcher
        .serve(ServerRequest {
            method: Some("PUT".to_string()),
            body: Some(RequestBody::Bytes(b"raw".to_vec())),
            ..ServerRequest::get("/index.php")
        })
        .await
        .unwrap();
    assert_eq!(explicit.header("x-request-method"), Some("PUT"));
}

#[tokio::test]
async fn uploaded_files_are_bound_into_the_instance_tmp_dir() {
    let runtime = echo_runtime();
    runtime.write_file("/www/index.php", "x").unwrap();
    let dispatcher = dispatcher_for(Arc::clone(&runtime));

    dispatcher
        .serve(ServerRequest {
            files: vec![UploadedFile {
                key: "photo".to_string(),
                name: "cat.png".to_string(),
                mime: "image/png".to_string(),
                data: vec![1, 2, 3],
            }],
            ..ServerRequest::get("/index.php")
        })
        .await
        .unwrap();

    let tmp_entries = runtime.list_dir("/tmp", false).unwrap();
    assert!(
        tmp_entries.iter().any(|name| name.starts_with("upload_")),
        "no bound upload in /tmp: {tmp_entries:?}"
    );
}

#[tokio::test]
async fn cookies_accumulate_across_dispatches() {
    let runtime = echo_runtime();
    runtime
        .write_file(
            "/www/login.php",
            "#!header: Set-Cookie: session=abc; Path=/\nwelcome\n",
        )
        .unwrap();
    runtime
        .write_file("/www/whoami.php", "#!echo-header: cookie\n")
        .unwrap();
    let dispatcher = dispatcher_for(runtime);

    dispatcher
        .serve(ServerRequest::get("/login.php"))
        .await
        .unwrap();
    let response = dispatcher
        .serve(ServerRequest::get("/whoami.php"))
        .await
        .unwrap();
    assert_eq!(response.text(), "session=abc\n");

    dispatcher.reset_cookies();
    let response = dispatcher
        .serve(ServerRequest::get("/whoami.php"))
        .await
        .unwrap();
    assert_eq!(response.text(), "\n");
}

#[tokio::test]
async fn request_supplied_cookies_append_after_the_jar() {
    let runtime = echo_runtime();
    runtime
        .write_file("/www/login.php", "#!header: Set-Cookie: name=jar\n")
        .unwrap();
    runtime
        .write_file("/www/whoami.php", "#!echo-header: cookie\n")
        .unwrap();
    let dispatcher = dispatcher_for(runtime);

    dispatcher
        .serve(ServerRequest::get("/login.php"))
        .await
        .unwrap();

    let mut headers = Headers::new();
    headers.append("cookie", "name=request");
    let response = dispatcher
        .serve(ServerRequest {
            headers,
            ..ServerRequest::get("/whoami.php")
        })
        .await
        .unwrap();
    // Jar value first, request value last: a last-occurrence parse makes
    // the request-supplied value win.
    assert_eq!(response.text(), "name=jar; name=request\n");
}

#[tokio::test]
async fn rewrite_rules_apply_first_match_wins() {
    let runtime = echo_runtime();
    runtime.write_file("/www/index.php", "rewritten").unwrap();
    let dispatcher = RequestDispatcher::new(
        runtime,
        DispatcherConfig {
            rewrite_rules: vec![
                RewriteRule::new(r"^/pretty/\d+$", "/index.php").unwrap(),
                RewriteRule::new(r"^/pretty/.*$", "/missing.php").unwrap(),
            ],
            ..DispatcherConfig::default()
        },
    )
    .unwrap();

    let response = dispatcher
        .serve(ServerRequest::get("/pretty/42"))
        .await
        .unwrap();
    assert_eq!(response.text(), "rewritten");
}

#[tokio::test]
async fn host_header_is_synthesized_from_the_base_url() {
    let runtime = echo_runtime();
    runtime
        .write_file("/www/host.php", "#!echo-header: host\n")
        .unwrap();
    let dispatcher = RequestDispatcher::new(
        runtime,
        DispatcherConfig {
            base_url: "https://play.example.org:8443/scope".to_string(),
            ..DispatcherConfig::default()
        },
    )
    .unwrap();

    let response = dispatcher
        .serve(ServerRequest::get("/scope/host.php"))
        .await
        .unwrap();
    assert_eq!(response.text(), "play.example.org:8443\n");
}

#[tokio::test]
async fn malformed_absolute_urls_are_rejected() {
    let runtime = echo_runtime();
    let dispatcher = dispatcher_for(runtime);

    let err = dispatcher
        .serve(ServerRequest::get("http://[not-a-host/"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServeError::BadUrl { .. }));
}

#[tokio::test]
async fn self_request_while_gate_held_fails_fast_with_502() {
    let runtime = echo_runtime();
    runtime
        .set_spawn_handler(script_spawn_handler(|_command, mut api| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                api.exit(0);
            });
        }))
        .unwrap();
    runtime
        .write_file("/www/slow.php", "#!spawn: sleep\n")
        .unwrap();
    runtime.write_file("/www/index.php", "x").unwrap();
    let dispatcher = Arc::new(dispatcher_for(runtime));

    let slow = Arc::clone(&dispatcher);
    let slow_task = tokio::spawn(async move { slow.serve(ServerRequest::get("/slow.php")).await });

    // Give the slow request time to take the gate.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(dispatcher.is_request_running());

    let mut headers = Headers::new();
    headers.append(SELF_REQUEST_HEADER, SELF_REQUEST_ISSUER);
    let started = Instant::now();
    let response = dispatcher
        .serve(ServerRequest {
            headers,
            ..ServerRequest::get("/index.php")
        })
        .await
        .unwrap();
    assert_eq!(response.status, 502);
    assert_eq!(response.text(), "502 Bad Gateway");
    assert!(started.elapsed() < Duration::from_millis(200));

    slow_task.await.unwrap().unwrap();
}

/// Engine that records how many requests are inside the critical section
/// at once, parking each request on a short poll so overlap would show.
struct ConcurrencyProbe {
    fd: Fd,
    active: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    parked: bool,
}

impl ScriptEngine for ConcurrencyProbe {
    fn boot(&mut self, _fs: &mut VirtFs, _config: &reef_vm::BootConfig) -> Result<()> {
        Ok(())
    }

    fn step(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        _resumed: Option<WakeValue>,
    ) -> Result<EngineStep> {
        if !self.parked {
            self.parked = true;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            return Ok(EngineStep::Blocked(HostCall::PollDescriptor {
                fd: self.fd,
                interest: PollInterest::READABLE,
                timeout: Some(Duration::from_millis(20)),
            }));
        }
        self.parked = false;
        self.active.fetch_sub(1, Ordering::SeqCst);
        ctx.fs.mkdir_tree("/tmp")?;
        ctx.fs.write_file(reef_vm::STDOUT_PATH, "ok")?;
        ctx.fs.write_file(reef_vm::STDERR_PATH, "")?;
        ctx.fs.write_file(
            reef_vm::HEADERS_PATH,
            serde_json::json!({ "status": 200, "headers": [] }).to_string(),
        )?;
        Ok(EngineStep::Done { exit_code: 0 })
    }
}

struct ProbeFactory {
    active: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

impl InstanceFactory for ProbeFactory {
    fn create(&self) -> Result<InstanceParts> {
        let mut fs = VirtFs::new();
        fs.mkdir_tree("/tmp")?;
        fs.mkdir_tree("/www")?;
        let bridge = Arc::new(ExecutionBridge::new());
        let fd = bridge.alloc_fd();
        bridge.sockets.register_socket(fd, false);
        bridge.sockets.connect_peer(fd).unwrap();
        Ok(InstanceParts {
            fs,
            bridge,
            engine: Box::new(ConcurrencyProbe {
                fd,
                active: Arc::clone(&self.active),
                max_seen: Arc::clone(&self.max_seen),
                parked: false,
            }),
        })
    }
}

#[tokio::test]
async fn concurrent_serves_never_overlap_in_the_critical_section() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let runtime = Arc::new(
        Runtime::new(
            Arc::new(ProbeFactory {
                active: Arc::clone(&active),
                max_seen: Arc::clone(&max_seen),
            }),
            RuntimeConfig::default(),
        )
        .unwrap(),
    );
    runtime.write_file("/www/index.php", "unused").unwrap();
    let dispatcher = Arc::new(dispatcher_for(runtime));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let dispatcher = Arc::clone(&dispatcher);
        tasks.push(tokio::spawn(async move {
            dispatcher.serve(ServerRequest::get("/index.php")).await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn four_hundred_requests_rotate_and_preserve_files() {
    let runtime = Arc::new(
        Runtime::with_echo_engine(RuntimeConfig {
            document_root: "/www".to_string(),
            max_requests: 400,
        })
        .unwrap(),
    );
    runtime.write_file("/www/index.php", "Hi").unwrap();
    let dispatcher = dispatcher_for(Arc::clone(&runtime));

    for i in 0..400 {
        if i == 10 {
            runtime.write_file("/www/written-mid-run.txt", "kept").unwrap();
        }
        let response = dispatcher
            .serve(ServerRequest::get("/index.php"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }
    assert_eq!(runtime.generation(), 1, "request 401 runs on a fresh instance");

    let response = dispatcher
        .serve(ServerRequest::get("/index.php"))
        .await
        .unwrap();
    assert_eq!(response.text(), "Hi");
    assert_eq!(
        runtime.read_file_to_string("/www/written-mid-run.txt").unwrap(),
        "kept"
    );
}
