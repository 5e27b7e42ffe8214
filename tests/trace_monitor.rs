mod common;

use common::{device, fast_config, wait_until, Harness, RecordingHook, CLIENT_MAC, GATEWAY_MAC};
use devtrace::device::DeviceHandle;
use devtrace::error::{ConnectionError, SearchError, TraceError};
use devtrace::events::{ConnectionState, SearchOutcome, TraceSource};
use devtrace::registry::MonitorRegistry;
use devtrace::search::SearchRequest;
use devtrace::session::{
    CommandType, ConnectionProvider, CrashHook, ScriptedConnect, ScriptedConnectionProvider,
    ScriptedLivenessProbe, Session,
};
use devtrace::tracelog::TraceLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_boot_then_wifi_scenario() {
    let harness = Harness::new(vec![ScriptedConnect::stream(
        [
            "2024 Jan 01 00:00:00.000000 BOOT COMPLETE",
            "2024 Jan 01 00:00:01.000000 WIFI UP",
        ],
        true,
    )]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.is_monitoring_started()));

    let wifi = monitor
        .search_and_wait_for_trace("WIFI UP", Duration::from_millis(5000), false, true, false)
        .unwrap();
    assert_eq!(wifi.as_deref(), Some("2024 Jan 01 00:00:01.000000 WIFI UP"));

    let boot = monitor
        .search_and_wait_for_trace("BOOT COMPLETE", Duration::from_millis(300), false, true, false)
        .unwrap();
    assert_eq!(boot, None);

    // Still there when scanning from the first line
    let boot = monitor
        .search_and_wait_for_trace("BOOT COMPLETE", Duration::from_millis(300), true, true, false)
        .unwrap();
    assert!(boot.unwrap().ends_with("BOOT COMPLETE"));

    monitor.stop_trace();
}

#[test]
fn test_existing_match_returns_immediately() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["READY"], true)]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_last_trace_line().is_some()));

    let started = Instant::now();
    let found = monitor
        .search_and_wait_for_trace("READY", Duration::from_secs(10), true, true, false)
        .unwrap();
    assert_eq!(found.as_deref(), Some("READY"));
    assert!(started.elapsed() < Duration::from_secs(1));

    monitor.stop_trace();
}

#[test]
fn test_search_times_out_on_schedule() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["noise"], true)]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_last_trace_line().is_some()));

    let started = Instant::now();
    let found = monitor
        .search_and_wait_for_trace("NEVER", Duration::from_millis(500), true, true, false)
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(found, None);
    assert!(elapsed >= Duration::from_millis(400), "returned after {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(650), "returned after {:?}", elapsed);

    monitor.stop_trace();
}

#[test]
fn test_search_before_start_is_not_running() {
    let harness = Harness::new(Vec::new());
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();

    let result =
        monitor.search_and_wait_for_trace("BOOT", Duration::from_millis(100), true, true, false);
    assert!(matches!(
        result,
        Err(TraceError::Search(SearchError::NotRunning(_)))
    ));
}

#[test]
fn test_wait_for_trace_string_ignores_old_lines() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["READY"], true)]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_last_trace_line().is_some()));

    assert!(!monitor
        .wait_for_trace_string("READY", Duration::from_millis(200))
        .unwrap());

    let provider = harness.provider.clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        provider.feed("READY again");
    });
    assert!(monitor
        .wait_for_trace_string("READY", Duration::from_secs(5))
        .unwrap());
    feeder.join().unwrap();

    monitor.stop_trace();
}

#[test]
fn test_wait_for_trace_string_restores_buffering() {
    let harness = Harness::with_config(vec![ScriptedConnect::stream(["boot"], true)], |c| {
        c.trace.buffer_on_start = false;
    });
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_trace_status()
        == ConnectionState::Connected));
    assert!(!monitor.is_buffering());

    let provider = harness.provider.clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        provider.feed("LOGIN PROMPT");
    });
    assert!(monitor
        .wait_for_trace_string("LOGIN", Duration::from_secs(5))
        .unwrap());
    feeder.join().unwrap();
    assert!(!monitor.is_buffering());

    monitor.stop_trace();
}

#[test]
fn test_stop_twice_leaves_disconnected() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["line"], true)]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_last_trace_line().is_some()));

    monitor.stop_trace();
    assert_eq!(monitor.get_trace_status(), ConnectionState::Disconnected);
    assert_eq!(monitor.get_last_trace_line(), None);
    assert!(harness.provider.is_stream_closed(0));

    monitor.stop_trace();
    assert_eq!(monitor.get_trace_status(), ConnectionState::Disconnected);
}

#[test]
fn test_start_is_idempotent() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["line"], true)]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_trace_status()
        == ConnectionState::Connected));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.provider.connect_count(), 1);
    monitor.stop_trace();
}

#[test]
fn test_failures_below_budget_keep_connecting() {
    let harness = Harness::with_config(Vec::new(), |c| {
        c.reconnect.max_attempts = 1_000;
        c.reconnect.retry_delay_ms = 20;
    });
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || harness.provider.connect_count() >= 3));
    assert_eq!(monitor.get_trace_status(), ConnectionState::Connecting);
    assert!(monitor.last_failure().is_some());
    assert!(!monitor.is_monitoring_started());

    monitor.stop_trace();
    assert_eq!(monitor.get_trace_status(), ConnectionState::Disconnected);
}

#[test]
fn test_failures_then_success_connect() {
    let harness = Harness::with_config(
        vec![
            ScriptedConnect::Refuse("connection refused".to_string()),
            ScriptedConnect::Refuse("connection refused".to_string()),
            ScriptedConnect::stream(["UP"], true),
        ],
        |c| c.reconnect.max_attempts = 5,
    );
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || monitor.get_last_trace_line().as_deref() == Some("UP")));
    assert_eq!(monitor.get_trace_status(), ConnectionState::Connected);
    assert_eq!(harness.provider.connect_count(), 3);

    monitor.stop_trace();
}

#[test]
fn test_budget_exhausted_leaves_disconnected() {
    let harness = Harness::with_config(Vec::new(), |c| c.reconnect.max_attempts = 3);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || {
        harness.provider.connect_count() == 3
            && monitor.get_trace_status() == ConnectionState::Disconnected
    }));
    let failure = monitor.last_failure().unwrap();
    assert!(failure.reason.contains("script exhausted"));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(harness.provider.connect_count(), 3);
    assert_eq!(monitor.get_trace_status(), ConnectionState::Disconnected);
}

#[test]
fn test_gateway_cascade() {
    let harness = Harness::new(vec![
        ScriptedConnect::stream(["trace"], true),
        ScriptedConnect::stream(["trace"], true),
    ]);
    let gateway = harness.registry.register(device(GATEWAY_MAC)).unwrap();
    let client = harness
        .registry
        .register(device(CLIENT_MAC).with_gateway(GATEWAY_MAC))
        .unwrap();

    client.start_trace().unwrap();
    assert!(wait_until(WAIT, || {
        client.get_trace_status() == ConnectionState::Connected
            && gateway.get_trace_status() == ConnectionState::Connected
    }));
    assert_eq!(harness.provider.connect_count(), 2);

    client.stop_buffering();
    assert!(!gateway.is_buffering());
    client.start_buffering();
    assert!(gateway.is_buffering());

    client.stop_trace();
    assert_eq!(client.get_trace_status(), ConnectionState::Disconnected);
    assert_eq!(gateway.get_trace_status(), ConnectionState::Disconnected);
}

#[test]
fn test_gateway_does_not_cascade_to_client() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["trace"], true)]);
    let gateway = harness.registry.register(device(GATEWAY_MAC)).unwrap();
    let client = harness
        .registry
        .register(device(CLIENT_MAC).with_gateway(GATEWAY_MAC))
        .unwrap();

    gateway.start_trace().unwrap();
    assert!(wait_until(WAIT, || gateway.get_trace_status()
        == ConnectionState::Connected));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(client.get_trace_status(), ConnectionState::Disconnected);
    assert_eq!(harness.provider.connect_count(), 1);

    gateway.stop_trace();
}

#[test]
fn test_client_without_registered_gateway() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["trace"], true)]);
    let client = harness
        .registry
        .register(device(CLIENT_MAC).with_gateway(GATEWAY_MAC))
        .unwrap();

    client.start_trace().unwrap();
    assert!(wait_until(WAIT, || client.get_trace_status()
        == ConnectionState::Connected));
    assert_eq!(harness.provider.connect_count(), 1);
    client.stop_trace();
}

#[test]
fn test_additional_logger_interleaved() {
    let harness = Harness::with_config(
        vec![
            ScriptedConnect::stream(["primary boot"], true),
            ScriptedConnect::stream(["console boot"], true),
        ],
        |c| c.trace.additional_trace_support = Some("XB6,atom,telnet,cat /dev/console".to_string()),
    );
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.is_monitoring_started()));

    assert!(monitor
        .search_and_wait_for_trace("console boot", WAIT, true, true, false)
        .unwrap()
        .is_some());
    assert!(monitor
        .search_and_wait_for_trace("primary boot", WAIT, true, true, false)
        .unwrap()
        .is_some());

    // A stalled console stream does not hold back the primary one
    assert!(harness.provider.feed_stream(0, "primary later"));
    assert!(monitor
        .search_and_wait_for_trace("primary later", WAIT, true, true, false)
        .unwrap()
        .is_some());

    monitor.stop_trace();
    let path = TraceLog::path_for(harness.dir.path(), &device(CLIENT_MAC));
    let contents = std::fs::read_to_string(path).unwrap();
    assert!(contents.contains(&format!("[{}][[atom]]console boot", CLIENT_MAC)));
    assert!(contents.contains(&format!("[{}][TC-INIT-1000]primary boot", CLIENT_MAC)));
}

#[test]
fn test_prompt_answered_transparently() {
    let harness = Harness::with_config(
        vec![ScriptedConnect::stream(["Password:"], true)],
        |c| {
            c.connection.prompts = vec![devtrace::config::PromptRule {
                pattern: "^Password:".to_string(),
                response: "hunter2".to_string(),
            }]
        },
    );
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || harness
        .provider
        .written_lines()
        .contains(&"hunter2".to_string())));
    monitor.stop_trace();
}

#[test]
fn test_size_cap_stops_device_trace() {
    let long = "y".repeat(700);
    let harness = Harness::with_config(
        vec![ScriptedConnect::stream(
            (0..5).map(|i| format!("{} {}", long, i)).collect::<Vec<_>>(),
            true,
        )],
        |c| c.trace.size_limit_kb = 1,
    );
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || monitor.is_monitoring_started()
        && monitor.get_trace_status() == ConnectionState::Disconnected));
    assert!(harness.provider.is_stream_closed(0));

    // Restarting refuses while the file is over its cap
    assert!(matches!(monitor.start_trace(), Err(TraceError::TraceLog(_))));
}

#[test]
fn test_probe_failure_then_recovery() {
    let harness = Harness::new(vec![
        ScriptedConnect::stream(["first"], true),
        ScriptedConnect::stream(["second"], true),
    ]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_trace_status()
        == ConnectionState::Connected));

    harness.probe.set_alive(false);
    assert!(wait_until(WAIT, || harness.provider.is_stream_closed(0)));
    assert!(wait_until(WAIT, || monitor.get_trace_status()
        == ConnectionState::Connecting));

    harness.probe.set_alive(true);
    assert!(wait_until(WAIT, || {
        harness.provider.connect_count() == 2
            && monitor.get_trace_status() == ConnectionState::Connected
    }));
    assert!(monitor
        .search_and_wait_for_trace("second", WAIT, true, true, false)
        .unwrap()
        .is_some());

    monitor.stop_trace();
}

#[test]
fn test_tracing_switch_disables_start() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["line"], true)]);
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    harness.registry.tracing_switch().set_enabled(false);

    monitor.start_trace().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.provider.connect_count(), 0);
    assert_eq!(monitor.get_trace_status(), ConnectionState::Disconnected);
}

#[test]
fn test_registry_stop_all() {
    let harness = Harness::new(vec![
        ScriptedConnect::stream(["a"], true),
        ScriptedConnect::stream(["b"], true),
    ]);
    let first = harness.registry.register(device(CLIENT_MAC)).unwrap();
    let second = harness.registry.register(device(GATEWAY_MAC)).unwrap();
    first.start_trace().unwrap();
    second.start_trace().unwrap();
    assert!(wait_until(WAIT, || {
        first.get_trace_status() == ConnectionState::Connected
            && second.get_trace_status() == ConnectionState::Connected
    }));

    harness.registry.stop_all();
    assert_eq!(first.get_trace_status(), ConnectionState::Disconnected);
    assert_eq!(second.get_trace_status(), ConnectionState::Disconnected);
}

#[test]
fn test_crash_hook_sees_admitted_lines_when_enabled() {
    let hook = Arc::new(RecordingHook::default());
    let harness = Harness::build(
        vec![ScriptedConnect::stream(["Kernel panic - not syncing", "", "rebooting"], true)],
        Some(hook.clone() as Arc<dyn CrashHook>),
        |c| c.trace.crash_analysis = true,
    );
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || hook.texts().len() == 2));
    assert_eq!(hook.texts(), vec!["Kernel panic - not syncing", "rebooting"]);
    monitor.stop_trace();
}

#[test]
fn test_crash_hook_idle_when_analysis_disabled() {
    let hook = Arc::new(RecordingHook::default());
    let harness = Harness::build(
        vec![ScriptedConnect::stream(["Kernel panic - not syncing", "rebooting"], true)],
        Some(hook.clone() as Arc<dyn CrashHook>),
        |c| c.trace.crash_analysis = false,
    );
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || monitor.get_last_trace_line().as_deref() == Some("rebooting")));
    assert!(hook.texts().is_empty());
    monitor.stop_trace();
}

#[test]
fn test_gateway_serving_clients_tags_lines() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["gateway boot"], true)]);
    let gateway = harness.registry.register(device(GATEWAY_MAC)).unwrap();
    harness
        .registry
        .register(device(CLIENT_MAC).with_gateway(GATEWAY_MAC))
        .unwrap();

    gateway.start_trace().unwrap();
    assert!(wait_until(WAIT, || gateway.is_monitoring_started()));

    let request = SearchRequest {
        from_start: true,
        ..SearchRequest::new("gateway boot", WAIT)
    };
    match gateway.search(&request).unwrap() {
        SearchOutcome::Found(line) => assert_eq!(line.source, TraceSource::Gateway),
        other => panic!("expected a match, got {:?}", other),
    }
    gateway.stop_trace();
}

#[test]
fn test_standalone_device_tags_lines_primary() {
    let harness = Harness::new(vec![ScriptedConnect::stream(["boot"], true)]);
    let monitor = harness.registry.register(device(GATEWAY_MAC)).unwrap();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.is_monitoring_started()));

    let request = SearchRequest {
        from_start: true,
        ..SearchRequest::new("boot", WAIT)
    };
    match monitor.search(&request).unwrap() {
        SearchOutcome::Found(line) => assert_eq!(line.source, TraceSource::Primary),
        other => panic!("expected a match, got {:?}", other),
    }
    monitor.stop_trace();
}

#[test]
fn test_suppressed_repeats_counted() {
    let harness = Harness::with_config(
        vec![ScriptedConnect::stream(["same", "same", "same", "same", "next"], true)],
        |c| c.trace.duplicate_line_limit = 2,
    );
    let monitor = harness.registry.register(device(CLIENT_MAC)).unwrap();
    monitor.start_trace().unwrap();

    assert!(wait_until(WAIT, || monitor.get_last_trace_line().as_deref() == Some("nextsame")));
    assert_eq!(monitor.suppressed_line_count(), 2);
    monitor.stop_trace();
}

/// First connect blocks longer than the stop timeout, then fails
struct SlowFirstConnect {
    first: AtomicBool,
    inner: ScriptedConnectionProvider,
}

impl ConnectionProvider for SlowFirstConnect {
    fn get_connection(&self, device: &DeviceHandle) -> Result<Box<dyn Session>, ConnectionError> {
        if self.first.swap(false, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(400));
            return Err(ConnectionError::ConnectFailed("slow refuse".to_string()));
        }
        self.inner.get_connection(device)
    }

    fn execute(
        &self,
        device: &DeviceHandle,
        session: &mut dyn Session,
        command_type: CommandType,
        command: &str,
    ) -> Result<(), ConnectionError> {
        self.inner.execute(device, session, command_type, command)
    }
}

#[test]
fn test_restart_unaffected_by_slow_stopped_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.reconnect.stop_join_timeout_ms = 50;
    let provider = Arc::new(SlowFirstConnect {
        first: AtomicBool::new(true),
        inner: ScriptedConnectionProvider::with_script([ScriptedConnect::stream(["up"], true)]),
    });
    let registry =
        MonitorRegistry::new(config, provider, Arc::new(ScriptedLivenessProbe::new(true)));
    let monitor = registry.register(device(CLIENT_MAC)).unwrap();

    monitor.start_trace().unwrap();
    thread::sleep(Duration::from_millis(50));
    monitor.stop_trace();
    monitor.start_trace().unwrap();
    assert!(wait_until(WAIT, || monitor.get_trace_status()
        == ConnectionState::Connected));

    // The stopped run's connect fails while the new run is live
    thread::sleep(Duration::from_millis(600));
    assert_eq!(monitor.get_trace_status(), ConnectionState::Connected);
    assert!(monitor.last_failure().is_none());
    monitor.stop_trace();
}
