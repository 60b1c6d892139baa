mod mocks;

use apisuite::resolve::status;
use apisuite::{
    endpoint, options, CaptureBuffer, Endpoint, FailureKind, HttpResponse, Method, MethodOutcome, Sink, Suite,
};
use mocks::{request_line, HarnessEvent, MockDoer, RecordingHarness, ScriptedDoer, SlowDoer};
use std::time::Duration;

fn nested() -> Vec<Endpoint> {
    vec![Endpoint::new("/api", "")
        .method(Method::get("").assert_ok())
        .child(endpoint("/pets", "", vec![Method::get("list").assert_ok()]))]
}

#[tokio::test]
async fn test_attached_harness_sees_nested_nodes() {
    let mut doer = MockDoer::new();
    doer.expect_do_request()
        .times(2)
        .returning(|_| Ok(HttpResponse::new(200)));
    let harness = RecordingHarness::new();

    let suite = Suite::new(nested())
        .init(vec![options::http_do(doer), options::testing(harness.clone())])
        .await
        .unwrap();
    suite.run().await.unwrap();

    let begin = |name: &str| HarnessEvent::Begin(name.to_string());
    let end = |name: &str| HarnessEvent::End(name.to_string());
    assert_eq!(
        harness.events(),
        vec![
            begin("/api"),
            begin("/api/GET"),
            end("/api/GET"),
            begin("/api//pets"),
            begin("/api//pets/GET_list"),
            end("/api//pets/GET_list"),
            end("/api//pets"),
            end("/api"),
        ]
    );
}

#[tokio::test]
async fn test_stopped_ancestor_skips_children() {
    let doer = ScriptedDoer::new().status(200).status(200);
    let harness = RecordingHarness::new();
    harness.stop("/api");

    let suite = Suite::new(nested())
        .init(vec![options::http_do(doer.clone()), options::testing(harness.clone())])
        .await
        .unwrap();
    let report = suite.run_report().await;

    assert!(report
        .methods
        .iter()
        .all(|method| method.outcome == MethodOutcome::Skipped));
    assert!(doer.requests().is_empty());
    let skipped: Vec<_> = harness
        .events()
        .into_iter()
        .filter(|event| matches!(event, HarnessEvent::Skip(_)))
        .collect();
    assert_eq!(skipped.len(), 2);
}

#[tokio::test]
async fn test_standalone_output_annotates_failures() {
    let out = CaptureBuffer::new();
    let err = CaptureBuffer::new();
    let doer = ScriptedDoer::new().status(200).status(200);

    let endpoints = vec![Endpoint::new("/api", "")
        .method(Method::get("").assert_equal(status(), 201))
        .child(endpoint("/pets", "", vec![Method::get("list").assert_ok()]))];
    let suite = Suite::new(endpoints)
        .init(vec![options::http_do(doer.clone()), options::logging_sinks(out.sink(), err.sink())])
        .await
        .unwrap();
    let report = suite.run_report().await;
    assert_eq!(report.failure_count(), 1);

    let stdout = out.contents();
    let stderr = err.contents();
    assert!(stdout.contains("=== RUN   /api\n"));
    assert!(stdout.contains("=== RUN   /api/GET\n"));
    assert!(stdout.contains("--- PASS: /api//pets/GET_list ("));
    assert!(stderr.contains("--- FAIL: /api/GET ("));
    assert!(stderr.contains("--- FAIL: /api ("));
    assert!(stderr.contains("harness_tests.rs:"));
    assert!(stderr.contains("AssertEqual: Not equal:"));
    assert!(stderr.contains("        expected: 201"));
    assert!(stderr.contains("        actual  : 200"));

    let lines: Vec<String> = doer.requests().iter().map(request_line).collect();
    assert_eq!(
        lines,
        vec!["GET http://localhost:8080/api", "GET http://localhost:8080/api/pets"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_abandons_in_flight_call() {
    let suite = Suite::new(vec![endpoint("/slow", "", vec![Method::get("").assert_ok()])])
        .init(vec![
            options::http_do(SlowDoer {
                status: 200,
                delay: Duration::from_secs(10),
            }),
            options::logging_sinks(Sink::discard(), Sink::discard()),
        ])
        .await
        .unwrap();

    let cancellation = suite.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();
    });

    let report = suite.run_report().await;
    assert!(report.cancelled);
    let method = &report.methods[0];
    assert_eq!(method.outcome, MethodOutcome::Error);
    assert_eq!(method.failures[0].kind, FailureKind::Transport);
    assert!(method.failures[0].message.contains("cancelled"));
}
