mod mocks;

use apisuite::resolve::var;
use apisuite::{endpoint, options, Method, Sink, Suite, SuiteConfig, SuiteReport};
use mocks::ScriptedDoer;
use tempfile::TempDir;
use tokio::fs;

#[tokio::test]
async fn test_config_file_drives_a_run() {
    let temp_dir = TempDir::new().unwrap();
    let oas_path = temp_dir.path().join("openapi.yaml");
    let report_path = temp_dir.path().join("out").join("report.json");
    let config_path = temp_dir.path().join("suite.yaml");

    fs::write(
        &oas_path,
        r#"
openapi: 3.0.0
paths:
  /api/pets:
    get:
      responses:
        "200":
          description: ok
"#,
    )
    .await
    .unwrap();
    fs::write(
        &config_path,
        format!(
            r#"
api:
  host: pets.test
  port: 9000
repeats:
  count: 2
variables:
  owner: alice
oas_path: {}
report_path: {}
"#,
            oas_path.display(),
            report_path.display()
        ),
    )
    .await
    .unwrap();

    let config = SuiteConfig::load(&config_path).await.unwrap();
    assert_eq!(config.repeats.count, 2);

    let doer = ScriptedDoer::new().status(200).status(200);
    let mut suite_options = config.into_options().unwrap();
    suite_options.push(options::http_do(doer.clone()));
    suite_options.push(options::logging_sinks(Sink::discard(), Sink::discard()));

    let suite = Suite::new(vec![endpoint(
        "/api/pets",
        "",
        vec![Method::get("").query_param("owner", var("owner")).assert_ok()],
    )])
    .init(suite_options)
    .await
    .unwrap();
    let report = suite.run().await.unwrap();

    assert_eq!(report.repeats_run, 2);
    let requests = doer.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].url, "http://pets.test:9000/api/pets?owner=alice");

    let written = fs::read_to_string(&report_path).await.unwrap();
    let parsed: SuiteReport = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed.run_id, report.run_id);
    assert_eq!(parsed.coverage.unwrap().methods_covered(), (1, 1, 1.0));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("suite.toml");
    fs::write(&config_path, "[repeats]\ncount = 0\n").await.unwrap();

    let err = SuiteConfig::load(&config_path).await.unwrap_err();
    assert!(err.to_string().contains("validation failed"));
}
