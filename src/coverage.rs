//! Coverage of an OpenAPI document by the executed plan.
//!
//! Paths are matched structurally: every `{...}` segment is equivalent, so
//! `/pets/{petId}` in the document matches `/pets/{id}` in a declaration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;

use crate::error::SuiteError;
use crate::http::HttpMethod;

#[derive(Debug, Clone, Deserialize)]
struct OpenApiDocument {
    #[serde(default)]
    paths: HashMap<String, OpenApiPathItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OpenApiPathItem {
    get: Option<OpenApiOperation>,
    post: Option<OpenApiOperation>,
    put: Option<OpenApiOperation>,
    delete: Option<OpenApiOperation>,
    patch: Option<OpenApiOperation>,
    head: Option<OpenApiOperation>,
    options: Option<OpenApiOperation>,
}

impl OpenApiPathItem {
    fn operations(self) -> Vec<(HttpMethod, OpenApiOperation)> {
        [
            (HttpMethod::GET, self.get),
            (HttpMethod::POST, self.post),
            (HttpMethod::PUT, self.put),
            (HttpMethod::DELETE, self.delete),
            (HttpMethod::PATCH, self.patch),
            (HttpMethod::HEAD, self.head),
            (HttpMethod::OPTIONS, self.options),
        ]
        .into_iter()
        .filter_map(|(method, operation)| operation.map(|operation| (method, operation)))
        .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OpenApiOperation {
    // Keys may be unquoted integers in YAML, so they are read as raw values
    #[serde(default)]
    responses: serde_yaml::Mapping,
}

/// A declared response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExpectedStatus {
    Exact(u16),
    /// `2XX` style range; holds the leading digit
    Class(u16),
    Default,
}

impl ExpectedStatus {
    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        if code.eq_ignore_ascii_case("default") {
            return Some(ExpectedStatus::Default);
        }
        if code.len() == 3 && code[1..].eq_ignore_ascii_case("XX") {
            return code[..1].parse().ok().map(ExpectedStatus::Class);
        }
        code.parse().ok().map(ExpectedStatus::Exact)
    }

    pub fn matches(&self, status: u16) -> bool {
        match self {
            ExpectedStatus::Exact(code) => *code == status,
            ExpectedStatus::Class(class) => status / 100 == *class,
            ExpectedStatus::Default => true,
        }
    }
}

/// Matching key of a path template: every `{name}` segment becomes `{}` and
/// a trailing slash is dropped.
///
/// Placeholder names do not take part, so `/a/{id}` and `/a/{name}` are the
/// same operation. OpenAPI treats such templates as identical; a document
/// declaring both keeps the last one.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let path = if trimmed.is_empty() { "/" } else { trimmed };
    path.split('/')
        .map(|segment| {
            if segment.starts_with('{') && segment.ends_with('}') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct OperationKey {
    path: String,
    method: HttpMethod,
}

impl OperationKey {
    fn new(path: &str, method: HttpMethod) -> Self {
        Self {
            path: normalize_path(path),
            method,
        }
    }
}

#[derive(Debug, Clone)]
struct OasOperation {
    template: String,
    statuses: Vec<ExpectedStatus>,
}

/// Path/method/status table extracted from an OpenAPI 3 document
#[derive(Debug, Clone, Default)]
pub struct OasTable {
    operations: BTreeMap<OperationKey, OasOperation>,
}

impl OasTable {
    /// Parse a YAML or JSON OpenAPI document
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, SuiteError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SuiteError> {
        let document: OpenApiDocument =
            serde_yaml::from_str(text).map_err(|e| SuiteError::Oas(e.to_string()))?;

        let mut table = Self::default();
        for (path, item) in document.paths {
            for (method, operation) in item.operations() {
                let statuses = operation
                    .responses
                    .keys()
                    .filter_map(|code| match code {
                        serde_yaml::Value::Number(n) => ExpectedStatus::parse(&n.to_string()),
                        serde_yaml::Value::String(s) => ExpectedStatus::parse(s),
                        _ => None,
                    })
                    .collect();
                table.insert(&path, method, statuses);
            }
        }
        log::debug!("OpenAPI table has {} operation(s)", table.len());
        Ok(table)
    }

    pub fn insert(&mut self, path: &str, method: HttpMethod, statuses: Vec<ExpectedStatus>) {
        let replaced = self.operations.insert(
            OperationKey::new(path, method),
            OasOperation {
                template: path.to_string(),
                statuses,
            },
        );
        if let Some(previous) = replaced {
            log::warn!(
                "OpenAPI paths {} and {} ({}) match the same operation; keeping {}",
                previous.template,
                path,
                method,
                path
            );
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn contains(&self, path: &str, method: HttpMethod) -> bool {
        self.operations.contains_key(&OperationKey::new(path, method))
    }

    /// Declared response codes of an operation
    pub fn statuses(&self, path: &str, method: HttpMethod) -> Option<&[ExpectedStatus]> {
        self.operations
            .get(&OperationKey::new(path, method))
            .map(|operation| operation.statuses.as_slice())
    }

    fn distinct_paths(&self) -> BTreeSet<&str> {
        self.operations.keys().map(|key| key.path.as_str()).collect()
    }
}

/// One observed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSample {
    pub path: String,
    pub method: HttpMethod,
    pub status: u16,
}

/// `(total, covered, fraction)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ratio {
    pub total: usize,
    pub covered: usize,
    pub fraction: f64,
}

impl Ratio {
    fn new(total: usize, covered: usize) -> Self {
        let fraction = if total == 0 {
            0.0
        } else {
            covered as f64 / total as f64
        };
        Self {
            total,
            covered,
            fraction,
        }
    }

    pub fn as_tuple(&self) -> (usize, usize, f64) {
        (self.total, self.covered, self.fraction)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRef {
    pub path: String,
    pub method: HttpMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub path: String,
    pub method: HttpMethod,
    pub status: u16,
    pub count: usize,
}

/// Final coverage figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub paths: Ratio,
    pub methods: Ratio,
    /// Exercised operations missing from the document
    pub unmet: Vec<StatusCount>,
    /// Documented operations that returned an undocumented status
    pub failures: Vec<StatusCount>,
    /// Documented operations never exercised
    pub skipped: Vec<OperationRef>,
    /// Every documented operation/status pair that was observed
    pub statuses: Vec<StatusCount>,
}

impl CoverageReport {
    pub fn paths_covered(&self) -> (usize, usize, f64) {
        self.paths.as_tuple()
    }

    pub fn methods_covered(&self) -> (usize, usize, f64) {
        self.methods.as_tuple()
    }

    /// Hit counts bucketed into `2xx`, `3xx`, ... across known and unknown operations
    pub fn status_classes(&self) -> BTreeMap<String, usize> {
        let mut classes = BTreeMap::new();
        for entry in self.statuses.iter().chain(self.unmet.iter()) {
            *classes.entry(format!("{}xx", entry.status / 100)).or_insert(0) += entry.count;
        }
        classes
    }
}

/// Accumulates `(path template, method, status)` samples during a run
#[derive(Debug, Clone, Default)]
pub struct CoverageCollector {
    table: OasTable,
    hits: BTreeMap<OperationKey, BTreeMap<u16, usize>>,
    unknown: BTreeMap<(String, HttpMethod), BTreeMap<u16, usize>>,
    samples: Vec<CoverageSample>,
}

impl CoverageCollector {
    pub fn new(table: OasTable) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    pub fn table(&self) -> &OasTable {
        &self.table
    }

    pub fn record(&mut self, path: &str, method: HttpMethod, status: u16) {
        let key = OperationKey::new(path, method);
        let counts = if self.table.operations.contains_key(&key) {
            self.hits.entry(key).or_default()
        } else {
            log::debug!("{} {} is not in the OpenAPI document", method, path);
            self.unknown.entry((path.to_string(), method)).or_default()
        };
        *counts.entry(status).or_insert(0) += 1;
        self.samples.push(CoverageSample {
            path: path.to_string(),
            method,
            status,
        });
    }

    pub fn samples(&self) -> &[CoverageSample] {
        &self.samples
    }

    pub fn paths_covered(&self) -> (usize, usize, f64) {
        self.paths_ratio().as_tuple()
    }

    pub fn methods_covered(&self) -> (usize, usize, f64) {
        self.methods_ratio().as_tuple()
    }

    fn paths_ratio(&self) -> Ratio {
        let covered: BTreeSet<&str> = self.hits.keys().map(|key| key.path.as_str()).collect();
        Ratio::new(self.table.distinct_paths().len(), covered.len())
    }

    fn methods_ratio(&self) -> Ratio {
        Ratio::new(self.table.len(), self.hits.len())
    }

    pub fn report(&self) -> CoverageReport {
        let mut statuses = Vec::new();
        let mut failures = Vec::new();
        for (key, counts) in &self.hits {
            let Some(operation) = self.table.operations.get(key) else {
                continue;
            };
            for (status, count) in counts {
                let entry = StatusCount {
                    path: operation.template.clone(),
                    method: key.method,
                    status: *status,
                    count: *count,
                };
                if !operation.statuses.iter().any(|expected| expected.matches(*status)) {
                    failures.push(entry.clone());
                }
                statuses.push(entry);
            }
        }

        let unmet = self
            .unknown
            .iter()
            .flat_map(|((path, method), counts)| {
                counts.iter().map(move |(status, count)| StatusCount {
                    path: path.clone(),
                    method: *method,
                    status: *status,
                    count: *count,
                })
            })
            .collect();

        let skipped = self
            .table
            .operations
            .iter()
            .filter(|(key, _)| !self.hits.contains_key(*key))
            .map(|(key, operation)| OperationRef {
                path: operation.template.clone(),
                method: key.method,
            })
            .collect();

        CoverageReport {
            paths: self.paths_ratio(),
            methods: self.methods_ratio(),
            unmet,
            failures,
            skipped,
            statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PETSTORE: &str = r#"
openapi: 3.0.0
info:
  title: Petstore
  version: "1.0"
paths:
  /api/pets:
    get:
      responses:
        200:
          description: ok
    post:
      responses:
        "201":
          description: created
        4XX:
          description: client error
  /api/pets/{petId}:
    delete:
      responses:
        default:
          description: anything
"#;

    #[test]
    fn test_parse_yaml_document() {
        let table = OasTable::parse(PETSTORE).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.contains("/api/pets/{id}", HttpMethod::DELETE));
        assert_eq!(
            table.statuses("/api/pets", HttpMethod::GET).unwrap(),
            &[ExpectedStatus::Exact(200)]
        );
        assert!(table
            .statuses("/api/pets", HttpMethod::POST)
            .unwrap()
            .contains(&ExpectedStatus::Class(4)));
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{"openapi": "3.0.0", "paths": {"/api": {"get": {"responses": {"200": {"description": "ok"}}}}}}"#;
        let table = OasTable::from_reader(json.as_bytes()).unwrap();
        assert!(table.contains("/api", HttpMethod::GET));
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(OasTable::parse("paths: [1, 2"), Err(SuiteError::Oas(_))));
    }

    #[test]
    fn test_expected_status_parsing() {
        assert_eq!(ExpectedStatus::parse("204"), Some(ExpectedStatus::Exact(204)));
        assert_eq!(ExpectedStatus::parse("5xx"), Some(ExpectedStatus::Class(5)));
        assert_eq!(ExpectedStatus::parse("default"), Some(ExpectedStatus::Default));
        assert_eq!(ExpectedStatus::parse("abc"), None);
        assert!(ExpectedStatus::Class(4).matches(404));
        assert!(!ExpectedStatus::Class(4).matches(500));
    }

    #[test]
    fn test_report_partitions_hits() {
        let mut coverage = CoverageCollector::new(OasTable::parse(PETSTORE).unwrap());
        coverage.record("/api/pets", HttpMethod::GET, 200);
        coverage.record("/api/pets", HttpMethod::GET, 500);
        coverage.record("/api/pets", HttpMethod::POST, 422);
        coverage.record("/api/health", HttpMethod::GET, 200);

        let report = coverage.report();
        assert_eq!(report.paths_covered(), (2, 1, 0.5));
        let (total, covered, fraction) = report.methods_covered();
        assert_eq!((total, covered), (3, 2));
        assert!((fraction - 2.0 / 3.0).abs() < 1e-9);

        assert_eq!(report.unmet.len(), 1);
        assert_eq!(report.unmet[0].path, "/api/health");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].status, 500);
        assert_eq!(
            report.skipped,
            vec![OperationRef {
                path: "/api/pets/{petId}".to_string(),
                method: HttpMethod::DELETE
            }]
        );

        let classes = report.status_classes();
        assert_eq!(classes.get("2xx"), Some(&2));
        assert_eq!(classes.get("4xx"), Some(&1));
        assert_eq!(classes.get("5xx"), Some(&1));
    }

    #[test]
    fn test_coverage_never_decreases() {
        let mut coverage = CoverageCollector::new(OasTable::parse(PETSTORE).unwrap());
        let mut last = 0.0;
        for (path, method) in [
            ("/api/pets", HttpMethod::GET),
            ("/api/unknown", HttpMethod::GET),
            ("/api/pets/{id}", HttpMethod::DELETE),
            ("/api/pets", HttpMethod::GET),
        ] {
            coverage.record(path, method, 200);
            let (_, _, fraction) = coverage.methods_covered();
            assert!(fraction >= last);
            last = fraction;
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/pets/{petId}/toys/{toy}"), "/pets/{}/toys/{}");
        assert_eq!(normalize_path("/pets"), "/pets");
        assert_eq!(normalize_path("/pets/"), "/pets");
        assert_eq!(normalize_path("/pets/{id}/"), "/pets/{}");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/a/{id}"), normalize_path("/a/{name}"));
    }

    #[test]
    fn test_trailing_slash_matches_declared_path() {
        let mut coverage = CoverageCollector::new(OasTable::parse(PETSTORE).unwrap());
        coverage.record("/api/pets/", HttpMethod::GET, 200);
        let report = coverage.report();
        assert!(report.unmet.is_empty());
        assert_eq!(report.statuses.len(), 1);
        assert_eq!(report.statuses[0].status, 200);
    }
}
