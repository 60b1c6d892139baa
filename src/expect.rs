//! Assertions and requirements evaluated after a method's HTTP call.

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::Context;
use crate::error::ResolveError;
use crate::frame::Frame;
use crate::listener::panic_message;
use crate::resolve::Resolvable;
use crate::value::{compare_values, contains, length_of, stringify, values_equal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

impl CompareOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::GreaterThan => ordering == Ordering::Greater,
            CompareOp::LessThan => ordering == Ordering::Less,
            CompareOp::GreaterOrEqual => ordering != Ordering::Less,
            CompareOp::LessOrEqual => ordering != Ordering::Greater,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::GreaterThan => ">",
            CompareOp::LessThan => "<",
            CompareOp::GreaterOrEqual => ">=",
            CompareOp::LessOrEqual => "<=",
        }
    }
}

/// User check over the whole context
pub type PredicateFn = Arc<dyn Fn(&Context) -> anyhow::Result<bool> + Send + Sync>;

pub fn predicate<F>(check: F) -> PredicateFn
where
    F: Fn(&Context) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(check)
}

#[derive(Clone)]
pub enum Check {
    Status(u16),
    Equal(Resolvable, Resolvable),
    NotEqual(Resolvable, Resolvable),
    Compare(CompareOp, Resolvable, Resolvable),
    Len(Resolvable, usize),
    Contains(Resolvable, Resolvable),
    NotContains(Resolvable, Resolvable),
    /// Regex pattern, then the value matched against it
    Matches(String, Resolvable),
    Header(String, Resolvable),
    Predicate(String, PredicateFn),
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Status(code) => write!(f, "Status({})", code),
            Check::Equal(a, b) => write!(f, "Equal({}, {})", a, b),
            Check::NotEqual(a, b) => write!(f, "NotEqual({}, {})", a, b),
            Check::Compare(op, a, b) => write!(f, "Compare({} {} {})", a, op.symbol(), b),
            Check::Len(target, n) => write!(f, "Len({}, {})", target, n),
            Check::Contains(a, b) => write!(f, "Contains({}, {})", a, b),
            Check::NotContains(a, b) => write!(f, "NotContains({}, {})", a, b),
            Check::Matches(pattern, value) => write!(f, "Matches({:?}, {})", pattern, value),
            Check::Header(name, expected) => write!(f, "Header({:?}, {})", name, expected),
            Check::Predicate(description, _) => write!(f, "Predicate({:?})", description),
        }
    }
}

impl Check {
    /// Operands that may reference images, for validation before the run
    pub fn operands(&self) -> Vec<&Resolvable> {
        match self {
            Check::Equal(a, b)
            | Check::NotEqual(a, b)
            | Check::Compare(_, a, b)
            | Check::Contains(a, b)
            | Check::NotContains(a, b) => vec![a, b],
            Check::Len(target, _) | Check::Matches(_, target) | Check::Header(_, target) => vec![target],
            Check::Status(_) | Check::Predicate(..) => Vec::new(),
        }
    }
}

/// Outcome of one expectation
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub ok: bool,
    pub message: String,
}

impl Evaluation {
    fn pass() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expectation {
    /// Operator name as declared, e.g. `AssertOK` or `RequireEqual`
    pub name: String,
    /// Require forms abort the method when they fail
    pub must: bool,
    pub frame: Frame,
    pub check: Check,
}

/// Reason phrase for the status codes the builders name
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

fn render_status(code: u16) -> String {
    match status_text(code) {
        "" => code.to_string(),
        text => format!("{} ({})", code, text),
    }
}

impl Expectation {
    pub fn new(name: impl Into<String>, must: bool, check: Check, frame: Frame) -> Self {
        Self {
            name: name.into(),
            must,
            frame,
            check,
        }
    }

    /// Resolve operands and run the check. Resolution errors fail the
    /// evaluation with the error text.
    pub async fn evaluate(&self, ctx: &Context) -> Evaluation {
        match self.run_check(ctx).await {
            Ok(evaluation) => evaluation,
            Err(e) => Evaluation::fail(format!("{}: {}", self.name, e)),
        }
    }

    async fn run_check(&self, ctx: &Context) -> Result<Evaluation, ResolveError> {
        let evaluation = match &self.check {
            Check::Status(expected) => {
                let actual = ctx.last_response()?.status;
                if actual == *expected {
                    Evaluation::pass()
                } else {
                    Evaluation::fail(format!(
                        "{}: expected status {}, got {}",
                        self.name,
                        render_status(*expected),
                        render_status(actual)
                    ))
                }
            }
            Check::Equal(actual, expected) => {
                let (a, b) = (actual.resolve(ctx).await?, expected.resolve(ctx).await?);
                if values_equal(&a, &b) {
                    Evaluation::pass()
                } else {
                    Evaluation::fail(format!(
                        "{}: Not equal:\nexpected: {}\nactual  : {}\noperand : {}",
                        self.name, b, a, actual
                    ))
                }
            }
            Check::NotEqual(actual, expected) => {
                let (a, b) = (actual.resolve(ctx).await?, expected.resolve(ctx).await?);
                if values_equal(&a, &b) {
                    Evaluation::fail(format!(
                        "{}: Should not be: {}\noperand : {}",
                        self.name, a, actual
                    ))
                } else {
                    Evaluation::pass()
                }
            }
            Check::Compare(op, left, right) => {
                let (a, b) = (left.resolve(ctx).await?, right.resolve(ctx).await?);
                let ordering = compare_values(&a, &b)?;
                if op.holds(ordering) {
                    Evaluation::pass()
                } else {
                    Evaluation::fail(format!(
                        "{}: \"{}\" is not {} \"{}\"\noperand : {}",
                        self.name,
                        a,
                        op.symbol(),
                        b,
                        left
                    ))
                }
            }
            Check::Len(target, expected) => {
                let value = target.resolve(ctx).await?;
                let value = decode_text(ctx, value);
                let len = length_of(&value)?;
                if len == *expected {
                    Evaluation::pass()
                } else {
                    Evaluation::fail(format!(
                        "{}: \"{}\" should have {} item(s), but has {}",
                        self.name, target, expected, len
                    ))
                }
            }
            Check::Contains(haystack, needle) | Check::NotContains(haystack, needle) => {
                let negate = matches!(self.check, Check::NotContains(..));
                let (h, n) = (haystack.resolve(ctx).await?, needle.resolve(ctx).await?);
                let found = contains(&h, &n)?;
                if found != negate {
                    Evaluation::pass()
                } else if negate {
                    Evaluation::fail(format!("{}: {} should not contain {}", self.name, h, n))
                } else {
                    Evaluation::fail(format!("{}: {} does not contain {}", self.name, h, n))
                }
            }
            Check::Matches(pattern, target) => {
                let regex = Regex::new(pattern)
                    .map_err(|e| ResolveError::Custom(format!("invalid pattern {:?}: {}", pattern, e)))?;
                let text = stringify(&target.resolve(ctx).await?);
                if regex.is_match(&text) {
                    Evaluation::pass()
                } else {
                    Evaluation::fail(format!(
                        "{}: Expect \"{}\" to match \"{}\"",
                        self.name, text, pattern
                    ))
                }
            }
            Check::Header(name, expected) => {
                let expected = stringify(&expected.resolve(ctx).await?);
                match ctx.last_response()?.header(name) {
                    Some(actual) if actual == expected => Evaluation::pass(),
                    Some(actual) => Evaluation::fail(format!(
                        "{}: header {:?} expected {:?}, got {:?}",
                        self.name, name, expected, actual
                    )),
                    None => Evaluation::fail(format!("{}: header {:?} not present", self.name, name)),
                }
            }
            Check::Predicate(description, predicate) => {
                match catch_unwind(AssertUnwindSafe(|| predicate(ctx))) {
                    Ok(Ok(true)) => Evaluation::pass(),
                    Ok(Ok(false)) => Evaluation::fail(format!("{}: {} returned false", self.name, description)),
                    Ok(Err(e)) => Evaluation::fail(format!("{}: {}: {:#}", self.name, description, e)),
                    Err(panic) => Evaluation::fail(format!(
                        "{}: {} panicked: {}",
                        self.name,
                        description,
                        panic_message(panic.as_ref())
                    )),
                }
            }
        };
        Ok(evaluation)
    }
}

/// Strings holding JSON containers count their elements, not their characters
fn decode_text(ctx: &Context, value: Value) -> Value {
    match value {
        Value::String(text) if text.trim_start().starts_with(['[', '{']) => {
            ctx.parse_json_cached(&text).unwrap_or(Value::String(text))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::http::{HttpDoer, HttpRequest, HttpResponse};
    use crate::resolve::{body, json_path, status, var};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct NoopDoer;

    #[async_trait]
    impl HttpDoer for NoopDoer {
        async fn do_request(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse::new(200))
        }
    }

    fn context() -> Context {
        let mut ctx = Context::new(Arc::new(NoopDoer), "http://localhost");
        let response = HttpResponse::new(201)
            .with_header("Content-Type", "application/json")
            .with_json(&json!({"hello": "world", "items": [1, 2, 3], "count": 7}));
        ctx.set_last_response(response, Duration::from_millis(3));
        ctx
    }

    fn expect(name: &str, check: Check) -> Expectation {
        Expectation::new(name, name.starts_with("Require"), check, Frame::internal(name))
    }

    #[tokio::test]
    async fn test_status() {
        let ctx = context();
        assert!(expect("AssertCreated", Check::Status(201)).evaluate(&ctx).await.ok);
        let failed = expect("RequireOK", Check::Status(200)).evaluate(&ctx).await;
        assert!(!failed.ok);
        assert_eq!(failed.message, "RequireOK: expected status 200 (OK), got 201 (Created)");
    }

    #[tokio::test]
    async fn test_equal_is_numeric_and_deep() {
        let ctx = context();
        let check = Check::Equal(json_path(body(), "count"), 7.0.into());
        assert!(expect("AssertEqual", check).evaluate(&ctx).await.ok);

        let check = Check::Equal(
            json_path(body(), "items"),
            Resolvable::array([1u64, 2, 3]),
        );
        assert!(expect("AssertEqual", check).evaluate(&ctx).await.ok);

        let failed = expect("AssertEqual", Check::Equal(json_path(body(), "hello"), "moon".into()))
            .evaluate(&ctx)
            .await;
        assert!(!failed.ok);
        assert!(failed.message.contains("expected: \"moon\""));
        assert!(failed.message.contains("JsonPath(Body, \"hello\")"));
    }

    #[tokio::test]
    async fn test_resolution_errors_fail_the_evaluation() {
        let ctx = context();
        let failed = expect("AssertEqual", Check::Equal(var("missing"), 1.into()))
            .evaluate(&ctx)
            .await;
        assert!(!failed.ok);
        assert!(failed.message.contains("Variable not set: missing"));
    }

    #[tokio::test]
    async fn test_compare_len_contains() {
        let ctx = context();
        let gt = Check::Compare(CompareOp::GreaterThan, json_path(body(), "count"), 3.into());
        assert!(expect("AssertGreaterThan", gt).evaluate(&ctx).await.ok);
        let le = Check::Compare(CompareOp::LessOrEqual, status(), 200.into());
        assert!(!expect("AssertLessOrEqual", le).evaluate(&ctx).await.ok);

        assert!(expect("AssertLen", Check::Len(json_path(body(), "items"), 3)).evaluate(&ctx).await.ok);
        assert!(expect("AssertLen", Check::Len(body(), 3)).evaluate(&ctx).await.ok);

        let check = Check::Contains(json_path(body(), "items"), 2.into());
        assert!(expect("AssertContains", check).evaluate(&ctx).await.ok);
        let check = Check::NotContains(body(), "hello".into());
        assert!(!expect("AssertNotContains", check).evaluate(&ctx).await.ok);
    }

    #[tokio::test]
    async fn test_matches_and_header() {
        let ctx = context();
        let check = Check::Matches("^wor".to_string(), json_path(body(), "hello"));
        assert!(expect("AssertMatches", check).evaluate(&ctx).await.ok);
        let check = Check::Matches("(".to_string(), body());
        let failed = expect("AssertMatches", check).evaluate(&ctx).await;
        assert!(failed.message.contains("invalid pattern"));

        let check = Check::Header("content-type".to_string(), "application/json".into());
        assert!(expect("AssertHeader", check).evaluate(&ctx).await.ok);
        let check = Check::Header("X-Trace".to_string(), "1".into());
        assert!(!expect("AssertHeader", check).evaluate(&ctx).await.ok);
    }

    #[tokio::test]
    async fn test_predicate_panics_are_contained() {
        let ctx = context();
        let ok = predicate(|ctx: &Context| Ok(ctx.last_response()?.status == 201));
        assert!(expect("AssertThat", Check::Predicate("created".into(), ok)).evaluate(&ctx).await.ok);

        let boom = predicate(|_: &Context| panic!("boom"));
        let failed = expect("AssertThat", Check::Predicate("boom".into(), boom)).evaluate(&ctx).await;
        assert!(!failed.ok);
        assert!(failed.message.contains("panicked: boom"));
    }
}
