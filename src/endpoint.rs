//! Declarative endpoint tree.
//!
//! Builders consume and return `self`, so a declared method is an immutable
//! value. Every builder is `#[track_caller]` and records where the user
//! declared the operation.

use std::fmt;
use std::time::Duration;

use crate::context::Context;
use crate::expect::{predicate, Check, CompareOp, Expectation};
use crate::frame::Frame;
use crate::hooks::{self, Hook, When};
use crate::http::HttpMethod;
use crate::plan::RequestBody;
use crate::resolve::Resolvable;

/// Path segment plus its methods and child endpoints, in declaration order
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub path: String,
    pub description: String,
    pub items: Vec<EndpointItem>,
    pub frame: Frame,
}

#[derive(Debug, Clone)]
pub enum EndpointItem {
    Method(Method),
    Child(Endpoint),
}

impl From<Method> for EndpointItem {
    fn from(method: Method) -> Self {
        EndpointItem::Method(method)
    }
}

impl From<Endpoint> for EndpointItem {
    fn from(endpoint: Endpoint) -> Self {
        EndpointItem::Child(endpoint)
    }
}

impl Endpoint {
    #[track_caller]
    pub fn new(path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            description: description.into(),
            items: Vec::new(),
            frame: Frame::caller("Endpoint"),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.items.push(EndpointItem::Method(method));
        self
    }

    pub fn child(mut self, endpoint: Endpoint) -> Self {
        self.items.push(EndpointItem::Child(endpoint));
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.items.iter().filter_map(|item| match item {
            EndpointItem::Method(method) => Some(method),
            EndpointItem::Child(_) => None,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = &Endpoint> {
        self.items.iter().filter_map(|item| match item {
            EndpointItem::Child(endpoint) => Some(endpoint),
            EndpointItem::Method(_) => None,
        })
    }
}

/// `Endpoint(path, description, children...)`
#[track_caller]
pub fn endpoint<I>(path: impl Into<String>, description: impl Into<String>, items: I) -> Endpoint
where
    I: IntoIterator,
    I::Item: Into<EndpointItem>,
{
    let mut endpoint = Endpoint::new(path, description);
    endpoint.items.extend(items.into_iter().map(Into::into));
    endpoint
}

/// One HTTP call with its hooks and expectations
#[derive(Clone)]
pub struct Method {
    pub verb: HttpMethod,
    pub description: String,
    pub path_params: Vec<Resolvable>,
    pub query: Vec<(String, Resolvable)>,
    pub headers: Vec<(String, Resolvable)>,
    pub body: RequestBody,
    /// Before and after hooks in declaration order; phases are split when
    /// the tree is flattened
    pub hooks: Vec<Hook>,
    pub expectations: Vec<Expectation>,
    pub frame: Frame,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("verb", &self.verb)
            .field("description", &self.description)
            .field("hooks", &self.hooks.len())
            .field("expectations", &self.expectations.len())
            .field("frame", &self.frame)
            .finish()
    }
}

macro_rules! status_expectations {
    ($($assert:ident, $require:ident, $label:literal, $code:expr;)*) => {
        $(
            #[track_caller]
            pub fn $assert(self) -> Self {
                self.expect(concat!("Assert", $label), false, Check::Status($code), stringify!($assert))
            }

            #[track_caller]
            pub fn $require(self) -> Self {
                self.expect(concat!("Require", $label), true, Check::Status($code), stringify!($require))
            }
        )*
    };
}

macro_rules! comparison_expectations {
    ($($assert:ident, $require:ident, $label:literal, $op:expr;)*) => {
        $(
            #[track_caller]
            pub fn $assert(self, actual: impl Into<Resolvable>, bound: impl Into<Resolvable>) -> Self {
                let check = Check::Compare($op, actual.into(), bound.into());
                self.expect(concat!("Assert", $label), false, check, stringify!($assert))
            }

            #[track_caller]
            pub fn $require(self, actual: impl Into<Resolvable>, bound: impl Into<Resolvable>) -> Self {
                let check = Check::Compare($op, actual.into(), bound.into());
                self.expect(concat!("Require", $label), true, check, stringify!($require))
            }
        )*
    };
}

impl Method {
    #[track_caller]
    pub fn new(verb: HttpMethod, description: impl Into<String>) -> Self {
        Self {
            verb,
            description: description.into(),
            path_params: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            hooks: Vec::new(),
            expectations: Vec::new(),
            frame: Frame::caller(format!("Method({})", verb)),
        }
    }

    #[track_caller]
    pub fn get(description: impl Into<String>) -> Self {
        Self::new(HttpMethod::GET, description)
    }

    #[track_caller]
    pub fn post(description: impl Into<String>) -> Self {
        Self::new(HttpMethod::POST, description)
    }

    #[track_caller]
    pub fn put(description: impl Into<String>) -> Self {
        Self::new(HttpMethod::PUT, description)
    }

    #[track_caller]
    pub fn patch(description: impl Into<String>) -> Self {
        Self::new(HttpMethod::PATCH, description)
    }

    #[track_caller]
    pub fn delete(description: impl Into<String>) -> Self {
        Self::new(HttpMethod::DELETE, description)
    }

    #[track_caller]
    pub fn head(description: impl Into<String>) -> Self {
        Self::new(HttpMethod::HEAD, description)
    }

    #[track_caller]
    pub fn options(description: impl Into<String>) -> Self {
        Self::new(HttpMethod::OPTIONS, description)
    }

    /// Next positional value for the cumulative path template
    pub fn path_param(mut self, value: impl Into<Resolvable>) -> Self {
        self.path_params.push(value.into());
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<Resolvable>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Resolvable>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn request_body(mut self, body: impl Into<Resolvable>) -> Self {
        self.body = RequestBody::Value(body.into());
        self
    }

    /// Body sent verbatim
    pub fn raw_body(mut self, bytes: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        self.body = RequestBody::Raw {
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
        };
        self
    }

    /// `Do(hook)`
    pub fn perform(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    #[track_caller]
    pub fn capture_func<F>(self, when: When, callback: F) -> Self
    where
        F: Fn(&mut Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.perform(hooks::capture_func(when, callback))
    }

    #[track_caller]
    pub fn wait(self, when: When, millis: u64) -> Self {
        self.perform(hooks::wait(when, millis))
    }

    #[track_caller]
    pub fn wait_for(self, when: When, duration: Duration) -> Self {
        let mut hook = hooks::wait(when, 0);
        hook.action = hooks::HookAction::Wait(duration);
        self.perform(hook)
    }

    #[track_caller]
    pub fn set_var(self, when: When, name: impl Into<String>, value: impl Into<Resolvable>) -> Self {
        self.perform(hooks::set_var(when, name, value))
    }

    #[track_caller]
    fn expect(mut self, name: &str, must: bool, check: Check, builder: &str) -> Self {
        let frame = Frame::caller(format!("Method::{}", builder));
        self.expectations.push(Expectation::new(name, must, check, frame));
        self
    }

    status_expectations! {
        assert_ok, require_ok, "OK", 200;
        assert_created, require_created, "Created", 201;
        assert_accepted, require_accepted, "Accepted", 202;
        assert_no_content, require_no_content, "NoContent", 204;
        assert_bad_request, require_bad_request, "BadRequest", 400;
        assert_unauthorized, require_unauthorized, "Unauthorized", 401;
        assert_forbidden, require_forbidden, "Forbidden", 403;
        assert_not_found, require_not_found, "NotFound", 404;
        assert_conflict, require_conflict, "Conflict", 409;
        assert_unprocessable_entity, require_unprocessable_entity, "UnprocessableEntity", 422;
        assert_internal_server_error, require_internal_server_error, "InternalServerError", 500;
    }

    comparison_expectations! {
        assert_greater_than, require_greater_than, "GreaterThan", CompareOp::GreaterThan;
        assert_less_than, require_less_than, "LessThan", CompareOp::LessThan;
        assert_greater_or_equal, require_greater_or_equal, "GreaterOrEqual", CompareOp::GreaterOrEqual;
        assert_less_or_equal, require_less_or_equal, "LessOrEqual", CompareOp::LessOrEqual;
    }

    #[track_caller]
    pub fn assert_status(self, code: u16) -> Self {
        self.expect("AssertStatus", false, Check::Status(code), "assert_status")
    }

    #[track_caller]
    pub fn require_status(self, code: u16) -> Self {
        self.expect("RequireStatus", true, Check::Status(code), "require_status")
    }

    #[track_caller]
    pub fn assert_equal(self, actual: impl Into<Resolvable>, expected: impl Into<Resolvable>) -> Self {
        let check = Check::Equal(actual.into(), expected.into());
        self.expect("AssertEqual", false, check, "assert_equal")
    }

    #[track_caller]
    pub fn require_equal(self, actual: impl Into<Resolvable>, expected: impl Into<Resolvable>) -> Self {
        let check = Check::Equal(actual.into(), expected.into());
        self.expect("RequireEqual", true, check, "require_equal")
    }

    #[track_caller]
    pub fn assert_not_equal(self, actual: impl Into<Resolvable>, expected: impl Into<Resolvable>) -> Self {
        let check = Check::NotEqual(actual.into(), expected.into());
        self.expect("AssertNotEqual", false, check, "assert_not_equal")
    }

    #[track_caller]
    pub fn require_not_equal(self, actual: impl Into<Resolvable>, expected: impl Into<Resolvable>) -> Self {
        let check = Check::NotEqual(actual.into(), expected.into());
        self.expect("RequireNotEqual", true, check, "require_not_equal")
    }

    #[track_caller]
    pub fn assert_len(self, target: impl Into<Resolvable>, len: usize) -> Self {
        self.expect("AssertLen", false, Check::Len(target.into(), len), "assert_len")
    }

    #[track_caller]
    pub fn require_len(self, target: impl Into<Resolvable>, len: usize) -> Self {
        self.expect("RequireLen", true, Check::Len(target.into(), len), "require_len")
    }

    #[track_caller]
    pub fn assert_contains(self, haystack: impl Into<Resolvable>, needle: impl Into<Resolvable>) -> Self {
        let check = Check::Contains(haystack.into(), needle.into());
        self.expect("AssertContains", false, check, "assert_contains")
    }

    #[track_caller]
    pub fn require_contains(self, haystack: impl Into<Resolvable>, needle: impl Into<Resolvable>) -> Self {
        let check = Check::Contains(haystack.into(), needle.into());
        self.expect("RequireContains", true, check, "require_contains")
    }

    #[track_caller]
    pub fn assert_not_contains(self, haystack: impl Into<Resolvable>, needle: impl Into<Resolvable>) -> Self {
        let check = Check::NotContains(haystack.into(), needle.into());
        self.expect("AssertNotContains", false, check, "assert_not_contains")
    }

    #[track_caller]
    pub fn assert_matches(self, pattern: impl Into<String>, value: impl Into<Resolvable>) -> Self {
        let check = Check::Matches(pattern.into(), value.into());
        self.expect("AssertMatches", false, check, "assert_matches")
    }

    #[track_caller]
    pub fn require_matches(self, pattern: impl Into<String>, value: impl Into<Resolvable>) -> Self {
        let check = Check::Matches(pattern.into(), value.into());
        self.expect("RequireMatches", true, check, "require_matches")
    }

    #[track_caller]
    pub fn assert_header(self, name: impl Into<String>, expected: impl Into<Resolvable>) -> Self {
        let check = Check::Header(name.into(), expected.into());
        self.expect("AssertHeader", false, check, "assert_header")
    }

    #[track_caller]
    pub fn require_header(self, name: impl Into<String>, expected: impl Into<Resolvable>) -> Self {
        let check = Check::Header(name.into(), expected.into());
        self.expect("RequireHeader", true, check, "require_header")
    }

    /// Free-form check over the context
    #[track_caller]
    pub fn assert_that<F>(self, description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Context) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let check = Check::Predicate(description.into(), predicate(check));
        self.expect("AssertThat", false, check, "assert_that")
    }

    #[track_caller]
    pub fn require_that<F>(self, description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Context) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let check = Check::Predicate(description.into(), predicate(check));
        self.expect("RequireThat", true, check, "require_that")
    }
}
