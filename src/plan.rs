//! Flattening of the endpoint tree into an ordered list of execution units.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::endpoint::{Endpoint, EndpointItem, Method};
use crate::error::DeclarationError;
use crate::expect::Expectation;
use crate::frame::Frame;
use crate::hooks::{Hook, When};
use crate::http::HttpMethod;
use crate::resolve::Resolvable;

/// Request payload of a method
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Bytes sent as given
    Raw {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    /// Resolved at call time, then serialized by type
    Value(Resolvable),
}

/// One method with its absolute path template and phase-split hooks
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    pub index: usize,
    /// Harness node names from the root endpoint down to this method
    pub name_path: Vec<String>,
    pub path: String,
    pub verb: HttpMethod,
    pub description: String,
    pub path_params: Vec<Resolvable>,
    pub headers: Vec<(String, Resolvable)>,
    pub query: Vec<(String, Resolvable)>,
    pub body: RequestBody,
    pub before: Vec<Hook>,
    pub after: Vec<Hook>,
    pub expectations: Vec<Expectation>,
    pub frame: Frame,
}

impl ExecutionUnit {
    /// Every hook of the unit, before hooks first
    pub fn hooks(&self) -> impl Iterator<Item = &Hook> {
        self.before.iter().chain(self.after.iter())
    }

    /// Every resolvable the unit will dereference
    pub fn resolvables(&self) -> Vec<&Resolvable> {
        let mut out: Vec<&Resolvable> = self.path_params.iter().collect();
        out.extend(self.headers.iter().map(|(_, value)| value));
        out.extend(self.query.iter().map(|(_, value)| value));
        if let RequestBody::Value(body) = &self.body {
            out.push(body);
        }
        for expectation in &self.expectations {
            out.extend(expectation.check.operands());
        }
        out
    }

    fn leaf_name(&self) -> String {
        if self.description.is_empty() {
            self.verb.to_string()
        } else {
            format!("{} {}", self.verb, self.description)
        }
    }

    fn to_method(&self) -> Method {
        Method {
            verb: self.verb,
            description: self.description.clone(),
            path_params: self.path_params.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            hooks: self.hooks().cloned().collect(),
            expectations: self.expectations.clone(),
            frame: self.frame.clone(),
        }
    }
}

/// Sibling node names of one tree level. A repeated name gets a `#NN`
/// suffix so every harness node is distinct.
#[derive(Debug, Default)]
struct SiblingNames {
    seen: HashMap<String, usize>,
}

impl SiblingNames {
    fn unique(&mut self, name: String) -> String {
        let count = self.seen.entry(name.clone()).or_insert(0);
        let unique = if *count == 0 { name } else { format!("{}#{:02}", name, count) };
        *count += 1;
        unique
    }
}

/// Concatenate two path templates, collapsing adjacent slashes
pub fn join_paths(parent: &str, child: &str) -> String {
    let joined = format!("{}{}", parent, child);
    let mut out = String::with_capacity(joined.len());
    for c in joined.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Placeholder names of a `{name}` template, in order
pub fn placeholders(template: &str) -> Result<Vec<String>, DeclarationError> {
    let mut names = Vec::new();
    let mut current: Option<String> = None;
    let unbalanced = || DeclarationError::InvalidPath(format!("unbalanced braces in '{}'", template));
    for c in template.chars() {
        match c {
            '{' if current.is_some() => return Err(unbalanced()),
            '{' => current = Some(String::new()),
            '}' => names.push(current.take().ok_or_else(unbalanced)?),
            c => {
                if let Some(name) = current.as_mut() {
                    name.push(c);
                }
            }
        }
    }
    if current.is_some() {
        return Err(DeclarationError::InvalidPath(format!("unclosed placeholder in '{}'", template)));
    }
    Ok(names)
}

/// Substitute positional values into a template's placeholders
pub fn fill_template(template: &str, values: &[String]) -> Result<String, DeclarationError> {
    let expected = placeholders(template)?.len();
    if expected != values.len() {
        return Err(DeclarationError::InvalidPath(format!(
            "'{}' needs {} value(s), got {}",
            template,
            expected,
            values.len()
        )));
    }

    let mut out = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut inside = false;
    for c in template.chars() {
        match c {
            '{' => {
                inside = true;
                if let Some(value) = values.next() {
                    out.push_str(value);
                }
            }
            '}' => inside = false,
            c if !inside => out.push(c),
            _ => {}
        }
    }
    Ok(out)
}

/// Ordered execution units of a declaration tree
#[derive(Debug, Clone, Default)]
pub struct Plan {
    units: Vec<ExecutionUnit>,
}

impl Plan {
    /// Walk the tree in declaration order. Fails when a method's path
    /// params do not match its cumulative template.
    pub fn flatten(endpoints: &[Endpoint]) -> Result<Plan, DeclarationError> {
        let mut units = Vec::new();
        let mut roots = SiblingNames::default();
        for endpoint in endpoints {
            let name = roots.unique(endpoint.path.clone());
            flatten_endpoint(endpoint, name, "", &[], &mut units)?;
        }
        log::debug!("Flattened {} endpoint(s) into {} unit(s)", endpoints.len(), units.len());
        Ok(Plan { units })
    }

    pub fn units(&self) -> &[ExecutionUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Stable textual rendering of every unit, used to compare plans.
    /// Harness node names are not part of it.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for unit in &self.units {
            let _ = writeln!(out, "#{} {} {} {:?} @ {}", unit.index, unit.verb, unit.path, unit.description, unit.frame);
            let params: Vec<String> = unit.path_params.iter().map(ToString::to_string).collect();
            let _ = writeln!(out, "  params: [{}]", params.join(", "));
            for (name, value) in &unit.query {
                let _ = writeln!(out, "  query: {}={}", name, value);
            }
            for (name, value) in &unit.headers {
                let _ = writeln!(out, "  header: {}={}", name, value);
            }
            match &unit.body {
                RequestBody::Empty => {}
                RequestBody::Raw { bytes, content_type } => {
                    let _ = writeln!(out, "  body: raw {} byte(s) {:?}", bytes.len(), content_type);
                }
                RequestBody::Value(value) => {
                    let _ = writeln!(out, "  body: {}", value);
                }
            }
            for hook in &unit.before {
                let _ = writeln!(out, "  {:?}", hook);
            }
            for expectation in &unit.expectations {
                let _ = writeln!(
                    out,
                    "  {} {:?} @ {}",
                    expectation.name, expectation.check, expectation.frame
                );
            }
            for hook in &unit.after {
                let _ = writeln!(out, "  {:?}", hook);
            }
        }
        out
    }

    /// A flat tree, one endpoint per unit, whose flattening reproduces
    /// this plan
    pub fn to_endpoints(&self) -> Vec<Endpoint> {
        self.units
            .iter()
            .map(|unit| Endpoint {
                path: unit.path.clone(),
                description: String::new(),
                items: vec![EndpointItem::Method(unit.to_method())],
                frame: unit.frame.clone(),
            })
            .collect()
    }
}

fn flatten_endpoint(
    endpoint: &Endpoint,
    name: String,
    parent_path: &str,
    parent_names: &[String],
    units: &mut Vec<ExecutionUnit>,
) -> Result<(), DeclarationError> {
    let path = join_paths(parent_path, &endpoint.path);
    let mut names = parent_names.to_vec();
    names.push(name);
    let expected = placeholders(&path)?.len();
    let mut siblings = SiblingNames::default();

    for item in &endpoint.items {
        match item {
            EndpointItem::Method(method) => {
                if method.path_params.len() != expected {
                    return Err(DeclarationError::PathParamMismatch {
                        path: path.clone(),
                        expected,
                        found: method.path_params.len(),
                        frame: method.frame.to_string(),
                    });
                }
                let (before, after): (Vec<Hook>, Vec<Hook>) =
                    method.hooks.iter().cloned().partition(|hook| hook.when == When::Before);

                let mut unit = ExecutionUnit {
                    index: units.len(),
                    name_path: names.clone(),
                    path: path.clone(),
                    verb: method.verb,
                    description: method.description.clone(),
                    path_params: method.path_params.clone(),
                    headers: method.headers.clone(),
                    query: method.query.clone(),
                    body: method.body.clone(),
                    before,
                    after,
                    expectations: method.expectations.clone(),
                    frame: method.frame.clone(),
                };
                let leaf = siblings.unique(unit.leaf_name());
                unit.name_path.push(leaf);
                units.push(unit);
            }
            EndpointItem::Child(child) => {
                let name = siblings.unique(child.path.clone());
                flatten_endpoint(child, name, &path, &names, units)?
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::endpoint;
    use crate::resolve::{body, json_path, var};
    use proptest::prelude::*;

    fn tree() -> Vec<Endpoint> {
        vec![endpoint(
            "/api/",
            "api",
            [
                EndpointItem::from(Method::get("root").assert_ok()),
                EndpointItem::from(
                    Endpoint::new("/pets/{petId}", "one pet")
                        .method(
                            Method::delete("remove")
                                .path_param(var("pet"))
                                .set_var(When::After, "deleted", true)
                                .wait(When::Before, 5)
                                .assert_no_content(),
                        )
                        .child(Endpoint::new("/tags/{tag}", "tags").method(
                            Method::get("tags")
                                .path_param(var("pet"))
                                .path_param("t1")
                                .assert_equal(json_path(body(), "0"), "t1"),
                        )),
                ),
                EndpointItem::from(Method::post("create").request_body(Resolvable::object([("a", 1)]))),
            ],
        )]
    }

    #[test]
    fn test_flatten_order_and_paths() {
        let plan = Plan::flatten(&tree()).unwrap();
        let rendered: Vec<(String, HttpMethod)> =
            plan.units().iter().map(|unit| (unit.path.clone(), unit.verb)).collect();
        assert_eq!(
            rendered,
            vec![
                ("/api/".to_string(), HttpMethod::GET),
                ("/api/pets/{petId}".to_string(), HttpMethod::DELETE),
                ("/api/pets/{petId}/tags/{tag}".to_string(), HttpMethod::GET),
                ("/api/".to_string(), HttpMethod::POST),
            ]
        );
        let indexes: Vec<usize> = plan.units().iter().map(|unit| unit.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(
            plan.units()[2].name_path,
            vec!["/api/", "/pets/{petId}", "/tags/{tag}", "GET tags"]
        );
    }

    #[test]
    fn test_hooks_are_split_by_phase_in_declared_order() {
        let plan = Plan::flatten(&tree()).unwrap();
        let unit = &plan.units()[1];
        assert_eq!(unit.before.len(), 1);
        assert_eq!(unit.after.len(), 1);
        assert_eq!(unit.before[0].when, When::Before);
        assert_eq!(unit.after[0].when, When::After);
    }

    #[test]
    fn test_path_param_mismatch_is_a_declaration_error() {
        let endpoints = vec![Endpoint::new("/pets/{id}", "").method(Method::get("no params"))];
        match Plan::flatten(&endpoints) {
            Err(DeclarationError::PathParamMismatch { expected, found, path, .. }) => {
                assert_eq!((expected, found), (1, 0));
                assert_eq!(path, "/pets/{id}");
            }
            other => panic!("expected a mismatch, got {:?}", other.map(|plan| plan.len())),
        }
    }

    #[test]
    fn test_zero_placeholders_and_zero_params_is_valid() {
        let plan = Plan::flatten(&[Endpoint::new("/health", "").method(Method::get(""))]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.units()[0].name_path, vec!["/health", "GET"]);
    }

    #[test]
    fn test_same_named_siblings_get_distinct_nodes() {
        let endpoints = vec![
            Endpoint::new("/api", "")
                .method(Method::get(""))
                .method(Method::get(""))
                .method(Method::get(""))
                .child(Endpoint::new("/pets", "").method(Method::get("list")))
                .child(Endpoint::new("/pets", "").method(Method::get("list"))),
            Endpoint::new("/api", "").method(Method::get("")),
        ];
        let plan = Plan::flatten(&endpoints).unwrap();
        let names: Vec<Vec<String>> = plan.units().iter().map(|unit| unit.name_path.clone()).collect();
        assert_eq!(
            names,
            vec![
                vec!["/api", "GET"],
                vec!["/api", "GET#01"],
                vec!["/api", "GET#02"],
                vec!["/api", "/pets", "GET list"],
                vec!["/api", "/pets#01", "GET list"],
                vec!["/api#01", "GET"],
            ]
        );
    }

    #[test]
    fn test_flatten_is_idempotent() {
        let plan = Plan::flatten(&tree()).unwrap();
        let again = Plan::flatten(&plan.to_endpoints()).unwrap();
        assert_eq!(plan.describe(), again.describe());
    }

    #[test]
    fn test_template_helpers() {
        assert_eq!(join_paths("/api/", "/pets"), "/api/pets");
        assert_eq!(join_paths("", "//x//y"), "/x/y");
        assert_eq!(placeholders("/a/{x}/b/{y}").unwrap(), vec!["x", "y"]);
        assert!(placeholders("/a/{x").is_err());
        assert!(placeholders("/a/x}").is_err());
        assert_eq!(
            fill_template("/pets/{petId}/tags/{tag}", &["P1".to_string(), "red".to_string()]).unwrap(),
            "/pets/P1/tags/red"
        );
        assert!(fill_template("/pets/{petId}", &[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_flatten_is_deterministic(segments in prop::collection::vec("[a-z]{1,6}", 1..6)) {
            let build = || {
                segments
                    .iter()
                    .map(|segment| Endpoint::new(format!("/{}", segment), "").method(Method::get(segment.clone())))
                    .collect::<Vec<_>>()
            };
            let first = Plan::flatten(&build()).unwrap().describe();
            let second = Plan::flatten(&build()).unwrap().describe();
            prop_assert_eq!(first, second);
        }
    }
}
