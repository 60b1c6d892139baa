//! Result routing: either into an external test harness or onto
//! hierarchical `=== RUN` / `--- PASS` lines.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::Frame;

/// Shared line-oriented writer for reporter output
#[derive(Clone)]
pub struct Sink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sink")
    }
}

impl Sink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    pub fn discard() -> Self {
        Self::new(io::sink())
    }

    pub fn write_line(&self, line: &str) {
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            log::warn!("Failed to write reporter output: {}", e);
        }
    }
}

/// In-memory writer, handy for capturing reporter output
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> Sink {
        Sink::new(self.clone())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiver of hierarchical results. Paths are node names from the root.
pub trait Harness: Send {
    fn begin(&mut self, path: &[String]);

    /// Record a failure and keep going
    fn error(&mut self, path: &[String], frame: &Frame, message: &str);

    /// Record a failure and stop the node; later children are skipped
    fn fatal(&mut self, path: &[String], frame: &Frame, message: &str);

    fn skip(&mut self, path: &[String], reason: &str);

    fn end(&mut self, path: &[String]);

    /// True when this node or an ancestor was stopped by `fatal`
    fn is_stopped(&self, path: &[String]) -> bool;

    /// True when any node failed
    fn failed(&self) -> bool;
}

/// Go-style name for a node path
pub fn node_name(path: &[String]) -> String {
    path.iter()
        .map(|segment| segment.trim().replace(char::is_whitespace, "_"))
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug)]
struct Node {
    started: Instant,
    failed: bool,
    skipped: bool,
    annotations: Vec<String>,
}

fn format_duration(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}

/// Reporter writing hierarchical pass/fail lines to stdout/stderr sinks
pub struct StandaloneHarness {
    stdout: Sink,
    stderr: Sink,
    nodes: HashMap<String, Node>,
    stopped: HashSet<String>,
    failed: bool,
}

impl StandaloneHarness {
    pub fn new(stdout: Sink, stderr: Sink) -> Self {
        Self {
            stdout,
            stderr,
            nodes: HashMap::new(),
            stopped: HashSet::new(),
            failed: false,
        }
    }

    fn annotate(&mut self, path: &[String], frame: &Frame, message: &str) {
        let name = node_name(path);
        let mut lines = message.lines();
        let first = lines.next().unwrap_or_default();
        let mut annotation = format!("    {}: {}", frame, first);
        for line in lines {
            annotation.push_str("\n        ");
            annotation.push_str(line);
        }

        self.failed = true;
        let node = self.nodes.entry(name).or_insert_with(|| Node {
            started: Instant::now(),
            failed: false,
            skipped: false,
            annotations: Vec::new(),
        });
        node.failed = true;
        node.annotations.push(annotation);
    }
}

impl Harness for StandaloneHarness {
    fn begin(&mut self, path: &[String]) {
        let name = node_name(path);
        self.stdout.write_line(&format!("=== RUN   {}", name));
        self.nodes.insert(
            name,
            Node {
                started: Instant::now(),
                failed: false,
                skipped: false,
                annotations: Vec::new(),
            },
        );
    }

    fn error(&mut self, path: &[String], frame: &Frame, message: &str) {
        self.annotate(path, frame, message);
    }

    fn fatal(&mut self, path: &[String], frame: &Frame, message: &str) {
        self.annotate(path, frame, message);
        self.stopped.insert(node_name(path));
    }

    fn skip(&mut self, path: &[String], reason: &str) {
        if let Some(node) = self.nodes.get_mut(&node_name(path)) {
            node.skipped = true;
            node.annotations.push(format!("    {}", reason));
        }
    }

    fn end(&mut self, path: &[String]) {
        let name = node_name(path);
        let Some(node) = self.nodes.remove(&name) else {
            return;
        };
        let elapsed = format_duration(node.started.elapsed());

        if node.failed {
            self.stderr.write_line(&format!("--- FAIL: {} ({})", name, elapsed));
            for annotation in &node.annotations {
                self.stderr.write_line(annotation);
            }
            // A failing child fails every open ancestor
            for depth in 1..path.len() {
                if let Some(parent) = self.nodes.get_mut(&node_name(&path[..depth])) {
                    parent.failed = true;
                }
            }
        } else if node.skipped {
            self.stdout.write_line(&format!("--- SKIP: {} ({})", name, elapsed));
            for annotation in &node.annotations {
                self.stdout.write_line(annotation);
            }
        } else {
            self.stdout.write_line(&format!("--- PASS: {} ({})", name, elapsed));
        }
    }

    fn is_stopped(&self, path: &[String]) -> bool {
        (1..=path.len()).any(|depth| self.stopped.contains(&node_name(&path[..depth])))
    }

    fn failed(&self) -> bool {
        self.failed
    }
}

/// Keeps the harness's open nodes in step with a sequence of leaf paths,
/// ending nodes that are left and beginning nodes that are entered.
#[derive(Debug, Default)]
pub struct NodeStack {
    open: Vec<String>,
}

impl NodeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, harness: &mut dyn Harness, path: &[String]) {
        let shared = self
            .open
            .iter()
            .zip(path.iter())
            .take_while(|(open, next)| open == next)
            .count();
        while self.open.len() > shared {
            harness.end(&self.open);
            self.open.pop();
        }
        for segment in &path[shared..] {
            self.open.push(segment.clone());
            harness.begin(&self.open);
        }
    }

    pub fn close_all(&mut self, harness: &mut dyn Harness) {
        while !self.open.is_empty() {
            harness.end(&self.open);
            self.open.pop();
        }
    }
}
