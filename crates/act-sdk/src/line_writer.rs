// LineWriter: sink for streamed process output, one line at a time.
// Each line is handed synchronously to the registered handlers in order; a
// handler returning `false` stops the chain for that line.

use std::fmt;

/// Callback invoked for every line (without the trailing newline).
pub type LineHandler = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct LineWriter {
    handlers: Vec<LineHandler>,
}

impl LineWriter {
    pub fn new(handlers: Vec<LineHandler>) -> Self {
        Self { handlers }
    }

    /// Dispatch one line. A trailing `\n` or `\r\n` is stripped.
    pub fn write_line(&self, line: &str) {
        let line = line.trim_end_matches(['\n', '\r']);
        for handler in &self.handlers {
            if !handler(line) {
                break;
            }
        }
    }
}

impl fmt::Debug for LineWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineWriter")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn collector() -> (Arc<Mutex<Vec<String>>>, LineHandler) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let handler: LineHandler = Box::new(move |line| {
            sink.lock().push(line.to_string());
            true
        });
        (lines, handler)
    }

    #[test]
    fn strips_line_endings() {
        let (lines, handler) = collector();
        let writer = LineWriter::new(vec![handler]);

        writer.write_line("first");
        writer.write_line("second\r\n");
        assert_eq!(*lines.lock(), vec!["first", "second"]);
    }

    #[test]
    fn handler_returning_false_stops_chain() {
        let (lines, collect) = collector();
        let swallow: LineHandler = Box::new(|line| !line.starts_with("::"));
        let writer = LineWriter::new(vec![swallow, collect]);

        writer.write_line("::set-output name=a::b");
        writer.write_line("plain output");

        assert_eq!(*lines.lock(), vec!["plain output"]);
    }

    #[test]
    fn every_handler_sees_the_line() {
        let (first, a) = collector();
        let (second, b) = collector();
        let writer = LineWriter::new(vec![a, b]);
        writer.write_line("hello 42");
        assert_eq!(*first.lock(), vec!["hello 42"]);
        assert_eq!(*second.lock(), vec!["hello 42"]);
    }
}
