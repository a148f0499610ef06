//! Line-oriented structured output streams.
//!
//! Every machine-parsable line goes through [`Streams`] so the first token
//! always names the stream and tests can capture exactly what an operator
//! would see on stdout. Diagnostics go to `tracing` (stderr) instead.
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

pub const CFG_OUT: &str = "CFG_OUT:";
pub const MANIFEST_OUTPUT: &str = "MANIFEST_OUTPUT:";
pub const SQL_OUT: &str = "SQL_OUT:";
pub const ORTHANC_OUT: &str = "ORTHANC_OUT:";

#[derive(Debug)]
enum Sink {
    Stdout,
    Capture(Vec<String>),
}

/// Shared handle to the structured output sink.
#[derive(Debug, Clone)]
pub struct Streams {
    sink: Rc<RefCell<Sink>>,
}

impl Streams {
    pub fn stdout() -> Self {
        Self {
            sink: Rc::new(RefCell::new(Sink::Stdout)),
        }
    }

    /// Collect lines in memory instead of printing them.
    pub fn capture() -> Self {
        Self {
            sink: Rc::new(RefCell::new(Sink::Capture(Vec::new()))),
        }
    }

    /// Lines captured so far (empty for the stdout sink).
    pub fn lines(&self) -> Vec<String> {
        match &*self.sink.borrow() {
            Sink::Stdout => Vec::new(),
            Sink::Capture(lines) => lines.clone(),
        }
    }

    /// Captured lines belonging to one stream.
    pub fn lines_of(&self, stream: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.starts_with(stream))
            .collect()
    }

    fn emit(&self, line: String) {
        match &mut *self.sink.borrow_mut() {
            Sink::Stdout => println!("{line}"),
            Sink::Capture(lines) => lines.push(line),
        }
    }

    pub fn cfg_header(&self) {
        self.emit(format!("{CFG_OUT},KEY_TYPE,KEY,VALUE"));
    }

    pub fn cfg(&self, source: &str, key: &str, value: &str) {
        self.emit(format!("{CFG_OUT},{source},{key},{value}"));
    }

    /// A SQL statement about to run (or, in dry-run, only printed). The
    /// statement must already be on one line.
    pub fn sql(&self, statement: &str) {
        self.emit(format!("{SQL_OUT}{statement}"));
    }

    /// A commented diagnostic line on the SQL stream (pre-image selects).
    pub fn sql_comment(&self, text: &str) {
        self.emit(format!("{SQL_OUT}-- {text}"));
    }

    pub fn manifest<S: AsRef<str>>(&self, columns: &[S]) {
        let joined = columns
            .iter()
            .map(|column| column.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.emit(format!("{MANIFEST_OUTPUT},{joined}"));
    }

    /// A commented manifest line; the leading `#` keeps it out of CSV parsers.
    pub fn manifest_comment(&self, text: &str) {
        self.emit(format!("{MANIFEST_OUTPUT},# {text}"));
    }

    pub fn orthanc(&self, command: &str) {
        self.emit(format!("{ORTHANC_OUT} {command}"));
    }

    pub fn flush(&self) {
        if let Sink::Stdout = &*self.sink.borrow() {
            let _ = std::io::stdout().flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_prefixes_each_stream() {
        let streams = Streams::capture();
        streams.cfg_header();
        streams.cfg("config", "run_mode", "single");
        streams.sql("UPDATE t SET active = 0");
        streams.sql_comment("SELECT * FROM t");
        streams.manifest(&["A1", "PROCESSED"]);
        streams.orthanc("curl -s http://orthanc/studies/u1");

        assert_eq!(
            streams.lines(),
            vec![
                "CFG_OUT:,KEY_TYPE,KEY,VALUE",
                "CFG_OUT:,config,run_mode,single",
                "SQL_OUT:UPDATE t SET active = 0",
                "SQL_OUT:-- SELECT * FROM t",
                "MANIFEST_OUTPUT:,A1,PROCESSED",
                "ORTHANC_OUT: curl -s http://orthanc/studies/u1",
            ]
        );
        assert_eq!(streams.lines_of(SQL_OUT).len(), 2);
    }
}
