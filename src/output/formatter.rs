//! Report formatters for a finished run
//!
//! Provides table, summary, JSON, CSV and JUnit XML output formats.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;

use crate::models::{Completion, DirectiveKind, ReportEntry, TestResult};

/// Receives every discovered file, then renders the report.
///
/// `report` decides the process exit code: 0 when every file completed ok,
/// 1 otherwise.
pub trait Formatter: Send {
    fn open_test(&mut self, entry: ReportEntry);

    fn report(&mut self) -> io::Result<i32>;
}

/// Output format options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    JsonPretty,
    Csv,
    /// JUnit XML, one suite per file
    Junit,
    Summary,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Ok(OutputFormat::JsonPretty),
            "csv" => Ok(OutputFormat::Csv),
            "junit" | "xml" => Ok(OutputFormat::Junit),
            "summary" => Ok(OutputFormat::Summary),
            _ => Err(format!("unknown output format: {s}")),
        }
    }
}

/// Per-file verdict shown in reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pass,
    Fail,
    Pending,
}

impl FileStatus {
    fn of(state: &Completion) -> Self {
        match state {
            Completion::Pending => FileStatus::Pending,
            Completion::Completed(result) if result.ok => FileStatus::Pass,
            Completion::Completed(_) => FileStatus::Fail,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Pass => write!(f, "PASS"),
            FileStatus::Fail => write!(f, "FAIL"),
            FileStatus::Pending => write!(f, "PENDING"),
        }
    }
}

/// Collects report entries and renders them in one of the [`OutputFormat`]s
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
    output: Option<PathBuf>,
    entries: Vec<ReportEntry>,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
            output: None,
            entries: Vec::new(),
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Write the report to `path` instead of stdout; implies no color
    pub fn to_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self.colorize = false;
        self
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// 0 iff every entry completed ok
    pub fn exit_code(&self) -> i32 {
        if self.entries.iter().all(|e| e.state.is_ok()) {
            0
        } else {
            1
        }
    }

    /// Render the collected entries
    pub fn render(&self) -> io::Result<String> {
        match self.format {
            OutputFormat::Table => Ok(self.format_table()),
            OutputFormat::Summary => Ok(self.format_summary()),
            OutputFormat::Json => serde_json::to_string(&self.json_report()).map_err(io::Error::other),
            OutputFormat::JsonPretty => {
                serde_json::to_string_pretty(&self.json_report()).map_err(io::Error::other)
            }
            OutputFormat::Csv => self.format_csv(),
            OutputFormat::Junit => Ok(self.format_junit()),
        }
    }

    fn status_str(&self, status: FileStatus) -> &'static str {
        if self.colorize {
            match status {
                FileStatus::Pass => "\x1b[32m✓ PASS\x1b[0m",
                FileStatus::Fail => "\x1b[31m✗ FAIL\x1b[0m",
                FileStatus::Pending => "\x1b[33m○ PENDING\x1b[0m",
            }
        } else {
            match status {
                FileStatus::Pass => "✓ PASS",
                FileStatus::Fail => "✗ FAIL",
                FileStatus::Pending => "○ PENDING",
            }
        }
    }

    fn format_table(&self) -> String {
        let mut output = String::new();
        let width = self.entries.iter().map(|e| e.path.len()).max().unwrap_or(0).max(20);

        for entry in &self.entries {
            let status = FileStatus::of(&entry.state);
            match entry.state.result() {
                Some(result) => {
                    output.push_str(&format!(
                        "{:width$} {} {:>4}/{:<4} [{:>6}ms]\n",
                        entry.path,
                        self.status_str(status),
                        result.passed(),
                        result.tests.len(),
                        result.duration_ms
                    ));
                    for line in result.failures() {
                        output.push_str(&format!("    {line}\n"));
                        for diag in line.diagnostic.lines().filter(|l| !l.trim().is_empty()) {
                            output.push_str(&format!("        {diag}\n"));
                        }
                    }
                }
                None => {
                    output.push_str(&format!("{:width$} {}\n", entry.path, self.status_str(status)));
                }
            }
        }

        output.push_str(&self.format_summary());
        output
    }

    fn format_summary(&self) -> String {
        let counts = Counts::of(&self.entries);
        let verdict = match (self.exit_code(), self.colorize) {
            (0, true) => "\x1b[32mPASS\x1b[0m",
            (0, false) => "PASS",
            (_, true) => "\x1b[31mFAIL\x1b[0m",
            (_, false) => "FAIL",
        };

        format!(
            "Files: {} | Pass: {} | Fail: {} | Pending: {} | Tests: {} | Duration: {}ms | Result: {}\n",
            counts.total, counts.passed, counts.failed, counts.pending, counts.tests, counts.duration_ms, verdict
        )
    }

    fn format_csv(&self) -> io::Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["path", "status", "passed", "failed", "planned", "duration_ms", "first_failure"])
            .map_err(io::Error::other)?;

        for entry in &self.entries {
            let status = FileStatus::of(&entry.state).to_string();
            let record = match entry.state.result() {
                Some(result) => vec![
                    entry.path.clone(),
                    status,
                    result.passed().to_string(),
                    result.failed().to_string(),
                    result.plan.to_string(),
                    result.duration_ms.to_string(),
                    result.failures().next().map(|l| l.to_string()).unwrap_or_default(),
                ],
                None => vec![
                    entry.path.clone(),
                    status,
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                ],
            };
            writer.write_record(&record).map_err(io::Error::other)?;
        }

        let bytes = writer.into_inner().map_err(|e| io::Error::other(e.to_string()))?;
        String::from_utf8(bytes).map_err(io::Error::other)
    }

    fn format_junit(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites>\n");

        for entry in &self.entries {
            let name = xml_escape(&entry.path);
            let Some(result) = entry.state.result() else {
                out.push_str(&format!(
                    "  <testsuite name=\"{name}\" tests=\"1\" failures=\"0\" errors=\"1\" skipped=\"0\" time=\"0.000\">\n"
                ));
                out.push_str(&format!(
                    "    <testcase classname=\"{name}\" name=\"{name}\">\n      <error message=\"no result received\" type=\"Pending\"/>\n    </testcase>\n"
                ));
                out.push_str("  </testsuite>\n");
                continue;
            };

            let skipped = result
                .tests
                .iter()
                .filter(|l| matches!(&l.directive, Some(d) if d.kind == DirectiveKind::Skip))
                .count();
            out.push_str(&format!(
                "  <testsuite name=\"{name}\" tests=\"{}\" failures=\"{}\" errors=\"0\" skipped=\"{skipped}\" time=\"{:.3}\">\n",
                result.tests.len(),
                result.failed(),
                result.duration_ms as f64 / 1000.0
            ));

            for line in &result.tests {
                let case = if line.description.is_empty() {
                    line.num.to_string()
                } else {
                    line.description.clone()
                };
                out.push_str(&format!(
                    "    <testcase classname=\"{name}\" name=\"{}\">\n",
                    xml_escape(&case)
                ));
                if !line.is_passing() {
                    out.push_str(&format!(
                        "      <failure message=\"{}\" type=\"TestFailed\">{}</failure>\n",
                        xml_escape(&line.to_string()),
                        xml_escape(&line.diagnostic)
                    ));
                } else if matches!(&line.directive, Some(d) if d.kind == DirectiveKind::Skip) {
                    out.push_str("      <skipped/>\n");
                }
                out.push_str("    </testcase>\n");
            }
            out.push_str("  </testsuite>\n");
        }

        out.push_str("</testsuites>\n");
        out
    }

    fn json_report(&self) -> JsonReport<'_> {
        JsonReport {
            generated_at: Utc::now(),
            ok: self.exit_code() == 0,
            counts: Counts::of(&self.entries),
            files: self
                .entries
                .iter()
                .map(|entry| JsonFile {
                    path: &entry.path,
                    status: FileStatus::of(&entry.state),
                    result: entry.state.result(),
                })
                .collect(),
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

impl Formatter for ResultFormatter {
    fn open_test(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    fn report(&mut self) -> io::Result<i32> {
        let mut content = self.render()?;
        if !content.ends_with('\n') {
            content.push('\n');
        }

        match &self.output {
            Some(path) => std::fs::write(path, content)?,
            None => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(content.as_bytes())?;
                stdout.flush()?;
            }
        }

        Ok(self.exit_code())
    }
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Debug, Default, Serialize)]
struct Counts {
    total: usize,
    passed: usize,
    failed: usize,
    pending: usize,
    tests: usize,
    duration_ms: u64,
}

impl Counts {
    fn of(entries: &[ReportEntry]) -> Self {
        let mut counts = Counts {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            match FileStatus::of(&entry.state) {
                FileStatus::Pass => counts.passed += 1,
                FileStatus::Fail => counts.failed += 1,
                FileStatus::Pending => counts.pending += 1,
            }
            if let Some(result) = entry.state.result() {
                counts.tests += result.tests.len();
                counts.duration_ms += result.duration_ms;
            }
        }
        counts
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: DateTime<Utc>,
    ok: bool,
    #[serde(flatten)]
    counts: Counts,
    files: Vec<JsonFile<'a>>,
}

#[derive(Serialize)]
struct JsonFile<'a> {
    path: &'a str,
    status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a TestResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Testline;
    use tempfile::tempdir;

    fn completed(ok: bool) -> Completion {
        Completion::Completed(TestResult {
            ok,
            tests: vec![Testline::new(ok, 1, "first").with_diagnostic("got: 1\nexpected: 2")],
            plan: 1,
            version: 12,
            duration_ms: 5,
        })
    }

    fn formatter(format: OutputFormat, states: Vec<(&str, Completion)>) -> ResultFormatter {
        let mut formatter = ResultFormatter::new(format).no_color();
        for (path, state) in states {
            formatter.open_test(ReportEntry::new(path, state));
        }
        formatter
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("json".parse(), Ok(OutputFormat::Json));
        assert_eq!("TABLE".parse(), Ok(OutputFormat::Table));
        assert!("unknown".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(formatter(OutputFormat::Table, vec![]).exit_code(), 0);
        assert_eq!(formatter(OutputFormat::Table, vec![("t/a.t", completed(true))]).exit_code(), 0);
        assert_eq!(
            formatter(OutputFormat::Table, vec![("t/a.t", completed(true)), ("t/b.t", completed(false))]).exit_code(),
            1
        );
        assert_eq!(formatter(OutputFormat::Table, vec![("t/a.t", Completion::Pending)]).exit_code(), 1);
    }

    #[test]
    fn test_table_lists_failures() {
        let output = formatter(
            OutputFormat::Table,
            vec![("t/a.t", completed(true)), ("t/b.t", completed(false)), ("t/c.t", Completion::Pending)],
        )
        .render()
        .unwrap();

        assert!(output.contains("t/a.t"));
        assert!(output.contains("✓ PASS"));
        assert!(output.contains("✗ FAIL"));
        assert!(output.contains("○ PENDING"));
        assert!(output.contains("    not ok 1 - first"));
        assert!(output.contains("        expected: 2"));
        assert!(output.contains("Files: 3 | Pass: 1 | Fail: 1 | Pending: 1"));
    }

    #[test]
    fn test_json_report() {
        let output = formatter(OutputFormat::Json, vec![("t/a.t", completed(true)), ("t/b.t", Completion::Pending)])
            .render()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["ok"], false);
        assert_eq!(value["total"], 2);
        assert_eq!(value["files"][0]["status"], "pass");
        assert_eq!(value["files"][0]["result"]["plan"], 1);
        assert_eq!(value["files"][1]["status"], "pending");
        assert!(value["files"][1].get("result").is_none());
        assert!(value["generated_at"].is_string());
    }

    #[test]
    fn test_csv_report() {
        let output = formatter(OutputFormat::Csv, vec![("t/b.t", completed(false))]).render().unwrap();
        let mut lines = output.lines();
        assert_eq!(
            lines.next(),
            Some("path,status,passed,failed,planned,duration_ms,first_failure")
        );
        assert_eq!(lines.next(), Some("t/b.t,FAIL,0,1,1,5,not ok 1 - first"));
    }

    #[test]
    fn test_junit_report() {
        let skipped = Completion::Completed(TestResult {
            ok: true,
            tests: vec![
                Testline::new(true, 1, "a < b"),
                Testline::new(true, 2, "").with_directive(DirectiveKind::Skip, "no db"),
            ],
            plan: 2,
            version: 13,
            duration_ms: 1_500,
        });
        let output = formatter(
            OutputFormat::Junit,
            vec![("t/a&b.t", skipped), ("t/b.t", completed(false)), ("t/c.t", Completion::Pending)],
        )
        .render()
        .unwrap();

        assert!(output.starts_with("<?xml"));
        assert!(output.contains(
            r#"<testsuite name="t/a&amp;b.t" tests="2" failures="0" errors="0" skipped="1" time="1.500">"#
        ));
        assert!(output.contains(r#"<testcase classname="t/a&amp;b.t" name="a &lt; b">"#));
        assert!(output.contains("<skipped/>"));
        assert!(output.contains(
            r#"<failure message="not ok 1 - first" type="TestFailed">got: 1
expected: 2</failure>"#
        ));
        assert!(output.contains(r#"errors="1""#));
        assert!(output.contains(r#"type="Pending""#));
        assert_eq!(output.matches("<testsuite ").count(), 3);
        assert!(output.trim_end().ends_with("</testsuites>"));
    }

    #[test]
    fn test_report_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let mut formatter = ResultFormatter::new(OutputFormat::Summary).to_file(&path);
        formatter.open_test(ReportEntry::new("t/a.t", completed(true)));

        assert_eq!(formatter.report().unwrap(), 0);
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("Files: 1 | Pass: 1"));
        assert!(!written.contains("\x1b["));
    }
}
