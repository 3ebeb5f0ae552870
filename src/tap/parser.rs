//! Incremental TAP stream parser
//!
//! Lines are fed one at a time as the child process produces them, so the
//! parser never needs the whole stream in memory.

use thiserror::Error;

use crate::models::{DirectiveKind, TestResult, Testline, DEFAULT_TAP_VERSION};

/// Malformed result stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: invalid version header '{text}'")]
    InvalidVersion { line: usize, text: String },

    #[error("line {line}: TAP version {version} cannot be declared explicitly")]
    UnsupportedVersion { line: usize, version: u32 },

    #[error("line {line}: invalid plan '{text}'")]
    InvalidPlan { line: usize, text: String },

    #[error("line {line}: more than one plan")]
    DuplicatePlan { line: usize },

    #[error("line {line}: test number out of range in '{text}'")]
    InvalidNumber { line: usize, text: String },

    #[error("YAML block opened on line {line} is never closed")]
    UnterminatedYaml { line: usize },
}

#[derive(Debug, Clone)]
struct Plan {
    count: u32,
    skip: Option<String>,
}

#[derive(Debug)]
struct YamlBlock {
    opened_at: usize,
    body: String,
}

/// Streaming parser state
#[derive(Debug)]
pub struct Parser {
    version: u32,
    plan: Option<Plan>,
    tests: Vec<Testline>,
    line_no: usize,
    next_num: u32,
    yaml: Option<YamlBlock>,
    bailed_out: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            version: DEFAULT_TAP_VERSION,
            plan: None,
            tests: Vec::new(),
            line_no: 0,
            next_num: 1,
            yaml: None,
            bailed_out: false,
        }
    }

    /// Consume one line of output (without its terminator)
    pub fn push_line(&mut self, raw: &str) -> Result<(), ParseError> {
        self.line_no += 1;
        if self.bailed_out {
            return Ok(());
        }

        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if let Some(block) = self.yaml.as_mut() {
            if line.trim() == "..." {
                let body = std::mem::take(&mut block.body);
                self.yaml = None;
                self.append_diagnostic(body.trim_end());
            } else {
                block.body.push_str(line.trim_start());
                block.body.push('\n');
            }
            return Ok(());
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // indented: YAML diagnostics or subtest output
            if line.trim() == "---" && !self.tests.is_empty() {
                self.yaml = Some(YamlBlock {
                    opened_at: self.line_no,
                    body: String::new(),
                });
            }
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix("TAP version") {
            return self.parse_version(line, rest);
        }
        if line.starts_with("1..") {
            return self.parse_plan(line);
        }
        if let Some(reason) = line.strip_prefix("Bail out!") {
            let num = self.tests.len() as u32 + 1;
            self.tests
                .push(Testline::new(false, num, format!("Bail out! {}", reason.trim()).trim_end()));
            self.bailed_out = true;
            return Ok(());
        }
        if let Some(comment) = line.strip_prefix('#') {
            self.append_diagnostic(comment.trim());
            return Ok(());
        }
        if let Some(test) = self.parse_test_line(line)? {
            self.next_num = test.num.saturating_add(1);
            self.tests.push(test);
        }

        Ok(())
    }

    /// Close the stream and produce the suite
    pub fn finish(self) -> Result<TestResult, ParseError> {
        if let Some(block) = &self.yaml {
            return Err(ParseError::UnterminatedYaml {
                line: block.opened_at,
            });
        }

        let ran = self.tests.len() as u32;
        let mut result = TestResult {
            ok: self.tests.iter().all(Testline::is_passing),
            plan: self.plan.as_ref().map(|p| p.count).unwrap_or(ran),
            tests: self.tests,
            version: self.version,
            duration_ms: 0,
        };

        if self.bailed_out {
            result.ok = false;
            return Ok(result);
        }

        match &self.plan {
            None => result.fail_with("no plan found", format!("ran {ran} tests without a plan")),
            Some(plan) if plan.count != ran => result.fail_with(
                format!("planned {} tests but ran {}", plan.count, ran),
                plan.skip.clone().unwrap_or_default(),
            ),
            Some(_) => {}
        }

        Ok(result)
    }

    fn parse_version(&mut self, line: &str, rest: &str) -> Result<(), ParseError> {
        // only meaningful as the very first line
        if self.line_no != 1 {
            return Ok(());
        }
        let version: u32 = rest.trim().parse().map_err(|_| ParseError::InvalidVersion {
            line: self.line_no,
            text: line.to_string(),
        })?;
        if version < 13 {
            return Err(ParseError::UnsupportedVersion {
                line: self.line_no,
                version,
            });
        }
        self.version = version;
        Ok(())
    }

    fn parse_plan(&mut self, line: &str) -> Result<(), ParseError> {
        if self.plan.is_some() {
            return Err(ParseError::DuplicatePlan { line: self.line_no });
        }

        let body = &line[3..];
        let (count, comment) = match body.split_once('#') {
            Some((count, comment)) => (count, Some(comment.trim())),
            None => (body, None),
        };
        let count: u32 = count.trim().parse().map_err(|_| ParseError::InvalidPlan {
            line: self.line_no,
            text: line.to_string(),
        })?;

        let skip = comment.and_then(|c| {
            let upper = c.to_ascii_uppercase();
            upper
                .starts_with("SKIP")
                .then(|| c[4..].trim().to_string())
        });

        self.plan = Some(Plan { count, skip });
        Ok(())
    }

    fn parse_test_line(&self, line: &str) -> Result<Option<Testline>, ParseError> {
        let (ok, rest) = if let Some(rest) = line.strip_prefix("not ok") {
            (false, rest)
        } else if let Some(rest) = line.strip_prefix("ok") {
            (true, rest)
        } else {
            return Ok(None);
        };
        if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
            return Ok(None);
        }

        let rest = rest.trim_start();
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let num = if digits > 0 {
            rest[..digits]
                .parse::<u32>()
                .map_err(|_| ParseError::InvalidNumber {
                    line: self.line_no,
                    text: line.to_string(),
                })?
        } else {
            self.next_num
        };

        let rest = rest[digits..].trim_start();
        let rest = rest.strip_prefix('-').unwrap_or(rest).trim_start();

        let mut test = Testline::new(ok, num, rest.trim_end());
        if let Some(idx) = find_directive_hash(rest) {
            let annotation = rest[idx + 1..].trim();
            let upper = annotation.to_ascii_uppercase();
            let kind = if upper.starts_with("SKIP") {
                Some(DirectiveKind::Skip)
            } else if upper.starts_with("TODO") {
                Some(DirectiveKind::Todo)
            } else {
                None
            };
            if let Some(kind) = kind {
                let explanation = annotation
                    .trim_start_matches(|c: char| !c.is_whitespace())
                    .trim();
                test = Testline::new(ok, num, rest[..idx].trim_end())
                    .with_directive(kind, explanation);
            }
        }

        Ok(Some(test))
    }

    fn append_diagnostic(&mut self, text: &str) {
        if let Some(last) = self.tests.last_mut() {
            if !last.diagnostic.is_empty() {
                last.diagnostic.push('\n');
            }
            last.diagnostic.push_str(text);
        }
    }
}

/// Index of the first `#` that is not escaped with a backslash
fn find_directive_hash(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    (0..bytes.len()).find(|&i| bytes[i] == b'#' && (i == 0 || bytes[i - 1] != b'\\'))
}
