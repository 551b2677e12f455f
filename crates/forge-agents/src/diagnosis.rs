//! Error diagnosis: pattern rules, stack-trace parsing, and the oracle
//! fallback.
//!
//! Classification is a first-match-wins walk over an ordered rule set.
//! A rule match at or above [`AUTHORITATIVE_CONFIDENCE`] is final and the
//! oracle is never consulted; anything weaker is sent to the oracle as a
//! hint and the JSON reply is merged field-by-field, higher confidence
//! winning.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::oracle::{AiOracle, OracleCapability, OracleOptions};

/// Rule matches at or above this confidence skip the oracle.
pub const AUTHORITATIVE_CONFIDENCE: f64 = 0.8;

/// Broad classification of a build or runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Syntax,
    Type,
    Runtime,
    Dependency,
    Config,
    Security,
    /// No error present.
    None,
    Unknown,
}

/// A concrete search/replace edit. `search_text` must match exactly once
/// when applied; an empty `search_text` marks an advisory fix that locates
/// the problem but cannot synthesize the replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub description: String,
    #[serde(rename = "search", default)]
    pub search_text: String,
    #[serde(rename = "replace", default)]
    pub replace_text: String,
}

impl Fix {
    /// Whether this fix carries an applicable edit.
    pub fn is_applicable(&self) -> bool {
        !self.search_text.is_empty()
    }
}

/// One frame of a normalized stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// A parsed stack trace. Frames are normalized so the first frame is the
/// error site regardless of the source format's ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    pub language: String,
    pub frames: Vec<StackFrame>,
    pub summary: String,
}

/// Outcome of a diagnosis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub error_type: ErrorType,
    pub root_cause: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub fixes: Vec<Fix>,
    pub confidence: f64,
    #[serde(default)]
    pub cause_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<StackTrace>,
}

impl DiagnosisResult {
    fn unknown(root_cause: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::Unknown,
            root_cause: root_cause.into(),
            affected_files: Vec::new(),
            fixes: Vec::new(),
            confidence: 0.2,
            cause_chain: Vec::new(),
            language: None,
            stack_trace: None,
        }
    }
}

// ── classification rules ─────────────────────────────────────────────────

struct Rule {
    regex: &'static LazyLock<Regex>,
    error_type: ErrorType,
    language: &'static str,
    confidence: f64,
    build: fn(&regex::Captures<'_>) -> (String, Vec<String>, Vec<Fix>),
}

static GO_UNDEFINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?P<file>[^\s:]+\.go):(?P<line>\d+):(?P<col>\d+): undefined: (?P<sym>\S+)")
        .unwrap()
});

static GO_COMPILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?P<file>[^\s:]+\.go):(?P<line>\d+):(?P<col>\d+): (?P<msg>.+)$")
        .unwrap()
});

static TS_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?P<file>\S+?)\((?P<line>\d+),(?P<col>\d+)\): error TS(?P<code>\d+): (?P<msg>.+)$",
    )
    .unwrap()
});

static MODULE_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)cannot find (?:module|package) ['"](?P<module>[^'"]+)['"]"#)
        .unwrap()
});

static NPM_RESOLVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)npm ERR! (?:code )?(?P<code>ERESOLVE|E404|ETARGET)").unwrap()
});

static JS_SYNTAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SyntaxError: (?P<msg>.+)").unwrap());

static JS_RUNTIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<kind>ReferenceError|TypeError|RangeError): (?P<msg>.+)").unwrap()
});

static PY_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?P<kind>\w+Error): (?P<msg>.+)$").unwrap()
});

static RUST_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^error\[E(?P<code>\d+)\]: (?P<msg>.+)$").unwrap()
});

static RUST_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*--> (?P<file>\S+):(?P<line>\d+):(?P<col>\d+)").unwrap()
});

static ENV_CONFIG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(missing required env|environment variable `?(?P<var>[A-Z0-9_]+)`? is not set|invalid configuration)")
        .unwrap()
});

static SECURITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(permission denied|EACCES|unauthorized|forbidden|csrf token)")
        .unwrap()
});

fn advisory_fix(file: &str, line: Option<u32>, description: String) -> Fix {
    Fix {
        file: file.to_string(),
        line,
        description,
        search_text: String::new(),
        replace_text: String::new(),
    }
}

fn capture_u32(caps: &regex::Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

/// Ordered rule set; the first matching rule wins.
static RULES: &[Rule] = &[
    Rule {
        regex: &GO_UNDEFINED,
        error_type: ErrorType::Type,
        language: "go",
        confidence: 0.9,
        build: |caps| {
            let file = caps["file"].to_string();
            let line = capture_u32(caps, "line");
            let sym = caps["sym"].to_string();
            (
                format!("undefined identifier `{sym}`"),
                vec![file.clone()],
                vec![advisory_fix(
                    &file,
                    line,
                    format!("define or import `{sym}`"),
                )],
            )
        },
    },
    Rule {
        regex: &TS_ERROR,
        error_type: ErrorType::Type,
        language: "typescript",
        confidence: 0.9,
        build: |caps| {
            let file = caps["file"].to_string();
            let line = capture_u32(caps, "line");
            let msg = caps["msg"].to_string();
            (
                format!("TS{}: {msg}", &caps["code"]),
                vec![file.clone()],
                vec![advisory_fix(&file, line, msg)],
            )
        },
    },
    Rule {
        regex: &MODULE_NOT_FOUND,
        error_type: ErrorType::Dependency,
        language: "javascript",
        confidence: 0.85,
        build: |caps| {
            let module = caps["module"].to_string();
            (
                format!("unresolved dependency `{module}`"),
                vec!["package.json".to_string()],
                vec![advisory_fix(
                    "package.json",
                    None,
                    format!("add `{module}` to dependencies"),
                )],
            )
        },
    },
    Rule {
        regex: &NPM_RESOLVE,
        error_type: ErrorType::Dependency,
        language: "javascript",
        confidence: 0.75,
        build: |caps| {
            (
                format!("package resolution failed ({})", &caps["code"]),
                vec!["package.json".to_string()],
                Vec::new(),
            )
        },
    },
    Rule {
        regex: &RUST_ERROR,
        error_type: ErrorType::Type,
        language: "rust",
        confidence: 0.85,
        build: |caps| {
            let msg = caps["msg"].to_string();
            (format!("E{}: {msg}", &caps["code"]), Vec::new(), Vec::new())
        },
    },
    Rule {
        regex: &GO_COMPILE,
        error_type: ErrorType::Syntax,
        language: "go",
        confidence: 0.7,
        build: |caps| {
            let file = caps["file"].to_string();
            let line = capture_u32(caps, "line");
            let msg = caps["msg"].to_string();
            (msg.clone(), vec![file.clone()], vec![advisory_fix(&file, line, msg)])
        },
    },
    Rule {
        regex: &JS_SYNTAX,
        error_type: ErrorType::Syntax,
        language: "javascript",
        confidence: 0.8,
        build: |caps| (caps["msg"].to_string(), Vec::new(), Vec::new()),
    },
    Rule {
        regex: &JS_RUNTIME,
        error_type: ErrorType::Runtime,
        language: "javascript",
        confidence: 0.8,
        build: |caps| {
            (
                format!("{}: {}", &caps["kind"], &caps["msg"]),
                Vec::new(),
                Vec::new(),
            )
        },
    },
    Rule {
        regex: &PY_ERROR,
        error_type: ErrorType::Runtime,
        language: "python",
        confidence: 0.75,
        build: |caps| {
            (
                format!("{}: {}", &caps["kind"], &caps["msg"]),
                Vec::new(),
                Vec::new(),
            )
        },
    },
    Rule {
        regex: &SECURITY,
        error_type: ErrorType::Security,
        language: "",
        confidence: 0.7,
        build: |caps| (caps[0].trim().to_string(), Vec::new(), Vec::new()),
    },
    Rule {
        regex: &ENV_CONFIG,
        error_type: ErrorType::Config,
        language: "",
        confidence: 0.75,
        build: |caps| {
            let root = caps
                .name("var")
                .map(|v| format!("environment variable `{}` is not set", v.as_str()))
                .unwrap_or_else(|| caps[0].trim().to_string());
            (root, Vec::new(), Vec::new())
        },
    },
];

// ── stack-trace parsers ──────────────────────────────────────────────────

static NODE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s+at (?P<func>[^(\s][^(]*?) \((?P<file>[^):]+):(?P<line>\d+):(?P<col>\d+)\)")
        .unwrap()
});

static PY_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*File "(?P<file>[^"]+)", line (?P<line>\d+), in (?P<func>\S+)"#)
        .unwrap()
});

static GO_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?P<func>[\w./()*]+\([^)]*\))\n\t(?P<file>[^\s:]+):(?P<line>\d+)")
        .unwrap()
});

static RUST_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s+\d+: (?P<func>.+)\n\s+at (?P<file>[^\s:]+):(?P<line>\d+)")
        .unwrap()
});

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Node/V8 traces list the error site first; order is kept.
fn parse_node_stack(text: &str) -> Option<StackTrace> {
    let frames: Vec<StackFrame> = NODE_FRAME
        .captures_iter(text)
        .map(|caps| StackFrame {
            function: caps["func"].trim().to_string(),
            file: caps["file"].to_string(),
            line: capture_u32(&caps, "line"),
            column: capture_u32(&caps, "col"),
        })
        .collect();
    if frames.is_empty() {
        return None;
    }
    Some(StackTrace {
        language: "javascript".into(),
        summary: first_line(text),
        frames,
    })
}

/// Python tracebacks are outermost-first with the error site last;
/// reversed so the first frame is the error site.
fn parse_python_traceback(text: &str) -> Option<StackTrace> {
    if !text.contains("Traceback (most recent call last)") {
        return None;
    }
    let mut frames: Vec<StackFrame> = PY_FRAME
        .captures_iter(text)
        .map(|caps| StackFrame {
            function: caps["func"].to_string(),
            file: caps["file"].to_string(),
            line: capture_u32(&caps, "line"),
            column: None,
        })
        .collect();
    if frames.is_empty() {
        return None;
    }
    frames.reverse();
    let summary = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string();
    Some(StackTrace {
        language: "python".into(),
        frames,
        summary,
    })
}

/// Go panics list the error site first after the goroutine header.
fn parse_go_panic(text: &str) -> Option<StackTrace> {
    if !text.contains("goroutine ") {
        return None;
    }
    let frames: Vec<StackFrame> = GO_FRAME
        .captures_iter(text)
        .map(|caps| StackFrame {
            function: caps["func"].to_string(),
            file: caps["file"].to_string(),
            line: capture_u32(&caps, "line"),
            column: None,
        })
        .collect();
    if frames.is_empty() {
        return None;
    }
    let summary = text
        .lines()
        .find(|l| l.starts_with("panic:"))
        .unwrap_or_default()
        .trim()
        .to_string();
    Some(StackTrace {
        language: "go".into(),
        frames,
        summary: if summary.is_empty() {
            first_line(text)
        } else {
            summary
        },
    })
}

/// Rust panic backtraces list the error site first.
fn parse_rust_panic(text: &str) -> Option<StackTrace> {
    if !text.contains("panicked at") {
        return None;
    }
    let frames: Vec<StackFrame> = RUST_FRAME
        .captures_iter(text)
        .map(|caps| StackFrame {
            function: caps["func"].trim().to_string(),
            file: caps["file"].to_string(),
            line: capture_u32(&caps, "line"),
            column: None,
        })
        .collect();
    if frames.is_empty() {
        return None;
    }
    let summary = text
        .lines()
        .find(|l| l.contains("panicked at"))
        .unwrap_or_default()
        .trim()
        .to_string();
    Some(StackTrace {
        language: "rust".into(),
        frames,
        summary,
    })
}

/// Try each trace format in turn; first recognizer wins.
pub fn parse_stack_trace(text: &str) -> Option<StackTrace> {
    parse_python_traceback(text)
        .or_else(|| parse_go_panic(text))
        .or_else(|| parse_rust_panic(text))
        .or_else(|| parse_node_stack(text))
}

// ── classifier ───────────────────────────────────────────────────────────

/// Pattern-matched diagnosis with an oracle fallback for weak matches.
#[derive(Default)]
pub struct DiagnosisClassifier;

impl DiagnosisClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify without the oracle. Stack traces are parsed independently
    /// of rule classification and attached to the result.
    pub fn classify(&self, error_text: &str) -> DiagnosisResult {
        if error_text.trim().is_empty() {
            return DiagnosisResult {
                error_type: ErrorType::None,
                root_cause: String::new(),
                affected_files: Vec::new(),
                fixes: Vec::new(),
                confidence: 1.0,
                cause_chain: Vec::new(),
                language: None,
                stack_trace: None,
            };
        }

        let stack_trace = parse_stack_trace(error_text);

        let mut result = RULES
            .iter()
            .find_map(|rule| {
                rule.regex.captures(error_text).map(|caps| {
                    let (root_cause, affected_files, fixes) = (rule.build)(&caps);
                    debug!(
                        error_type = ?rule.error_type,
                        language = rule.language,
                        confidence = rule.confidence,
                        "diagnosis rule matched"
                    );
                    DiagnosisResult {
                        error_type: rule.error_type,
                        cause_chain: vec![root_cause.clone()],
                        root_cause,
                        affected_files,
                        fixes,
                        confidence: rule.confidence,
                        language: (!rule.language.is_empty())
                            .then(|| rule.language.to_string()),
                        stack_trace: None,
                    }
                })
            })
            .unwrap_or_else(|| DiagnosisResult::unknown(first_line(error_text)));

        // rustc prints the location on its own `-->` line, separate from
        // the error header the rule matched.
        if result.language.as_deref() == Some("rust") && result.affected_files.is_empty() {
            if let Some(caps) = RUST_LOCATION.captures(error_text) {
                let file = caps["file"].to_string();
                let line = capture_u32(&caps, "line");
                result.fixes.push(advisory_fix(&file, line, result.root_cause.clone()));
                result.affected_files.push(file);
            }
        }

        if let Some(trace) = stack_trace {
            // The trace's error-site frame is an affected file even when no
            // rule recognized the message.
            if let Some(frame) = trace.frames.first() {
                if !result.affected_files.contains(&frame.file) {
                    result.affected_files.push(frame.file.clone());
                }
            }
            // The trace format is direct evidence of the language.
            result.language = Some(trace.language.clone());
            result.stack_trace = Some(trace);
        }

        result
    }

    /// Full diagnosis: the rule result is authoritative at high confidence;
    /// otherwise the oracle is consulted with the rule result as a hint and
    /// the two are merged.
    pub async fn diagnose(&self, oracle: &dyn AiOracle, error_text: &str) -> DiagnosisResult {
        let rule_result = self.classify(error_text);
        if rule_result.confidence >= AUTHORITATIVE_CONFIDENCE
            || rule_result.error_type == ErrorType::None
        {
            return rule_result;
        }

        let hint = serde_json::to_string(&rule_result).unwrap_or_default();
        let instruction = format!(
            "Diagnose this build/runtime error. A pattern classifier produced this hint:\n{hint}\n\
             Respond with JSON only: {{\"error_type\", \"root_cause\", \"affected_files\", \
             \"cause_chain\", \"fixes\": [{{\"file\", \"line\", \"description\", \"search\", \
             \"replace\"}}], \"confidence\"}}"
        );
        let options = OracleOptions {
            capability: Some(OracleCapability::Debugging),
            ..Default::default()
        };

        match oracle.analyze(error_text, &instruction, &options).await {
            Ok(reply) => match parse_oracle_diagnosis(&reply) {
                Some(oracle_result) => merge_diagnoses(rule_result, oracle_result),
                None => {
                    warn!("oracle diagnosis reply unparseable; keeping rule result");
                    rule_result
                }
            },
            Err(e) => {
                warn!(error = %e, "oracle diagnosis failed; keeping rule result");
                rule_result
            }
        }
    }
}

/// Strip fenced-code wrappers the oracle sometimes adds around JSON.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json"), then the closing fence.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the oracle's diagnosis JSON contract.
pub fn parse_oracle_diagnosis(reply: &str) -> Option<DiagnosisResult> {
    let body = strip_code_fences(reply);
    serde_json::from_str::<DiagnosisResult>(body).ok()
}

/// Aggregate view over the diagnoses of one healing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisSummary {
    pub total: usize,
    pub by_type: std::collections::HashMap<String, usize>,
    /// Highest confidence seen across the run.
    pub peak_confidence: f64,
    /// Distinct files implicated, first-seen order.
    pub affected_files: Vec<String>,
    pub has_security_findings: bool,
    pub has_dependency_findings: bool,
}

impl DiagnosisSummary {
    pub fn from_diagnoses(diagnoses: &[DiagnosisResult]) -> Self {
        let mut by_type = std::collections::HashMap::new();
        let mut affected_files = Vec::new();
        let mut peak_confidence: f64 = 0.0;
        let mut has_security_findings = false;
        let mut has_dependency_findings = false;

        for diagnosis in diagnoses {
            *by_type
                .entry(format!("{:?}", diagnosis.error_type).to_lowercase())
                .or_insert(0) += 1;
            peak_confidence = peak_confidence.max(diagnosis.confidence);
            has_security_findings |= diagnosis.error_type == ErrorType::Security;
            has_dependency_findings |= diagnosis.error_type == ErrorType::Dependency;
            for file in &diagnosis.affected_files {
                if !affected_files.contains(file) {
                    affected_files.push(file.clone());
                }
            }
        }

        Self {
            total: diagnoses.len(),
            by_type,
            peak_confidence,
            affected_files,
            has_security_findings,
            has_dependency_findings,
        }
    }

    /// Whether the run warrants human attention regardless of healing
    /// outcome.
    pub fn needs_review(&self) -> bool {
        self.has_security_findings || self.peak_confidence < 0.5
    }
}

/// Merge rule and oracle diagnoses: the higher-confidence source wins
/// `error_type`, `root_cause`, and `language`; affected files are unioned;
/// fixes are deduplicated by `(file, line)`.
pub fn merge_diagnoses(rule: DiagnosisResult, oracle: DiagnosisResult) -> DiagnosisResult {
    let rule_wins = rule.confidence >= oracle.confidence;
    let (primary, secondary) = if rule_wins {
        (rule, oracle)
    } else {
        (oracle, rule)
    };

    let mut affected_files = primary.affected_files.clone();
    for file in secondary.affected_files {
        if !affected_files.contains(&file) {
            affected_files.push(file);
        }
    }

    let mut fixes = primary.fixes.clone();
    for fix in secondary.fixes {
        if !fixes
            .iter()
            .any(|existing| existing.file == fix.file && existing.line == fix.line)
        {
            fixes.push(fix);
        }
    }

    let mut cause_chain = primary.cause_chain.clone();
    for cause in secondary.cause_chain {
        if !cause_chain.contains(&cause) {
            cause_chain.push(cause);
        }
    }

    DiagnosisResult {
        error_type: primary.error_type,
        root_cause: primary.root_cause,
        affected_files,
        fixes,
        confidence: primary.confidence,
        cause_chain,
        language: primary.language.or(secondary.language),
        stack_trace: primary.stack_trace.or(secondary.stack_trace),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use async_trait::async_trait;

    /// Panics when consulted: used to prove the oracle is skipped.
    struct UnreachableOracle;

    #[async_trait]
    impl AiOracle for UnreachableOracle {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &OracleOptions,
        ) -> Result<String, OracleError> {
            panic!("oracle must not be consulted")
        }
        async fn analyze(
            &self,
            _content: &str,
            _instruction: &str,
            _options: &OracleOptions,
        ) -> Result<String, OracleError> {
            panic!("oracle must not be consulted")
        }
    }

    /// Returns a canned reply.
    struct CannedOracle(String);

    #[async_trait]
    impl AiOracle for CannedOracle {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &OracleOptions,
        ) -> Result<String, OracleError> {
            Ok(self.0.clone())
        }
        async fn analyze(
            &self,
            _content: &str,
            _instruction: &str,
            _options: &OracleOptions,
        ) -> Result<String, OracleError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_go_undefined_is_authoritative() {
        let classifier = DiagnosisClassifier::new();
        let result = classifier
            .diagnose(&UnreachableOracle, "src/x.go:10:5: undefined: Foo")
            .await;

        assert_eq!(result.error_type, ErrorType::Type);
        assert_eq!(result.language.as_deref(), Some("go"));
        assert!(result.confidence >= 0.9);
        assert_eq!(result.fixes.len(), 1);
        assert_eq!(result.fixes[0].file, "src/x.go");
        assert_eq!(result.fixes[0].line, Some(10));
    }

    #[test]
    fn test_first_match_wins_over_later_rules() {
        let classifier = DiagnosisClassifier::new();
        // Matches both the undefined rule and the generic go rule; the
        // undefined rule is earlier and wins.
        let result = classifier.classify("pkg/a.go:3:1: undefined: Bar");
        assert_eq!(result.error_type, ErrorType::Type);
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn test_ts_error_classification() {
        let classifier = DiagnosisClassifier::new();
        let result =
            classifier.classify("src/App.tsx(14,5): error TS2304: Cannot find name 'Foo'.");
        assert_eq!(result.error_type, ErrorType::Type);
        assert_eq!(result.language.as_deref(), Some("typescript"));
        assert_eq!(result.affected_files, vec!["src/App.tsx"]);
        assert!(result.root_cause.contains("TS2304"));
    }

    #[test]
    fn test_module_not_found_is_dependency() {
        let classifier = DiagnosisClassifier::new();
        let result = classifier.classify("Error: Cannot find module 'left-pad'");
        assert_eq!(result.error_type, ErrorType::Dependency);
        assert_eq!(result.affected_files, vec!["package.json"]);
        assert!(result.fixes[0].description.contains("left-pad"));
    }

    #[test]
    fn test_empty_input_is_none() {
        let classifier = DiagnosisClassifier::new();
        let result = classifier.classify("  \n ");
        assert_eq!(result.error_type, ErrorType::None);
        assert_eq!(result.confidence, 1.0);
        assert!(result.fixes.is_empty());
    }

    #[test]
    fn test_unrecognized_input_is_unknown() {
        let classifier = DiagnosisClassifier::new();
        let result = classifier.classify("something inexplicable happened");
        assert_eq!(result.error_type, ErrorType::Unknown);
        assert!(result.confidence < AUTHORITATIVE_CONFIDENCE);
    }

    #[test]
    fn test_rust_error_location_from_arrow_line() {
        let classifier = DiagnosisClassifier::new();
        let result = classifier.classify(
            "error[E0308]: mismatched types\n  --> src/lib.rs:42:9\n   |\n42 |     1u32\n",
        );
        assert_eq!(result.error_type, ErrorType::Type);
        assert_eq!(result.language.as_deref(), Some("rust"));
        assert_eq!(result.affected_files, vec!["src/lib.rs"]);
        assert_eq!(result.fixes[0].line, Some(42));
    }

    #[test]
    fn test_config_and_security_rules() {
        let classifier = DiagnosisClassifier::new();
        let config = classifier.classify("environment variable DATABASE_URL is not set");
        assert_eq!(config.error_type, ErrorType::Config);
        assert!(config.root_cause.contains("DATABASE_URL"));

        let security = classifier.classify("EACCES: permission denied, open '/etc/shadow'");
        assert_eq!(security.error_type, ErrorType::Security);
    }

    #[test]
    fn test_node_stack_error_site_first() {
        let trace = parse_stack_trace(
            "TypeError: x is not a function\n    at handler (src/routes.js:42:13)\n    at dispatch (src/router.js:101:5)",
        )
        .unwrap();
        assert_eq!(trace.language, "javascript");
        assert_eq!(trace.frames[0].file, "src/routes.js");
        assert_eq!(trace.frames[0].line, Some(42));
        assert_eq!(trace.frames[0].column, Some(13));
        assert_eq!(trace.frames.len(), 2);
    }

    #[test]
    fn test_python_traceback_reversed_to_error_site_first() {
        let text = "Traceback (most recent call last):\n  File \"app.py\", line 10, in main\n  File \"svc.py\", line 99, in handle\nValueError: bad input";
        let trace = parse_stack_trace(text).unwrap();
        assert_eq!(trace.language, "python");
        // svc.py is the error site; it comes first after normalization.
        assert_eq!(trace.frames[0].file, "svc.py");
        assert_eq!(trace.frames[1].file, "app.py");
        assert_eq!(trace.summary, "ValueError: bad input");
    }

    #[test]
    fn test_go_panic_parsing() {
        let text = "panic: runtime error: index out of range [3]\n\ngoroutine 1 [running]:\nmain.lookup(0x0)\n\t/app/main.go:27 +0x1d\nmain.main()\n\t/app/main.go:12 +0x40\n";
        let trace = parse_stack_trace(text).unwrap();
        assert_eq!(trace.language, "go");
        assert_eq!(trace.frames[0].file, "/app/main.go");
        assert_eq!(trace.frames[0].line, Some(27));
        assert!(trace.summary.starts_with("panic:"));
    }

    #[test]
    fn test_rust_panic_parsing() {
        let text = "thread 'main' panicked at src/lib.rs:8:5:\nindex out of bounds\nstack backtrace:\n   0: core::panicking::panic_bounds_check\n             at library/core/src/panicking.rs:274\n   1: forge::run\n             at src/lib.rs:8\n";
        let trace = parse_stack_trace(text).unwrap();
        assert_eq!(trace.language, "rust");
        assert_eq!(trace.frames.len(), 2);
        assert!(trace.summary.contains("panicked at"));
    }

    #[test]
    fn test_stack_trace_attaches_affected_file() {
        let classifier = DiagnosisClassifier::new();
        let result = classifier.classify(
            "TypeError: x is not a function\n    at handler (src/routes.js:42:13)",
        );
        assert_eq!(result.error_type, ErrorType::Runtime);
        assert!(result.affected_files.contains(&"src/routes.js".to_string()));
        assert!(result.stack_trace.is_some());
    }

    #[test]
    fn test_oracle_json_fence_stripping() {
        let reply = "```json\n{\"error_type\":\"syntax\",\"root_cause\":\"missing brace\",\"confidence\":0.9,\"affected_files\":[],\"cause_chain\":[],\"fixes\":[]}\n```";
        let parsed = parse_oracle_diagnosis(reply).unwrap();
        assert_eq!(parsed.error_type, ErrorType::Syntax);
        assert_eq!(parsed.root_cause, "missing brace");
    }

    #[test]
    fn test_oracle_fix_field_names() {
        let reply = r#"{"error_type":"type","root_cause":"x","confidence":0.9,"affected_files":[],"cause_chain":[],"fixes":[{"file":"a.ts","line":3,"description":"d","search":"old","replace":"new"}]}"#;
        let parsed = parse_oracle_diagnosis(reply).unwrap();
        assert_eq!(parsed.fixes[0].search_text, "old");
        assert_eq!(parsed.fixes[0].replace_text, "new");
        assert!(parsed.fixes[0].is_applicable());
    }

    #[tokio::test]
    async fn test_weak_match_consults_oracle_and_merges() {
        let reply = r#"{"error_type":"dependency","root_cause":"stale lockfile","confidence":0.95,"affected_files":["package-lock.json"],"cause_chain":["lockfile drift"],"fixes":[{"file":"package-lock.json","line":null,"description":"regenerate","search":"","replace":""}]}"#;
        let oracle = CannedOracle(reply.to_string());
        let classifier = DiagnosisClassifier::new();

        let result = classifier
            .diagnose(&oracle, "something inexplicable happened")
            .await;
        // Oracle confidence 0.95 beats the unknown rule's 0.2.
        assert_eq!(result.error_type, ErrorType::Dependency);
        assert_eq!(result.root_cause, "stale lockfile");
        assert!(result
            .affected_files
            .contains(&"package-lock.json".to_string()));
    }

    #[tokio::test]
    async fn test_oracle_failure_keeps_rule_result() {
        struct FailingOracle;

        #[async_trait]
        impl AiOracle for FailingOracle {
            async fn generate(
                &self,
                _p: &str,
                _o: &OracleOptions,
            ) -> Result<String, OracleError> {
                Err(OracleError::Request("503".into()))
            }
            async fn analyze(
                &self,
                _c: &str,
                _i: &str,
                _o: &OracleOptions,
            ) -> Result<String, OracleError> {
                Err(OracleError::Request("503".into()))
            }
        }

        let classifier = DiagnosisClassifier::new();
        let result = classifier
            .diagnose(&FailingOracle, "something inexplicable happened")
            .await;
        assert_eq!(result.error_type, ErrorType::Unknown);
    }

    #[test]
    fn test_diagnosis_summary_aggregates() {
        let classifier = DiagnosisClassifier::new();
        let diagnoses = vec![
            classifier.classify("src/x.go:10:5: undefined: Foo"),
            classifier.classify("Error: Cannot find module 'left-pad'"),
            classifier.classify("EACCES: permission denied"),
        ];

        let summary = DiagnosisSummary::from_diagnoses(&diagnoses);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type.get("type"), Some(&1));
        assert_eq!(summary.by_type.get("dependency"), Some(&1));
        assert_eq!(summary.by_type.get("security"), Some(&1));
        assert!(summary.peak_confidence >= 0.9);
        assert!(summary.has_security_findings);
        assert!(summary.has_dependency_findings);
        assert!(summary.affected_files.contains(&"src/x.go".to_string()));
        // Security findings always flag review.
        assert!(summary.needs_review());
    }

    #[test]
    fn test_diagnosis_summary_empty_run() {
        let summary = DiagnosisSummary::from_diagnoses(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.peak_confidence, 0.0);
        assert!(!summary.has_security_findings);
        // Nothing confident was found; a human should look.
        assert!(summary.needs_review());
    }

    #[test]
    fn test_merge_dedupes_fixes_by_file_and_line() {
        let rule = DiagnosisResult {
            error_type: ErrorType::Type,
            root_cause: "rule cause".into(),
            affected_files: vec!["a.ts".into()],
            fixes: vec![Fix {
                file: "a.ts".into(),
                line: Some(3),
                description: "rule fix".into(),
                search_text: String::new(),
                replace_text: String::new(),
            }],
            confidence: 0.9,
            cause_chain: vec!["rule cause".into()],
            language: Some("typescript".into()),
            stack_trace: None,
        };
        let oracle = DiagnosisResult {
            error_type: ErrorType::Runtime,
            root_cause: "oracle cause".into(),
            affected_files: vec!["a.ts".into(), "b.ts".into()],
            fixes: vec![
                Fix {
                    file: "a.ts".into(),
                    line: Some(3),
                    description: "duplicate".into(),
                    search_text: "x".into(),
                    replace_text: "y".into(),
                },
                Fix {
                    file: "b.ts".into(),
                    line: Some(7),
                    description: "new".into(),
                    search_text: "p".into(),
                    replace_text: "q".into(),
                },
            ],
            confidence: 0.6,
            cause_chain: vec!["oracle cause".into()],
            language: None,
            stack_trace: None,
        };

        let merged = merge_diagnoses(rule, oracle);
        // Rule wins the contested fields.
        assert_eq!(merged.error_type, ErrorType::Type);
        assert_eq!(merged.root_cause, "rule cause");
        assert_eq!(merged.language.as_deref(), Some("typescript"));
        // Files unioned, fixes deduped by (file, line).
        assert_eq!(merged.affected_files, vec!["a.ts", "b.ts"]);
        assert_eq!(merged.fixes.len(), 2);
        assert_eq!(merged.fixes[0].description, "rule fix");
        assert_eq!(merged.fixes[1].file, "b.ts");
    }
}
