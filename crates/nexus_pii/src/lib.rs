//! nexus_pii
//!
//! Detects and redacts sensitive strings before any prompt leaves the
//! gateway. Pattern table and sequential-substitution semantics mirror the
//! model this gateway replaces: categories are tried in a fixed order,
//! matches are taken off the buffer as it is being redacted (so an earlier
//! category's substitution can change later categories' match offsets), and
//! critical categories can mark a request for blocking upstream.
//!
//! Stateless and safe for concurrent calls: nothing here holds per-call
//! mutable state beyond a local string buffer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

struct PatternSpec {
    name: &'static str,
    pattern: &'static str,
    critical: bool,
}

/// Ordered pattern table. Order matters: earlier categories are substituted
/// first, so their `[TYPE]` placeholders become part of the buffer that
/// later categories scan.
const PATTERN_SPECS: &[PatternSpec] = &[
    PatternSpec {
        name: "CREDIT_CARD",
        pattern: r"\b(?:4[0-9]{12}(?:[0-9]{3})?|5[1-5][0-9]{14}|3[47][0-9]{13}|6(?:011|5[0-9]{2})[0-9]{12})\b",
        critical: true,
    },
    PatternSpec {
        name: "API_KEY",
        pattern: r"\b(?:sk-[a-zA-Z0-9]{32,}|sk-ant-[a-zA-Z0-9\-]{50,}|AIza[0-9A-Za-z\-_]{35})\b",
        critical: true,
    },
    PatternSpec {
        name: "AWS_KEY",
        pattern: r"\b(?:AKIA|AIPA|ABIA|ACCA)[0-9A-Z]{16}\b",
        critical: true,
    },
    PatternSpec {
        name: "EMAIL_ADDRESS",
        pattern: r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b",
        critical: false,
    },
    PatternSpec {
        name: "PHONE_NUMBER",
        pattern: r"\b(?:\+?55\s?)?(?:\(?\d{2}\)?\s?)?(?:9\s?)?\d{4}[\s\-]?\d{4}\b",
        critical: false,
    },
    PatternSpec {
        name: "CPF",
        pattern: r"\b\d{3}[.\-]?\d{3}[.\-]?\d{3}[.\-]?\d{2}\b",
        critical: false,
    },
    PatternSpec {
        name: "CNPJ",
        pattern: r"\b\d{2}[.\-]?\d{3}[.\-]?\d{3}[./]?\d{4}[.\-]?\d{2}\b",
        critical: false,
    },
    PatternSpec {
        name: "SSN",
        pattern: r"\b\d{3}-?\d{2}-?\d{4}\b",
        critical: false,
    },
    PatternSpec {
        name: "IP_ADDRESS",
        pattern: r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
        critical: false,
    },
    PatternSpec {
        name: "IBAN",
        pattern: r"\b[A-Z]{2}[0-9]{2}[A-Z0-9]{4}[0-9]{7}(?:[A-Z0-9]?){0,16}\b",
        critical: false,
    },
    PatternSpec {
        name: "PASSPORT",
        pattern: r"\b[A-Z]{1,2}[0-9]{6,9}\b",
        critical: false,
    },
];

struct CompiledPattern {
    name: &'static str,
    regex: Regex,
    critical: bool,
}

static PATTERNS: Lazy<Vec<CompiledPattern>> = Lazy::new(|| {
    PATTERN_SPECS
        .iter()
        .map(|spec| CompiledPattern {
            name: spec.name,
            regex: Regex::new(&format!("(?i){}", spec.pattern)).expect("static PII pattern is valid"),
            critical: spec.critical,
        })
        .collect()
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PiiEntity {
    pub r#type: String,
    pub start: usize,
    pub end: usize,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiResult {
    pub has_pii: bool,
    pub has_critical: bool,
    pub entities: Vec<PiiEntity>,
    pub redacted_text: String,
}

/// Scan `text` against the ordered pattern table, redacting matches in
/// place as each category is processed.
pub fn analyze(text: &str) -> PiiResult {
    let mut buffer = text.to_string();
    let mut entities = Vec::new();
    let mut has_critical = false;

    for pat in PATTERNS.iter() {
        let matches: Vec<(usize, usize)> = pat
            .regex
            .find_iter(&buffer)
            .map(|m| (m.start(), m.end()))
            .collect();
        if matches.is_empty() {
            continue;
        }
        for (start, end) in &matches {
            entities.push(PiiEntity {
                r#type: pat.name.to_string(),
                start: *start,
                end: *end,
                critical: pat.critical,
            });
            if pat.critical {
                has_critical = true;
            }
        }
        let replacement = format!("[{}]", pat.name);
        buffer = pat.regex.replace_all(&buffer, replacement.as_str()).into_owned();
    }

    PiiResult {
        has_pii: !entities.is_empty(),
        has_critical,
        entities,
        redacted_text: buffer,
    }
}

/// `analyze(text).has_critical` as a standalone check for callers that
/// only care about the blocking decision.
pub fn should_block(text: &str) -> bool {
    analyze(text).has_critical
}
