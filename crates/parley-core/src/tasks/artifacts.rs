//! Output-to-artifact parser
//!
//! Turns a raw output snapshot into artifacts. The snapshot is rendered
//! through vt100 first, then the echoed input and the trailing prompt are
//! removed before segmenting.

use super::types::{Artifact, FileAction};
use crate::ansi::render_plain;
use crate::error::ParleyError;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

const RENDER_COLS: u16 = 200;

/// Result of parsing one output snapshot
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedOutput {
    pub artifacts: Vec<Artifact>,
    /// First error signature found, if any
    pub error: Option<DetectedError>,
    /// The output ends by asking a question
    pub needs_input: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedError {
    pub kind: ErrorSignature,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSignature {
    PermissionDenied,
    ConnectionRefused,
    RateLimited,
    Refusal,
}

impl ErrorSignature {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSignature::PermissionDenied => "permission_denied",
            ErrorSignature::ConnectionRefused => "connection_refused",
            ErrorSignature::RateLimited => "rate_limited",
            ErrorSignature::Refusal => "refusal",
        }
    }
}

impl DetectedError {
    /// The task-level error this signature maps to
    pub fn to_error(&self) -> ParleyError {
        match self.kind {
            ErrorSignature::Refusal => ParleyError::AgentRefused(self.text.clone()),
            _ => ParleyError::CliExecution(format!("{}: {}", self.kind.as_str(), self.text)),
        }
    }
}

struct Signatures {
    permission: Regex,
    connection: Regex,
    rate_limit: Regex,
    refusal: Regex,
    file_touch: Regex,
    question: Regex,
}

fn signatures() -> &'static Signatures {
    static SIGNATURES: OnceLock<Signatures> = OnceLock::new();
    SIGNATURES.get_or_init(|| Signatures {
        permission: Regex::new(r"(?i)\bpermission denied\b|\bEACCES\b").expect("static regex"),
        connection: Regex::new(r"(?i)\bconnection refused\b|\bECONNREFUSED\b").expect("static regex"),
        rate_limit: Regex::new(r"(?i)\brate[ -]?limit|\btoo many requests\b|\b429\b").expect("static regex"),
        refusal: Regex::new(
            r"(?i)\bI\s+can(?:'|’|no)?t\s+help\s+with\b|\bI\s+cannot\s+assist\b|\bI\s+won(?:'|’)t\b",
        )
        .expect("static regex"),
        file_touch: Regex::new(
            r"^(?:[-*•⏺●]\s*)?(Created|Modified|Updated|Edited|Wrote|Deleted)\s+(?:file\s+)?`?([\w./~-]+)`?",
        )
        .expect("static regex"),
        question: Regex::new(r"(?i)\(y/n\)|\[y/n\]|\?\s*$").expect("static regex"),
    })
}

/// Parse `raw` session output produced in response to `sent`
pub fn parse_output(raw: &[u8], sent: &str) -> ParsedOutput {
    let rendered = render_plain(raw, RENDER_COLS);
    let mut lines: Vec<&str> = rendered.lines().collect();
    strip_echo(&mut lines, sent);
    strip_trailing_prompt(&mut lines);

    let needs_input = lines
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| signatures().question.is_match(l.trim()))
        .unwrap_or(false);

    let mut parsed = segment(&lines);
    parsed.needs_input = needs_input;
    parsed
}

/// Drop leading lines that are the terminal's echo of what was typed
fn strip_echo(lines: &mut Vec<&str>, sent: &str) {
    let sent_lines: Vec<&str> = sent
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let mut skip = 0;
    let mut expected = sent_lines.iter().peekable();
    for line in lines.iter() {
        let trimmed = line.trim();
        if trimmed.is_empty() && skip == 0 {
            skip += 1;
            continue;
        }
        match expected.peek() {
            Some(want) if trimmed.contains(**want) => {
                expected.next();
                skip += 1;
            }
            _ => break,
        }
    }
    lines.drain(..skip);
}

/// Drop a final line that is only a prompt glyph
fn strip_trailing_prompt(lines: &mut Vec<&str>) {
    while let Some(last) = lines.last() {
        let trimmed = last.trim();
        let prompt_only = trimmed.chars().all(|c| matches!(c, '>' | '❯' | '›' | '$' | '#' | '%'));
        if prompt_only {
            lines.pop();
        } else {
            break;
        }
    }
}

fn segment(lines: &[&str]) -> ParsedOutput {
    let sig = signatures();
    let mut parsed = ParsedOutput::default();
    let mut text: Vec<&str> = Vec::new();
    let mut code: Option<(Option<String>, Vec<&str>)> = None;

    for line in lines {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("```") {
            match code.take() {
                Some((language, body)) => {
                    parsed.artifacts.push(Artifact::Code {
                        language,
                        code: body.join("\n"),
                    });
                }
                None => {
                    flush_text(&mut parsed.artifacts, &mut text);
                    let language = Some(rest.trim().to_string()).filter(|l| !l.is_empty());
                    code = Some((language, Vec::new()));
                }
            }
            continue;
        }
        if let Some((_, body)) = code.as_mut() {
            body.push(line);
            continue;
        }

        if let Some(caps) = sig.file_touch.captures(trimmed) {
            let action = match &caps[1] {
                "Created" => FileAction::Created,
                "Deleted" => FileAction::Deleted,
                _ => FileAction::Modified,
            };
            parsed.artifacts.push(Artifact::File {
                path: PathBuf::from(&caps[2]),
                action,
            });
            continue;
        }

        if let Some(kind) = detect(trimmed) {
            parsed.artifacts.push(Artifact::Error {
                kind: kind.as_str().to_string(),
                text: trimmed.to_string(),
            });
            if parsed.error.is_none() {
                parsed.error = Some(DetectedError {
                    kind,
                    text: trimmed.to_string(),
                });
            }
        }
        text.push(line);
    }

    // unterminated fence: keep what we have as code
    if let Some((language, body)) = code {
        parsed.artifacts.push(Artifact::Code {
            language,
            code: body.join("\n"),
        });
    }
    flush_text(&mut parsed.artifacts, &mut text);
    parsed
}

fn detect(line: &str) -> Option<ErrorSignature> {
    let sig = signatures();
    if sig.refusal.is_match(line) {
        Some(ErrorSignature::Refusal)
    } else if sig.permission.is_match(line) {
        Some(ErrorSignature::PermissionDenied)
    } else if sig.connection.is_match(line) {
        Some(ErrorSignature::ConnectionRefused)
    } else if sig.rate_limit.is_match(line) {
        Some(ErrorSignature::RateLimited)
    } else {
        None
    }
}

fn flush_text(artifacts: &mut Vec<Artifact>, text: &mut Vec<&str>) {
    let joined = text.join("\n");
    let joined = joined.trim();
    if !joined.is_empty() {
        artifacts.push(Artifact::text(joined));
    }
    text.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_echo_and_prompt_removed() {
        let parsed = parse_output(b"ping\r\npong\r\n> ", "ping");
        assert_eq!(parsed.artifacts, vec![Artifact::text("pong")]);
        assert!(parsed.error.is_none());
        assert!(!parsed.needs_input);
    }

    #[test]
    fn test_code_block_and_file_notice() {
        let raw = b"write it\r\nHere you go:\r\n```rust\r\nfn main() {}\r\n```\r\nCreated src/main.rs\r\n> ";
        let parsed = parse_output(raw, "write it");
        assert_eq!(
            parsed.artifacts,
            vec![
                Artifact::text("Here you go:"),
                Artifact::Code {
                    language: Some("rust".into()),
                    code: "fn main() {}".into(),
                },
                Artifact::File {
                    path: PathBuf::from("src/main.rs"),
                    action: FileAction::Created,
                },
            ]
        );
    }

    #[test]
    fn test_refusal_detected() {
        let parsed = parse_output(b"do it\r\nSorry, I can't help with that.\r\n> ", "do it");
        let error = parsed.error.unwrap();
        assert_eq!(error.kind, ErrorSignature::Refusal);
        assert!(matches!(error.to_error(), ParleyError::AgentRefused(_)));
    }

    #[test]
    fn test_rate_limit_is_cli_execution() {
        let parsed = parse_output(b"Error: 429 Too Many Requests\r\n", "");
        let error = parsed.error.unwrap();
        assert_eq!(error.kind, ErrorSignature::RateLimited);
        assert_eq!(error.to_error().code(), "cli_execution");
    }

    #[test]
    fn test_question_needs_input() {
        let parsed = parse_output(b"rm\r\nDelete 3 files? (y/n)\r\n", "rm");
        assert!(parsed.needs_input);
    }

    #[test]
    fn test_redrawn_spinner_collapses() {
        let raw = b"go\r\nthinking |\rthinking /\r\x1b[2Kdone\r\n> ";
        let parsed = parse_output(raw, "go");
        assert_eq!(parsed.artifacts, vec![Artifact::text("done")]);
    }

    #[test]
    fn test_early_error_in_long_output() {
        let mut raw = b"build\r\nbuild: permission denied\r\n".to_vec();
        for i in 0..6000 {
            raw.extend_from_slice(format!("compiling unit {}\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"> ");
        let parsed = parse_output(&raw, "build");
        assert_eq!(parsed.error.unwrap().kind, ErrorSignature::PermissionDenied);
    }
}
