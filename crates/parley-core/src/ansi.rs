//! Terminal output cleanup
//!
//! Idle detection works on escape-stripped chunks; artifact parsing works on a
//! vt100 rendering so cursor movement and line redraws collapse into the text
//! a human would have seen.

use regex::Regex;
use std::sync::OnceLock;

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(concat!(
            r"\x1b\[[0-?]*[ -/]*[@-~]",          // CSI
            r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)", // OSC
            r"|\x1b[PX^_][^\x1b]*\x1b\\",          // DCS/SOS/PM/APC
            r"|\x1b[@-Z\\-_]",                     // two-byte escapes
            r"|[\x00-\x08\x0b\x0c\x0e-\x1a\x1c-\x1f\x7f]",
        ))
        .expect("static regex")
    })
}

/// Remove escape sequences and non-printing control bytes
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Screen rows rendered by one vt100 parser
const CHUNK_ROWS: usize = 2000;
/// Cap for a chunk holding a single very long line
const MAX_ROWS: usize = 16_000;

/// Render raw terminal bytes to plain text
///
/// Output is rendered a block of lines at a time, each on a screen tall
/// enough that nothing scrolls off. Redraws only collapse within a block.
pub fn render_plain(bytes: &[u8], cols: u16) -> String {
    let cols = cols.max(20);
    // Bare LF from programs that bypass the tty's ONLCR should still start a new line
    let normalized = normalize_newlines(bytes);

    let mut lines = Vec::new();
    for (chunk, rows) in line_chunks(&normalized, cols as usize) {
        // one spare row for the line feed that ends the chunk
        let mut parser = vt100::Parser::new((rows + 1).clamp(24, MAX_ROWS) as u16, cols, 0);
        parser.process(chunk);
        lines.extend(
            parser
                .screen()
                .contents()
                .lines()
                .map(|line| line.trim_end().to_string()),
        );
    }
    lines.join("\n").trim().to_string()
}

/// Split at line feeds into runs that fit in `CHUNK_ROWS` wrapped rows
fn line_chunks(bytes: &[u8], cols: usize) -> Vec<(&[u8], usize)> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut end = 0;
    let mut rows = 0;
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        let line_rows = line.len().div_ceil(cols).max(1);
        if rows > 0 && rows + line_rows > CHUNK_ROWS {
            chunks.push((&bytes[start..end], rows));
            start = end;
            rows = 0;
        }
        end += line.len();
        rows += line_rows;
    }
    if end > start {
        chunks.push((&bytes[start..end], rows));
    }
    chunks
}

fn normalize_newlines(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 16);
    let mut prev = 0u8;
    for &b in bytes {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}
