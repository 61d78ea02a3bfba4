//! Interactive input scanner
//!
//! Sits between the human's keyboard and the wrapped process. Keystrokes pass
//! straight through, except that a line starting with `@` is held back and
//! echoed locally until Enter decides what it is:
//!
//! - `@reply text` / `@reply:<sender> text`: answer a pending sender
//! - `@<target> text`: route to another agent, `@<target>! text` interrupts it
//! - anything else is forwarded to the wrapped process as typed
//!
//! Escape sequences (arrow keys, mouse reports) pass through untouched and
//! never count as the start of a line.

use crate::protocol::{DEFAULT_PRIORITY, INTERRUPT_PRIORITY};

const ESC: u8 = 0x1b;
const CTRL_C: u8 = 0x03;
const CTRL_U: u8 = 0x15;
const BACKSPACE: u8 = 0x7f;
const CTRL_H: u8 = 0x08;

/// What the wrapper should do with a batch of keystrokes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Forward to the wrapped process
    PassThrough(Vec<u8>),
    /// Draw on the human's terminal only
    Echo(Vec<u8>),
    /// Forward a held-back line, then submit it
    Commit(Vec<u8>),
    /// Send `text` to another agent
    Route {
        target: String,
        text: String,
        priority: u8,
    },
    /// Answer a pending sender
    Reply {
        sender: Option<String>,
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Normal,
    /// Just saw ESC
    Escape,
    /// Inside `ESC [ ...`
    Csi,
    /// `ESC O` waits for one more byte
    Ss3,
    /// Holding back an `@` line
    Candidate(Vec<u8>),
}

/// Byte-stream state machine owned by the stdin loop
#[derive(Debug)]
pub struct InputScanner {
    state: State,
    /// Printable characters typed on the current line
    line_len: usize,
}

impl Default for InputScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl InputScanner {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            line_len: 0,
        }
    }

    /// Whether an `@` line is being held back
    pub fn is_buffering(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    /// Consume keystrokes and return the resulting actions, in order
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ScanEvent> {
        let mut out = Events::default();
        for &b in bytes {
            self.step(b, &mut out);
        }
        out.finish()
    }

    fn step(&mut self, b: u8, out: &mut Events) {
        match std::mem::replace(&mut self.state, State::Normal) {
            State::Normal => self.normal(b, out),
            State::Escape => {
                out.pass(b);
                self.state = match b {
                    b'[' => State::Csi,
                    b'O' => State::Ss3,
                    _ => State::Normal,
                };
            }
            State::Csi => {
                out.pass(b);
                if !(0x40..=0x7e).contains(&b) {
                    self.state = State::Csi;
                }
            }
            State::Ss3 => out.pass(b),
            State::Candidate(line) => self.candidate(line, b, out),
        }
    }

    fn normal(&mut self, b: u8, out: &mut Events) {
        match b {
            b'@' if self.line_len == 0 => {
                out.echo(b"@");
                self.state = State::Candidate(vec![b'@']);
            }
            ESC => {
                out.pass(b);
                self.state = State::Escape;
            }
            b'\r' | b'\n' | CTRL_C | CTRL_U => {
                out.pass(b);
                self.line_len = 0;
            }
            BACKSPACE | CTRL_H => {
                out.pass(b);
                self.line_len = self.line_len.saturating_sub(1);
            }
            // UTF-8 continuation bytes do not start a new character
            0x80..=0xbf => out.pass(b),
            _ => {
                out.pass(b);
                if b >= 0x20 || b == b'\t' {
                    self.line_len += 1;
                }
            }
        }
    }

    fn candidate(&mut self, mut line: Vec<u8>, b: u8, out: &mut Events) {
        match b {
            b'\r' | b'\n' => {
                self.line_len = 0;
                match classify(&line) {
                    Some(event) => {
                        out.echo(b"\r\n");
                        out.push(event);
                    }
                    None => {
                        out.echo(b"\r\x1b[K");
                        out.push(ScanEvent::Commit(line));
                    }
                }
            }
            BACKSPACE | CTRL_H => {
                pop_char(&mut line);
                out.echo(b"\x08 \x08");
                if line.is_empty() {
                    self.line_len = 0;
                } else {
                    self.state = State::Candidate(line);
                }
            }
            CTRL_C => {
                out.echo(b"\r\x1b[K");
                out.pass(CTRL_C);
                self.line_len = 0;
            }
            ESC => {
                // navigation inside a held line: hand the text to the program as typed
                out.echo(b"\r\x1b[K");
                self.line_len = line.len();
                for byte in line {
                    out.pass(byte);
                }
                out.pass(ESC);
                self.state = State::Escape;
            }
            _ => {
                out.echo(&[b]);
                line.push(b);
                self.state = State::Candidate(line);
            }
        }
    }
}

/// Decide what a finished `@` line means; `None` forwards it as typed
fn classify(line: &[u8]) -> Option<ScanEvent> {
    let text = String::from_utf8_lossy(line);
    let body = text.strip_prefix('@')?;
    let (head, rest) = match body.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (body, ""),
    };
    if rest.is_empty() {
        return None;
    }

    if head == "reply" {
        return Some(ScanEvent::Reply {
            sender: None,
            text: rest.to_string(),
        });
    }
    if let Some(sender) = head.strip_prefix("reply:") {
        if !valid_target(sender) {
            return None;
        }
        return Some(ScanEvent::Reply {
            sender: Some(sender.to_string()),
            text: rest.to_string(),
        });
    }

    let (target, priority) = match head.strip_suffix('!') {
        Some(target) => (target, INTERRUPT_PRIORITY),
        None => (head, DEFAULT_PRIORITY),
    };
    if !valid_target(target) {
        return None;
    }
    Some(ScanEvent::Route {
        target: target.to_string(),
        text: rest.to_string(),
        priority,
    })
}

fn valid_target(target: &str) -> bool {
    !target.is_empty()
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Remove the last UTF-8 character
fn pop_char(line: &mut Vec<u8>) {
    while let Some(b) = line.pop() {
        if b & 0xc0 != 0x80 {
            break;
        }
    }
}

/// Accumulates events, merging adjacent pass-through and echo bytes
#[derive(Default)]
struct Events(Vec<ScanEvent>);

impl Events {
    fn pass(&mut self, b: u8) {
        if let Some(ScanEvent::PassThrough(bytes)) = self.0.last_mut() {
            bytes.push(b);
        } else {
            self.0.push(ScanEvent::PassThrough(vec![b]));
        }
    }

    fn echo(&mut self, b: &[u8]) {
        if let Some(ScanEvent::Echo(bytes)) = self.0.last_mut() {
            bytes.extend_from_slice(b);
        } else {
            self.0.push(ScanEvent::Echo(b.to_vec()));
        }
    }

    fn push(&mut self, event: ScanEvent) {
        self.0.push(event);
    }

    fn finish(self) -> Vec<ScanEvent> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn routed(events: &[ScanEvent]) -> Vec<&ScanEvent> {
        events
            .iter()
            .filter(|e| !matches!(e, ScanEvent::Echo(_)))
            .collect()
    }

    #[test]
    fn test_plain_typing_passes_through() {
        let mut scanner = InputScanner::new();
        let events = scanner.feed(b"ls -la\r");
        assert_eq!(events, vec![ScanEvent::PassThrough(b"ls -la\r".to_vec())]);
    }

    #[test]
    fn test_route_line() {
        let mut scanner = InputScanner::new();
        let events = scanner.feed(b"@codex-8120 review src/lib.rs\r");
        assert_eq!(
            routed(&events),
            vec![&ScanEvent::Route {
                target: "codex-8120".into(),
                text: "review src/lib.rs".into(),
                priority: DEFAULT_PRIORITY,
            }]
        );
        assert!(!scanner.is_buffering());
    }

    #[test]
    fn test_priority_route() {
        let mut scanner = InputScanner::new();
        let events = scanner.feed(b"@claude! stop that\r");
        assert!(events.contains(&ScanEvent::Route {
            target: "claude".into(),
            text: "stop that".into(),
            priority: INTERRUPT_PRIORITY,
        }));
    }

    #[test]
    fn test_reply_forms() {
        let mut scanner = InputScanner::new();
        let events = scanner.feed(b"@reply done\r@reply:gemini-8130 also done\r");
        assert_eq!(
            routed(&events),
            vec![
                &ScanEvent::Reply {
                    sender: None,
                    text: "done".into()
                },
                &ScanEvent::Reply {
                    sender: Some("gemini-8130".into()),
                    text: "also done".into()
                },
            ]
        );
    }

    #[test]
    fn test_at_without_text_is_committed() {
        let mut scanner = InputScanner::new();
        let events = scanner.feed(b"@file.rs\r");
        assert_eq!(routed(&events), vec![&ScanEvent::Commit(b"@file.rs".to_vec())]);
    }

    #[test]
    fn test_at_mid_line_passes_through() {
        let mut scanner = InputScanner::new();
        let events = scanner.feed(b"mail me@host\r");
        assert_eq!(events, vec![ScanEvent::PassThrough(b"mail me@host\r".to_vec())]);
    }

    #[test]
    fn test_backspace_over_at_returns_to_normal() {
        let mut scanner = InputScanner::new();
        scanner.feed(b"@x");
        scanner.feed(&[BACKSPACE, BACKSPACE]);
        assert!(!scanner.is_buffering());
        let events = scanner.feed(b"hi");
        assert_eq!(events, vec![ScanEvent::PassThrough(b"hi".to_vec())]);
    }

    #[test]
    fn test_ctrl_c_abandons_candidate() {
        let mut scanner = InputScanner::new();
        let events = scanner.feed(b"@codex do\x03");
        assert_eq!(routed(&events), vec![&ScanEvent::PassThrough(vec![CTRL_C])]);
        assert!(!scanner.is_buffering());
    }

    #[test]
    fn test_escape_sequence_is_not_line_start() {
        let mut scanner = InputScanner::new();
        // up-arrow then '@' at what is still the start of the line
        let events = scanner.feed(b"\x1b[A@codex hi\r");
        assert_eq!(events[0], ScanEvent::PassThrough(b"\x1b[A".to_vec()));
        assert!(events.iter().any(|e| matches!(e, ScanEvent::Route { .. })));
    }

    #[test]
    fn test_split_across_feeds() {
        let mut scanner = InputScanner::new();
        assert!(routed(&scanner.feed(b"@gem")).is_empty());
        assert!(scanner.is_buffering());
        let events = scanner.feed(b"ini hello\r");
        assert!(events.contains(&ScanEvent::Route {
            target: "gemini".into(),
            text: "hello".into(),
            priority: DEFAULT_PRIORITY,
        }));
    }

    #[test]
    fn test_multibyte_backspace() {
        let mut line = "@é".as_bytes().to_vec();
        pop_char(&mut line);
        assert_eq!(line, b"@".to_vec());
    }
}
