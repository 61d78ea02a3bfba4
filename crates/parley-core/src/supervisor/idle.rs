//! Idle detection strategies
//!
//! Each strategy turns a stream of (escape-stripped) output chunks and clock
//! ticks into a `Ready`/`Processing` verdict. The supervisor owns exactly one
//! detector, chosen from the program profile at construction time.

use crate::config::{IdleConfig, IdleStrategy};
use crate::error::{ParleyError, Result};
use crate::types::SessionStatus;
use regex::Regex;
use std::time::{Duration, Instant};

/// Text kept for pattern matching, in bytes
const PATTERN_WINDOW: usize = 4096;

/// Classifies a session as busy or ready
pub trait IdleDetector: Send {
    /// Feed one output chunk
    fn on_output(&mut self, text: &str, now: Instant) -> SessionStatus;

    /// Re-evaluate without new output
    fn on_tick(&mut self, now: Instant) -> SessionStatus;

    fn name(&self) -> &'static str;
}

/// Build the detector a profile asks for
pub fn build_detector(config: &IdleConfig, now: Instant) -> Result<Box<dyn IdleDetector>> {
    match config.strategy {
        IdleStrategy::Pattern => Ok(Box::new(PatternDetector::new(required_pattern(config)?)?)),
        IdleStrategy::Timeout => Ok(Box::new(TimeoutDetector::new(config.quiet(), now))),
        IdleStrategy::Hybrid => Ok(Box::new(HybridDetector::new(
            PatternDetector::new(required_pattern(config)?)?,
            TimeoutDetector::new(config.quiet(), now),
            config.grace(),
            now,
        ))),
    }
}

fn required_pattern(config: &IdleConfig) -> Result<&str> {
    config
        .pattern
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ParleyError::config("idle strategy needs a pattern"))
}

/// Ready when the configured prompt regex matches the newest output
///
/// Only output that arrived after the last match is searched, and a match
/// counts only if nothing but whitespace follows it; any later output flips
/// the verdict back to `Processing`.
pub struct PatternDetector {
    regex: Regex,
    pending: String,
    ready: bool,
}

impl PatternDetector {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ParleyError::config(format!("invalid idle pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            regex,
            pending: String::new(),
            ready: false,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn trim_window(&mut self) {
        if self.pending.len() <= PATTERN_WINDOW {
            return;
        }
        let mut cut = self.pending.len() - PATTERN_WINDOW;
        while !self.pending.is_char_boundary(cut) {
            cut += 1;
        }
        self.pending.drain(..cut);
    }
}

impl IdleDetector for PatternDetector {
    fn on_output(&mut self, text: &str, _now: Instant) -> SessionStatus {
        self.pending.push_str(text);
        self.trim_window();

        let last_end = self.regex.find_iter(&self.pending).last().map(|m| m.end());
        self.ready = match last_end {
            Some(end) => {
                let trailing_blank = self.pending[end..].trim().is_empty();
                // the prompt is consumed; only newer output can match again
                self.pending.drain(..end);
                trailing_blank
            }
            None => false,
        };

        self.on_tick(_now)
    }

    fn on_tick(&mut self, _now: Instant) -> SessionStatus {
        if self.ready {
            SessionStatus::Ready
        } else {
            SessionStatus::Processing
        }
    }

    fn name(&self) -> &'static str {
        "pattern"
    }
}

/// Ready after a quiet interval with no output
pub struct TimeoutDetector {
    quiet: Duration,
    last_output: Instant,
}

impl TimeoutDetector {
    pub fn new(quiet: Duration, now: Instant) -> Self {
        Self {
            quiet,
            last_output: now,
        }
    }
}

impl IdleDetector for TimeoutDetector {
    fn on_output(&mut self, _text: &str, now: Instant) -> SessionStatus {
        self.last_output = now;
        SessionStatus::Processing
    }

    fn on_tick(&mut self, now: Instant) -> SessionStatus {
        if now.saturating_duration_since(self.last_output) >= self.quiet {
            SessionStatus::Ready
        } else {
            SessionStatus::Processing
        }
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}

/// Pattern first; once a busy stretch outlasts the grace period without a
/// match, the quiet-interval heuristic is used for the rest of the run
pub struct HybridDetector {
    pattern: PatternDetector,
    timeout: TimeoutDetector,
    grace: Duration,
    busy_since: Option<Instant>,
    fallback: bool,
}

impl HybridDetector {
    pub fn new(
        pattern: PatternDetector,
        timeout: TimeoutDetector,
        grace: Duration,
        now: Instant,
    ) -> Self {
        Self {
            pattern,
            timeout,
            grace,
            busy_since: Some(now),
            fallback: false,
        }
    }

    /// Whether the timeout fallback has latched
    pub fn in_fallback(&self) -> bool {
        self.fallback
    }
}

impl IdleDetector for HybridDetector {
    fn on_output(&mut self, text: &str, now: Instant) -> SessionStatus {
        self.timeout.on_output(text, now);
        if self.pattern.on_output(text, now) == SessionStatus::Ready {
            self.busy_since = None;
            return SessionStatus::Ready;
        }
        self.busy_since.get_or_insert(now);
        SessionStatus::Processing
    }

    fn on_tick(&mut self, now: Instant) -> SessionStatus {
        if self.pattern.is_ready() {
            return SessionStatus::Ready;
        }
        if !self.fallback {
            let expired = self
                .busy_since
                .map(|since| now.saturating_duration_since(since) >= self.grace)
                .unwrap_or(false);
            if expired {
                tracing::info!("idle pattern not seen within grace period, using quiet timeout");
                self.fallback = true;
            }
        }
        if self.fallback {
            self.timeout.on_tick(now)
        } else {
            SessionStatus::Processing
        }
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_pattern_ready_then_processing_again() {
        let now = Instant::now();
        let mut det = PatternDetector::new("> $").unwrap();
        assert_eq!(det.on_output("thinking...\r\n", now), SessionStatus::Processing);
        assert_eq!(det.on_output("pong\r\n> ", now), SessionStatus::Ready);
        assert_eq!(det.on_output("more output", now), SessionStatus::Processing);
    }

    #[test]
    fn test_pattern_followed_by_output_in_same_chunk() {
        let now = Instant::now();
        let mut det = PatternDetector::new(r"(?m)^READY$").unwrap();
        let status = det.on_output("READY\nstill printing\n", now);
        assert_eq!(status, SessionStatus::Processing);
    }

    #[test]
    fn test_pattern_split_across_chunks() {
        let now = Instant::now();
        let mut det = PatternDetector::new(r"ready> $").unwrap();
        assert_eq!(det.on_output("rea", now), SessionStatus::Processing);
        assert_eq!(det.on_output("dy> ", now), SessionStatus::Ready);
    }

    #[test]
    fn test_pattern_does_not_rematch_old_prompt() {
        let now = Instant::now();
        let mut det = PatternDetector::new(r"(?m)^> ?$").unwrap();
        assert_eq!(det.on_output("> ", now), SessionStatus::Ready);
        assert_eq!(det.on_output("\r\nanswer", now), SessionStatus::Processing);
        assert_eq!(det.on_tick(now), SessionStatus::Processing);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            PatternDetector::new("(unclosed"),
            Err(ParleyError::Config(_))
        ));
    }

    #[test]
    fn test_timeout_quiet_interval() {
        let start = Instant::now();
        let mut det = TimeoutDetector::new(ms(100), start);
        assert_eq!(det.on_tick(start + ms(50)), SessionStatus::Processing);
        assert_eq!(det.on_tick(start + ms(100)), SessionStatus::Ready);
        assert_eq!(det.on_output("x", start + ms(120)), SessionStatus::Processing);
        assert_eq!(det.on_tick(start + ms(200)), SessionStatus::Processing);
        assert_eq!(det.on_tick(start + ms(220)), SessionStatus::Ready);
    }

    #[test]
    fn test_hybrid_prefers_pattern() {
        let start = Instant::now();
        let mut det = HybridDetector::new(
            PatternDetector::new("> $").unwrap(),
            TimeoutDetector::new(ms(50), start),
            ms(1000),
            start,
        );
        assert_eq!(det.on_output("working", start), SessionStatus::Processing);
        // quiet long enough for the timeout, but still inside grace
        assert_eq!(det.on_tick(start + ms(200)), SessionStatus::Processing);
        assert_eq!(det.on_output("\r\n> ", start + ms(300)), SessionStatus::Ready);
        assert!(!det.in_fallback());
    }

    #[test]
    fn test_hybrid_falls_back_and_latches() {
        let start = Instant::now();
        let mut det = HybridDetector::new(
            PatternDetector::new("> $").unwrap(),
            TimeoutDetector::new(ms(50), start),
            ms(500),
            start,
        );
        det.on_output("no prompt here", start + ms(10));
        assert_eq!(det.on_tick(start + ms(600)), SessionStatus::Ready);
        assert!(det.in_fallback());

        det.on_output("more", start + ms(700));
        assert_eq!(det.on_tick(start + ms(720)), SessionStatus::Processing);
        assert_eq!(det.on_tick(start + ms(760)), SessionStatus::Ready);
    }

    #[test]
    fn test_build_detector_requires_pattern() {
        let config = IdleConfig {
            strategy: IdleStrategy::Pattern,
            pattern: None,
            ..IdleConfig::default()
        };
        assert!(build_detector(&config, Instant::now()).is_err());

        let det = build_detector(&IdleConfig::hybrid("> $"), Instant::now()).unwrap();
        assert_eq!(det.name(), "hybrid");
    }
}
