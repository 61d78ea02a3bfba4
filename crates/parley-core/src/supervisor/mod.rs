//! Session supervisor
//!
//! Owns exactly one wrapped interactive process attached to a pseudo-terminal.
//! A reader thread feeds its output into a bounded buffer, a live vt100 screen
//! and the idle detector; a ticker thread re-evaluates time-based strategies.
//! Everything else talks to the process through the serialized input channel.

mod buffer;
mod idle;
mod input;

pub use buffer::OutputBuffer;
pub use idle::{build_detector, HybridDetector, IdleDetector, PatternDetector, TimeoutDetector};
pub use input::{InputChannel, InterruptMethod, ProcessGroup, SignalTarget};

use crate::ansi::strip_ansi;
use crate::config::ProgramProfile;
use crate::error::{ParleyError, Result};
use crate::events::SessionEvent;
use crate::types::SessionStatus;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often time-based idle strategies are re-evaluated
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// What the rest of the system needs from a running session
///
/// Implemented by [`SessionSupervisor`]; tests substitute a scripted fake.
pub trait Session: Send + Sync {
    /// Write a payload followed by the program's submit sequence
    fn write(&self, data: &[u8]) -> Result<()>;

    fn interrupt(&self) -> Result<()>;

    /// Interrupt and write as one request
    fn interrupt_then_write(&self, data: &[u8]) -> Result<()>;

    fn status(&self) -> SessionStatus;

    /// The last `n` bytes of output
    fn recent_output(&self, n: usize) -> Vec<u8>;

    /// Absolute offset one past the newest output byte
    fn output_offset(&self) -> u64;

    /// Retained output at or after `offset`
    fn output_since(&self, offset: u64) -> Vec<u8>;
}

/// Terminal geometry and buffering for a new session
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub cols: u16,
    pub rows: u16,
    pub buffer_bytes: usize,
    /// Extra environment for the wrapped process, on top of the profile's
    pub env: Vec<(String, String)>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 40,
            buffer_bytes: 256 * 1024,
            env: Vec::new(),
        }
    }
}

/// State shared between the supervisor handle and its background threads
struct Shared {
    buffer: Mutex<OutputBuffer>,
    screen: RwLock<vt100::Parser>,
    detector: Mutex<Box<dyn IdleDetector>>,
    status: AtomicU8,
    alive: Arc<AtomicBool>,
    stop: AtomicBool,
    started_at: Instant,
    startup_delay: Duration,
    events: Sender<SessionEvent>,
}

impl Shared {
    fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Record a detector verdict; callers hold the detector lock
    fn apply(&self, verdict: SessionStatus, now: Instant) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let verdict = if verdict == SessionStatus::Ready
            && now.saturating_duration_since(self.started_at) < self.startup_delay
        {
            SessionStatus::Processing
        } else {
            verdict
        };
        self.set_status(verdict);
    }

    fn set_status(&self, to: SessionStatus) {
        let from = SessionStatus::from_u8(self.status.swap(to.to_u8(), Ordering::SeqCst));
        if from != to {
            tracing::debug!(%from, %to, "session status changed");
            let _ = self.events.send(SessionEvent::StatusChanged { from, to });
        }
    }
}

/// One supervised pseudo-terminal session
pub struct SessionSupervisor {
    pid: Option<u32>,
    input: InputChannel,
    submit: Vec<u8>,
    shared: Arc<Shared>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl SessionSupervisor {
    /// Spawn `profile.command` on a fresh pseudo-terminal
    ///
    /// `extra_args` are appended after the profile's default arguments.
    pub fn start(
        profile: &ProgramProfile,
        extra_args: &[String],
        cwd: &Path,
        options: SupervisorOptions,
        events: Sender<SessionEvent>,
    ) -> Result<Self> {
        let size = PtySize {
            rows: options.rows.max(3),
            cols: options.cols.max(10),
            pixel_width: 0,
            pixel_height: 0,
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| ParleyError::pty(format!("Failed to create PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&profile.command);
        for arg in profile.default_args.iter().chain(extra_args) {
            cmd.arg(arg);
        }
        if profile.use_cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in profile.env.iter() {
            cmd.env(key, value);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ParleyError::ProcessSpawn {
                command: profile.command.clone(),
                reason: e.to_string(),
            })?;
        // the child holds its own copy; keeping ours would hide EOF
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ParleyError::pty(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ParleyError::pty(format!("Failed to get writer: {}", e)))?;

        let now = Instant::now();
        let alive = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(Shared {
            buffer: Mutex::new(OutputBuffer::new(options.buffer_bytes)),
            screen: RwLock::new(vt100::Parser::new(size.rows, size.cols, 1000)),
            detector: Mutex::new(build_detector(&profile.idle, now)?),
            status: AtomicU8::new(SessionStatus::Processing.to_u8()),
            alive: alive.clone(),
            stop: AtomicBool::new(false),
            started_at: now,
            startup_delay: profile.startup_delay(),
            events,
        });

        let interrupt = match (&profile.interrupt_sequence, pid) {
            (Some(keys), _) => InterruptMethod::Keys(keys.as_bytes().to_vec()),
            // portable-pty makes the child a session leader, so pgid == pid
            (None, Some(pid)) => InterruptMethod::Signal(Box::new(ProcessGroup { pgid: pid as i32 })),
            (None, None) => InterruptMethod::Keys(vec![0x03]),
        };
        let input = InputChannel::new(writer, interrupt, profile.submit_delay(), alive);

        {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("parley-pty-reader".into())
                .spawn(move || {
                    Self::read_loop(reader, &shared);
                    let code = child.wait().ok().map(|status| status.exit_code());
                    tracing::info!(?code, "wrapped process exited");
                    let _ = shared.events.send(SessionEvent::Exited { code });
                })?;
        }
        {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("parley-idle-ticker".into())
                .spawn(move || Self::tick_loop(&shared))?;
        }

        tracing::info!(
            command = %profile.command,
            ?pid,
            strategy = %shared.detector.lock().name(),
            "session started"
        );

        Ok(Self {
            pid,
            input,
            submit: profile.submit_sequence.as_bytes().to_vec(),
            shared,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        })
    }

    /// Reader loop - runs in background thread
    fn read_loop(mut reader: Box<dyn Read + Send>, shared: &Shared) {
        let mut buf = [0u8; 4096];
        let mut carry = Vec::new();

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = &buf[..n];
                    let now = Instant::now();

                    shared.buffer.lock().push(data);
                    shared.screen.write().process(data);

                    let text = strip_ansi(&decode_utf8(&mut carry, data));
                    // pure cursor/colour repaints say nothing about readiness
                    if !text.is_empty() {
                        let mut detector = shared.detector.lock();
                        let verdict = detector.on_output(&text, now);
                        shared.apply(verdict, now);
                    }

                    let _ = shared.events.send(SessionEvent::Output(data.to_vec()));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "pty read ended");
                    break;
                }
            }
        }

        shared.alive.store(false, Ordering::SeqCst);
        shared.set_status(SessionStatus::NotStarted);
    }

    fn tick_loop(shared: &Shared) {
        while shared.alive.load(Ordering::SeqCst) && !shared.stop.load(Ordering::SeqCst) {
            std::thread::sleep(TICK_INTERVAL);
            let now = Instant::now();
            let mut detector = shared.detector.lock();
            let verdict = detector.on_tick(now);
            shared.apply(verdict, now);
        }
    }

    /// Process id of the wrapped program
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// The bytes appended after every submitted payload
    pub fn submit_sequence(&self) -> &[u8] {
        &self.submit
    }

    /// Forward keystrokes without a submit sequence
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        self.input.write(data, &[])
    }

    /// Current screen as plain text
    pub fn screen_text(&self) -> String {
        self.shared.screen.read().screen().contents()
    }

    /// Resize the PTY
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let cols = cols.max(10);
        let rows = rows.max(3);
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ParleyError::pty(format!("Failed to resize: {}", e)))?;
        self.shared.screen.write().set_size(rows, cols);
        Ok(())
    }

    /// Stop the ticker and kill the wrapped process
    pub fn shutdown(&self) -> Result<()> {
        self.shared.stop.store(true, Ordering::SeqCst);
        if !self.is_alive() {
            return Ok(());
        }
        tracing::info!(pid = ?self.pid, "killing wrapped process");
        self.killer
            .lock()
            .kill()
            .map_err(|e| ParleyError::pty(format!("Failed to kill process: {}", e)))
    }
}

impl Session for SessionSupervisor {
    fn write(&self, data: &[u8]) -> Result<()> {
        self.input.write(data, &self.submit)
    }

    fn interrupt(&self) -> Result<()> {
        self.input.interrupt()
    }

    fn interrupt_then_write(&self, data: &[u8]) -> Result<()> {
        self.input.interrupt_then_write(data, &self.submit)
    }

    fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    fn recent_output(&self, n: usize) -> Vec<u8> {
        self.shared.buffer.lock().tail(n)
    }

    fn output_offset(&self) -> u64 {
        self.shared.buffer.lock().total()
    }

    fn output_since(&self, offset: u64) -> Vec<u8> {
        self.shared.buffer.lock().since(offset)
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Decode a chunk, holding back a multi-byte character split across reads
fn decode_utf8(carry: &mut Vec<u8>, data: &[u8]) -> String {
    carry.extend_from_slice(data);
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}
