//! Interactive wrapper
//!
//! Runs one program profile on a pseudo-terminal, serves it to peers over
//! HTTP and the local socket, and proxies the human's terminal to it. Lines
//! typed as `@target text` are routed instead of forwarded.

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, never, select, Receiver};
use crossterm::terminal;
use parley_core::config::load_config;
use parley_core::tasks::{HistoryDispatcher, TracingHistory, HISTORY_QUEUE};
use parley_core::{
    AgentDirectory, AgentRecord, AgentService, DefaultConnector, EventBus, InputScanner,
    ProgramProfile, ResponseMode, ScanEvent, SessionEvent, SessionSupervisor, SupervisorOptions,
    TaskStore, AGENT_ID_ENV,
};
use parley_server::{init_tracing, run_server, AppState};
use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const EVENT_QUEUE: usize = 1024;
const TICK: Duration = Duration::from_millis(100);

/// What `parley <profile>` was asked to run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub profile: String,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub cwd: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl RunOptions {
    pub fn new(profile: String) -> Self {
        Self {
            profile,
            port: None,
            name: None,
            role: None,
            cwd: None,
            extra_args: Vec::new(),
        }
    }
}

/// Raw mode for the lifetime of the guard
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Run the wrapper until the wrapped program exits; returns its exit code
pub fn run(options: RunOptions) -> Result<i32> {
    let cwd = match &options.cwd {
        Some(dir) => dir.canonicalize().with_context(|| format!("bad --cwd {}", dir.display()))?,
        None => std::env::current_dir().context("no current directory")?,
    };
    let config = load_config(&cwd)?;

    let profile = match config.profiles.get(&options.profile) {
        Some(profile) if !profile.enabled => bail!("profile {} is disabled", options.profile),
        Some(profile) => profile.clone(),
        None => ProgramProfile::for_command(&options.profile),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("parley-server")
        .build()
        .context("failed to start runtime")?;

    // the port must be known before the record is written
    let port = options.port.unwrap_or(config.server.port);
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind((config.server.host.as_str(), port)))
        .with_context(|| format!("failed to bind {}:{}", config.server.host, port))?;
    let port = listener.local_addr()?.port();

    let mut record = AgentRecord::new(&options.profile, port, std::process::id(), cwd.clone());
    record.display_name = options.name.clone();
    record.role = options.role.clone();
    if config.server.host != "0.0.0.0" {
        record.host = Some(config.server.host.clone());
    }
    if config.server.local_socket {
        record.local_socket_path = Some(config.sockets_dir().join(format!("{}.sock", record.agent_id)));
    }

    let log_file = config.logs_dir().join(format!("{}.log", record.agent_id));
    init_tracing(&config.logging.level, Some(&log_file));
    tracing::info!(
        agent_id = %record.agent_id,
        profile = %options.profile,
        command = %profile.command,
        port,
        "starting agent"
    );

    let interactive = std::io::stdin().is_terminal();
    let (cols, rows) = if interactive {
        terminal::size().unwrap_or((120, 40))
    } else {
        (120, 40)
    };

    let bus = EventBus::new(EVENT_QUEUE);
    let supervisor = Arc::new(SessionSupervisor::start(
        &profile,
        &options.extra_args,
        &cwd,
        SupervisorOptions {
            cols,
            rows,
            buffer_bytes: config.output.buffer_bytes,
            env: vec![
                (AGENT_ID_ENV.to_string(), record.agent_id.clone()),
                ("PARLEY_HOME".to_string(), config.home_dir().display().to_string()),
            ],
        },
        bus.sender(),
    )?);

    AgentDirectory::new(config.agents_dir()).register(&record)?;

    let store = Arc::new(TaskStore::with_history(HistoryDispatcher::spawn(
        Arc::new(TracingHistory),
        HISTORY_QUEUE,
    )));
    let service = Arc::new(AgentService::new(
        record.clone(),
        profile,
        supervisor.clone(),
        store,
        &config,
        Arc::new(DefaultConnector::from_config(&config.router)),
    )?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = runtime.spawn(run_server(
        AppState::new(service.clone()),
        listener,
        record.local_socket_path.clone(),
        async move {
            let _ = shutdown_rx.await;
        },
    ));

    let (stop_tx, stop_rx) = bounded::<&'static str>(1);
    runtime.spawn(async move {
        if let Some(signal) = termination().await {
            let _ = stop_tx.send(signal);
        }
    });

    let _raw = if interactive { Some(RawModeGuard::enable()?) } else { None };
    let stdin = spawn_stdin_reader();

    let code = proxy(&service, &supervisor, &bus, &stdin, &stop_rx, interactive);

    if supervisor.is_alive() {
        service.shutdown();
        if let Err(e) = supervisor.shutdown() {
            tracing::warn!(error = %e, "failed to stop wrapped process");
        }
    }
    let _ = shutdown_tx.send(());
    match runtime.block_on(server) {
        Ok(Err(e)) => tracing::error!(error = %e, "server stopped with error"),
        Err(e) => tracing::error!(error = %e, "server task failed"),
        Ok(Ok(())) => {}
    }
    runtime.shutdown_timeout(Duration::from_secs(2));
    tracing::info!(agent_id = %record.agent_id, code, "agent stopped");
    Ok(code)
}

/// Pump events between the terminal, the wrapped session and the service
fn proxy(
    service: &Arc<AgentService>,
    supervisor: &SessionSupervisor,
    bus: &EventBus,
    stdin: &Receiver<Vec<u8>>,
    stop: &Receiver<&'static str>,
    interactive: bool,
) -> i32 {
    let events = bus.receiver();
    let mut scanner = InputScanner::new();
    let mut stdout = std::io::stdout();
    let mut size = terminal::size().ok();
    let mut stdin = stdin.clone();
    let mut stop = stop.clone();

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(SessionEvent::Output(bytes)) => {
                    let _ = stdout.write_all(&bytes);
                    let _ = stdout.flush();
                }
                Ok(SessionEvent::Exited { code }) => {
                    service.on_event(&SessionEvent::Exited { code });
                    return code.map(|c| c as i32).unwrap_or(1);
                }
                Ok(event) => service.on_event(&event),
                Err(_) => return 1,
            },
            recv(stdin) -> chunk => match chunk {
                Ok(bytes) => {
                    for event in scanner.feed(&bytes) {
                        handle_scan(service, supervisor, event);
                    }
                }
                Err(_) => {
                    tracing::debug!("stdin closed");
                    stdin = never();
                }
            },
            recv(stop) -> signal => match signal {
                Ok(signal) => {
                    tracing::info!(signal, "stopping on signal");
                    return 0;
                }
                Err(_) => stop = never(),
            },
            default(TICK) => {}
        }

        if interactive {
            let current = terminal::size().ok();
            if current != size {
                if let Some((cols, rows)) = current {
                    if let Err(e) = supervisor.resize(cols, rows) {
                        tracing::debug!(error = %e, "resize failed");
                    }
                }
                size = current;
            }
        }
    }
}

fn handle_scan(service: &Arc<AgentService>, supervisor: &SessionSupervisor, event: ScanEvent) {
    let mut stdout = std::io::stdout();
    match event {
        ScanEvent::PassThrough(bytes) => {
            if let Err(e) = supervisor.write_raw(&bytes) {
                tracing::debug!(error = %e, "dropping keystrokes");
            }
        }
        ScanEvent::Echo(bytes) => {
            let _ = stdout.write_all(&bytes);
            let _ = stdout.flush();
        }
        ScanEvent::Commit(line) => {
            if let Err(e) = parley_core::Session::write(supervisor, &line) {
                tracing::warn!(error = %e, "failed to forward line");
            }
        }
        ScanEvent::Route {
            target,
            text,
            priority,
        } => {
            let service = service.clone();
            std::thread::spawn(move || {
                match service.send(&target, &text, priority, ResponseMode::Oneway) {
                    Ok(delivery) => notice(&format!("sent to {} via {}", delivery.peer, delivery.transport)),
                    Err(e) => notice(&format!("send to {} failed: {}", target, e)),
                }
            });
        }
        ScanEvent::Reply { sender, text } => {
            let service = service.clone();
            std::thread::spawn(move || match service.reply(&text, sender.as_deref()) {
                Ok(delivery) => notice(&format!("replied to {}", delivery.peer)),
                Err(e) => notice(&format!("reply failed: {}", e)),
            });
        }
    }
}

/// A status line on the human's terminal, outside the wrapped program's output
fn notice(message: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "\r\n[parley] {}\r\n", message);
    let _ = stdout.flush();
}

/// Forward stdin in chunks; the channel closes at end of input
fn spawn_stdin_reader() -> Receiver<Vec<u8>> {
    let (tx, rx) = bounded(64);
    std::thread::Builder::new()
        .name("parley-stdin".into())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .map(|_| ())
        .unwrap_or_else(|e| tracing::error!(error = %e, "failed to spawn stdin reader"));
    rx
}

#[cfg(unix)]
async fn termination() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).ok()?;
    let mut hup = signal(SignalKind::hangup()).ok()?;
    tokio::select! {
        _ = term.recv() => Some("SIGTERM"),
        _ = hup.recv() => Some("SIGHUP"),
    }
}

#[cfg(not(unix))]
async fn termination() -> Option<&'static str> {
    tokio::signal::ctrl_c().await.ok().map(|_| "ctrl-c")
}
