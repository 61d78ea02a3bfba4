//! Parley - supervised CLI agents that talk to each other
//!
//! Entry point. `parley <profile>` wraps an interactive agent in a
//! pseudo-terminal and serves it to its peers; the other subcommands are
//! one-shot clients of the agent directory.

mod wrapper;

use anyhow::{bail, Context, Result};
use parley_core::config::{load_config, sample_config};
use parley_core::protocol::RelaySendRequest;
use parley_core::reply::identity_from_env;
use parley_core::router::relay;
use parley_core::tasks::TaskStore;
use parley_core::{
    AgentDirectory, AgentRecord, DefaultConnector, MessageRouter, ParleyConfig, ReplyTracker,
    ResponseMode, SendOptions, SenderInfo, AGENT_ID_ENV, DEFAULT_PRIORITY, INTERRUPT_PRIORITY,
};
use std::path::PathBuf;
use std::sync::Arc;

const USAGE: &str = "\
usage:
  parley <profile> [--port N] [--name NAME] [--role ROLE] [--cwd DIR] [-- ARGS...]
  parley send <target> <text...> [--priority N] [--urgent] [--wait]
  parley reply <text...> [--to SENDER]
  parley list [--json]
  parley config";

/// Command-line arguments
enum Args {
    /// Wrap a program profile
    Run(wrapper::RunOptions),
    Send {
        target: String,
        text: String,
        priority: u8,
        wait: bool,
    },
    Reply {
        text: String,
        to: Option<String>,
    },
    List {
        json: bool,
    },
    Config,
    Help,
}

impl Args {
    /// Parse command-line arguments
    fn parse() -> Result<Self> {
        Self::parse_from(std::env::args().skip(1))
    }

    fn parse_from(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut args = args.into_iter();
        let Some(first) = args.next() else {
            return Ok(Args::Help);
        };

        match first.as_str() {
            "-h" | "--help" | "help" => Ok(Args::Help),
            "config" => Ok(Args::Config),
            "list" => Ok(Args::List {
                json: args.any(|a| a == "--json"),
            }),
            "send" => {
                let mut words = Vec::new();
                let mut priority = DEFAULT_PRIORITY;
                let mut wait = false;
                while let Some(arg) = args.next() {
                    match arg.as_str() {
                        "--priority" | "-p" => {
                            let value = args.next().context("--priority needs a value")?;
                            priority = value
                                .parse()
                                .with_context(|| format!("bad priority: {}", value))?;
                        }
                        "--urgent" => priority = INTERRUPT_PRIORITY,
                        "--wait" | "-w" => wait = true,
                        _ => words.push(arg),
                    }
                }
                if words.len() < 2 {
                    bail!("send needs a target and some text\n{}", USAGE);
                }
                let target = words.remove(0);
                Ok(Args::Send {
                    target,
                    text: words.join(" "),
                    priority,
                    wait,
                })
            }
            "reply" => {
                let mut words = Vec::new();
                let mut to = None;
                while let Some(arg) = args.next() {
                    match arg.as_str() {
                        "--to" => to = Some(args.next().context("--to needs a sender")?),
                        _ => words.push(arg),
                    }
                }
                if words.is_empty() {
                    bail!("reply needs some text\n{}", USAGE);
                }
                Ok(Args::Reply {
                    text: words.join(" "),
                    to,
                })
            }
            _ if first.starts_with('-') => bail!("unknown flag {}\n{}", first, USAGE),
            _ => {
                let mut options = wrapper::RunOptions::new(first);
                while let Some(arg) = args.next() {
                    match arg.as_str() {
                        "--port" => {
                            let value = args.next().context("--port needs a value")?;
                            options.port = Some(
                                value
                                    .parse()
                                    .with_context(|| format!("bad port: {}", value))?,
                            );
                        }
                        "--name" => options.name = Some(args.next().context("--name needs a value")?),
                        "--role" => options.role = Some(args.next().context("--role needs a value")?),
                        "--cwd" => {
                            options.cwd = Some(PathBuf::from(args.next().context("--cwd needs a value")?))
                        }
                        "--" => {
                            options.extra_args.extend(args.by_ref());
                        }
                        _ => options.extra_args.push(arg),
                    }
                }
                Ok(Args::Run(options))
            }
        }
    }
}

fn main() -> Result<()> {
    match Args::parse()? {
        Args::Run(options) => {
            let code = wrapper::run(options)?;
            std::process::exit(code);
        }
        Args::Send {
            target,
            text,
            priority,
            wait,
        } => send(&target, &text, priority, wait),
        Args::Reply { text, to } => reply(&text, to.as_deref()),
        Args::List { json } => list(json),
        Args::Config => {
            print!("{}", sample_config());
            Ok(())
        }
        Args::Help => {
            println!("{}", USAGE);
            Ok(())
        }
    }
}

fn config() -> Result<ParleyConfig> {
    let cwd = std::env::current_dir().context("no current directory")?;
    Ok(load_config(&cwd)?)
}

/// The directory record of the agent whose session this command runs in
fn session_agent(config: &ParleyConfig) -> Result<Option<AgentRecord>> {
    let Ok(id) = std::env::var(AGENT_ID_ENV) else {
        return Ok(None);
    };
    match AgentDirectory::new(config.agents_dir()).get(&id)? {
        Some(record) => Ok(Some(record)),
        None => bail!("{} names {}, which is not in the directory", AGENT_ID_ENV, id),
    }
}

/// A router acting for the agent named in the environment, or for an
/// anonymous command-line sender outside any session
fn router(config: &ParleyConfig) -> Result<MessageRouter> {
    let identity = match session_agent(config)? {
        Some(record) => SenderInfo::from_record(&record),
        None => SenderInfo {
            id: format!("cli-{}", std::process::id()),
            agent_type: "cli".into(),
            endpoint: None,
            socket_path: None,
        },
    };

    Ok(MessageRouter::new(
        identity,
        AgentDirectory::new(config.agents_dir()),
        Arc::new(TaskStore::new()),
        Arc::new(DefaultConnector::from_config(&config.router)),
        config.router.clone(),
    ))
}

fn send(target: &str, text: &str, priority: u8, wait: bool) -> Result<()> {
    let config = config()?;

    // inside a session the agent sends for us, so the answer lands in its store
    let (peer, transport, remote_task, placeholder) = match session_agent(&config)? {
        Some(record) => {
            let request = RelaySendRequest {
                target: target.to_string(),
                text: text.to_string(),
                priority: Some(priority),
                wait,
            };
            let response = relay(&record, &request, &config.router)?;
            (response.peer, response.transport, response.remote_task, response.placeholder)
        }
        None => {
            let options = if wait {
                SendOptions::roundtrip()
            } else {
                SendOptions {
                    mode: ResponseMode::Oneway,
                    ..SendOptions::default()
                }
            }
            .with_priority(priority);
            let delivery = router(&config)?.send(target, parley_core::Message::user_text(text), options)?;
            (
                delivery.peer,
                delivery.transport.to_string(),
                delivery.remote_task,
                delivery.placeholder,
            )
        }
    };

    match placeholder {
        Some(task) => {
            if let Some(error) = &task.error {
                bail!("{} failed ({}): {}", peer, error.kind, error.message);
            }
            println!("{}", task.artifact_text());
        }
        None => println!("sent to {} via {} (task {})", peer, transport, remote_task.id),
    }
    Ok(())
}

fn reply(text: &str, to: Option<&str>) -> Result<()> {
    let config = config()?;
    let agent_id = identity_from_env()?;
    let replies = ReplyTracker::open(&config.replies_dir(), &agent_id, config.replies.retention())?;
    let delivery = router(&config)?.reply(&replies, text, to)?;
    println!("replied to {} via {}", delivery.peer, delivery.transport);
    Ok(())
}

fn list(json: bool) -> Result<()> {
    let config = config()?;
    let agents = AgentDirectory::new(config.agents_dir()).list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    if agents.is_empty() {
        println!("no agents running");
        return Ok(());
    }
    for agent in agents {
        println!(
            "{:<20} {:<12} {:<11} {:<22} {}",
            agent.agent_id,
            agent.port_alias(),
            agent.status.as_str(),
            agent.endpoint(),
            agent.display_name.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
