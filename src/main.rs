use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use agent_foundry::backend::{AgentBackend, BackendRegistry, BackendSpec, CommandBackend};
use agent_foundry::config::Config;
use agent_foundry::error::{ConfigError, WorkspaceError};
use agent_foundry::events::{Event, EventBus, EventType, LogPayload, Subscription};
use agent_foundry::orchestrator::{Orchestrator, OrchestratorDeps};
use agent_foundry::store::{LibSqlStore, Store};
use agent_foundry::stream::{StreamEvent, StreamEventKind};
use agent_foundry::task::NewTask;
use agent_foundry::workspace::{self, ProcessRunner};

const USAGE: &str = "\
usage: agent-foundry <command>

  run <intent...>            submit a task and follow it until review
  continue <id> <message...> start a follow-up run and follow it
  list                       list tasks for this repository
  show <id>                  print a task's transcript
  diff <id>                  print a task's diff against main
  merge <id>                 merge a reviewed task into main
  resolve <id> <message...>  commit a manual conflict resolution
  abort-merge <id>           abandon a conflicted merge
  push <id>                  push the task branch
  cleanup <id>               remove the task workspace";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let cwd = std::env::current_dir()?;
    let (kind, root) = workspace::detect_repository(&cwd)
        .ok_or_else(|| ConfigError::RepositoryNotFound(cwd.clone()))?;

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // ── Backends ─────────────────────────────────────────────────────────
    let backends = Arc::new(BackendRegistry::new(config.default_backend.clone()));
    let agent_command = config.agent_command.clone();
    backends.register("command", move |_spec: &BackendSpec| {
        Ok(Box::new(CommandBackend::new(agent_command.clone())?) as Box<dyn AgentBackend>)
    });

    let workspaces = workspace::create_manager(
        kind,
        root.clone(),
        config.workspaces_dir.clone(),
        Arc::new(ProcessRunner::new()),
    );
    let bus = Arc::new(EventBus::new(
        config.event_replay_capacity,
        config.subscriber_capacity,
    ));

    eprintln!("agent-foundry v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Repository: {} ({kind})", root.display());
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Workers: {}", config.max_workers);

    let orchestrator = Orchestrator::new(
        &config,
        OrchestratorDeps {
            store,
            workspaces,
            backends,
            bus,
        },
    );

    let result = dispatch(&orchestrator, &root, command, rest).await;
    orchestrator.shutdown().await;
    result
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-foundry.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    guard
}

async fn dispatch(
    orchestrator: &Orchestrator,
    root: &Path,
    command: &str,
    rest: &[String],
) -> anyhow::Result<()> {
    match command {
        "run" => {
            let intent = rest.join(" ");
            let mut events = orchestrator.subscribe();
            let task = orchestrator
                .submit(NewTask::new(root.display().to_string(), intent))
                .await?;
            eprintln!("   Task: {}\n", task.id);
            follow(orchestrator, task.id, &mut events).await
        }
        "continue" => {
            let (id, message) = id_and_text(rest)?;
            let mut events = orchestrator.subscribe();
            orchestrator.continue_task(id, &message).await?;
            follow(orchestrator, id, &mut events).await
        }
        "list" => {
            let repo = root.display().to_string();
            for task in orchestrator.list_tasks(Some(&repo)).await? {
                let note = task
                    .status_note
                    .map(|n| format!(" ({n})"))
                    .unwrap_or_default();
                println!("{:>3}  {}  {:<11}{}  {}", task.position, task.id, task.status, note, task.intent);
            }
            Ok(())
        }
        "show" => {
            let id = task_id(rest)?;
            for message in orchestrator.messages(id).await? {
                println!("[{}] {}\n", message.role.as_str(), message.text);
            }
            Ok(())
        }
        "diff" => {
            print!("{}", orchestrator.diff(task_id(rest)?).await?);
            Ok(())
        }
        "merge" => {
            let id = task_id(rest)?;
            match orchestrator.merge(id).await {
                Ok(()) => {
                    eprintln!("Merged {id}");
                    Ok(())
                }
                Err(agent_foundry::Error::Workspace(WorkspaceError::MergeConflict {
                    files,
                    workspace_path,
                })) => {
                    eprintln!("Merge conflict in {}:", workspace_path.display());
                    for file in &files {
                        eprintln!("   {file}");
                    }
                    bail!("resolve the files, then run `agent-foundry resolve {id} <message>`");
                }
                Err(e) => Err(e.into()),
            }
        }
        "resolve" => {
            let (id, message) = id_and_text(rest)?;
            orchestrator.resolve_merge(id, &message).await?;
            Ok(())
        }
        "abort-merge" => Ok(orchestrator.abort_merge(task_id(rest)?).await?),
        "push" => Ok(orchestrator.push(task_id(rest)?).await?),
        "cleanup" => Ok(orchestrator.cleanup(task_id(rest)?).await?),
        other => bail!("unknown command `{other}`\n\n{USAGE}"),
    }
}

fn task_id(rest: &[String]) -> anyhow::Result<Uuid> {
    let raw = rest.first().context("task id is required")?;
    Uuid::parse_str(raw).with_context(|| format!("invalid task id `{raw}`"))
}

fn id_and_text(rest: &[String]) -> anyhow::Result<(Uuid, String)> {
    let id = task_id(rest)?;
    Ok((id, rest[1..].join(" ")))
}

/// Print a task's events until its run ends. Ctrl-C cancels the run.
async fn follow(
    orchestrator: &Orchestrator,
    task_id: Uuid,
    events: &mut Subscription,
) -> anyhow::Result<()> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.task_id != task_id {
                    continue;
                }
                print_event(&event);
                if event.ends_run() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("\nCancelling {task_id}...");
                orchestrator.cancel(task_id);
            }
        }
    }
    Ok(())
}

fn print_event(event: &Event) {
    match event.event_type {
        EventType::AgentUpdate => {
            if let Ok(update) = serde_json::from_str::<StreamEvent>(&event.data) {
                match update.kind {
                    StreamEventKind::ContentDelta => {
                        if let Some(delta) = update.delta {
                            print!("{delta}");
                        }
                    }
                    StreamEventKind::MessageEnd => println!(),
                    _ => {}
                }
            }
        }
        EventType::StatusChange => {
            if let Some(status) = event.status() {
                match status.note {
                    Some(note) => eprintln!("-> {} ({note})", status.status),
                    None => eprintln!("-> {}", status.status),
                }
            }
        }
        EventType::Log => {
            if let Ok(log) = serde_json::from_str::<LogPayload>(&event.data) {
                eprintln!("[{}] {}", log.level, log.message);
            }
        }
        EventType::TaskCreated => {}
    }
}
