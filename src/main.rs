use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use medtrip_agent::config::AgentConfig;
use medtrip_agent::llm::{LlmConfig, ReplyClient, create_provider};
use medtrip_agent::orchestrator::{Orchestrator, TurnResponse};
use medtrip_agent::patients::{InMemoryPatientDirectory, PatientDirectory};
use medtrip_agent::phase::CallDirection;
use medtrip_agent::store::{InMemorySessionStore, LibSqlSessionStore, SessionStore};

const HELP: &str = "Commands:
  /inbound            start an inbound call
  /outbound <phone>   call the patient scheduled for <phone>
  /state              print the session state as JSON
  /end                drop the current session
  /quit               exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = Arc::new(AgentConfig::from_env());
    let llm_config = LlmConfig::from_env()?;
    let provider = create_provider(&llm_config)?;
    let llm = ReplyClient::new(provider, llm_config.temperature, llm_config.max_tokens);

    // ── Storage ─────────────────────────────────────────────────────────
    let store: Arc<dyn SessionStore> = match &config.db_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            eprintln!("   Sessions: {}", path.display());
            Arc::new(LibSqlSessionStore::new_local(path).await?)
        }
        None => {
            eprintln!("   Sessions: in memory");
            InMemorySessionStore::new()
        }
    };

    let patients: Option<Arc<dyn PatientDirectory>> = match &config.patients_file {
        Some(path) => {
            let directory = InMemoryPatientDirectory::from_json_file(path)?;
            eprintln!("   Patients: {}", path.display());
            Some(Arc::new(directory))
        }
        None => {
            eprintln!("   Patients: none (outbound calls disabled)");
            None
        }
    };

    // Sessions left over from a previous run
    let purged = store.purge_expired().await?;
    if purged > 0 {
        tracing::info!(purged, "Expired sessions removed");
    }

    eprintln!("📞 Medtrip Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm.model_name());
    eprintln!("{HELP}\n");

    let orchestrator = Orchestrator::new(Arc::clone(&config), store, llm, patients);
    repl(&orchestrator, &config).await
}

/// Console logging on stderr, plus a daily file when `MEDTRIP_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("MEDTRIP_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "medtrip-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn repl(orchestrator: &Orchestrator, config: &AgentConfig) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session: Option<String> = None;

    eprint!("> ");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            eprint!("> ");
            continue;
        }

        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" | "/exit" => break,
            "/help" => eprintln!("{HELP}"),
            "/inbound" => {
                match orchestrator
                    .create_session(CallDirection::Inbound, None, None)
                    .await
                {
                    Ok(id) => {
                        eprintln!("ℹ️  Inbound call {id}");
                        session = Some(id);
                    }
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
            "/outbound" => {
                if arg.is_empty() {
                    eprintln!("Usage: /outbound <phone>");
                } else {
                    match orchestrator
                        .create_session(CallDirection::Outbound, None, Some(arg))
                        .await
                    {
                        Ok(id) => {
                            eprintln!("ℹ️  Outbound call {id}");
                            match orchestrator
                                .process_message(&id, &config.start_sentinel)
                                .await
                            {
                                Ok(response) => print_response(&response),
                                Err(e) => eprintln!("❌ {e}"),
                            }
                            session = Some(id);
                        }
                        Err(e) => eprintln!("❌ {e}"),
                    }
                }
            }
            "/state" => match &session {
                Some(id) => match orchestrator.get_session(id).await {
                    Ok(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                    Err(e) => eprintln!("❌ {e}"),
                },
                None => eprintln!("No active call. Use /inbound or /outbound <phone>."),
            },
            "/end" => {
                if let Some(id) = session.take() {
                    if let Err(e) = orchestrator.delete_session(&id).await {
                        eprintln!("❌ {e}");
                    } else {
                        eprintln!("ℹ️  Call {id} dropped");
                    }
                }
            }
            _ if command.starts_with('/') => eprintln!("Unknown command. /help for a list."),
            _ => {
                let id = match &session {
                    Some(id) => id.clone(),
                    None => {
                        let id = orchestrator
                            .create_session(CallDirection::Inbound, None, None)
                            .await?;
                        eprintln!("ℹ️  Inbound call {id}");
                        session = Some(id.clone());
                        id
                    }
                };
                match orchestrator.process_message(&id, line).await {
                    Ok(response) => {
                        print_response(&response);
                        if response.call_ended {
                            session = None;
                        }
                    }
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
        }
        eprint!("> ");
    }

    Ok(())
}

fn print_response(response: &TurnResponse) {
    println!("\n{}\n", response.agent_reply);
    eprintln!("   [{}]", response.phase);
    if response.escalation_flag {
        eprintln!(
            "⚠️  Escalated: {}",
            response.escalation_reason.as_deref().unwrap_or("sin motivo")
        );
    }
    if response.call_ended {
        eprintln!("ℹ️  Call ended. Type to start a new inbound call, or /outbound <phone>.");
    }
}
