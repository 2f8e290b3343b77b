use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::ops::ControlFlow;
use std::sync::Arc;
use tandem::controller::Controller;
use tandem::message::StreamEvent;
use tandem::provider::{ProviderId, ProviderSet};
use tandem::storage::{FsSessionStore, FsSummaryStore};
use tandem::{logging, repl};

#[derive(Debug, Clone, ValueEnum)]
enum ProviderChoice {
    Anthropic,
    Openai,
    Gemini,
    Auto,
}

impl ProviderChoice {
    fn resolve(&self, providers: &ProviderSet) -> ProviderId {
        match self {
            ProviderChoice::Anthropic => ProviderId::Anthropic,
            ProviderChoice::Openai => ProviderId::OpenAI,
            ProviderChoice::Gemini => ProviderId::Gemini,
            ProviderChoice::Auto => providers.default_active(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(version)]
#[command(about = "tandem: an AI pair programmer for the terminal")]
struct Args {
    /// Provider to use (anthropic, openai, gemini, or auto-detect)
    #[arg(short, long, default_value = "auto", global = true)]
    provider: ProviderChoice,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the interactive chat loop
    Repl,

    /// Send a single message and exit
    Run {
        /// The message to send
        message: String,
    },

    /// Check provider health
    Status,

    /// List saved conversations
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    logging::cleanup_old_logs();
    logging::info("tandem starting");

    let args = Args::parse();

    let providers = ProviderSet::from_config();
    let active = args.provider.resolve(&providers);
    let sessions = Arc::new(FsSessionStore::open()?);
    let summaries = Arc::new(FsSummaryStore::open()?);
    let mut controller = Controller::new(providers, active, sessions, summaries);

    match args.command.unwrap_or(Command::Repl) {
        Command::Repl => repl::run(&mut controller).await?,
        Command::Run { message } => {
            controller
                .send_user_turn(&message, |event| {
                    if let StreamEvent::TextDelta(delta) = event {
                        print!("{}", delta);
                        let _ = std::io::stdout().flush();
                    }
                    ControlFlow::Continue(())
                })
                .await?;
            println!();
        }
        Command::Status => {
            for (id, report) in controller.health().await {
                let latency = report
                    .latency_ms
                    .map(|ms| format!(", {}ms", ms))
                    .unwrap_or_default();
                println!("{}: {}{} - {}", id, report.status.label(), latency, report.message);
            }
        }
        Command::Sessions => {
            let entries = controller.list_saved()?;
            if entries.is_empty() {
                println!("No saved conversations.");
            }
            for entry in entries {
                println!(
                    "{}  {}  {}",
                    entry.id,
                    entry.display_name,
                    entry.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }

    Ok(())
}
