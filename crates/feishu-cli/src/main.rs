//! feishu - terminal chat client with streamed replies

mod commands;
mod config;
mod history;

use clap::Parser;
use commands::CommandResult;
use feishu_ai::{ChatClient, ChatModel};
use feishu_chat::{
    ConversationController, ConversationEvent, HttpTransport, MemoryStore, MessageStore,
};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::broadcast;

/// feishu - chat with a streaming AI model
#[derive(Parser, Debug)]
#[command(name = "feishu")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Base URL of the chat-completions service
    #[arg(long)]
    base_url: Option<String>,

    /// Run in non-interactive mode with a single prompt
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// History file to load and save
    #[arg(long)]
    history_file: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long)]
    no_history: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("feishu=debug")
            .with_writer(std::io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let config = config::Config::load();

    let Some(api_key) = config.get_api_key() else {
        eprintln!("Error: No API key found");
        eprintln!();
        eprintln!(
            "Set your API key with: export {}=your-key",
            feishu_ai::client::API_KEY_ENV
        );
        eprintln!("Or add it to config file: feishu --init-config");
        std::process::exit(1);
    };

    let model = ChatModel::new(config.model(args.model), config.base_url(args.base_url));
    let model_id = model.id.clone();
    let transport = Arc::new(HttpTransport::new(ChatClient::new(api_key, model)));

    let store: Arc<dyn MessageStore> = if args.no_history {
        Arc::new(MemoryStore::new())
    } else {
        let store = history::JsonlStore::new(config.history_path(args.history_file));
        tracing::debug!("history file: {}", store.path().display());
        Arc::new(store)
    };

    let controller = ConversationController::new(transport, store);
    controller.initialize().await;
    if let Some(error) = controller.state().last_error {
        eprintln!("Warning: {}", error);
    }

    if let Some(command) = args.command {
        let ok = run_reply(&controller, &command).await?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    run_interactive(&controller, &model_id).await
}

async fn run_interactive(controller: &ConversationController, model_id: &str) -> anyhow::Result<()> {
    // Show minimal startup info (only if TTY)
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        let count = controller.state().messages.len();
        if count > 0 {
            eprintln!("feishu ({}) {} messages loaded", model_id, count);
        } else {
            eprintln!("feishu ({})", model_id);
        }
        eprintln!();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        // Ctrl-C at the prompt exits; during a reply it only stops the reply.
        let Some(input) = next_prompt(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(result) = commands::execute_command(input, &controller.state()) {
            match result {
                CommandResult::Clear => {
                    controller.clear().await;
                    match controller.state().last_error {
                        Some(error) => eprintln!("Error: {}", error),
                        None => println!("Cleared conversation."),
                    }
                }
                CommandResult::Reload => {
                    controller.reload().await;
                    let state = controller.state();
                    match state.last_error {
                        Some(error) => eprintln!("Error: {}", error),
                        None => println!("Loaded {} messages.", state.messages.len()),
                    }
                }
                CommandResult::Message(msg) => println!("{}", msg),
                CommandResult::Exit => break,
                CommandResult::Unknown(cmd) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
            }
            continue;
        }

        println!();
        run_reply(controller, input).await?;
        println!();
    }

    Ok(())
}

/// Read the next input line. `None` on EOF or once `interrupt` completes.
async fn next_prompt<R>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

/// Send one prompt and print the reply as it streams. Ctrl-C stops the reply.
///
/// Returns whether the reply completed without an error.
async fn run_reply(controller: &ConversationController, prompt: &str) -> anyhow::Result<bool> {
    let events = controller.events();
    let Some(task) = controller.send_message(prompt) else {
        return Ok(true);
    };
    let printer = tokio::spawn(print_reply(events));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            controller.stop_requesting();
        }
        _ = controller.wait_for_idle() => {}
    }

    task.await?;
    printer.await?;

    match controller.state().last_error {
        Some(error) => {
            eprintln!("Error: {}", error);
            Ok(false)
        }
        None => Ok(true),
    }
}

async fn print_reply(mut events: broadcast::Receiver<ConversationEvent>) {
    let mut stdout = std::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "display fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ConversationEvent::Fragment { delta, .. } => {
                print!("{}", delta);
                stdout.flush().ok();
            }
            ConversationEvent::ReplyFinished { .. } | ConversationEvent::ReplyFailed { .. } => {
                println!();
                break;
            }
            ConversationEvent::ReplyCancelled { .. } => {
                println!("\n[stopped]");
                break;
            }
            _ => {}
        }
    }
}
