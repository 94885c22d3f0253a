//! Slash commands for interactive mode

use feishu_chat::ConversationState;

/// Result of parsing a slash command
#[derive(Debug, PartialEq, Eq)]
pub enum CommandResult {
    /// Clear the conversation and its history
    Clear,
    /// Load history from the store again
    Reload,
    /// Show a message to the user (not sent as a prompt)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse a slash command. Returns `None` for ordinary prompts.
pub fn execute_command(input: &str, state: &ConversationState) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let command = rest.split_whitespace().next().unwrap_or("").to_lowercase();

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),
        "clear" | "c" => CommandResult::Clear,
        "reload" | "r" => CommandResult::Reload,
        "history" => CommandResult::Message(history_message(state)),
        "quit" | "exit" | "q" => CommandResult::Exit,
        _ => CommandResult::Unknown(command),
    })
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /history             List messages in the conversation
  /clear, /c           Clear the conversation and saved history
  /reload, /r          Reload saved history
  /quit, /exit, /q     Exit

Press Ctrl-C while a reply is streaming to stop it."#
        .to_string()
}

fn history_message(state: &ConversationState) -> String {
    if state.messages.is_empty() {
        return "No messages.".to_string();
    }

    state
        .messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let preview: String = m.text.chars().take(60).collect();
            let ellipsis = if m.text.chars().count() > 60 { "..." } else { "" };
            format!("  {}: [{}] {}{}", i, m.role(), preview.replace('\n', " "), ellipsis)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
