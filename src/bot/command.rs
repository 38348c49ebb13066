//! Command parsing: turns raw message text into a `Command` or free text.

/// Parses message content into `Input`.
pub struct CommandParser;

impl CommandParser {
    /// Parse message content. Anything not starting with `/` is free text.
    pub fn parse(content: &str) -> Input {
        let trimmed = content.trim();
        let Some(body) = trimmed.strip_prefix('/') else {
            return Input::Text(trimmed.to_string());
        };

        let mut parts = body.split_whitespace();
        let head = parts.next().unwrap_or_default();
        // Group chats address commands as `/cmd@BotName`.
        let name = head.split('@').next().unwrap_or_default().to_lowercase();
        let args: Vec<&str> = parts.collect();

        Input::Command(parse_command(&name, &args))
    }
}

fn parse_command(name: &str, args: &[&str]) -> Command {
    match name {
        "start" => Command::Start,
        "add" => Command::Add,
        "list" => Command::List,
        "listusers" | "users" => Command::ListUsers,
        "pending" => Command::Pending,
        "approve" => match args.first() {
            None => Command::Approve { pending_id: None },
            Some(raw) => match raw.parse() {
                Ok(id) => Command::Approve {
                    pending_id: Some(id),
                },
                Err(_) => Command::Invalid {
                    usage: "/approve <id>",
                },
            },
        },
        "reject" => match args.first().and_then(|raw| raw.parse().ok()) {
            Some(pending_id) => Command::Reject { pending_id },
            None => Command::Invalid {
                usage: "/reject <id>",
            },
        },
        "addadmin" => match alias_arg(args) {
            Some(alias) => Command::AddAdmin { alias },
            None => Command::Invalid {
                usage: "/addadmin <alias>",
            },
        },
        "removeadmin" => match alias_arg(args) {
            Some(alias) => Command::RemoveAdmin { alias },
            None => Command::Invalid {
                usage: "/removeadmin <alias>",
            },
        },
        "editalias" => Command::EditAlias,
        "cancel" => Command::Cancel,
        "help" | "?" => Command::Help,
        "deletetask" => match args.first().and_then(|raw| raw.trim_start_matches('#').parse().ok()) {
            Some(task_id) => Command::DeleteTask { task_id },
            None => Command::Invalid {
                usage: "/deletetask <task id>",
            },
        },
        "removeuser" => match alias_arg(args) {
            Some(alias) => Command::RemoveUser { alias },
            None => Command::Invalid {
                usage: "/removeuser <alias>",
            },
        },
        "whoami" => Command::WhoAmI,
        other => Command::Unknown(other.to_string()),
    }
}

fn alias_arg(args: &[&str]) -> Option<String> {
    match args {
        [alias] => Some(alias.trim_start_matches('@').to_string()),
        _ => None,
    }
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    /// Free text or a button selection, fed to the active dialog.
    Text(String),
}

/// A bot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// First contact / registration request.
    Start,
    /// Begin the add-task flow.
    Add,
    /// Tasks the caller gave or received.
    List,
    ListUsers,
    Pending,
    /// Begin approving a pending request; without an id, list them.
    Approve { pending_id: Option<i64> },
    Reject { pending_id: i64 },
    AddAdmin { alias: String },
    RemoveAdmin { alias: String },
    EditAlias,
    Cancel,
    Help,
    DeleteTask { task_id: i64 },
    RemoveUser { alias: String },
    WhoAmI,
    /// A known command with bad arguments.
    Invalid { usage: &'static str },
    Unknown(String),
}

impl Command {
    /// Entry commands start a dialog.
    pub fn starts_dialog(&self) -> bool {
        matches!(
            self,
            Self::Add | Self::EditAlias | Self::Approve { pending_id: Some(_) }
        )
    }
}
