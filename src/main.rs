// Deskline Chat Engine — Terminal Demo
//
// Minimal interactive front end over the headless client: type to send,
// slash commands for everything else. Configuration comes from the
// environment (DESKLINE_API_URL, DESKLINE_SOCKET_URL, DESKLINE_TOKEN,
// DESKLINE_USER_ID, DESKLINE_WELCOME).

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use deskline::{
    ChatClient, ClientConfig, ClientError, ClientEvent, ConnectionState, Reaction, Role,
};

enum Ui {
    Line(Option<String>),
    Event(Option<ClientEvent>),
}

#[tokio::main]
async fn main() -> deskline::ClientResult<()> {
    // Default to info-level logs when RUST_LOG is not set.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = ClientConfig::from_env()?;
    info!("Deskline demo starting (api {})", cfg.rest_base());

    let mut client = ChatClient::start(cfg)?;
    client.new_conversation();
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let step = tokio::select! {
            line = lines.next_line() => Ui::Line(line.map_err(ClientError::from)?),
            event = client.next_event() => Ui::Event(event),
        };
        match step {
            Ui::Line(Some(line)) => {
                if !dispatch(&client, line.trim()) {
                    break;
                }
            }
            Ui::Line(None) | Ui::Event(None) => break,
            Ui::Event(Some(event)) => render(&client, event),
        }
    }

    client.shutdown().await;
    info!("Deskline demo stopped");
    Ok(())
}

/// Returns false when the demo should exit.
fn dispatch(client: &ChatClient, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/help" => print_help(),
        "/new" => client.new_conversation(),
        "/list" => {
            for c in client.snapshot().conversations {
                println!("  {}  {}", c.id, c.title);
            }
        }
        "/messages" => {
            for m in client.snapshot().messages {
                println!("  {}  {:?}  {}", m.id, m.role, m.content);
            }
        }
        _ if line.starts_with("/open ") => {
            client.activate(line["/open ".len()..].trim());
        }
        _ if line.starts_with("/like ") => {
            client.set_reaction(line["/like ".len()..].trim(), Some(Reaction::Like));
        }
        _ if line.starts_with("/dislike ") => {
            client.set_reaction(line["/dislike ".len()..].trim(), Some(Reaction::Dislike));
        }
        _ if line.starts_with("/unreact ") => {
            client.set_reaction(line["/unreact ".len()..].trim(), None);
        }
        _ if line.starts_with("/comment ") => {
            match line["/comment ".len()..].split_once(' ') {
                Some((id, text)) => client.set_comment(id.trim(), text.trim()),
                None => println!("usage: /comment <message-id> <text>"),
            }
        }
        _ if line.starts_with('/') => println!("unknown command; try /help"),
        _ => client.send_message(line),
    }
    true
}

fn render(client: &ChatClient, event: ClientEvent) {
    match event {
        ClientEvent::TranscriptChanged => {
            // Streaming redraws the growing last message line by line.
            if let Some(last) = client.snapshot().messages.last() {
                let who = match last.role {
                    Role::User => "you".to_string(),
                    Role::System => "system".to_string(),
                    Role::Assistant => last
                        .agent
                        .clone()
                        .unwrap_or_else(|| "assistant".to_string()),
                };
                println!("[{}] {}", who, last.content);
            }
        }
        ClientEvent::ConnectionChanged { state } => {
            if state == ConnectionState::Open {
                println!("(connected)");
            } else {
                println!("({:?})", state);
            }
        }
        ClientEvent::LoadingChanged { loading } => {
            if loading {
                println!("(awaiting reply)");
            }
        }
        ClientEvent::TitleChanged { title, .. } => println!("(title: {})", title),
        ClientEvent::ConversationsChanged => {}
        ClientEvent::Notice { notice, detail } => println!(
            "(notice: {:?}{})",
            notice,
            detail.map(|d| format!(" - {}", d)).unwrap_or_default()
        ),
    }
}

fn print_help() {
    println!("commands: /new, /list, /open <id>, /messages, /like <id>, /dislike <id>, /unreact <id>, /comment <id> <text>, /quit");
    println!("anything else is sent as a chat message");
}
