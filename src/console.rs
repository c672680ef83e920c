//! Line commands understood by the `invoicedesk` agent.

use serde_json::{Map, Value};
use std::fmt::Write;
use std::str::FromStr;

use crate::desk::Desk;
use crate::invoices::SerialSource;
use crate::notifications::Severity;
use crate::session::LoginProfile;

pub const HELP: &str = "\
commands:
  login <email> [role]       sign in (sqlite backend)
  activity                   record user activity
  notify <severity> <text>   add a notification (info|success|warning|error)
  list                       show notifications
  read <id> | read-all       mark notifications read
  remove <id> | clear        delete notifications
  invoice <recipient>        allocate a number and save an invoice
  invoices | binned          list saved or binned invoices
  bin <id>                   move an invoice to the bin
  rename <id> <recipient>    rename an invoice's recipient
  whoami                     show name, role and position
  profile <field> <value>    set a profile field (full_name, role, position, phone)
  logout | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Login { email: String, role: Option<String> },
    Activity,
    Notify { severity: Severity, message: String },
    List,
    Read(String),
    ReadAll,
    Remove(String),
    Clear,
    Invoice(String),
    Invoices,
    Binned,
    Bin(String),
    Rename { id: String, recipient: String },
    WhoAmI,
    Profile { field: String, value: String },
    Logout,
    Quit,
}

fn required(arg: Option<&str>, usage: &str) -> Result<String, String> {
    match arg.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(format!("usage: {}", usage)),
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, Some(rest.trim())),
            None => (line, None),
        };

        match word {
            "help" | "?" => Ok(Command::Help),
            "login" => {
                let args = required(rest, "login <email> [role]")?;
                let mut parts = args.split_whitespace();
                let email = parts.next().unwrap_or_default().to_string();
                Ok(Command::Login {
                    email,
                    role: parts.next().map(str::to_string),
                })
            }
            "activity" => Ok(Command::Activity),
            "notify" => {
                let args = required(rest, "notify <severity> <text>")?;
                let (severity, message) = match args.split_once(char::is_whitespace) {
                    Some((severity, message)) => (severity, message.trim()),
                    None => return Err("usage: notify <severity> <text>".to_string()),
                };
                Ok(Command::Notify {
                    severity: severity.parse()?,
                    message: message.to_string(),
                })
            }
            "list" => Ok(Command::List),
            "read" => Ok(Command::Read(required(rest, "read <id>")?)),
            "read-all" => Ok(Command::ReadAll),
            "remove" => Ok(Command::Remove(required(rest, "remove <id>")?)),
            "clear" => Ok(Command::Clear),
            "invoice" => Ok(Command::Invoice(rest.unwrap_or_default().to_string())),
            "invoices" => Ok(Command::Invoices),
            "binned" => Ok(Command::Binned),
            "bin" => Ok(Command::Bin(required(rest, "bin <id>")?)),
            "rename" => {
                let args = required(rest, "rename <id> <recipient>")?;
                match args.split_once(char::is_whitespace) {
                    Some((id, recipient)) => Ok(Command::Rename {
                        id: id.to_string(),
                        recipient: recipient.trim().to_string(),
                    }),
                    None => Err("usage: rename <id> <recipient>".to_string()),
                }
            }
            "whoami" => Ok(Command::WhoAmI),
            "profile" => {
                let args = required(rest, "profile <field> <value>")?;
                match args.split_once(char::is_whitespace) {
                    Some((field, value)) => Ok(Command::Profile {
                        field: field.to_string(),
                        value: value.trim().to_string(),
                    }),
                    None => Err("usage: profile <field> <value>".to_string()),
                }
            }
            "logout" => Ok(Command::Logout),
            "quit" | "exit" => Ok(Command::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command: {} (try help)", other)),
        }
    }
}

/// Run one command and render its reply.
pub async fn execute(desk: &Desk, command: Command) -> String {
    match command {
        Command::Help => HELP.to_string(),
        Command::Quit => "bye".to_string(),
        Command::Login { email, role } => {
            let mut profile = LoginProfile::new(email);
            profile.role = role;
            match desk.sign_in_local(&profile).await {
                Ok(()) => format!("signed in as {} ({})", profile.email, profile.position()),
                Err(e) => format!("error: {}", e),
            }
        }
        Command::Activity => {
            if desk.guard.record_activity() {
                "activity recorded".to_string()
            } else {
                "not signed in".to_string()
            }
        }
        Command::Notify { severity, message } => {
            match desk.mailbox.add(message, severity, Value::Null).await {
                Ok(notification) => format!("added {}", notification.id),
                Err(e) => format!("error: {}", e),
            }
        }
        Command::List => {
            let notifications = desk.mailbox.notifications();
            let mut out = format!(
                "{} notification(s), {} unread",
                notifications.len(),
                desk.mailbox.unread_count()
            );
            for n in notifications {
                let _ = write!(
                    out,
                    "\n{} {} [{}] {}",
                    if n.read { " " } else { "*" },
                    n.id,
                    n.severity,
                    n.message
                );
            }
            out
        }
        Command::Read(id) => reply(desk.mailbox.mark_read(&id).await, "marked read"),
        Command::ReadAll => reply(desk.mailbox.mark_all_read().await, "all marked read"),
        Command::Remove(id) => reply(desk.mailbox.remove(&id).await, "removed"),
        Command::Clear => reply(desk.mailbox.clear_all().await, "cleared"),
        Command::Invoice(recipient) => {
            let allocation = desk.allocator.generate(&recipient).await;
            let number = allocation.number.to_string();
            let note = match allocation.source {
                SerialSource::Counter => "",
                SerialSource::Fallback => " (random serial, check for duplicates)",
            };
            match desk.ledger.create(&recipient, &number, Map::new()).await {
                Ok(record) => format!("{} saved as {}{}", number, record.id, note),
                Err(e) => format!("{}{} not saved: {}", number, note, e),
            }
        }
        Command::Invoices => render_invoices(desk.ledger.saved().await),
        Command::Binned => render_invoices(desk.ledger.deleted().await),
        Command::Bin(id) => reply(desk.ledger.bin(&id).await, "moved to bin"),
        Command::Rename { id, recipient } => {
            match desk.ledger.rename_recipient(&id, &recipient).await {
                Ok(record) => format!("{} now {}", record.id, record.invoice_number),
                Err(e) => format!("error: {}", e),
            }
        }
        Command::WhoAmI => {
            let user = desk.users.current_role().await;
            format!(
                "{} ({}){}{}",
                user.name,
                user.role,
                if user.position.is_empty() { "" } else { ", " },
                user.position
            )
        }
        Command::Profile { field, value } => {
            let mut fields = Map::new();
            fields.insert(field.clone(), Value::String(value));
            if desk.users.set_profile(fields, None).await {
                format!("{} updated", field)
            } else {
                "error: profile not saved".to_string()
            }
        }
        Command::Logout => {
            desk.guard.logout().await;
            "logged out".to_string()
        }
    }
}

fn reply<E: std::fmt::Display>(result: Result<(), E>, done: &str) -> String {
    match result {
        Ok(()) => done.to_string(),
        Err(e) => format!("error: {}", e),
    }
}

fn render_invoices(invoices: Vec<crate::invoices::InvoiceRecord>) -> String {
    let mut out = format!("{} invoice(s)", invoices.len());
    for invoice in invoices {
        let _ = write!(
            out,
            "\n{} {} {}",
            invoice.id, invoice.invoice_number, invoice.recipient_name
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuth;
    use crate::clock::ManualClock;
    use crate::config::DeskConfig;
    use crate::store::MemoryStore;
    use crate::testing::start_time;
    use std::sync::Arc;

    fn desk() -> Desk {
        Desk::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalAuth::new(None)),
            Arc::new(ManualClock::new(start_time())),
            &DeskConfig::default(),
        )
    }

    async fn run(desk: &Desk, line: &str) -> String {
        execute(desk, line.parse().unwrap()).await
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("list".parse::<Command>().unwrap(), Command::List);
        assert_eq!(
            "notify warning  Invoice overdue ".parse::<Command>().unwrap(),
            Command::Notify {
                severity: Severity::Warning,
                message: "Invoice overdue".to_string()
            }
        );
        assert_eq!(
            "rename abc Beta Corp".parse::<Command>().unwrap(),
            Command::Rename {
                id: "abc".to_string(),
                recipient: "Beta Corp".to_string()
            }
        );
        assert_eq!(
            "login jo@example.com admin".parse::<Command>().unwrap(),
            Command::Login {
                email: "jo@example.com".to_string(),
                role: Some("admin".to_string())
            }
        );
        assert_eq!("invoice".parse::<Command>().unwrap(), Command::Invoice(String::new()));
        assert_eq!(
            "profile position Senior Associate".parse::<Command>().unwrap(),
            Command::Profile {
                field: "position".to_string(),
                value: "Senior Associate".to_string()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("read".parse::<Command>().is_err());
        assert!("notify loud hi".parse::<Command>().is_err());
        assert!("notify info".parse::<Command>().is_err());
        assert!("rename abc".parse::<Command>().is_err());
        assert!("dance".parse::<Command>().unwrap_err().contains("unknown command"));
    }

    #[tokio::test]
    async fn test_session_flow() {
        let desk = desk();
        assert_eq!(run(&desk, "activity").await, "not signed in");
        assert!(run(&desk, "notify info hi").await.starts_with("error"));

        let reply = run(&desk, "login jo@example.com").await;
        assert_eq!(reply, "signed in as jo@example.com (Invoicing Associate)");
        assert_eq!(run(&desk, "activity").await, "activity recorded");

        assert!(run(&desk, "notify success Saved").await.starts_with("added notification_"));
        assert!(run(&desk, "list").await.starts_with("1 notification(s), 1 unread"));
        assert_eq!(run(&desk, "read-all").await, "all marked read");
        assert!(run(&desk, "list").await.starts_with("1 notification(s), 0 unread"));
        assert_eq!(run(&desk, "clear").await, "cleared");

        assert_eq!(run(&desk, "logout").await, "logged out");
        assert_eq!(run(&desk, "activity").await, "not signed in");
    }

    #[tokio::test]
    async fn test_invoice_flow() {
        let desk = desk();
        run(&desk, "login jo@example.com").await;

        let reply = run(&desk, "invoice Acme Corp").await;
        assert!(reply.starts_with("ACME-20240315-0001 saved as "), "{}", reply);
        let id = desk.ledger.saved().await[0].id.clone();

        let reply = run(&desk, &format!("rename {} Beta Corp", id)).await;
        assert_eq!(reply, format!("{} now BETA-20240315-0001", id));

        assert_eq!(run(&desk, &format!("bin {}", id)).await, "moved to bin");
        assert_eq!(run(&desk, "invoices").await, "0 invoice(s)");
        assert!(run(&desk, "binned").await.starts_with("1 invoice(s)"));
    }

    #[tokio::test]
    async fn test_profile_flow_reloads_mailbox() {
        let desk = desk();
        assert_eq!(run(&desk, "whoami").await, "Anonymous User (user)");
        assert_eq!(run(&desk, "profile role admin").await, "error: profile not saved");

        run(&desk, "login jo@example.com admin").await;
        assert_eq!(run(&desk, "whoami").await, "jo (admin), Admin");

        desk.store
            .insert(
                crate::store::Table::Notifications,
                vec![serde_json::from_value(serde_json::json!({
                    "id": "notification_1",
                    "user_id": "jo@example.com",
                    "timestamp": "2024-03-15T08:00:00.000Z",
                    "message": "Welcome",
                    "type": "info",
                }))
                .unwrap()],
            )
            .await
            .unwrap();

        assert_eq!(run(&desk, "profile full_name Jo Smith").await, "full_name updated");
        assert_eq!(run(&desk, "whoami").await, "Jo Smith (admin), Admin");
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(desk.mailbox.notifications().len(), 1);
    }
}
