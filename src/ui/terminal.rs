use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::APP_NAME;
use crate::models::{Conversation, Message, Role};
use crate::services::export::{write_export, ExportFormat};
use crate::services::{
    ChatController, ChatStore, ChatView, Database, HttpRelayClient, StreamPhase, TemplateService,
};

pub type TerminalController = ChatController<HttpRelayClient, Arc<dyn ChatStore>, Arc<TerminalView>>;

const HELP: &str = "Commands: /new /regen /history /open <n> /rename <n> <title> /delete <n> \
                    /export json|txt /templates /template save <name> <content> \
                    /template use <n> /template delete <n> /quit";

struct Screen {
    out: Box<dyn Write + Send>,
    /// Reply text already written for the current assistant turn.
    shown: String,
    in_reply: bool,
    history: Vec<Conversation>,
}

impl Screen {
    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            tracing::warn!("Failed to write to terminal: {}", e);
        }
    }

    /// Terminate a partially written reply before printing anything else.
    fn end_reply(&mut self) {
        if self.in_reply {
            self.emit("\n");
            self.in_reply = false;
            self.shown.clear();
        }
    }
}

/// Line-oriented chat view. Streamed replies are printed as they grow.
pub struct TerminalView {
    screen: Mutex<Screen>,
}

impl TerminalView {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            screen: Mutex::new(Screen {
                out,
                shown: String::new(),
                in_reply: false,
                history: Vec::new(),
            }),
        }
    }

    fn screen(&self) -> MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notice(&self, text: &str) {
        let mut screen = self.screen();
        screen.end_reply();
        screen.emit(&format!("{}\n", text));
    }

    /// The list last shown by the controller, numbered from 1 in `print_history`.
    pub fn history(&self) -> Vec<Conversation> {
        self.screen().history.clone()
    }

    pub fn print_history(&self) {
        let mut screen = self.screen();
        screen.end_reply();
        if screen.history.is_empty() {
            screen.emit("No saved chats.\n");
            return;
        }
        let lines: String = screen
            .history
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "{:>3}. {} ({})\n",
                    i + 1,
                    c.title,
                    c.updated_at.format("%Y-%m-%d %H:%M")
                )
            })
            .collect();
        screen.emit(&lines);
    }
}

fn sender(role: Role) -> &'static str {
    match role {
        Role::User => "You",
        Role::Assistant => APP_NAME,
    }
}

impl ChatView for TerminalView {
    fn show_message(&self, message: &Message) {
        let mut screen = self.screen();
        screen.end_reply();
        screen.emit(&format!("{}: {}\n", sender(message.role), message.content));
    }

    fn begin_assistant(&self) {
        let mut screen = self.screen();
        screen.end_reply();
        screen.emit(&format!("{}: ", APP_NAME));
        screen.in_reply = true;
    }

    fn update_assistant(&self, text: &str, _html: &str) {
        let mut screen = self.screen();
        if !screen.in_reply {
            return;
        }
        let output = match text.strip_prefix(screen.shown.as_str()) {
            Some(suffix) => suffix.to_string(),
            // Only reachable if the reply shrank; start the line over.
            None => format!("\n{}: {}", APP_NAME, text),
        };
        screen.emit(&output);
        screen.shown = text.to_string();
    }

    fn finish_assistant(&self, text: &str) {
        self.update_assistant(text, "");
        self.screen().end_reply();
    }

    fn fail_assistant(&self, message: &str) {
        let mut screen = self.screen();
        if screen.in_reply && !screen.shown.is_empty() {
            screen.emit("\n");
        }
        screen.in_reply = false;
        screen.shown.clear();
        screen.emit(&format!("[{}]\n", message));
    }

    fn remove_last_assistant(&self) {
        self.notice("(regenerating last reply)");
    }

    fn clear(&self) {
        self.notice("--- new chat ---");
    }

    fn show_history(&self, conversations: &[Conversation]) {
        self.screen().history = conversations.to_vec();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    Regenerate,
    History,
    Open(usize),
    Rename(usize, String),
    Delete(usize),
    Export(ExportFormat),
    Templates,
    TemplateSave { name: String, content: String },
    TemplateUse(usize),
    TemplateDelete(usize),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

fn index(arg: &str) -> Option<usize> {
    arg.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line.to_string());
        };

        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();
        let usage = |text: &str| Command::Invalid(format!("Usage: {}", text));

        match name {
            "new" => Command::New,
            "regen" => Command::Regenerate,
            "history" => Command::History,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            "templates" => Command::Templates,
            "open" => index(args).map(Command::Open).unwrap_or_else(|| usage("/open <n>")),
            "delete" => index(args)
                .map(Command::Delete)
                .unwrap_or_else(|| usage("/delete <n>")),
            "rename" => {
                let (n, title) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
                match index(n) {
                    Some(n) if !title.trim().is_empty() => {
                        Command::Rename(n, title.trim().to_string())
                    }
                    _ => usage("/rename <n> <title>"),
                }
            }
            "export" => ExportFormat::parse(args)
                .map(Command::Export)
                .unwrap_or_else(|| usage("/export json|txt")),
            "template" => {
                let (action, rest) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
                let rest = rest.trim();
                match action {
                    "save" => match rest.split_once(char::is_whitespace) {
                        Some((name, content)) if !content.trim().is_empty() => {
                            Command::TemplateSave {
                                name: name.to_string(),
                                content: content.trim().to_string(),
                            }
                        }
                        _ => usage("/template save <name> <content>"),
                    },
                    "use" => index(rest)
                        .map(Command::TemplateUse)
                        .unwrap_or_else(|| usage("/template use <n>")),
                    "delete" => index(rest)
                        .map(Command::TemplateDelete)
                        .unwrap_or_else(|| usage("/template delete <n>")),
                    _ => usage("/template save|use|delete"),
                }
            }
            other => Command::Invalid(format!("Unknown command: /{}", other)),
        }
    }
}

fn spawn_reply(controller: &Arc<TerminalController>, text: String) {
    let controller = controller.clone();
    tokio::spawn(async move {
        if let Err(e) = controller.send(&text).await {
            tracing::debug!("Message not sent: {}", e);
        }
    });
}

fn is_busy(phase: StreamPhase) -> bool {
    matches!(phase, StreamPhase::AwaitingFirstByte | StreamPhase::Streaming)
}

/// Read commands from stdin until `/quit` or end of input.
pub async fn run(
    controller: Arc<TerminalController>,
    view: Arc<TerminalView>,
    db: Database,
) -> Result<()> {
    view.notice(HELP);
    controller.refresh_history().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if is_busy(controller.phase()) {
                    controller.cancel();
                    view.notice("(cancelled)");
                    continue;
                }
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Send(text) => spawn_reply(&controller, text),
            Command::New => controller.new_chat(),
            Command::Regenerate => {
                let controller = controller.clone();
                let view = view.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.regenerate().await {
                        view.notice(&e.to_string());
                    }
                });
            }
            Command::History => {
                controller.refresh_history().await;
                view.print_history();
            }
            Command::Open(n) => match view.history().get(n - 1) {
                Some(conversation) => controller.open_chat(conversation.clone()),
                None => view.notice("No such chat. Use /history to list chats."),
            },
            Command::Rename(n, title) => match view.history().get(n - 1) {
                Some(conversation) => {
                    controller.rename_chat(&conversation.id, &title).await;
                    view.print_history();
                }
                None => view.notice("No such chat. Use /history to list chats."),
            },
            Command::Delete(n) => match view.history().get(n - 1) {
                Some(conversation) => {
                    controller.delete_chat(&conversation.id).await;
                    view.print_history();
                }
                None => view.notice("No such chat. Use /history to list chats."),
            },
            Command::Export(format) => match controller.current_conversation() {
                Some(conversation) => match write_export(&conversation, format, Path::new(".")) {
                    Ok(path) => view.notice(&format!("Exported to {}", path.display())),
                    Err(e) => view.notice(&format!("{:#}", e)),
                },
                None => view.notice("Nothing to export yet."),
            },
            Command::Templates => {
                let templates = TemplateService::templates(&db).await;
                if templates.is_empty() {
                    view.notice("No saved templates.");
                }
                for (i, template) in templates.iter().enumerate() {
                    view.notice(&format!("{:>3}. {}: {}", i + 1, template.name, template.content));
                }
            }
            Command::TemplateSave { name, content } => {
                match TemplateService::save_template(&db, &name, &content).await {
                    Ok(_) => view.notice(&format!("Saved template \"{}\".", name)),
                    Err(e) => view.notice(&format!("Failed to save template: {:#}", e)),
                }
            }
            Command::TemplateUse(n) => {
                let templates = TemplateService::templates(&db).await;
                match templates.get(n - 1) {
                    Some(template) => spawn_reply(&controller, template.content.clone()),
                    None => view.notice("No such template."),
                }
            }
            Command::TemplateDelete(n) => {
                let templates = TemplateService::templates(&db).await;
                match templates.get(n - 1) {
                    Some(template) => {
                        if let Err(e) = TemplateService::delete_template(&db, &template.id).await {
                            view.notice(&format!("Failed to delete template: {:#}", e));
                        }
                    }
                    None => view.notice("No such template."),
                }
            }
            Command::Help => view.notice(HELP),
            Command::Quit => break,
            Command::Invalid(message) => view.notice(&message),
        }
    }

    controller.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn view() -> (TerminalView, SharedBuf) {
        let buf = SharedBuf::default();
        (TerminalView::with_writer(Box::new(buf.clone())), buf)
    }

    #[test]
    fn test_streamed_reply_prints_suffixes() {
        let (view, buf) = view();
        view.show_message(&Message::user("Hello"));
        view.begin_assistant();
        view.update_assistant("Hi", "");
        view.update_assistant("Hi there", "");
        view.finish_assistant("Hi there!");
        assert_eq!(buf.text(), "You: Hello\nLannZAi: Hi there!\n");
    }

    #[test]
    fn test_failure_replaces_partial_reply() {
        let (view, buf) = view();
        view.begin_assistant();
        view.update_assistant("Hi", "");
        view.fail_assistant("Maaf");
        view.notice("next");
        assert_eq!(buf.text(), "LannZAi: Hi\n[Maaf]\nnext\n");
    }

    #[test]
    fn test_cancelled_reply_is_terminated_before_next_output() {
        let (view, buf) = view();
        view.begin_assistant();
        view.update_assistant("Partial", "");
        view.clear();
        assert_eq!(buf.text(), "LannZAi: Partial\n--- new chat ---\n");
    }

    #[test]
    fn test_history_is_numbered() {
        let (view, buf) = view();
        let mut conv = Conversation::new();
        conv.title = "Hello".to_string();
        view.show_history(&[conv]);
        assert!(buf.text().is_empty());

        view.print_history();
        assert!(buf.text().starts_with("  1. Hello ("));
        assert_eq!(view.history().len(), 1);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  hello world "), Command::Send("hello world".to_string()));
        assert_eq!(Command::parse(""), Command::Empty);
        assert_eq!(Command::parse("/new"), Command::New);
        assert_eq!(Command::parse("/regen"), Command::Regenerate);
        assert_eq!(Command::parse("/open 2"), Command::Open(2));
        assert_eq!(
            Command::parse("/rename 1 My chat"),
            Command::Rename(1, "My chat".to_string())
        );
        assert_eq!(Command::parse("/export txt"), Command::Export(ExportFormat::Txt));
        assert_eq!(
            Command::parse("/template save greet Say hello"),
            Command::TemplateSave {
                name: "greet".to_string(),
                content: "Say hello".to_string()
            }
        );
        assert_eq!(Command::parse("/template use 3"), Command::TemplateUse(3));
        assert_eq!(Command::parse("/quit"), Command::Quit);
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(matches!(Command::parse("/open 0"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/open x"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/rename 1"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/export pdf"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/template save name"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/bogus"), Command::Invalid(_)));
    }
}
