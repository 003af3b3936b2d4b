use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::config::APP_NAME;
use crate::models::{Conversation, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Json,
    Txt,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(ExportFormat::Json),
            "txt" | "text" => Some(ExportFormat::Txt),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
        }
    }

    pub fn render(&self, conversation: &Conversation) -> Result<String> {
        match self {
            ExportFormat::Json => export_json(conversation),
            ExportFormat::Txt => Ok(export_text(conversation)),
        }
    }
}

/// Write the export into `dir` under its conventional file name.
pub fn write_export(
    conversation: &Conversation,
    format: ExportFormat,
    dir: &Path,
) -> Result<PathBuf> {
    let path = dir.join(export_file_name(conversation, format.extension()));
    let content = format.render(conversation)?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write export to {}", path.display()))?;
    Ok(path)
}

pub fn export_json(conversation: &Conversation) -> Result<String> {
    Ok(serde_json::to_string_pretty(conversation)?)
}

pub fn export_text(conversation: &Conversation) -> String {
    let mut output = format!("{} Chat Export\n", APP_NAME);
    output.push_str(&format!("Title: {}\n", conversation.title));
    output.push_str(&format!(
        "Date: {}\n",
        conversation.updated_at.format("%Y-%m-%d %H:%M")
    ));
    output.push_str(&format!("\n{}\n\n", "=".repeat(50)));

    for msg in &conversation.messages {
        let sender = match msg.role {
            Role::User => "You",
            Role::Assistant => APP_NAME,
        };
        output.push_str(&format!("{}:\n{}\n\n", sender, msg.content));
    }

    output
}

pub fn export_file_name(conversation: &Conversation, extension: &str) -> String {
    format!("lannzai-chat-{}.{}", conversation.id, extension)
}
