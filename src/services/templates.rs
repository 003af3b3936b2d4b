use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use super::database::Database;
use crate::models::Template;

const TEMPLATES_KEY: &str = "lannzai_prompt_templates";

pub struct TemplateService;

impl TemplateService {
    /// Saved templates, oldest first. A missing or unreadable entry reads as empty.
    pub async fn templates(db: &Database) -> Vec<Template> {
        match db.get_setting(TEMPLATES_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Discarding unreadable templates entry: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("Failed to load templates: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn save_template(db: &Database, name: &str, content: &str) -> Result<Vec<Template>> {
        let mut templates = Self::templates(db).await;
        templates.push(Template {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Self::store(db, &templates).await?;
        Ok(templates)
    }

    pub async fn delete_template(db: &Database, id: &str) -> Result<Vec<Template>> {
        let mut templates = Self::templates(db).await;
        templates.retain(|t| t.id != id);
        Self::store(db, &templates).await?;
        Ok(templates)
    }

    async fn store(db: &Database, templates: &[Template]) -> Result<()> {
        let json = serde_json::to_string(templates)?;
        db.set_setting(TEMPLATES_KEY, &json).await
    }
}
