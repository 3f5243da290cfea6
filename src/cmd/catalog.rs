//! Catalog templates and their preview assets.

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use marketplace::config::MarketConfig;
use marketplace::market::models::NewTemplate;
use marketplace::market::{AssetStore, DbHandle};

use super::super::TemplateCommands;
use super::open_db;

pub async fn cmd_template(config: &MarketConfig, command: TemplateCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        TemplateCommands::Add {
            tenant,
            name,
            price_cents,
            currency,
            image,
            description,
            category,
        } => {
            let tenant = db
                .get_tenant_by_slug(&tenant)?
                .ok_or_else(|| anyhow!("Tenant '{}' not found", tenant))?;
            let template = db.create_template(
                tenant.id,
                &NewTemplate {
                    name,
                    description,
                    category,
                    price_cents,
                    currency,
                    preview_url: None,
                    image,
                },
            )?;
            println!("Created template {} ({})", template.id, template.slug);
        }
        TemplateCommands::List { tenant } => {
            let tenant = db
                .get_tenant_by_slug(&tenant)?
                .ok_or_else(|| anyhow!("Tenant '{}' not found", tenant))?;
            let templates = db.list_all_templates(tenant.id)?;
            if templates.is_empty() {
                println!("No templates.");
            }
            for t in templates {
                println!(
                    "{:>4}  {:<24} {:>8} {} {:<11} {}",
                    t.id,
                    t.slug,
                    t.price_cents,
                    t.currency,
                    if t.is_published { "published" } else { "draft" },
                    t.preview_url.as_deref().unwrap_or("-")
                );
            }
        }
        TemplateCommands::Publish { id } => {
            let template = db.set_template_published(id, true)?;
            println!("Published template {} ({})", template.id, template.slug);
        }
        TemplateCommands::Unpublish { id } => {
            let template = db.set_template_published(id, false)?;
            println!("Unpublished template {} ({})", template.id, template.slug);
        }
        TemplateCommands::Preview { id, file } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let assets = AssetStore::local(&config.storage.assets_dir, &config.storage.public_url)?;
            let (template, asset) = assets
                .attach_preview(&DbHandle::new(db), id, &file_name, Bytes::from(data))
                .await?;
            println!(
                "Set preview of template {} to {} ({} bytes)",
                template.id, asset.url, asset.size
            );
        }
    }
    Ok(())
}
