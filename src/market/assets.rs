//! Template preview assets kept in object storage.
//!
//! Keys look like `tenants/<tenant>/templates/<template>/<uuid>-<name>`. The
//! local backend is a directory; any other `object_store` backend plugs in
//! through [`AssetStore::new`].

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use serde::Serialize;

use super::db::{DbHandle, MarketDb};
use super::models::Template;
use crate::errors::{MarketError, MarketResult};

pub const MAX_ASSET_BYTES: usize = 5 * 1024 * 1024;

const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "svg"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAsset {
    pub key: String,
    pub size: usize,
    pub url: String,
}

#[derive(Clone)]
pub struct AssetStore {
    store: Arc<dyn ObjectStore>,
    public_base: String,
}

/// Lowercased file name restricted to `[a-z0-9._-]`, with an image extension.
pub fn sanitize_file_name(name: &str) -> MarketResult<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.').to_string();
    let ext = cleaned.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext) {
        return Err(MarketError::Validation(format!(
            "unsupported asset type '{}'",
            name
        )));
    }
    Ok(cleaned)
}

impl AssetStore {
    pub fn new(store: Arc<dyn ObjectStore>, public_base: &str) -> Self {
        Self {
            store,
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    /// Directory-backed store rooted at `root`, created if missing.
    pub fn local(root: &Path, public_base: &str) -> MarketResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            MarketError::Other(anyhow::Error::new(e).context(format!(
                "Failed to create asset directory {}",
                root.display()
            )))
        })?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store), public_base))
    }

    pub fn in_memory(public_base: &str) -> Self {
        Self::new(Arc::new(InMemory::new()), public_base)
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }

    fn template_prefix(template: &Template) -> String {
        format!("tenants/{}/templates/{}", template.tenant_id, template.id)
    }

    /// Store one file under the template's prefix.
    pub async fn upload(
        &self,
        template: &Template,
        file_name: &str,
        data: Bytes,
    ) -> MarketResult<StoredAsset> {
        let name = sanitize_file_name(file_name)?;
        if data.is_empty() {
            return Err(MarketError::Validation("asset is empty".into()));
        }
        if data.len() > MAX_ASSET_BYTES {
            return Err(MarketError::Validation(format!(
                "asset is {} bytes, limit is {}",
                data.len(),
                MAX_ASSET_BYTES
            )));
        }
        let key = format!(
            "{}/{}-{}",
            Self::template_prefix(template),
            uuid::Uuid::new_v4().simple(),
            name
        );
        let size = data.len();
        self.store.put(&ObjectPath::from(key.as_str()), data.into()).await?;
        tracing::info!(template_id = template.id, key = %key, size, "Stored template asset");
        Ok(StoredAsset {
            url: self.url_for(&key),
            key,
            size,
        })
    }

    pub async fn read(&self, key: &str) -> MarketResult<Bytes> {
        let result = self.store.get(&ObjectPath::from(key)).await?;
        Ok(result.bytes().await?)
    }

    /// Keys stored for the template, sorted.
    pub async fn list(&self, template: &Template) -> MarketResult<Vec<String>> {
        let prefix = ObjectPath::from(Self::template_prefix(template).as_str());
        let metas: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    pub async fn delete(&self, key: &str) -> MarketResult<()> {
        self.store.delete(&ObjectPath::from(key)).await?;
        Ok(())
    }

    /// Upload a preview image and point the template's `preview_url` at it.
    pub async fn attach_preview(
        &self,
        db: &DbHandle,
        template_id: i64,
        file_name: &str,
        data: Bytes,
    ) -> MarketResult<(Template, StoredAsset)> {
        let template = db
            .call(move |db| {
                db.get_template(template_id)?
                    .ok_or(MarketError::TemplateNotFound { id: template_id })
            })
            .await?;
        let asset = self.upload(&template, file_name, data).await?;
        let url = asset.url.clone();
        let updated = db
            .call(move |db: &MarketDb| db.set_template_preview_url(template_id, Some(url.as_str())))
            .await;
        match updated {
            Ok(template) => Ok((template, asset)),
            Err(e) => {
                if let Err(cleanup) = self.delete(&asset.key).await {
                    tracing::warn!(key = %asset.key, error = %cleanup, "Failed to remove orphaned asset");
                }
                Err(e)
            }
        }
    }
}
