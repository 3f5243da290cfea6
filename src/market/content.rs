//! Blog, landing page and contact-form storage.

use rusqlite::{Row, params};

use super::db::{DbContext, MarketDb, Table, audit_at, now_timestamp, parse_column};
use super::models::*;
use super::validate;
use crate::errors::{MarketError, MarketResult};

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

const POST_SELECT: &str = "SELECT id, tenant_id, author_id, title, slug, excerpt, body, published_at, is_deleted, created_at, modified_at, deleted_at FROM blog_posts";

fn map_post(row: &Row) -> rusqlite::Result<BlogPost> {
    Ok(BlogPost {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        author_id: row.get(2)?,
        title: row.get(3)?,
        slug: row.get(4)?,
        excerpt: row.get(5)?,
        body: row.get(6)?,
        published_at: row.get(7)?,
        audit: audit_at(row, 8)?,
    })
}

const SECTION_SELECT: &str = "SELECT id, tenant_id, kind, title, body, position, is_visible, is_deleted, created_at, modified_at, deleted_at FROM landing_sections";

fn map_section(row: &Row) -> rusqlite::Result<LandingSection> {
    Ok(LandingSection {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        kind: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        position: row.get(5)?,
        is_visible: row.get(6)?,
        audit: audit_at(row, 7)?,
    })
}

const CONTACT_SELECT: &str = "SELECT id, tenant_id, name, email, subject, message, status, is_deleted, created_at, modified_at, deleted_at FROM contact_requests";

fn map_contact(row: &Row) -> rusqlite::Result<ContactRequest> {
    Ok(ContactRequest {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        subject: row.get(4)?,
        message: row.get(5)?,
        status: parse_column(row, 6)?,
        audit: audit_at(row, 7)?,
    })
}

impl MarketDb {
    // ── Blog ──────────────────────────────────────────────────────────

    /// Create an unpublished draft; the slug is derived from the title.
    pub fn create_post(
        &self,
        tenant_id: i64,
        author_id: Option<i64>,
        title: &str,
        excerpt: &str,
        body: &str,
    ) -> MarketResult<BlogPost> {
        validate::require_non_empty("title", title)?;
        let base = slugify(title, 60);
        if base.is_empty() {
            return Err(MarketError::Validation(format!(
                "title '{}' has no usable characters",
                title
            )));
        }
        let slug = self.unique_slug(Table::BlogPosts, tenant_id, &base)?;
        let id = self.insert_row(
            Table::BlogPosts,
            &["tenant_id", "author_id", "title", "slug", "excerpt", "body"],
            &[&tenant_id, &author_id, &title, &slug, &excerpt, &body],
        )?;
        self.get_post(id)?.ok_or(MarketError::PostNotFound { id })
    }

    pub fn get_post(&self, id: i64) -> MarketResult<Option<BlogPost>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", POST_SELECT),
            params![id],
            map_post,
        )
    }

    pub fn get_post_by_slug(&self, tenant_id: i64, slug: &str) -> MarketResult<Option<BlogPost>> {
        self.query_opt(
            &format!(
                "{} WHERE tenant_id = ?1 AND slug = ?2 AND is_deleted = 0",
                POST_SELECT
            ),
            params![tenant_id, slug],
            map_post,
        )
    }

    pub fn publish_post(&self, id: i64) -> MarketResult<BlogPost> {
        let now = now_timestamp();
        if !self.update_row(Table::BlogPosts, id, &[("published_at", &now)])? {
            return Err(MarketError::PostNotFound { id });
        }
        self.get_post(id)?.ok_or(MarketError::PostNotFound { id })
    }

    pub fn unpublish_post(&self, id: i64) -> MarketResult<BlogPost> {
        let none: Option<String> = None;
        if !self.update_row(Table::BlogPosts, id, &[("published_at", &none)])? {
            return Err(MarketError::PostNotFound { id });
        }
        self.get_post(id)?.ok_or(MarketError::PostNotFound { id })
    }

    /// Public listing: published posts, newest first.
    pub fn list_published_posts(&self, tenant_id: i64) -> MarketResult<Vec<BlogPost>> {
        self.query_all(
            &format!(
                "{} WHERE tenant_id = ?1 AND published_at IS NOT NULL AND is_deleted = 0
                 ORDER BY published_at DESC, id DESC",
                POST_SELECT
            ),
            params![tenant_id],
            map_post,
        )
    }

    // ── Landing sections ──────────────────────────────────────────────

    /// Append a section after the tenant's last one.
    pub fn add_landing_section(
        &self,
        tenant_id: i64,
        kind: &str,
        title: &str,
        body: &str,
    ) -> MarketResult<LandingSection> {
        validate::require_non_empty("kind", kind)?;
        let next: i64 = self
            .conn()
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM landing_sections
                 WHERE tenant_id = ?1 AND is_deleted = 0",
                params![tenant_id],
                |row| row.get(0),
            )
            .db_context("Failed to get next section position")?;
        let id = self.insert_row(
            Table::LandingSections,
            &["tenant_id", "kind", "title", "body", "position"],
            &[&tenant_id, &kind, &title, &body, &next],
        )?;
        self.query_opt(
            &format!("{} WHERE id = ?1", SECTION_SELECT),
            params![id],
            map_section,
        )?
        .ok_or(MarketError::SectionNotFound { id })
    }

    pub fn list_landing_sections(&self, tenant_id: i64) -> MarketResult<Vec<LandingSection>> {
        self.query_all(
            &format!(
                "{} WHERE tenant_id = ?1 AND is_deleted = 0 ORDER BY position, id",
                SECTION_SELECT
            ),
            params![tenant_id],
            map_section,
        )
    }

    pub fn set_section_visible(&self, id: i64, visible: bool) -> MarketResult<bool> {
        self.update_row(Table::LandingSections, id, &[("is_visible", &visible)])
    }

    /// Rewrite positions `0..n` following `ordered_ids`.
    ///
    /// `ordered_ids` must name every live section of the tenant exactly once.
    pub fn reorder_landing_sections(
        &self,
        tenant_id: i64,
        ordered_ids: &[i64],
    ) -> MarketResult<Vec<LandingSection>> {
        let current = self.list_landing_sections(tenant_id)?;
        let mut expected: Vec<i64> = current.iter().map(|s| s.id).collect();
        let mut given = ordered_ids.to_vec();
        expected.sort_unstable();
        given.sort_unstable();
        if expected != given {
            return Err(MarketError::Validation(
                "reorder must list each section of the tenant exactly once".into(),
            ));
        }

        let tx = self
            .conn()
            .unchecked_transaction()
            .db_context("Failed to begin reorder")?;
        for (position, id) in ordered_ids.iter().enumerate() {
            let position = position as i64;
            self.update_row(Table::LandingSections, *id, &[("position", &position)])?;
        }
        tx.commit().db_context("Failed to commit reorder")?;
        self.list_landing_sections(tenant_id)
    }

    // ── Contact requests ──────────────────────────────────────────────

    pub fn submit_contact_request(
        &self,
        tenant_id: i64,
        name: &str,
        email: &str,
        subject: &str,
        message: &str,
    ) -> MarketResult<ContactRequest> {
        validate::require_non_empty("name", name)?;
        validate::require_email(email.trim())?;
        validate::require_non_empty("message", message)?;
        if self.get_tenant(tenant_id)?.is_none() {
            return Err(MarketError::TenantNotFound(tenant_id.to_string()));
        }
        let id = self.insert_row(
            Table::ContactRequests,
            &["tenant_id", "name", "email", "subject", "message"],
            &[&tenant_id, &name, &email.trim(), &subject, &message],
        )?;
        self.get_contact_request(id)?
            .ok_or(MarketError::ContactNotFound { id })
    }

    pub fn get_contact_request(&self, id: i64) -> MarketResult<Option<ContactRequest>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", CONTACT_SELECT),
            params![id],
            map_contact,
        )
    }

    pub fn list_contact_requests(
        &self,
        tenant_id: i64,
        status: Option<ContactStatus>,
    ) -> MarketResult<Vec<ContactRequest>> {
        match status {
            Some(status) => self.query_all(
                &format!(
                    "{} WHERE tenant_id = ?1 AND status = ?2 AND is_deleted = 0 ORDER BY id",
                    CONTACT_SELECT
                ),
                params![tenant_id, status.as_str()],
                map_contact,
            ),
            None => self.query_all(
                &format!(
                    "{} WHERE tenant_id = ?1 AND is_deleted = 0 ORDER BY id",
                    CONTACT_SELECT
                ),
                params![tenant_id],
                map_contact,
            ),
        }
    }

    pub fn mark_contact_handled(&self, id: i64) -> MarketResult<ContactRequest> {
        let status = ContactStatus::Handled.as_str();
        if !self.update_row(Table::ContactRequests, id, &[("status", &status)])? {
            return Err(MarketError::ContactNotFound { id });
        }
        self.get_contact_request(id)?
            .ok_or(MarketError::ContactNotFound { id })
    }
}
