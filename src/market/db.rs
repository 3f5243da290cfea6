use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::types::{ToSql, Type};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};

use super::license;
use super::models::*;
use super::validate;
use crate::errors::{MarketError, MarketResult};

/// Columns every table carries. Spliced into each `CREATE TABLE`.
const AUDIT_COLUMNS: &str = "is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    modified_at TEXT,
    deleted_at TEXT";

/// Select list matching [`audit_at`].
pub(crate) const AUDIT_SELECT: &str = "is_deleted, created_at, modified_at, deleted_at";

/// UTC timestamp with fixed width so lexical order is chronological.
pub fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

/// Tables that follow the audit and soft-delete convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Tenants,
    Users,
    Templates,
    Orders,
    OrderItems,
    Purchases,
    Payments,
    BlogPosts,
    LandingSections,
    ContactRequests,
    DeploymentTargets,
    CustomerSites,
    DeploymentJobs,
    Logs,
}

impl Table {
    /// Creation order (parents before children).
    pub const ALL: [Table; 14] = [
        Table::Tenants,
        Table::Users,
        Table::Templates,
        Table::Orders,
        Table::OrderItems,
        Table::Purchases,
        Table::Payments,
        Table::BlogPosts,
        Table::LandingSections,
        Table::ContactRequests,
        Table::DeploymentTargets,
        Table::CustomerSites,
        Table::DeploymentJobs,
        Table::Logs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tenants => "tenants",
            Self::Users => "users",
            Self::Templates => "templates",
            Self::Orders => "orders",
            Self::OrderItems => "order_items",
            Self::Purchases => "purchases",
            Self::Payments => "payments",
            Self::BlogPosts => "blog_posts",
            Self::LandingSections => "landing_sections",
            Self::ContactRequests => "contact_requests",
            Self::DeploymentTargets => "deployment_targets",
            Self::CustomerSites => "customer_sites",
            Self::DeploymentJobs => "deployment_jobs",
            Self::Logs => "logs",
        }
    }

    /// Entity-specific columns (without `id` and the audit columns).
    fn columns(&self) -> &'static str {
        match self {
            Self::Tenants => {
                "name TEXT NOT NULL,
                slug TEXT NOT NULL,
                custom_domain TEXT,
                is_active INTEGER NOT NULL DEFAULT 1"
            }
            Self::Users => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                email TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'customer',
                is_active INTEGER NOT NULL DEFAULT 1"
            }
            Self::Templates => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                name TEXT NOT NULL,
                slug TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                price_cents INTEGER NOT NULL,
                currency TEXT NOT NULL,
                preview_url TEXT,
                image TEXT NOT NULL,
                is_published INTEGER NOT NULL DEFAULT 0"
            }
            Self::Orders => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                user_id INTEGER NOT NULL REFERENCES users(id),
                reference TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending',
                total_cents INTEGER NOT NULL,
                currency TEXT NOT NULL"
            }
            Self::OrderItems => {
                "order_id INTEGER NOT NULL REFERENCES orders(id),
                template_id INTEGER NOT NULL REFERENCES templates(id),
                quantity INTEGER NOT NULL,
                unit_price_cents INTEGER NOT NULL"
            }
            Self::Purchases => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                user_id INTEGER NOT NULL REFERENCES users(id),
                template_id INTEGER NOT NULL REFERENCES templates(id),
                order_id INTEGER REFERENCES orders(id),
                license_key TEXT NOT NULL UNIQUE,
                price_cents INTEGER NOT NULL,
                currency TEXT NOT NULL"
            }
            Self::Payments => {
                "order_id INTEGER NOT NULL REFERENCES orders(id),
                provider TEXT NOT NULL,
                provider_reference TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                status TEXT NOT NULL"
            }
            Self::BlogPosts => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                author_id INTEGER REFERENCES users(id),
                title TEXT NOT NULL,
                slug TEXT NOT NULL,
                excerpt TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                published_at TEXT"
            }
            Self::LandingSections => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                kind TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                position INTEGER NOT NULL DEFAULT 0,
                is_visible INTEGER NOT NULL DEFAULT 1"
            }
            Self::ContactRequests => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new'"
            }
            Self::DeploymentTargets => {
                "name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 22,
                username TEXT NOT NULL,
                ssh_key_path TEXT,
                is_active INTEGER NOT NULL DEFAULT 1"
            }
            Self::CustomerSites => {
                "tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                user_id INTEGER REFERENCES users(id),
                template_id INTEGER REFERENCES templates(id),
                target_id INTEGER NOT NULL REFERENCES deployment_targets(id),
                name TEXT NOT NULL,
                slug TEXT NOT NULL,
                domain TEXT,
                image TEXT NOT NULL,
                host_port INTEGER NOT NULL,
                container_port INTEGER NOT NULL,
                env TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending'"
            }
            Self::DeploymentJobs => {
                "site_id INTEGER NOT NULL REFERENCES customer_sites(id),
                action TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                requested_by INTEGER REFERENCES users(id),
                error TEXT,
                output TEXT,
                started_at TEXT,
                finished_at TEXT"
            }
            Self::Logs => {
                "level TEXT NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL,
                job_id INTEGER,
                site_id INTEGER"
            }
        }
    }
}

/// Attach a message to a rusqlite failure and classify it as a database error.
pub(crate) trait DbContext<T> {
    fn db_context(self, msg: &'static str) -> MarketResult<T>;
}

impl<T> DbContext<T> for rusqlite::Result<T> {
    fn db_context(self, msg: &'static str) -> MarketResult<T> {
        self.map_err(|e| MarketError::Database(anyhow::Error::new(e).context(msg)))
    }
}

/// Read the four audit columns starting at `start`.
pub(crate) fn audit_at(row: &Row, start: usize) -> rusqlite::Result<Audit> {
    Ok(Audit {
        is_deleted: row.get(start)?,
        created_at: row.get(start + 1)?,
        modified_at: row.get(start + 2)?,
        deleted_at: row.get(start + 3)?,
    })
}

/// Read a TEXT column into one of the string-backed enums.
pub(crate) fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Async-safe handle to the marketplace database.
///
/// Wraps `MarketDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MarketDb>>,
}

impl DbHandle {
    pub fn new(db: MarketDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> MarketResult<R>
    where
        F: FnOnce(&MarketDb) -> MarketResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| MarketError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, CLI commands
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> MarketResult<std::sync::MutexGuard<'_, MarketDb>> {
        self.inner.lock().map_err(|_| MarketError::LockPoisoned)
    }
}

pub struct MarketDb {
    conn: Connection,
}

impl MarketDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> MarketResult<Self> {
        let conn = Connection::open(path).db_context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> MarketResult<Self> {
        let conn = Connection::open_in_memory()
            .db_context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> MarketResult<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .db_context("Failed to enable foreign keys")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> MarketResult<()> {
        for table in Table::ALL {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    {},
                    {}
                )",
                table.as_str(),
                table.columns(),
                AUDIT_COLUMNS
            );
            self.conn
                .execute_batch(&ddl)
                .db_context("Failed to create table")?;
        }

        self.conn
            .execute_batch(
                "
                CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_slug
                    ON tenants(slug) WHERE is_deleted = 0;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_domain
                    ON tenants(custom_domain) WHERE is_deleted = 0 AND custom_domain IS NOT NULL;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email
                    ON users(tenant_id, email) WHERE is_deleted = 0;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_templates_slug
                    ON templates(tenant_id, slug) WHERE is_deleted = 0;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_blog_posts_slug
                    ON blog_posts(tenant_id, slug) WHERE is_deleted = 0;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_sites_slug
                    ON customer_sites(slug) WHERE is_deleted = 0;
                CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
                CREATE INDEX IF NOT EXISTS idx_purchases_user ON purchases(user_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_queue ON deployment_jobs(status, created_at, id);
                CREATE INDEX IF NOT EXISTS idx_jobs_site ON deployment_jobs(site_id);
                ",
            )
            .db_context("Failed to create indexes")?;
        Ok(())
    }

    // ── Audit convention ──────────────────────────────────────────────

    /// Insert a row, stamping `created_at`. Returns the new row id.
    pub(crate) fn insert_row(
        &self,
        table: Table,
        columns: &[&str],
        values: &[&dyn ToSql],
    ) -> MarketResult<i64> {
        let now = now_timestamp();
        let mut cols: Vec<&str> = columns.to_vec();
        cols.push("created_at");
        let placeholders = (1..=cols.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.as_str(),
            cols.join(", "),
            placeholders
        );
        let mut params: Vec<&dyn ToSql> = values.to_vec();
        params.push(&now);
        self.conn
            .execute(&sql, params.as_slice())
            .db_context("Failed to insert row")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Update live (not soft-deleted) row `id`, stamping `modified_at`.
    /// Returns whether a row was changed.
    pub(crate) fn update_row(
        &self,
        table: Table,
        id: i64,
        assignments: &[(&str, &dyn ToSql)],
    ) -> MarketResult<bool> {
        let now = now_timestamp();
        let mut sets = Vec::with_capacity(assignments.len() + 1);
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(assignments.len() + 2);
        for (column, value) in assignments {
            params.push(*value);
            sets.push(format!("{} = ?{}", column, params.len()));
        }
        params.push(&now);
        sets.push(format!("modified_at = ?{}", params.len()));
        params.push(&id);
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{} AND is_deleted = 0",
            table.as_str(),
            sets.join(", "),
            params.len()
        );
        let changed = self
            .conn
            .execute(&sql, params.as_slice())
            .db_context("Failed to update row")?;
        Ok(changed > 0)
    }

    /// Mark a row deleted. Returns `false` if it is missing or already deleted.
    pub fn soft_delete(&self, table: Table, id: i64) -> MarketResult<bool> {
        let now = now_timestamp();
        let sql = format!(
            "UPDATE {} SET is_deleted = 1, deleted_at = ?1, modified_at = ?1
             WHERE id = ?2 AND is_deleted = 0",
            table.as_str()
        );
        let changed = self
            .conn
            .execute(&sql, params![now, id])
            .db_context("Failed to soft-delete row")?;
        Ok(changed > 0)
    }

    pub(crate) fn query_all<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        map: fn(&Row) -> rusqlite::Result<T>,
    ) -> MarketResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).db_context("Failed to prepare query")?;
        let rows = stmt.query_map(params, map).db_context("Failed to run query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.db_context("Failed to read row")?);
        }
        Ok(out)
    }

    pub(crate) fn query_opt<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        map: fn(&Row) -> rusqlite::Result<T>,
    ) -> MarketResult<Option<T>> {
        self.conn
            .query_row(sql, params, map)
            .optional()
            .db_context("Failed to query row")
    }

    // ── Tenants ───────────────────────────────────────────────────────

    pub fn create_tenant(
        &self,
        name: &str,
        slug: &str,
        custom_domain: Option<&str>,
    ) -> MarketResult<Tenant> {
        validate::require_non_empty("name", name)?;
        validate::require_slug(slug)?;
        let domain = custom_domain.map(|d| d.trim().to_ascii_lowercase());
        if let Some(ref d) = domain {
            validate::require_hostname("domain", d)?;
            if self.get_tenant_by_domain(d)?.is_some() {
                return Err(MarketError::Validation(format!("domain '{}' is taken", d)));
            }
        }
        if self.get_tenant_by_slug(slug)?.is_some() {
            return Err(MarketError::Validation(format!(
                "tenant slug '{}' is taken",
                slug
            )));
        }
        let id = self.insert_row(
            Table::Tenants,
            &["name", "slug", "custom_domain"],
            &[&name, &slug, &domain],
        )?;
        self.get_tenant(id)?
            .ok_or_else(|| MarketError::TenantNotFound(id.to_string()))
    }

    pub fn get_tenant(&self, id: i64) -> MarketResult<Option<Tenant>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", TENANT_SELECT),
            params![id],
            map_tenant,
        )
    }

    pub fn get_tenant_by_slug(&self, slug: &str) -> MarketResult<Option<Tenant>> {
        self.query_opt(
            &format!("{} WHERE slug = ?1 AND is_deleted = 0", TENANT_SELECT),
            params![slug],
            map_tenant,
        )
    }

    pub fn get_tenant_by_domain(&self, domain: &str) -> MarketResult<Option<Tenant>> {
        self.query_opt(
            &format!(
                "{} WHERE custom_domain = ?1 AND is_deleted = 0",
                TENANT_SELECT
            ),
            params![domain],
            map_tenant,
        )
    }

    pub fn list_tenants(&self) -> MarketResult<Vec<Tenant>> {
        self.query_all(
            &format!("{} WHERE is_deleted = 0 ORDER BY id", TENANT_SELECT),
            [],
            map_tenant,
        )
    }

    pub fn set_tenant_active(&self, id: i64, active: bool) -> MarketResult<Tenant> {
        if !self.update_row(Table::Tenants, id, &[("is_active", &active)])? {
            return Err(MarketError::TenantNotFound(id.to_string()));
        }
        self.get_tenant(id)?
            .ok_or_else(|| MarketError::TenantNotFound(id.to_string()))
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        tenant_id: i64,
        email: &str,
        display_name: &str,
        role: Role,
    ) -> MarketResult<User> {
        let email = email.trim().to_ascii_lowercase();
        validate::require_email(&email)?;
        if self.get_tenant(tenant_id)?.is_none() {
            return Err(MarketError::TenantNotFound(tenant_id.to_string()));
        }
        let taken: Option<i64> = self.query_opt(
            "SELECT id FROM users WHERE tenant_id = ?1 AND email = ?2 AND is_deleted = 0",
            params![tenant_id, email],
            |row| row.get(0),
        )?;
        if taken.is_some() {
            return Err(MarketError::Validation(format!(
                "email '{}' is already registered",
                email
            )));
        }
        let id = self.insert_row(
            Table::Users,
            &["tenant_id", "email", "display_name", "role"],
            &[&tenant_id, &email, &display_name, &role.as_str()],
        )?;
        self.get_user(id)?.ok_or(MarketError::UserNotFound { id })
    }

    pub fn get_user(&self, id: i64) -> MarketResult<Option<User>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", USER_SELECT),
            params![id],
            map_user,
        )
    }

    pub fn list_users(&self, tenant_id: i64) -> MarketResult<Vec<User>> {
        self.query_all(
            &format!(
                "{} WHERE tenant_id = ?1 AND is_deleted = 0 ORDER BY id",
                USER_SELECT
            ),
            params![tenant_id],
            map_user,
        )
    }

    pub fn set_user_role(&self, id: i64, role: Role) -> MarketResult<User> {
        if !self.update_row(Table::Users, id, &[("role", &role.as_str())])? {
            return Err(MarketError::UserNotFound { id });
        }
        self.get_user(id)?.ok_or(MarketError::UserNotFound { id })
    }

    /// Load an active user and check it holds `permission`.
    pub fn require_permission(
        &self,
        user_id: i64,
        permission: Permission,
        action: &str,
    ) -> MarketResult<User> {
        let user = self
            .get_user(user_id)?
            .ok_or(MarketError::UserNotFound { id: user_id })?;
        if !user.is_active || !user.role.allows(permission) {
            return Err(MarketError::Forbidden {
                user_id,
                action: action.to_string(),
            });
        }
        Ok(user)
    }

    // ── Templates ─────────────────────────────────────────────────────

    pub fn create_template(&self, tenant_id: i64, new: &NewTemplate) -> MarketResult<Template> {
        validate::require_non_empty("name", &new.name)?;
        validate::require_non_empty("image", &new.image)?;
        validate::require_currency(&new.currency)?;
        if new.price_cents < 0 {
            return Err(MarketError::Validation("price must not be negative".into()));
        }
        if self.get_tenant(tenant_id)?.is_none() {
            return Err(MarketError::TenantNotFound(tenant_id.to_string()));
        }
        let base = super::content::slugify(&new.name, 60);
        validate::require_slug(&base)?;
        let slug = self.unique_slug(Table::Templates, tenant_id, &base)?;
        let id = self.insert_row(
            Table::Templates,
            &[
                "tenant_id",
                "name",
                "slug",
                "description",
                "category",
                "price_cents",
                "currency",
                "preview_url",
                "image",
            ],
            &[
                &tenant_id,
                &new.name,
                &slug,
                &new.description,
                &new.category,
                &new.price_cents,
                &new.currency,
                &new.preview_url,
                &new.image,
            ],
        )?;
        self.get_template(id)?.ok_or(MarketError::TemplateNotFound { id })
    }

    /// First free `base`, `base-2`, `base-3`, ... among live rows of `table`
    /// in the tenant. `table` must have `tenant_id` and `slug` columns.
    pub(crate) fn unique_slug(&self, table: Table, tenant_id: i64, base: &str) -> MarketResult<String> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE tenant_id = ?1 AND slug = ?2 AND is_deleted = 0",
            table.as_str()
        );
        let mut candidate = base.to_string();
        let mut n = 2;
        loop {
            let count: i64 = self
                .conn
                .query_row(&sql, params![tenant_id, candidate], |row| row.get(0))
                .db_context("Failed to check slug")?;
            if count == 0 {
                return Ok(candidate);
            }
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
    }

    pub fn get_template(&self, id: i64) -> MarketResult<Option<Template>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", TEMPLATE_SELECT),
            params![id],
            map_template,
        )
    }

    /// Storefront listing: published templates only, by name.
    pub fn list_published_templates(&self, tenant_id: i64) -> MarketResult<Vec<Template>> {
        self.query_all(
            &format!(
                "{} WHERE tenant_id = ?1 AND is_published = 1 AND is_deleted = 0 ORDER BY name, id",
                TEMPLATE_SELECT
            ),
            params![tenant_id],
            map_template,
        )
    }

    /// Back-office listing: includes unpublished templates.
    pub fn list_all_templates(&self, tenant_id: i64) -> MarketResult<Vec<Template>> {
        self.query_all(
            &format!(
                "{} WHERE tenant_id = ?1 AND is_deleted = 0 ORDER BY name, id",
                TEMPLATE_SELECT
            ),
            params![tenant_id],
            map_template,
        )
    }

    pub fn set_template_published(&self, id: i64, published: bool) -> MarketResult<Template> {
        if !self.update_row(Table::Templates, id, &[("is_published", &published)])? {
            return Err(MarketError::TemplateNotFound { id });
        }
        self.get_template(id)?.ok_or(MarketError::TemplateNotFound { id })
    }

    pub fn update_template_price(&self, id: i64, price_cents: i64) -> MarketResult<Template> {
        if price_cents < 0 {
            return Err(MarketError::Validation("price must not be negative".into()));
        }
        if !self.update_row(Table::Templates, id, &[("price_cents", &price_cents)])? {
            return Err(MarketError::TemplateNotFound { id });
        }
        self.get_template(id)?.ok_or(MarketError::TemplateNotFound { id })
    }

    pub fn set_template_preview_url(&self, id: i64, url: Option<&str>) -> MarketResult<Template> {
        if !self.update_row(Table::Templates, id, &[("preview_url", &url)])? {
            return Err(MarketError::TemplateNotFound { id });
        }
        self.get_template(id)?.ok_or(MarketError::TemplateNotFound { id })
    }

    // ── Purchases & license keys ──────────────────────────────────────

    /// Record an acquisition of `template_id` by `user_id` with a fresh key.
    pub fn purchase_template(&self, user_id: i64, template_id: i64) -> MarketResult<Purchase> {
        let user = self
            .get_user(user_id)?
            .ok_or(MarketError::UserNotFound { id: user_id })?;
        let template = self.purchasable_template(template_id, user.tenant_id)?;
        self.insert_purchase(&user, &template, None, template.price_cents)
    }

    /// A published, live template in the given tenant.
    pub(crate) fn purchasable_template(
        &self,
        template_id: i64,
        tenant_id: i64,
    ) -> MarketResult<Template> {
        let template = self
            .get_template(template_id)?
            .filter(|t| t.tenant_id == tenant_id)
            .ok_or(MarketError::TemplateNotFound { id: template_id })?;
        if !template.is_published {
            return Err(MarketError::Validation(format!(
                "template {} is not published",
                template_id
            )));
        }
        Ok(template)
    }

    pub(crate) fn insert_purchase(
        &self,
        user: &User,
        template: &Template,
        order_id: Option<i64>,
        price_cents: i64,
    ) -> MarketResult<Purchase> {
        let mut attempts = 0;
        let license_key = loop {
            let key = license::generate_key();
            let exists: Option<i64> = self.query_opt(
                "SELECT id FROM purchases WHERE license_key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            if exists.is_none() {
                break key;
            }
            attempts += 1;
            if attempts >= license::MAX_KEY_ATTEMPTS {
                return Err(MarketError::Other(anyhow::anyhow!(
                    "could not generate a unique license key"
                )));
            }
        };
        let id = self.insert_row(
            Table::Purchases,
            &[
                "tenant_id",
                "user_id",
                "template_id",
                "order_id",
                "license_key",
                "price_cents",
                "currency",
            ],
            &[
                &user.tenant_id,
                &user.id,
                &template.id,
                &order_id,
                &license_key,
                &price_cents,
                &template.currency,
            ],
        )?;
        self.query_opt(
            &format!("{} WHERE id = ?1", PURCHASE_SELECT),
            params![id],
            map_purchase,
        )?
        .ok_or_else(|| MarketError::Other(anyhow::anyhow!("purchase {} vanished after insert", id)))
    }

    /// Look a purchase up by license key; accepts lower-case and undashed input.
    pub fn find_purchase_by_key(&self, key: &str) -> MarketResult<Option<Purchase>> {
        let Some(key) = license::normalize_key(key) else {
            return Ok(None);
        };
        self.query_opt(
            &format!(
                "{} WHERE license_key = ?1 AND is_deleted = 0",
                PURCHASE_SELECT
            ),
            params![key],
            map_purchase,
        )
    }

    pub fn list_purchases_for_user(&self, user_id: i64) -> MarketResult<Vec<Purchase>> {
        self.query_all(
            &format!(
                "{} WHERE user_id = ?1 AND is_deleted = 0 ORDER BY id",
                PURCHASE_SELECT
            ),
            params![user_id],
            map_purchase,
        )
    }

    // ── Audit log ─────────────────────────────────────────────────────

    pub fn insert_log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        job_id: Option<i64>,
        site_id: Option<i64>,
    ) -> MarketResult<LogEntry> {
        let id = self.insert_row(
            Table::Logs,
            &["level", "source", "message", "job_id", "site_id"],
            &[&level.as_str(), &source, &message, &job_id, &site_id],
        )?;
        self.query_opt(
            "SELECT id, level, source, message, job_id, site_id, created_at FROM logs WHERE id = ?1",
            params![id],
            map_log,
        )?
        .ok_or_else(|| MarketError::Other(anyhow::anyhow!("log {} vanished after insert", id)))
    }

    /// Most recent entries first.
    pub fn list_logs(&self, limit: i64) -> MarketResult<Vec<LogEntry>> {
        self.query_all(
            "SELECT id, level, source, message, job_id, site_id, created_at
             FROM logs WHERE is_deleted = 0 ORDER BY id DESC LIMIT ?1",
            params![limit],
            map_log,
        )
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

const TENANT_SELECT: &str = "SELECT id, name, slug, custom_domain, is_active, is_deleted, created_at, modified_at, deleted_at FROM tenants";

fn map_tenant(row: &Row) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        custom_domain: row.get(3)?,
        is_active: row.get(4)?,
        audit: audit_at(row, 5)?,
    })
}

const USER_SELECT: &str = "SELECT id, tenant_id, email, display_name, role, is_active, is_deleted, created_at, modified_at, deleted_at FROM users";

fn map_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        role: parse_column(row, 4)?,
        is_active: row.get(5)?,
        audit: audit_at(row, 6)?,
    })
}

const TEMPLATE_SELECT: &str = "SELECT id, tenant_id, name, slug, description, category, price_cents, currency, preview_url, image, is_published, is_deleted, created_at, modified_at, deleted_at FROM templates";

fn map_template(row: &Row) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        description: row.get(4)?,
        category: row.get(5)?,
        price_cents: row.get(6)?,
        currency: row.get(7)?,
        preview_url: row.get(8)?,
        image: row.get(9)?,
        is_published: row.get(10)?,
        audit: audit_at(row, 11)?,
    })
}

pub(crate) const PURCHASE_SELECT: &str = "SELECT id, tenant_id, user_id, template_id, order_id, license_key, price_cents, currency, is_deleted, created_at, modified_at, deleted_at FROM purchases";

pub(crate) fn map_purchase(row: &Row) -> rusqlite::Result<Purchase> {
    Ok(Purchase {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        template_id: row.get(3)?,
        order_id: row.get(4)?,
        license_key: row.get(5)?,
        price_cents: row.get(6)?,
        currency: row.get(7)?,
        audit: audit_at(row, 8)?,
    })
}

fn map_log(row: &Row) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        level: parse_column(row, 1)?,
        source: row.get(2)?,
        message: row.get(3)?,
        job_id: row.get(4)?,
        site_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_template(name: &str, price_cents: i64) -> NewTemplate {
        NewTemplate {
            name: name.to_string(),
            description: "A storefront".to_string(),
            category: "shop".to_string(),
            price_cents,
            currency: "EUR".to_string(),
            preview_url: None,
            image: "ghcr.io/acme/storefront:1.0".to_string(),
        }
    }

    /// Tenant, customer and one published template.
    pub(crate) fn seeded() -> (MarketDb, Tenant, User, Template) {
        let db = MarketDb::new_in_memory().unwrap();
        let tenant = db.create_tenant("Acme", "acme", None).unwrap();
        let user = db
            .create_user(tenant.id, "jo@example.com", "Jo", Role::Customer)
            .unwrap();
        let template = db
            .create_template(tenant.id, &sample_template("Shop Basic", 4900))
            .unwrap();
        let template = db.set_template_published(template.id, true).unwrap();
        (db, tenant, user, template)
    }

    #[test]
    fn test_create_database_and_run_migrations() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let table_count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('tenants', 'templates', 'deployment_jobs', 'logs')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 4);

        // Every table carries the audit columns.
        for table in Table::ALL {
            let sql = format!("SELECT {} FROM {} LIMIT 0", AUDIT_SELECT, table.as_str());
            db.conn.prepare(&sql)?;
        }
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> MarketResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.db");
        {
            let db = MarketDb::new(&path)?;
            db.create_tenant("Acme", "acme", None)?;
        }
        let db = MarketDb::new(&path)?;
        assert_eq!(db.list_tenants()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = now_timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_timestamp();
        assert!(a < b);
        assert!(a.ends_with('Z'));
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn test_create_and_get_tenant() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let tenant = db.create_tenant("Acme", "acme", Some("Shop.Acme.COM"))?;
        assert_eq!(tenant.slug, "acme");
        assert_eq!(tenant.custom_domain.as_deref(), Some("shop.acme.com"));
        assert!(tenant.is_active);
        assert!(!tenant.audit.is_deleted);
        assert!(tenant.audit.modified_at.is_none());

        let by_domain = db.get_tenant_by_domain("shop.acme.com")?.unwrap();
        assert_eq!(by_domain.id, tenant.id);
        Ok(())
    }

    #[test]
    fn test_tenant_slug_must_be_unique_and_valid() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        db.create_tenant("Acme", "acme", None)?;
        assert!(matches!(
            db.create_tenant("Other", "acme", None),
            Err(MarketError::Validation(_))
        ));
        assert!(matches!(
            db.create_tenant("Bad", "Not A Slug", None),
            Err(MarketError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_tenant_custom_domain_must_be_unique() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        db.create_tenant("Acme", "acme", Some("shop.acme.com"))?;
        let err = db
            .create_tenant("Copy", "copy", Some("SHOP.acme.com"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: domain 'shop.acme.com' is taken");
        assert!(matches!(
            db.create_tenant("Bad", "bad", Some("no spaces.com")),
            Err(MarketError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_update_stamps_modified_at() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let tenant = db.create_tenant("Acme", "acme", None)?;
        let updated = db.set_tenant_active(tenant.id, false)?;
        assert!(!updated.is_active);
        assert!(updated.audit.modified_at.is_some());
        assert_eq!(updated.audit.created_at, tenant.audit.created_at);
        Ok(())
    }

    #[test]
    fn test_soft_delete_hides_rows() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let tenant = db.create_tenant("Acme", "acme", None)?;
        assert!(db.soft_delete(Table::Tenants, tenant.id)?);
        assert!(db.get_tenant(tenant.id)?.is_none());
        assert!(db.list_tenants()?.is_empty());
        // Second delete is a no-op.
        assert!(!db.soft_delete(Table::Tenants, tenant.id)?);
        // Row is still physically present with deleted_at set.
        let deleted_at: Option<String> = db.conn.query_row(
            "SELECT deleted_at FROM tenants WHERE id = ?1",
            params![tenant.id],
            |row| row.get(0),
        )?;
        assert!(deleted_at.is_some());
        // Updates skip soft-deleted rows.
        assert!(matches!(
            db.set_tenant_active(tenant.id, true),
            Err(MarketError::TenantNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_soft_deleted_slug_can_be_reused() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let first = db.create_tenant("Acme", "acme", None)?;
        db.soft_delete(Table::Tenants, first.id)?;
        let second = db.create_tenant("Acme again", "acme", None)?;
        assert_ne!(first.id, second.id);
        Ok(())
    }

    #[test]
    fn test_user_email_unique_per_tenant() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let acme = db.create_tenant("Acme", "acme", None)?;
        let globex = db.create_tenant("Globex", "globex", None)?;
        db.create_user(acme.id, "Jo@Example.com", "Jo", Role::Customer)?;
        assert!(matches!(
            db.create_user(acme.id, "jo@example.com", "Jo 2", Role::Customer),
            Err(MarketError::Validation(_))
        ));
        let other = db.create_user(globex.id, "jo@example.com", "Jo", Role::Admin)?;
        assert_eq!(other.email, "jo@example.com");
        assert_eq!(db.list_users(acme.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_require_permission() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let tenant = db.create_tenant("Acme", "acme", None)?;
        let editor = db.create_user(tenant.id, "ed@example.com", "Ed", Role::Editor)?;
        assert!(
            db.require_permission(editor.id, Permission::ManageContent, "edit posts")
                .is_ok()
        );
        let err = db
            .require_permission(editor.id, Permission::ManageDeployments, "deploy")
            .unwrap_err();
        assert!(matches!(err, MarketError::Forbidden { .. }));

        let promoted = db.set_user_role(editor.id, Role::Admin)?;
        assert_eq!(promoted.role, Role::Admin);
        assert!(
            db.require_permission(editor.id, Permission::ManageDeployments, "deploy")
                .is_ok()
        );
        Ok(())
    }

    #[test]
    fn test_template_slugs_are_unique_per_tenant() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let tenant = db.create_tenant("Acme", "acme", None)?;
        let a = db.create_template(tenant.id, &sample_template("Coffee Shop", 100))?;
        let b = db.create_template(tenant.id, &sample_template("Coffee shop!", 100))?;
        assert_eq!(a.slug, "coffee-shop");
        assert_eq!(b.slug, "coffee-shop-2");
        Ok(())
    }

    #[test]
    fn test_template_validation() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        let tenant = db.create_tenant("Acme", "acme", None)?;
        let mut bad = sample_template("Shop", -1);
        assert!(db.create_template(tenant.id, &bad).is_err());
        bad.price_cents = 10;
        bad.currency = "euro".into();
        assert!(db.create_template(tenant.id, &bad).is_err());
        assert!(matches!(
            db.create_template(999, &sample_template("Shop", 10)),
            Err(MarketError::TenantNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_storefront_lists_only_published() -> MarketResult<()> {
        let (db, tenant, _user, published) = seeded();
        db.create_template(tenant.id, &sample_template("Draft", 100))?;
        let storefront = db.list_published_templates(tenant.id)?;
        assert_eq!(storefront.len(), 1);
        assert_eq!(storefront[0].id, published.id);
        assert_eq!(db.list_all_templates(tenant.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_purchase_issues_license_key() -> MarketResult<()> {
        let (db, _tenant, user, template) = seeded();
        let purchase = db.purchase_template(user.id, template.id)?;
        assert_eq!(purchase.price_cents, 4900);
        assert_eq!(purchase.currency, "EUR");
        assert!(purchase.order_id.is_none());
        assert_eq!(purchase.license_key.len(), 29);

        let loose = purchase.license_key.replace('-', "").to_lowercase();
        let found = db.find_purchase_by_key(&loose)?.unwrap();
        assert_eq!(found.id, purchase.id);
        assert!(db.find_purchase_by_key("not-a-key")?.is_none());

        let second = db.purchase_template(user.id, template.id)?;
        assert_ne!(second.license_key, purchase.license_key);
        assert_eq!(db.list_purchases_for_user(user.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_purchase_requires_published_template_in_tenant() -> MarketResult<()> {
        let (db, tenant, user, _template) = seeded();
        let draft = db.create_template(tenant.id, &sample_template("Draft", 100))?;
        assert!(matches!(
            db.purchase_template(user.id, draft.id),
            Err(MarketError::Validation(_))
        ));

        let other = db.create_tenant("Globex", "globex", None)?;
        let foreign = db.create_template(other.id, &sample_template("Foreign", 100))?;
        db.set_template_published(foreign.id, true)?;
        assert!(matches!(
            db.purchase_template(user.id, foreign.id),
            Err(MarketError::TemplateNotFound { .. })
        ));
        assert!(matches!(
            db.purchase_template(999, foreign.id),
            Err(MarketError::UserNotFound { id: 999 })
        ));
        Ok(())
    }

    #[test]
    fn test_logs_newest_first() -> MarketResult<()> {
        let db = MarketDb::new_in_memory()?;
        db.insert_log(LogLevel::Info, "deploy", "first", Some(1), Some(2))?;
        db.insert_log(LogLevel::Error, "deploy", "second", None, None)?;
        let logs = db.list_logs(10)?;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "second");
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[1].job_id, Some(1));
        assert_eq!(db.list_logs(1)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> MarketResult<()> {
        let handle = DbHandle::new(MarketDb::new_in_memory()?);
        let tenant = handle
            .call(|db| db.create_tenant("Acme", "acme", None))
            .await?;
        let fetched = handle.call(move |db| db.get_tenant(tenant.id)).await?;
        assert_eq!(fetched.unwrap().slug, "acme");
        Ok(())
    }
}
