//! Map an incoming request host onto a tenant.

use super::db::MarketDb;
use super::models::Tenant;
use crate::errors::MarketResult;

/// Resolves hosts to tenants: custom domain first, then a subdomain of the
/// shared base domain, then the configured default tenant.
#[derive(Debug, Clone, Default)]
pub struct TenantResolver {
    base_domain: Option<String>,
    default_slug: Option<String>,
}

/// Lowercase, trim, strip any `:port` and a trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host,
    };
    host.trim_end_matches('.').to_string()
}

impl TenantResolver {
    pub fn new(base_domain: Option<&str>, default_slug: Option<&str>) -> Self {
        Self {
            base_domain: base_domain
                .map(normalize_host)
                .filter(|d| !d.is_empty()),
            default_slug: default_slug
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    pub fn resolve(&self, db: &MarketDb, host: &str) -> MarketResult<Option<Tenant>> {
        let host = normalize_host(host);

        if !host.is_empty()
            && let Some(tenant) = db.get_tenant_by_domain(&host)?
            && tenant.is_active
        {
            tracing::debug!(host = %host, tenant = %tenant.slug, "resolved by custom domain");
            return Ok(Some(tenant));
        }

        if let Some(label) = self.subdomain_label(&host)
            && let Some(tenant) = db.get_tenant_by_slug(label)?
            && tenant.is_active
        {
            tracing::debug!(host = %host, tenant = %tenant.slug, "resolved by subdomain");
            return Ok(Some(tenant));
        }

        if let Some(slug) = &self.default_slug {
            let tenant = db.get_tenant_by_slug(slug)?.filter(|t| t.is_active);
            if tenant.is_none() {
                tracing::warn!(slug = %slug, "default tenant is missing or inactive");
            }
            return Ok(tenant);
        }
        Ok(None)
    }

    /// `shop` for `shop.<base_domain>`; nested labels do not match.
    fn subdomain_label<'a>(&self, host: &'a str) -> Option<&'a str> {
        let base = self.base_domain.as_deref()?;
        let label = host.strip_suffix(base)?.strip_suffix('.')?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_tenants() -> MarketDb {
        let db = MarketDb::new_in_memory().unwrap();
        db.create_tenant("Acme", "acme", Some("shop.acme.com")).unwrap();
        db.create_tenant("Globex", "globex", None).unwrap();
        db.create_tenant("Main", "main", None).unwrap();
        db
    }

    fn slug(t: Option<Tenant>) -> Option<String> {
        t.map(|t| t.slug)
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("  Shop.Acme.COM:8080 "), "shop.acme.com");
        assert_eq!(normalize_host("acme.example.com."), "acme.example.com");
        assert_eq!(normalize_host("localhost"), "localhost");
        assert_eq!(normalize_host(""), "");
    }

    #[test]
    fn test_custom_domain_wins() -> MarketResult<()> {
        let db = db_with_tenants();
        let resolver = TenantResolver::new(Some("example.com"), Some("main"));
        assert_eq!(
            slug(resolver.resolve(&db, "SHOP.acme.com:443")?).as_deref(),
            Some("acme")
        );
        Ok(())
    }

    #[test]
    fn test_subdomain_of_base_domain() -> MarketResult<()> {
        let db = db_with_tenants();
        let resolver = TenantResolver::new(Some("example.com"), None);
        assert_eq!(
            slug(resolver.resolve(&db, "globex.example.com")?).as_deref(),
            Some("globex")
        );
        assert!(resolver.resolve(&db, "a.globex.example.com")?.is_none());
        assert!(resolver.resolve(&db, "example.com")?.is_none());
        assert!(resolver.resolve(&db, "globexexample.com")?.is_none());
        assert!(resolver.resolve(&db, "unknown.example.com")?.is_none());
        Ok(())
    }

    #[test]
    fn test_falls_back_to_default() -> MarketResult<()> {
        let db = db_with_tenants();
        let resolver = TenantResolver::new(Some("example.com"), Some("main"));
        assert_eq!(
            slug(resolver.resolve(&db, "unknown.example.com")?).as_deref(),
            Some("main")
        );
        assert_eq!(
            slug(resolver.resolve(&db, "elsewhere.org")?).as_deref(),
            Some("main")
        );
        Ok(())
    }

    #[test]
    fn test_inactive_tenants_never_resolve() -> MarketResult<()> {
        let db = db_with_tenants();
        let acme = db.get_tenant_by_slug("acme")?.unwrap();
        db.set_tenant_active(acme.id, false)?;
        let resolver = TenantResolver::new(Some("example.com"), Some("acme"));
        assert!(resolver.resolve(&db, "shop.acme.com")?.is_none());
        assert!(resolver.resolve(&db, "acme.example.com")?.is_none());
        Ok(())
    }

    #[test]
    fn test_deleted_tenants_never_resolve() -> MarketResult<()> {
        let db = db_with_tenants();
        let globex = db.get_tenant_by_slug("globex")?.unwrap();
        db.soft_delete(super::super::db::Table::Tenants, globex.id)?;
        let resolver = TenantResolver::new(Some("example.com"), None);
        assert!(resolver.resolve(&db, "globex.example.com")?.is_none());
        Ok(())
    }
}
