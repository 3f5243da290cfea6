use serde::{Deserialize, Serialize};

/// Declares a string-backed enum with `as_str`, `FromStr` and `Display`
/// matching its snake_case serde representation.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, ::serde::Serialize, ::serde::Deserialize, PartialEq, Eq, Hash)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", $label, s)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }
    };
}

pub(crate) use str_enum;

/// Audit columns shared by every stored entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Audit {
    pub is_deleted: bool,
    pub created_at: String,
    pub modified_at: Option<String>,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub custom_domain: Option<String>,
    pub is_active: bool,
    #[serde(flatten)]
    pub audit: Audit,
}

str_enum!(
    /// Back-office role attached to a user.
    Role, "role" {
        Customer => "customer",
        Editor => "editor",
        Admin => "admin",
    }
);

/// Actions gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ManageCatalog,
    ManageContent,
    ManageDeployments,
    ViewOrders,
}

impl Role {
    pub fn allows(&self, permission: Permission) -> bool {
        match self {
            Self::Admin => true,
            Self::Editor => matches!(
                permission,
                Permission::ManageCatalog | Permission::ManageContent | Permission::ViewOrders
            ),
            Self::Customer => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub tenant_id: i64,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub is_active: bool,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub category: String,
    pub price_cents: i64,
    pub currency: String,
    pub preview_url: Option<String>,
    /// Container image a customer site built from this template runs.
    pub image: String,
    pub is_published: bool,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Input for creating a catalog template.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub description: String,
    pub category: String,
    pub price_cents: i64,
    pub currency: String,
    pub preview_url: Option<String>,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: i64,
    pub template_id: i64,
    pub order_id: Option<i64>,
    pub license_key: String,
    pub price_cents: i64,
    pub currency: String,
    #[serde(flatten)]
    pub audit: Audit,
}

str_enum!(
    OrderStatus, "order status" {
        Pending => "pending",
        Paid => "paid",
        Cancelled => "cancelled",
        Refunded => "refunded",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub template_id: i64,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: i64,
    pub reference: String,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub currency: String,
    pub items: Vec<OrderItem>,
    #[serde(flatten)]
    pub audit: Audit,
}

str_enum!(
    PaymentStatus, "payment status" {
        Succeeded => "succeeded",
        Failed => "failed",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub provider: String,
    pub provider_reference: String,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlogPost {
    pub id: i64,
    pub tenant_id: i64,
    pub author_id: Option<i64>,
    pub title: String,
    pub slug: String,
    pub excerpt: String,
    pub body: String,
    pub published_at: Option<String>,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingSection {
    pub id: i64,
    pub tenant_id: i64,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub position: i64,
    pub is_visible: bool,
    #[serde(flatten)]
    pub audit: Audit,
}

str_enum!(
    ContactStatus, "contact status" {
        New => "new",
        Handled => "handled",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRequest {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
    pub status: ContactStatus,
    #[serde(flatten)]
    pub audit: Audit,
}

str_enum!(
    LogLevel, "log level" {
        Info => "info",
        Warn => "warn",
        Error => "error",
    }
);

/// Audit log entry stored alongside the data it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub job_id: Option<i64>,
    pub site_id: Option<i64>,
    pub created_at: String,
}
