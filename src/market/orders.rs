//! Orders, payments and the purchases a paid order issues.

use rusqlite::{Row, params};

use super::db::{DbContext, MarketDb, PURCHASE_SELECT, Table, audit_at, map_purchase, parse_column};
use super::models::*;
use crate::errors::{MarketError, MarketResult};

/// Upper bound on units per line; each unit becomes a purchase when paid.
pub const MAX_LINE_QUANTITY: i64 = 100;

/// One requested line of an order.
#[derive(Debug, Clone, Copy)]
pub struct LineRequest {
    pub template_id: i64,
    pub quantity: i64,
}

const ORDER_SELECT: &str = "SELECT id, tenant_id, user_id, reference, status, total_cents, currency, is_deleted, created_at, modified_at, deleted_at FROM orders";

fn map_order(row: &Row) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        reference: row.get(3)?,
        status: parse_column(row, 4)?,
        total_cents: row.get(5)?,
        currency: row.get(6)?,
        items: Vec::new(),
        audit: audit_at(row, 7)?,
    })
}

fn map_item(row: &Row) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        template_id: row.get(2)?,
        quantity: row.get(3)?,
        unit_price_cents: row.get(4)?,
    })
}

const PAYMENT_SELECT: &str = "SELECT id, order_id, provider, provider_reference, amount_cents, status, is_deleted, created_at, modified_at, deleted_at FROM payments";

fn map_payment(row: &Row) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        order_id: row.get(1)?,
        provider: row.get(2)?,
        provider_reference: row.get(3)?,
        amount_cents: row.get(4)?,
        status: parse_column(row, 5)?,
        audit: audit_at(row, 6)?,
    })
}

/// Sum of `quantity * unit price` over priced lines, failing on overflow.
pub fn order_total(lines: &[(i64, i64)]) -> MarketResult<i64> {
    lines.iter().try_fold(0i64, |acc, (qty, unit)| {
        qty.checked_mul(*unit)
            .and_then(|line| acc.checked_add(line))
            .ok_or_else(|| MarketError::Validation("order total overflows".into()))
    })
}

impl MarketDb {
    /// Create a pending order, snapshotting unit prices from the catalog.
    pub fn place_order(&self, user_id: i64, lines: &[LineRequest]) -> MarketResult<Order> {
        if lines.is_empty() {
            return Err(MarketError::Validation("order has no items".into()));
        }
        let user = self
            .get_user(user_id)?
            .ok_or(MarketError::UserNotFound { id: user_id })?;

        let mut priced = Vec::with_capacity(lines.len());
        let mut currency: Option<String> = None;
        for line in lines {
            if !(1..=MAX_LINE_QUANTITY).contains(&line.quantity) {
                return Err(MarketError::Validation(format!(
                    "quantity for template {} must be between 1 and {}",
                    line.template_id, MAX_LINE_QUANTITY
                )));
            }
            let template = self.purchasable_template(line.template_id, user.tenant_id)?;
            match &currency {
                Some(c) if *c != template.currency => {
                    return Err(MarketError::Validation(
                        "all items in an order must share one currency".into(),
                    ));
                }
                Some(_) => {}
                None => currency = Some(template.currency.clone()),
            }
            priced.push((template.id, line.quantity, template.price_cents));
        }
        let total = order_total(
            &priced
                .iter()
                .map(|(_, qty, unit)| (*qty, *unit))
                .collect::<Vec<_>>(),
        )?;
        let currency = currency.unwrap_or_default();
        let reference = uuid::Uuid::new_v4().to_string();

        let tx = self
            .conn()
            .unchecked_transaction()
            .db_context("Failed to begin order")?;
        let order_id = self.insert_row(
            Table::Orders,
            &["tenant_id", "user_id", "reference", "status", "total_cents", "currency"],
            &[
                &user.tenant_id,
                &user.id,
                &reference,
                &OrderStatus::Pending.as_str(),
                &total,
                &currency,
            ],
        )?;
        for (template_id, quantity, unit) in &priced {
            self.insert_row(
                Table::OrderItems,
                &["order_id", "template_id", "quantity", "unit_price_cents"],
                &[&order_id, template_id, quantity, unit],
            )?;
        }
        tx.commit().db_context("Failed to commit order")?;

        self.get_order(order_id)?
            .ok_or(MarketError::OrderNotFound { id: order_id })
    }

    pub fn get_order(&self, id: i64) -> MarketResult<Option<Order>> {
        let Some(mut order) = self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", ORDER_SELECT),
            params![id],
            map_order,
        )?
        else {
            return Ok(None);
        };
        order.items = self.query_all(
            "SELECT id, order_id, template_id, quantity, unit_price_cents
             FROM order_items WHERE order_id = ?1 AND is_deleted = 0 ORDER BY id",
            params![id],
            map_item,
        )?;
        Ok(Some(order))
    }

    pub fn list_orders_for_user(&self, user_id: i64) -> MarketResult<Vec<Order>> {
        let ids: Vec<i64> = self.query_all(
            "SELECT id FROM orders WHERE user_id = ?1 AND is_deleted = 0 ORDER BY id DESC",
            params![user_id],
            |row| row.get(0),
        )?;
        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(order) = self.get_order(id)? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    fn require_order(&self, id: i64) -> MarketResult<Order> {
        self.get_order(id)?.ok_or(MarketError::OrderNotFound { id })
    }

    fn set_order_status(&self, id: i64, status: OrderStatus) -> MarketResult<()> {
        if !self.update_row(Table::Orders, id, &[("status", &status.as_str())])? {
            return Err(MarketError::OrderNotFound { id });
        }
        Ok(())
    }

    /// Record a payment attempt against a pending order.
    ///
    /// A successful payment must cover the total exactly; it marks the order
    /// paid and issues one purchase per unit ordered, atomically. Failed
    /// attempts are stored and leave the order pending.
    pub fn record_payment(
        &self,
        order_id: i64,
        provider: &str,
        provider_reference: &str,
        amount_cents: i64,
        succeeded: bool,
    ) -> MarketResult<Payment> {
        let order = self.require_order(order_id)?;
        if order.status != OrderStatus::Pending {
            return Err(MarketError::InvalidTransition {
                entity: "order",
                state: order.status.as_str().to_string(),
                action: "pay",
            });
        }
        if succeeded && amount_cents != order.total_cents {
            return Err(MarketError::Validation(format!(
                "payment of {} does not match order total {}",
                amount_cents, order.total_cents
            )));
        }
        let status = if succeeded {
            PaymentStatus::Succeeded
        } else {
            PaymentStatus::Failed
        };

        let tx = self
            .conn()
            .unchecked_transaction()
            .db_context("Failed to begin payment")?;
        let payment_id = self.insert_row(
            Table::Payments,
            &["order_id", "provider", "provider_reference", "amount_cents", "status"],
            &[
                &order_id,
                &provider,
                &provider_reference,
                &amount_cents,
                &status.as_str(),
            ],
        )?;
        if succeeded {
            let user = self
                .get_user(order.user_id)?
                .ok_or(MarketError::UserNotFound { id: order.user_id })?;
            for item in &order.items {
                let template = self
                    .get_template(item.template_id)?
                    .ok_or(MarketError::TemplateNotFound {
                        id: item.template_id,
                    })?;
                for _ in 0..item.quantity {
                    self.insert_purchase(&user, &template, Some(order.id), item.unit_price_cents)?;
                }
            }
            self.set_order_status(order.id, OrderStatus::Paid)?;
        }
        tx.commit().db_context("Failed to commit payment")?;

        self.query_opt(
            &format!("{} WHERE id = ?1", PAYMENT_SELECT),
            params![payment_id],
            map_payment,
        )?
        .ok_or_else(|| MarketError::Other(anyhow::anyhow!("payment {} vanished", payment_id)))
    }

    pub fn list_payments(&self, order_id: i64) -> MarketResult<Vec<Payment>> {
        self.query_all(
            &format!(
                "{} WHERE order_id = ?1 AND is_deleted = 0 ORDER BY id",
                PAYMENT_SELECT
            ),
            params![order_id],
            map_payment,
        )
    }

    pub fn list_order_purchases(&self, order_id: i64) -> MarketResult<Vec<Purchase>> {
        self.query_all(
            &format!(
                "{} WHERE order_id = ?1 AND is_deleted = 0 ORDER BY id",
                PURCHASE_SELECT
            ),
            params![order_id],
            map_purchase,
        )
    }

    pub fn cancel_order(&self, id: i64) -> MarketResult<Order> {
        let order = self.require_order(id)?;
        if order.status != OrderStatus::Pending {
            return Err(MarketError::InvalidTransition {
                entity: "order",
                state: order.status.as_str().to_string(),
                action: "cancel",
            });
        }
        self.set_order_status(id, OrderStatus::Cancelled)?;
        self.require_order(id)
    }

    /// Refund a paid order; its purchases are soft-deleted with it.
    pub fn refund_order(&self, id: i64) -> MarketResult<Order> {
        let order = self.require_order(id)?;
        if order.status != OrderStatus::Paid {
            return Err(MarketError::InvalidTransition {
                entity: "order",
                state: order.status.as_str().to_string(),
                action: "refund",
            });
        }
        let tx = self
            .conn()
            .unchecked_transaction()
            .db_context("Failed to begin refund")?;
        for purchase in self.list_order_purchases(id)? {
            self.soft_delete(Table::Purchases, purchase.id)?;
        }
        self.set_order_status(id, OrderStatus::Refunded)?;
        tx.commit().db_context("Failed to commit refund")?;
        self.require_order(id)
    }
}
