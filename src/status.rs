use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Order lifecycle states. Stored as lowercase strings.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Cancellation is allowed from any state except shipped, delivered and
    /// cancelled itself.
    pub fn cancellable(self) -> bool {
        !matches!(
            self,
            OrderStatus::Shipped | OrderStatus::Delivered | OrderStatus::Cancelled
        )
    }

    /// Orders can only be deleted before they enter fulfillment.
    pub fn deletable(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Cancelled)
    }

    /// Line items may only be edited while the order is pending.
    pub fn items_mutable(self) -> bool {
        matches!(self, OrderStatus::Pending)
    }
}

/// Payment states. Stored as lowercase strings.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "success" => Some(PaymentStatus::Success),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    /// Only payments that never captured funds can be deleted.
    pub fn deletable(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Failed)
    }

    pub fn refundable(self) -> bool {
        matches!(self, PaymentStatus::Success)
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "cod")]
    Cod,
    #[sea_orm(string_value = "paypal")]
    Paypal,
    #[sea_orm(string_value = "other")]
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Cod => "cod",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Other => "other",
        }
    }

    /// Cash-on-delivery orders carry a locally tracked payment record whose
    /// status follows the order's progress.
    pub fn is_cod(self) -> bool {
        matches!(self, PaymentMethod::Cod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_through_parse() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("completed"), None);
    }

    #[test]
    fn cancellation_is_blocked_once_fulfillment_starts() {
        assert!(OrderStatus::Pending.cancellable());
        assert!(OrderStatus::Paid.cancellable());
        assert!(!OrderStatus::Shipped.cancellable());
        assert!(!OrderStatus::Delivered.cancellable());
        assert!(!OrderStatus::Cancelled.cancellable());
    }

    #[test]
    fn only_pending_and_cancelled_orders_are_deletable() {
        assert!(OrderStatus::Pending.deletable());
        assert!(OrderStatus::Cancelled.deletable());
        assert!(!OrderStatus::Paid.deletable());
        assert!(!OrderStatus::Shipped.deletable());
        assert!(!OrderStatus::Delivered.deletable());
    }

    #[test]
    fn item_edits_require_a_pending_order() {
        assert!(OrderStatus::Pending.items_mutable());
        assert!(!OrderStatus::Paid.items_mutable());
        assert!(!OrderStatus::Cancelled.items_mutable());
    }

    #[test]
    fn payment_deletion_and_refund_rules() {
        assert!(PaymentStatus::Pending.deletable());
        assert!(PaymentStatus::Failed.deletable());
        assert!(!PaymentStatus::Success.deletable());
        assert!(!PaymentStatus::Refunded.deletable());

        assert!(PaymentStatus::Success.refundable());
        assert!(!PaymentStatus::Pending.refundable());
        assert!(!PaymentStatus::Failed.refundable());
        assert!(!PaymentStatus::Refunded.refundable());
    }
}
