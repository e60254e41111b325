// Workflow Triggers - Domain events that can start workflows

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event-type strings fired by the ledger, billing and customer modules
pub mod event_types {
    pub const INVOICE_CREATED: &str = "invoice.created";
    pub const INVOICE_UPDATED: &str = "invoice.updated";
    pub const INVOICE_PAID: &str = "invoice.paid";
    pub const INVOICE_OVERDUE: &str = "invoice.overdue";
    pub const BILL_CREATED: &str = "bill.created";
    pub const BILL_APPROVED: &str = "bill.approved";
    pub const BILL_PAID: &str = "bill.paid";
    pub const PAYMENT_RECEIVED: &str = "payment.received";
    pub const PAYMENT_MADE: &str = "payment.made";
    pub const CUSTOMER_CREATED: &str = "customer.created";
    pub const CUSTOMER_UPDATED: &str = "customer.updated";
    pub const VENDOR_CREATED: &str = "vendor.created";
    pub const TRANSACTION_POSTED: &str = "transaction.posted";
    pub const USER_LOGIN: &str = "user.login";
    pub const USER_FAILED_LOGIN: &str = "user.failed_login";

    pub const ALL: &[&str] = &[
        INVOICE_CREATED,
        INVOICE_UPDATED,
        INVOICE_PAID,
        INVOICE_OVERDUE,
        BILL_CREATED,
        BILL_APPROVED,
        BILL_PAID,
        PAYMENT_RECEIVED,
        PAYMENT_MADE,
        CUSTOMER_CREATED,
        CUSTOMER_UPDATED,
        VENDOR_CREATED,
        TRANSACTION_POSTED,
        USER_LOGIN,
        USER_FAILED_LOGIN,
    ];

    pub fn is_known(event_type: &str) -> bool {
        ALL.contains(&event_type)
    }
}

/// Payload for trigger events
pub type EventPayload = serde_json::Value;

/// A domain event handed to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_type: String,
    pub payload: EventPayload,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
}

/// Who fired the event. A user source is recorded as the acting user of the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EventSource {
    System,
    User(Uuid),
    Api,
    Scheduler,
}

impl EventSource {
    pub fn acting_user(&self) -> Option<Uuid> {
        match self {
            Self::User(id) => Some(*id),
            _ => None,
        }
    }
}

impl TriggerEvent {
    pub fn new(event_type: &str, payload: EventPayload, source: EventSource) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn invoice_created(
        invoice_id: Uuid,
        invoice_number: &str,
        customer_id: Uuid,
        total_amount: Decimal,
        created_by: Uuid,
    ) -> Self {
        Self::new(
            event_types::INVOICE_CREATED,
            serde_json::json!({
                "invoice_id": invoice_id,
                "invoice_number": invoice_number,
                "customer_id": customer_id,
                "total_amount": total_amount.to_string()
            }),
            EventSource::User(created_by),
        )
    }

    pub fn invoice_overdue(
        invoice_id: Uuid,
        invoice_number: &str,
        customer_id: Uuid,
        balance_due: Decimal,
        days_overdue: i64,
    ) -> Self {
        Self::new(
            event_types::INVOICE_OVERDUE,
            serde_json::json!({
                "invoice_id": invoice_id,
                "invoice_number": invoice_number,
                "customer_id": customer_id,
                "balance_due": balance_due.to_string(),
                "days_overdue": days_overdue
            }),
            EventSource::Scheduler,
        )
    }

    pub fn bill_approved(
        bill_id: Uuid,
        vendor_id: Uuid,
        amount: Decimal,
        payment_terms: &str,
        approved_by: Uuid,
    ) -> Self {
        Self::new(
            event_types::BILL_APPROVED,
            serde_json::json!({
                "bill_id": bill_id,
                "vendor_id": vendor_id,
                "amount": amount.to_string(),
                "payment_terms": payment_terms
            }),
            EventSource::User(approved_by),
        )
    }

    pub fn transaction_posted(
        transaction_id: Uuid,
        account_code: &str,
        amount: Decimal,
        budget_exceeded: bool,
        posted_by: Uuid,
    ) -> Self {
        Self::new(
            event_types::TRANSACTION_POSTED,
            serde_json::json!({
                "transaction_id": transaction_id,
                "account_code": account_code,
                "amount": amount.to_string(),
                "budget_exceeded": budget_exceeded
            }),
            EventSource::User(posted_by),
        )
    }

    pub fn customer_created(customer_id: Uuid, customer_name: &str, email: &str, created_by: Uuid) -> Self {
        Self::new(
            event_types::CUSTOMER_CREATED,
            serde_json::json!({
                "customer_id": customer_id,
                "customer_name": customer_name,
                "email": email
            }),
            EventSource::User(created_by),
        )
    }
}
