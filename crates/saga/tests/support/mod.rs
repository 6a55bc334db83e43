//! In-memory services and an order fulfillment saga shared by the saga tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::HandlerError;
use record::{PayloadType, RetryPolicy};
use saga::{Compensation, Process, SagaDefinition};
use serde::{Deserialize, Serialize};

/// Ordered log of every service call, shared across services.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

// ============================================================================
// Inventory
// ============================================================================

#[derive(Debug, Default)]
struct InventoryState {
    reservations: HashMap<String, String>,
    next_id: u32,
    fail_on_reserve: bool,
}

/// In-memory inventory service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<Mutex<InventoryState>>,
    journal: Journal,
}

impl InMemoryInventoryService {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.lock().fail_on_reserve = fail;
    }

    pub fn reservation_count(&self) -> usize {
        self.lock().reservations.len()
    }

    pub fn reserve(&self, order_id: &str) -> Result<String, String> {
        self.journal.record("reserve");
        let mut state = self.lock();
        if state.fail_on_reserve {
            return Err("Insufficient stock".to_string());
        }
        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), order_id.to_string());
        Ok(reservation_id)
    }

    pub fn release(&self, reservation_id: &str) {
        self.journal.record("release");
        self.lock().reservations.remove(reservation_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InventoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Payment
// ============================================================================

#[derive(Debug, Default)]
struct PaymentState {
    payments: HashMap<String, i64>,
    next_id: u32,
    failing_charges: u32,
    fail_on_refund: bool,
}

/// In-memory payment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<Mutex<PaymentState>>,
    journal: Journal,
}

impl InMemoryPaymentService {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    /// Makes the next `count` charge calls fail.
    pub fn fail_next_charges(&self, count: u32) {
        self.lock().failing_charges = count;
    }

    pub fn set_fail_on_refund(&self, fail: bool) {
        self.lock().fail_on_refund = fail;
    }

    pub fn payment_count(&self) -> usize {
        self.lock().payments.len()
    }

    pub fn charge(&self, amount_cents: i64) -> Result<String, String> {
        self.journal.record("charge");
        let mut state = self.lock();
        if state.failing_charges > 0 {
            state.failing_charges -= 1;
            return Err("Payment declined".to_string());
        }
        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(payment_id.clone(), amount_cents);
        Ok(payment_id)
    }

    pub fn refund(&self, payment_id: Option<&str>) -> Result<(), String> {
        self.journal.record("refund");
        let mut state = self.lock();
        if state.fail_on_refund {
            return Err("Refund gateway unavailable".to_string());
        }
        if let Some(payment_id) = payment_id {
            state.payments.remove(payment_id);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaymentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Shipping
// ============================================================================

/// In-memory shipping service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    shipments: Arc<Mutex<Vec<String>>>,
    journal: Journal,
}

impl InMemoryShippingService {
    pub fn new(journal: Journal) -> Self {
        Self {
            shipments: Arc::default(),
            journal,
        }
    }

    pub fn shipment_count(&self) -> usize {
        self.shipments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn ship(&self, reservation_id: Option<&str>) -> Result<String, String> {
        self.journal.record("ship");
        let reservation_id = reservation_id.ok_or("nothing reserved to ship")?;
        let mut shipments = self.shipments.lock().unwrap_or_else(PoisonError::into_inner);
        let tracking = format!("TRK-{reservation_id}");
        shipments.push(tracking.clone());
        Ok(tracking)
    }
}

// ============================================================================
// Order fulfillment saga
// ============================================================================

pub const STEP_RESERVE: i32 = 100;
pub const STEP_CHARGE: i32 = 110;
pub const STEP_SHIP: i32 = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderContext {
    pub order_id: String,
    pub amount_cents: i64,
    pub reservation_id: Option<String>,
    pub payment_id: Option<String>,
    pub tracking_number: Option<String>,
}

impl OrderContext {
    pub fn new(order_id: &str, amount_cents: i64) -> Self {
        Self {
            order_id: order_id.to_string(),
            amount_cents,
            reservation_id: None,
            payment_id: None,
            tracking_number: None,
        }
    }
}

impl PayloadType for OrderContext {
    const TYPE_TAG: &'static str = "order_context";
}

/// Reserve inventory, charge the customer, ship. Shipping has no rollback.
#[derive(Debug, Clone)]
pub struct OrderFulfillment {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub shipping: InMemoryShippingService,
    pub retry_times: u32,
}

impl OrderFulfillment {
    pub fn new(journal: &Journal, retry_times: u32) -> Self {
        Self {
            inventory: InMemoryInventoryService::new(journal.clone()),
            payment: InMemoryPaymentService::new(journal.clone()),
            shipping: InMemoryShippingService::new(journal.clone()),
            retry_times,
        }
    }
}

impl SagaDefinition for OrderFulfillment {
    type Context = OrderContext;
    const SAGA_TYPE: &'static str = "order_fulfillment";

    fn process(&self) -> Process<OrderContext> {
        let inventory = self.inventory.clone();
        let reserve = move |mut ctx: OrderContext| {
            let inventory = inventory.clone();
            async move {
                ctx.reservation_id = Some(inventory.reserve(&ctx.order_id)?);
                Ok::<_, HandlerError>(ctx)
            }
        };
        let inventory = self.inventory.clone();
        let release = move |c: Compensation<OrderContext>| {
            let inventory = inventory.clone();
            async move {
                if let Some(id) = c.output.and_then(|o| o.reservation_id) {
                    inventory.release(&id);
                }
                Ok::<_, HandlerError>(true)
            }
        };

        let payment = self.payment.clone();
        let charge = move |mut ctx: OrderContext| {
            let payment = payment.clone();
            async move {
                ctx.payment_id = Some(payment.charge(ctx.amount_cents)?);
                Ok::<_, HandlerError>(ctx)
            }
        };
        let payment = self.payment.clone();
        let refund = move |c: Compensation<OrderContext>| {
            let payment = payment.clone();
            async move {
                let payment_id = c.output.and_then(|o| o.payment_id);
                payment.refund(payment_id.as_deref())?;
                Ok::<_, HandlerError>(true)
            }
        };

        let shipping = self.shipping.clone();
        let ship = move |mut ctx: OrderContext| {
            let shipping = shipping.clone();
            async move {
                ctx.tracking_number = Some(shipping.ship(ctx.reservation_id.as_deref())?);
                Ok::<_, HandlerError>(ctx)
            }
        };

        Process::of(STEP_RESERVE, "reserve", reserve)
            .with_rollback(release)
            .then(Process::of(STEP_CHARGE, "charge", charge).with_rollback(refund))
            .then(Process::of(STEP_SHIP, "ship", ship))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_times, chrono::Duration::days(1))
    }
}
