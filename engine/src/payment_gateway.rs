//! Payment gateway abstraction and an in-memory mock.
//!
//! The engine only needs one call from a crypto-payment provider: create an
//! invoice (pay address + gateway id) for an amount. Settlement notifications
//! arrive separately and are modelled by
//! [`SettlementEvent`](crate::aggregates::intent::SettlementEvent).

use crate::types::{Currency, IntentId, Money};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentGatewayError {
    /// Request timed out
    Timeout,
    /// Provider unreachable or returned a server error
    Unavailable {
        /// Provider message
        message: String,
    },
    /// Provider does not settle in this currency
    UnsupportedCurrency {
        /// Currency requested
        currency: Currency,
    },
    /// Amount below the provider's minimum for the currency
    BelowMinimum {
        /// Provider minimum
        minimum: Money,
    },
    /// Request refused for another reason
    Rejected {
        /// Provider message
        reason: String,
    },
}

impl PaymentGatewayError {
    /// Timeouts and outages are worth retrying; everything else is final
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable { .. })
    }
}

impl std::fmt::Display for PaymentGatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Gateway timeout"),
            Self::Unavailable { message } => write!(f, "Gateway unavailable: {message}"),
            Self::UnsupportedCurrency { currency } => write!(f, "Unsupported currency: {currency}"),
            Self::BelowMinimum { minimum } => write!(f, "Amount below gateway minimum {minimum}"),
            Self::Rejected { reason } => write!(f, "Invoice rejected: {reason}"),
        }
    }
}

impl std::error::Error for PaymentGatewayError {}

/// Invoice request
#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    /// Our reference (basket id or refill reference)
    pub order_ref: String,
    /// Amount to collect
    pub amount: Money,
    /// Settlement currency
    pub currency: Currency,
    /// Human-readable description
    pub description: String,
}

/// Invoice issued by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// Gateway-assigned id; becomes the intent id
    pub intent_id: IntentId,
    /// Address the customer pays to
    pub pay_address: String,
    /// Amount quoted
    pub amount: Money,
    /// Currency quoted
    pub currency: Currency,
}

/// Payment gateway trait
///
/// Implementations perform network I/O; callers must not hold any engine lock
/// while awaiting them.
pub trait PaymentGateway: Send + Sync {
    /// Create an invoice for `request`
    ///
    /// # Errors
    ///
    /// Returns error if the provider refuses or cannot be reached
    fn create_invoice(
        &self,
        request: InvoiceRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Invoice>> + Send>>;
}

/// Mock payment gateway
///
/// Issues invoices locally. Per-currency minimums, a supported-currency list,
/// artificial latency and scripted failures make the error paths testable.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    minimums: HashMap<Currency, Money>,
    supported: Option<HashSet<Currency>>,
    latency: Duration,
    scripted_failures: Mutex<VecDeque<PaymentGatewayError>>,
    scripted_ids: Mutex<VecDeque<IntentId>>,
    calls: AtomicUsize,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped default instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Reject amounts below `minimum` in `currency`
    #[must_use]
    pub fn with_minimum(mut self, currency: Currency, minimum: Money) -> Self {
        self.minimums.insert(currency, minimum);
        self
    }

    /// Only accept the listed currencies
    #[must_use]
    pub fn with_currencies(mut self, currencies: impl IntoIterator<Item = Currency>) -> Self {
        self.supported = Some(currencies.into_iter().collect());
        self
    }

    /// Simulated network delay per call
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next call with `error` (queued, one per call)
    pub fn fail_next(&self, error: PaymentGatewayError) {
        self.scripted_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Issue `id` on the next successful call instead of a fresh one
    pub fn issue_id_next(&self, id: IntentId) {
        self.scripted_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(id);
    }

    /// Number of `create_invoice` calls made so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn decide(&self, request: &InvoiceRequest) -> GatewayResult<Invoice> {
        if let Some(error) = self
            .scripted_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(error);
        }

        if let Some(supported) = &self.supported {
            if !supported.contains(&request.currency) {
                return Err(PaymentGatewayError::UnsupportedCurrency {
                    currency: request.currency.clone(),
                });
            }
        }

        if let Some(minimum) = self.minimums.get(&request.currency) {
            if request.amount < *minimum {
                return Err(PaymentGatewayError::BelowMinimum { minimum: *minimum });
            }
        }

        let intent_id = self
            .scripted_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| IntentId::new(format!("np_{}", uuid::Uuid::new_v4().simple())));
        let mut rng = rand::thread_rng();
        Ok(Invoice {
            intent_id,
            pay_address: format!("{:016x}{:016x}", rng.r#gen::<u64>(), rng.r#gen::<u64>()),
            amount: request.amount,
            currency: request.currency.clone(),
        })
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_invoice(
        &self,
        request: InvoiceRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Invoice>> + Send>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.decide(&request);
        let latency = self.latency;

        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            match &outcome {
                Ok(invoice) => tracing::info!(
                    intent_id = %invoice.intent_id,
                    order_ref = %request.order_ref,
                    amount = invoice.amount.cents(),
                    currency = %invoice.currency,
                    "Mock invoice issued"
                ),
                Err(error) => tracing::warn!(
                    order_ref = %request.order_ref,
                    error = %error,
                    "Mock invoice refused"
                ),
            }

            outcome
        })
    }
}
