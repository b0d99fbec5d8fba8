//! Payment acceptance and reconciliation.
//!
//! Purchases start with a gateway-hosted confirmation page and a local
//! pending record; a background loop polls the gateway for settled payments
//! and applies status transitions exactly once, fanning out to registered
//! handlers (subscription activation, notifications).

pub mod activation;
pub mod gateway;
pub mod reconcile;

pub use activation::SubscriptionActivation;
pub use gateway::{Billing, CreatedPayment, GatewayPayment, PaymentGatewayPort, PaymentRequest};
pub use reconcile::{PaymentStatusHandler, Reconciler};
