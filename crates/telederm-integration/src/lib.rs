//! # TeleDerm Integration
//!
//! 外部系统集成：托管收银台支付网关的薄适配层，以及核心事件的
//! Webhook对外通知。业务规则不在此层。

pub mod checkout;
pub mod gateway;
pub mod webhook;

pub use checkout::CheckoutClient;
pub use gateway::{MockGateway, PaymentGateway, PaymentSession, SessionLookup, SessionRequest};
pub use webhook::{CoreEvent, EventEmitter, EventPayload, MemoryEmitter, WebhookManager};
