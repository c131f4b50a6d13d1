//! Outbound human/operator integrations. All three clients are
//! best-effort: a failed notification is logged and never interferes with
//! the exchange pipeline itself.

pub mod audit;
pub mod chat;
pub mod pager;
