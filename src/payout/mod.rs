// Two-phase settlement: stablecoin redemption, then fiat payout
pub mod client;
pub mod reference;

pub use client::PayoutClient;
pub use reference::{sanitize_reference, SettlementReferences};
