//! Chat core: metered message store, pricing and the event coordinator.

pub mod coordinator;
pub mod error;
pub mod locks;
pub mod pricing;
pub mod store;
pub mod users;
pub mod views;

pub use coordinator::{Coordinator, EventStage, PullRequest, SpeakingPhase};
pub use error::{ChatError, Result};
pub use pricing::{PricingCalculator, TierRates};
pub use store::{BillingIdentity, Charge, LockedMessage, MessageStore, NewMessage, PricedTranslations};
pub use users::UserDirectory;
pub use views::message_view;
