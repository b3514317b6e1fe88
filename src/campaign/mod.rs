//! Campaign dispatch: bounded-concurrency runs over a recipient list.

pub mod controller;
pub mod dispatcher;
pub mod model;
mod worker;

pub use controller::CampaignController;
pub use dispatcher::{CampaignRequest, DispatchDeps, Dispatcher};
pub use model::{AbortReason, CampaignEvent, DeliveryOutcome, Recipient};
