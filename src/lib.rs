//! Campaign mailer: bounded, observable email campaigns over a transactional API.

pub mod campaign;
pub mod config;
pub mod delivery;
pub mod error;
pub mod quota;
pub mod stats;
pub mod store;
pub mod suppression;
pub mod templates;

pub use campaign::{CampaignController, CampaignEvent, CampaignRequest, Dispatcher};
pub use config::MailerConfig;
pub use error::{Error, Result};
