//! Notification routing and delivery
//!
//! Transitions produced by the evaluator become [`Notification`]s, are
//! matched against the [`RoutingTree`] and handed to the [`Dispatcher`],
//! which delivers them through the configured receivers with retries.

pub mod dispatcher;
pub mod notification;
pub mod receivers;
pub mod router;
pub mod secrets;

pub use dispatcher::{
    DeliveryLog, DispatchHandle, Dispatcher, DispatcherConfig, DispatcherTask, RetryPolicy, Target,
};
pub use notification::{
    AlertSnapshot, DeliveryRecord, DeliveryStatus, Notification, NotificationKind,
};
pub use receivers::{build_receiver, DeliveryOutcome, Receiver, ReceiverKind, ReceiverSpec};
pub use router::{Route, RoutingTree};
pub use secrets::{EnvSecretStore, SecretStore, StaticSecretStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Receiver '{receiver}' references unknown secret '{secret}'")]
    MissingSecret { receiver: String, secret: String },

    #[error("Receiver '{receiver}' has invalid address '{address}'")]
    InvalidAddress { receiver: String, address: String },

    #[error("Invalid receiver configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP setup error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}
