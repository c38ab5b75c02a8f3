//! Domain types shared by the registry, monitor and delivery pipeline.

pub mod content;
pub mod delivery;
pub mod identity;
pub mod preferences;

pub use content::{ContentItem, ContentKind, Cursor};
pub use delivery::{DeliveryState, FailureReason};
pub use identity::{RecipientId, SourceId};
pub use preferences::{BindingPreferences, NotificationCadence};
