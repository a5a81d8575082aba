//! # Request/Response Services
//!
//! Everything built on top of the bus and the radio service rather than
//! being part of the core connector: node-settings Load/Save, traceroute,
//! notification policy, node-discovery, and the update checker (spec.md §2
//! item 7, §4.8, §4.9).

mod admin_payload;
mod discovery;
mod node_settings;
mod notification;
mod traceroute;
mod update_checker;

pub use admin_payload::SettingsGroup;
pub use discovery::DiscoveryService;
pub use node_settings::{NodeSettingsService, PositionSave};
pub use notification::{Notification, NotificationSink, NotificationService, NullSink};
pub use traceroute::{TracerouteError, TracerouteService};
pub use update_checker::UpdateChecker;
