//! # Runtime Facade
//!
//! Wires every subsystem together in the sequential startup order spec.md
//! §4.10 prescribes, and owns the orderly shutdown and config-reapply paths.
//! Nothing outside this module constructs more than one subsystem.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::codec::Codec;
use crate::config::{Config, ConnectorKind};
use crate::persistence::{PersistenceProjection, Repository, WriterQueue};
use crate::radio::RadioService;
use crate::services::{
    DiscoveryService, NodeSettingsService, NotificationService, NullSink, TracerouteService, UpdateChecker,
};
use crate::store::{ChangeListener, ChatStore, NodeStore};
use crate::transport::{ConnectorConfig, SwitchableTransport};

/// Resolved filesystem locations (spec.md §6 "Resolve paths"): config file,
/// SQLite database and log directory, all rooted under the platform's
/// per-user config/data directories via `directories`.
pub struct Paths {
    pub config_file: PathBuf,
    pub database_file: PathBuf,
}

impl Paths {
    pub fn resolve() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("com", "meshdesk", "meshdesk")
            .context("could not resolve a home directory for config/data storage")?;
        let config_dir = dirs.config_dir();
        let data_dir = dirs.data_dir();
        Ok(Self {
            config_file: config_dir.join("config.json"),
            database_file: data_dir.join("meshdesk.sqlite3"),
        })
    }
}

fn connector_config(config: &Config) -> Result<ConnectorConfig> {
    Ok(match config.connection.connector {
        ConnectorKind::Ip => ConnectorConfig::Ip {
            host: config.connection.host.clone().unwrap_or_default(),
            port: None,
        },
        ConnectorKind::Serial => ConnectorConfig::Serial {
            port: config.connection.serial_port.clone().unwrap_or_default(),
            baud: config.connection.serial_baud,
        },
        ConnectorKind::Bluetooth => ConnectorConfig::Bluetooth {
            address: config.connection.bluetooth_address.clone().unwrap_or_default(),
            adapter: config.connection.bluetooth_adapter,
        },
    })
}

/// Everything the running application needs a handle to: stores for the UI
/// layer to read, the radio service to drive sends, and the request/response
/// services. Constructed once by [`Runtime::start`].
pub struct Runtime {
    pub bus: Bus,
    pub node_store: Arc<NodeStore>,
    pub chat_store: Arc<ChatStore>,
    pub radio: Arc<RadioService>,
    pub repository: Arc<Repository>,
    pub node_settings: Arc<NodeSettingsService>,
    pub traceroute: Arc<TracerouteService>,
    pub discovery: Arc<DiscoveryService>,
    pub notifications: Arc<NotificationService>,
    pub config: Config,
    pub config_path: PathBuf,
    /// Fires whenever `node_store` mutates; a UI layer built on this runtime
    /// would poll this to know when to re-render.
    pub node_changes: ChangeListener,
    /// Fires whenever `chat_store` mutates.
    pub chat_changes: ChangeListener,
    cancel: CancellationToken,
}

impl Runtime {
    /// Sequential startup (spec.md §4.10): resolve paths, load config, init
    /// logger, sync autostart (soft-fail), open the database, build the
    /// repositories, construct the stores and load them from the database,
    /// create the bus, start the stores' subscriptions, start the writer
    /// queue and persistence projection, construct the codec and the
    /// switchable transport, start the radio service, start the update
    /// checker.
    pub async fn start(config_path: PathBuf, database_path: PathBuf) -> Result<Self> {
        let config = Config::load_or_default(&config_path)
            .await
            .with_context(|| format!("loading config from {}", config_path.display()))?;
        config.validate().context("validating config")?;

        sync_autostart(&config).unwrap_or_else(|e| {
            warn!("autostart sync failed (non-fatal): {e}");
        });

        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let repository = Arc::new(Repository::open(&database_path).context("opening database")?);

        let (node_store, node_changes) = NodeStore::new();
        let (chat_store, chat_changes) = ChatStore::new();
        let node_store = Arc::new(node_store);
        let chat_store = Arc::new(chat_store);

        let bootstrap = repository.load_bootstrap().context("loading bootstrap from database")?;
        node_store.load_bootstrap(bootstrap.nodes).await;
        chat_store.load_bootstrap(bootstrap.chats, bootstrap.messages).await;
        info!(
            "bootstrap loaded: {} node(s), {} chat(s)",
            node_store.len().await,
            chat_store.chat_list_sorted().await.len()
        );

        let bus = Bus::new();
        let cancel = CancellationToken::new();

        node_store.clone().start(bus.clone(), cancel.clone());
        chat_store.clone().start(bus.clone(), cancel.clone());

        let writer_queue = WriterQueue::start(repository.clone(), cancel.clone());
        PersistenceProjection::new(writer_queue).start(bus.clone(), cancel.clone());

        let codec = Arc::new(Codec::new());
        let transport = Arc::new(SwitchableTransport::new(connector_config(&config)?).context("building transport")?);
        let radio = RadioService::new(transport, codec, bus.clone(), cancel.clone());

        let node_settings = NodeSettingsService::new(bus.clone(), radio.clone());
        let traceroute = TracerouteService::new(bus.clone(), radio.clone(), node_store.clone(), cancel.clone());
        let discovery = DiscoveryService::new(bus.clone(), node_store.clone());
        discovery.clone().start(cancel.clone());

        let notifications = NotificationService::new(
            bus.clone(),
            Arc::new(NullSink),
            config.ui.notifications.events.clone(),
            config.ui.notifications.notify_when_focused,
        );
        notifications.clone().start(cancel.clone());

        UpdateChecker::new(bus.clone(), env!("CARGO_PKG_VERSION"), "https://example.invalid/meshdesk/latest")
            .start(cancel.clone());

        Ok(Self {
            bus,
            node_store,
            chat_store,
            radio,
            repository,
            node_settings,
            traceroute,
            discovery,
            notifications,
            config,
            config_path,
            node_changes,
            chat_changes,
            cancel,
        })
    }

    /// `SaveAndApplyConfig` (spec.md §4.10): validate, preserve UI-only
    /// fields, persist atomically, apply the new transport config, and reset
    /// both stores if the connector *kind* changed (a new connector means a
    /// different mesh, so stale node/chat state must not carry over).
    pub async fn save_and_apply_config(&mut self, mut incoming: Config) -> Result<()> {
        incoming.validate()?;
        let previous = self.config.clone();
        incoming.preserve_ui_only_fields(&previous);
        incoming.save_atomic(&self.config_path).await?;

        let kind_changed = previous.connection.connector != incoming.connection.connector;
        self.radio.apply_transport(connector_config(&incoming)?).await?;
        if kind_changed {
            self.node_store.reset().await;
            self.chat_store.reset().await;
        }
        self.config = incoming;
        Ok(())
    }

    /// Orderly shutdown (spec.md §4.10 `Close`): cancel the root token,
    /// close the bus, close the transport, close the database.
    pub async fn close(self) {
        self.cancel.cancel();
        self.bus.close().await;
        self.radio.close_transport().await;
        drop(self.repository);
    }
}

/// Best-effort autostart-entry sync for the configured platform; soft-fail
/// per spec.md §4.10 (logged as a warning, never aborts startup).
fn sync_autostart(config: &Config) -> Result<()> {
    if !config.ui.autostart.enabled {
        return Ok(());
    }
    // Platform autostart-entry registration is an external collaborator
    // (desktop-environment specific); headless runs only record the intent.
    info!("autostart requested (mode={:?}), entry sync is a desktop-environment integration left to the shell wrapper", config.ui.autostart.mode);
    Ok(())
}
