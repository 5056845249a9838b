//! Service layer for Crosscast
//!
//! `CrosscastService` is the single entry point used by the daemon (and by an
//! HTTP layer, should one be added). It owns the shared resources and wires
//! the sub-services together:
//!
//! - [`dispatcher::PublishDispatcher`]: fan-out of a post to its targets
//! - [`posting::PostService`]: create, edit, dispatch and retry posts
//! - [`connect::ConnectService`]: OAuth connect flow
//! - [`refresh::TokenRefresher`]: credential refresh scans
//! - [`reconcile::StatusReconciler`]: aggregate post status upkeep
//! - [`events::EventBus`]: progress event distribution
//!
//! # Example
//!
//! ```no_run
//! use libcrosscast::platforms::ConnectorRegistry;
//! use libcrosscast::service::CrosscastService;
//!
//! # async fn example() -> libcrosscast::Result<()> {
//! let mut service = CrosscastService::new(ConnectorRegistry::new()).await?;
//! let pool = service.start_workers()?;
//!
//! let dispatched = service
//!     .posts()
//!     .dispatch_due_posts(chrono::Utc::now().timestamp())
//!     .await?;
//! println!("Dispatched {} posts", dispatched);
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod connect;
pub mod dispatcher;
pub mod events;
pub mod posting;
pub mod reconcile;
pub mod refresh;

pub use events::TargetResult;

use std::sync::Arc;

use self::connect::ConnectService;
use self::dispatcher::PublishDispatcher;
use self::events::EventBus;
use self::posting::PostService;
use self::reconcile::StatusReconciler;
use self::refresh::TokenRefresher;
use crate::config::Config;
use crate::db::Database;
use crate::error::{ConfigError, DomainError, Result};
use crate::platforms::ConnectorRegistry;
use crate::queue::scheduler::RefreshScheduler;
use crate::queue::worker::{WorkerConfig, WorkerContext, WorkerPool};
use crate::queue::{JobQueue, QueueReceivers};

const EVENT_BUS_CAPACITY: usize = 100;

/// Main service facade
///
/// All sub-services share the same `Arc<Database>`, connector registry and
/// event bus.
pub struct CrosscastService {
    db: Arc<Database>,
    config: Arc<Config>,
    event_bus: EventBus,
    posts: PostService,
    connect: ConnectService,
    refresher: Arc<TokenRefresher>,
    reconciler: Arc<StatusReconciler>,
    queue: Arc<JobQueue>,
    receivers: Option<QueueReceivers>,
}

impl CrosscastService {
    /// Create a service from the configuration file at the default location
    pub async fn new(registry: ConnectorRegistry) -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config, registry).await
    }

    /// Open the configured database and build every sub-service
    pub async fn from_config(config: Config, registry: ConnectorRegistry) -> Result<Self> {
        let db_path = crate::config::resolve_db_path(&config.database.path);
        let db_path_str = db_path.to_str().ok_or_else(|| ConfigError::InvalidValue {
            field: "database.path".to_string(),
            reason: "path is not valid UTF-8".to_string(),
        })?;
        let db = Database::new(db_path_str).await?;

        Self::with_database(Arc::new(db), config, registry)
    }

    /// Build the service around an already opened database
    pub fn with_database(
        db: Arc<Database>,
        config: Config,
        registry: ConnectorRegistry,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);

        let reconciler = Arc::new(StatusReconciler::new(db.clone()));
        let dispatcher = PublishDispatcher::new(
            db.clone(),
            registry.clone(),
            event_bus.clone(),
            reconciler.clone(),
        );

        let (queue, receivers) = JobQueue::new(&registry.platforms(), &config.queue);
        let queue = Arc::new(queue);

        // Inline until workers are started
        let posts = PostService::new(db.clone(), dispatcher, None, config.limits.clone());

        let states = crate::oauth_state::from_config(&config.oauth_state)?;
        let connect = ConnectService::new(states, registry.clone(), db.clone());

        let refresher = Arc::new(TokenRefresher::new(
            db.clone(),
            registry,
            event_bus.clone(),
            config.refresh.lookahead,
        ));

        Ok(Self {
            db,
            config,
            event_bus,
            posts,
            connect,
            refresher,
            reconciler,
            queue,
            receivers: Some(receivers),
        })
    }

    /// Start the worker pool and the refresh scheduler. May be called once.
    ///
    /// Until then every dispatch publishes inline.
    pub fn start_workers(&mut self) -> Result<WorkerPool> {
        let receivers = self.receivers.take().ok_or_else(|| {
            DomainError::Conflict("Workers have already been started".to_string())
        })?;

        let context = WorkerContext {
            dispatcher: self.posts.dispatcher().clone(),
            refresher: Arc::clone(&self.refresher),
            failure_hook: self.reconciler.clone(),
            event_bus: self.event_bus.clone(),
        };

        let mut pool = WorkerPool::start(
            Arc::clone(&self.queue),
            receivers,
            context,
            WorkerConfig::from(&self.config.queue),
        );
        pool.spawn_scheduler(RefreshScheduler::new(
            Arc::clone(&self.queue),
            self.config.refresh.period,
        ));

        self.posts = self.posts.clone().with_queue(Arc::clone(&self.queue));
        Ok(pool)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn posts(&self) -> &PostService {
        &self.posts
    }

    pub fn dispatcher(&self) -> &PublishDispatcher {
        self.posts.dispatcher()
    }

    pub fn connect(&self) -> &ConnectService {
        &self.connect
    }

    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Subscribe to dispatch, job and refresh events
    pub fn subscribe(&self) -> events::EventReceiver {
        self.event_bus.subscribe()
    }
}
