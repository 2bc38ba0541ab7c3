pub mod admin;
pub mod controller;
pub mod grant;
pub mod portal_config;
pub mod rate_limit;
pub mod rbac;
pub mod reservation;
pub mod voucher;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{info, warn};

use crate::config::Config;
use crate::database::Database;
use crate::Result;

use self::controller::retry_queue::{self, Queue as RetryQueue};
use self::controller::{Controller, NullController, OmadaController};
use self::rate_limit::RateLimiter;
use self::rbac::audit::AuditLog;

/// Aggregates every domain service behind one process-wide handle, built once
/// at startup and shared (via `Arc`) with every request handler and
/// background task.
pub struct Services {
    pub db: Database,
    pub voucher: voucher::Service,
    pub grant: grant::Service,
    pub reservation: Arc<reservation::Service>,
    pub controller: Arc<dyn Controller>,
    pub retry_queue: Arc<RetryQueue>,
    pub audit: Arc<AuditLog>,
    pub rate_limiter: RateLimiter,
    pub admin: admin::Service,
    pub portal_config: portal_config::Service,
    pub config: Config,
}

impl Services {
    pub fn build(config: Config) -> Result<Self> {
        let db = Database::open(&config.database_path, num_cpus::get())?;

        let controller: Arc<dyn Controller> = match OmadaController::new(config.controller.clone()) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!("controller adapter could not be built, falling back to a no-op controller: {}", e);
                Arc::new(NullController)
            }
        };

        let audit = Arc::new(AuditLog::build(db.clone()));
        let retry_queue = retry_queue::spawn(db.clone(), controller.clone(), audit.clone());

        let voucher = voucher::Service::build(db.clone());
        let grant = grant::Service::build(db.clone(), retry_queue.clone(), audit.clone());
        let reservation = Arc::new(reservation::Service::build(
            db.clone(),
            config.reservation.clone(),
            config.cleanup.clone(),
            audit.clone(),
        )?);

        let portal_config = portal_config::Service::build(db.clone());
        // The DB-held singleton is the runtime-editable source of truth once
        // the process is up; the file-based config only seeds its defaults
        // via the migration's INSERT. Load it now so a prior admin edit
        // survives a restart.
        let portal_settings = portal_config.get()?;

        let rate_limiter = RateLimiter::new(
            portal_settings.rate_limit_attempts,
            StdDuration::from_secs(portal_settings.rate_limit_window_seconds),
        );

        let admin = admin::Service::build(db.clone(), config.security.clone());

        Ok(Self {
            db,
            voucher,
            grant,
            reservation,
            controller,
            retry_queue,
            audit,
            rate_limiter,
            admin,
            portal_config,
            config,
        })
    }

    /// Starts every independent background loop: the reservation poller and
    /// retention cleaner (together, via `reservation::Service::spawn`) and the
    /// grant-expiry sweeper.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        self.reservation.clone().spawn();

        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.expiry_sweep_loop().await });
    }

    async fn expiry_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(30));
        loop {
            interval.tick().await;
            match self.grant.expire_sweep(chrono::Utc::now()) {
                Ok(0) => {}
                Ok(count) => info!(count, "grant expiry sweep transitioned grants to EXPIRED"),
                Err(e) => warn!("grant expiry sweep failed: {}", e),
            }
        }
    }

    /// Gives in-flight controller operations a moment to settle before exit.
    /// The retry queue itself is already durable — every enqueue is a
    /// synchronous DB write — so a crash mid-drain loses no state.
    pub async fn shutdown(&self) {
        info!("shutting down, allowing in-flight controller operations to settle");
        tokio::time::sleep(StdDuration::from_millis(250)).await;
    }
}
