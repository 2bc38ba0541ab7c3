use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{middleware::map_response, response::IntoResponse, response::Response, Router};
use axum_server::{bind, bind_rustls, tls_rustls::RustlsConfig, Handle as ServerHandle};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use http::header::{self, CONTENT_SECURITY_POLICY};
use http::{HeaderName, Method};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{self, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

pub use stayauth::*; // Re-export everything from the library crate

#[tokio::main]
async fn main() {
    clap::parse();

    let raw_config = Figment::new()
        .merge(
            Toml::file(Env::var("STAYAUTH_CONFIG").expect(
                "The STAYAUTH_CONFIG env var needs to be set. Example: /etc/stayauth.toml",
            ))
            .nested(),
        )
        // Nested keys are addressed with a double underscore, e.g.
        // `STAYAUTH_CONTROLLER__BASE_URL` for `controller.base_url`.
        .merge(Env::prefixed("STAYAUTH_").split("__").global());

    let config: Config = match raw_config.extract() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    config.warn_deprecated();

    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::try_new("warn").unwrap()
        }
    };
    tracing::subscriber::set_global_default(registry.with(filter_layer).with(fmt_layer)).unwrap();

    info!("{}", config);

    // Needed for a serialized writer plus a handful of reader connections to
    // the bundled-sqlite file, plus outbound connections to the controller
    // and reservation source.
    #[cfg(unix)]
    maximize_fd_limit().expect("should be able to increase the soft limit to the hard limit");

    info!("Opening database");
    let services = match Services::build(config) {
        Ok(s) => Arc::new(s),
        Err(error) => {
            error!(?error, "The database couldn't be loaded or created");
            std::process::exit(1);
        }
    };

    services.spawn_background_tasks();

    info!("Starting server");
    if let Err(error) = run_server(services).await {
        error!(?error, "server exited with an error");
        std::process::exit(1);
    }
}

/// Adds the fixed guest-facing security header set (§4.I.9) to every response,
/// as an outer layer so handlers never forget to set it individually.
async fn set_csp_header(response: Response) -> impl IntoResponse {
    (
        [(
            CONTENT_SECURITY_POLICY,
            "default-src 'self'; frame-ancestors 'none'",
        )],
        response,
    )
}

async fn run_server(services: Arc<Services>) -> io::Result<()> {
    let config = services.config.clone();
    let addr = SocketAddr::from((config.address, config.port));

    let middlewares = ServiceBuilder::new().layer(
        CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT, HeaderName::from_static("x-csrf-token")])
            .max_age(Duration::from_secs(86400)),
    );

    let app: Router = api::router(services.clone())
        .layer(middlewares)
        .layer(map_response(set_csp_header))
        .into_make_service_with_connect_info::<SocketAddr>();

    let handle = ServerHandle::new();
    tokio::spawn(shutdown_signal(handle.clone(), services));

    match &config.tls {
        Some(tls) => {
            let conf = RustlsConfig::from_pem_file(&tls.certs, &tls.key).await?;
            let server = bind_rustls(addr, conf).handle(handle).serve(app);

            #[cfg(feature = "systemd")]
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

            server.await
        }
        None => {
            let server = bind(addr).handle(handle).serve(app);

            #[cfg(feature = "systemd")]
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

            server.await
        }
    }
}

async fn shutdown_signal(handle: ServerHandle, services: Arc<Services>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;
    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
    handle.graceful_shutdown(Some(Duration::from_secs(30)));

    services.shutdown().await;

    #[cfg(feature = "systemd")]
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
}

#[cfg(unix)]
#[tracing::instrument(err)]
fn maximize_fd_limit() -> std::result::Result<(), nix::errno::Errno> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let res = Resource::RLIMIT_NOFILE;
    let (soft_limit, hard_limit) = getrlimit(res)?;
    tracing::debug!("Current nofile soft limit: {soft_limit}");
    setrlimit(res, hard_limit, hard_limit)?;
    tracing::debug!("Increased nofile soft limit to {hard_limit}");
    Ok(())
}
