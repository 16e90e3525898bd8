//! Warden control-plane binary
//!
//! `warden run` is the long-lived mode: ensure the CA and wildcard
//! certificate, rebuild the route cache from the proxy, and keep the
//! renewal scheduler running until ctrl-c. The remaining subcommands are
//! one-shot operator tools for certificate and route management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden_common::AgentId;
use warden_config::Settings;
use warden_control::acme::{dns, AcmeStorage, RenewalOutcome, WildcardCertManager};
use warden_control::pki::{AgentCertIssuer, CertificateAuthority};
use warden_control::reload::ProxyReloader;
use warden_control::renewal::{CheckOutcome, RenewalScheduler};
use warden_control::routes::{
    DataplaneApi, HttpDataplaneClient, RouteCache, RouteManager, TransactionCoordinator,
};

#[derive(Parser)]
#[command(
    name = "warden",
    about = "Certificate lifecycle and route reconciliation for the proxy front",
    version
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/warden/warden.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted
    Run,
    /// Issue (or return the cached) certificate for an agent
    Issue {
        /// Agent identifier
        #[arg(long)]
        agent: AgentId,
        /// Backend address to include in the certificate's SANs
        #[arg(long)]
        target: Option<String>,
    },
    /// Revoke an agent's certificate and delete its material
    Revoke {
        #[arg(long)]
        agent: AgentId,
    },
    /// Force one renewal check now
    Renew,
    /// Manage proxy routes
    Route {
        #[command(subcommand)]
        command: RouteCommand,
    },
}

#[derive(Subcommand)]
enum RouteCommand {
    /// Route a public subdomain's HTTP traffic to an agent backend
    AddHttp {
        #[arg(long)]
        agent: AgentId,
        /// Subdomain under the public domain
        #[arg(long)]
        subdomain: String,
        /// Backend address as host[:port]
        #[arg(long)]
        target: String,
    },
    /// Route MongoDB traffic to an agent backend over TLS
    AddMongo {
        #[arg(long)]
        agent: AgentId,
        /// Backend address as host[:port]
        #[arg(long)]
        target: String,
    },
    /// Remove every route for an agent
    Remove {
        #[arg(long)]
        agent: AgentId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run(settings).await,
        Command::Issue { agent, target } => issue(&settings, &agent, target.as_deref()),
        Command::Revoke { agent } => revoke(&settings, &agent),
        Command::Renew => renew(settings).await,
        Command::Route { command } => route(settings, command).await,
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let (_authority, issuer) = build_pki(&settings)?;
    let wildcard = build_wildcard(&settings)?;

    wildcard
        .ensure_account()
        .await
        .context("ensuring ACME account")?;
    match wildcard.renew_if_needed().await {
        Ok(RenewalOutcome::Renewed(certificate)) => {
            info!(not_after = %certificate.not_after, "Wildcard certificate installed")
        }
        Ok(RenewalOutcome::NotDue { days_left }) => {
            info!(days_left, "Wildcard certificate valid")
        }
        // The scheduler retries on its interval; boot does not depend on it
        Err(e) => warn!(error = %e, "Initial wildcard issuance failed"),
    }

    let reloader = Arc::new(ProxyReloader::new(&settings.reload));
    let (routes, _cache) = build_routes(&settings, reloader.clone())?;
    if let Err(e) = routes.rebuild_cache().await {
        warn!(error = %e, "Route cache rebuild failed, starting empty");
    }

    let scheduler = Arc::new(RenewalScheduler::new(
        settings.renewal.clone(),
        settings.acme.renew_before_days,
        wildcard,
        issuer,
        reloader,
    ));
    scheduler.start();

    info!("Warden control plane running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    scheduler.stop();
    Ok(())
}

fn issue(settings: &Settings, agent: &AgentId, target: Option<&str>) -> anyhow::Result<()> {
    let (_authority, issuer) = build_pki(settings)?;
    let bundle = issuer
        .issue(agent, target)
        .with_context(|| format!("issuing certificate for agent '{}'", agent))?;

    println!("agent:       {}", bundle.agent);
    println!("domain:      {}", bundle.domain);
    println!("certificate: {}", bundle.cert_path.display());
    println!("key:         {}", bundle.key_path.display());
    println!("bundle:      {}", bundle.bundle_path.display());
    println!("expires:     {}", bundle.expires_at);
    Ok(())
}

fn revoke(settings: &Settings, agent: &AgentId) -> anyhow::Result<()> {
    let (_authority, issuer) = build_pki(settings)?;
    issuer
        .revoke(agent)
        .with_context(|| format!("revoking certificate for agent '{}'", agent))?;
    println!("revoked {}", agent);
    Ok(())
}

async fn renew(settings: Settings) -> anyhow::Result<()> {
    let (_authority, issuer) = build_pki(&settings)?;
    let wildcard = build_wildcard(&settings)?;
    let reloader = Arc::new(ProxyReloader::new(&settings.reload));

    let scheduler = Arc::new(RenewalScheduler::new(
        settings.renewal.clone(),
        settings.acme.renew_before_days,
        wildcard,
        issuer,
        reloader,
    ));

    match scheduler.perform_renewal_check().await? {
        CheckOutcome::Skipped { waited_ms } => {
            println!("skipped: another instance held the renewal lock ({}ms)", waited_ms)
        }
        CheckOutcome::Completed {
            wildcard_renewed,
            agents_renewed,
            failures,
        } => println!(
            "done: wildcard renewed: {}, agents renewed: {}, failures: {}",
            wildcard_renewed, agents_renewed, failures
        ),
    }
    Ok(())
}

async fn route(settings: Settings, command: RouteCommand) -> anyhow::Result<()> {
    let (authority, issuer) = build_pki(&settings)?;
    let reloader = Arc::new(ProxyReloader::new(&settings.reload));
    let (routes, _cache) = build_routes(&settings, reloader)?;

    match command {
        RouteCommand::AddHttp {
            agent,
            subdomain,
            target,
        } => {
            routes
                .add_http_route(&agent, &subdomain, &target)
                .await
                .with_context(|| format!("adding HTTP route for agent '{}'", agent))?;
            println!("routed {}.{} -> {}", subdomain, settings.acme.public_domain, target);
        }
        RouteCommand::AddMongo { agent, target } => {
            // The backend presents a leaf signed by our CA; make sure one
            // exists before wiring the TLS route to it
            issuer
                .issue(&agent, Some(&target))
                .with_context(|| format!("issuing certificate for agent '{}'", agent))?;
            routes
                .add_mongo_route(&agent, &target, &authority.cert_path())
                .await
                .with_context(|| format!("adding MongoDB route for agent '{}'", agent))?;
            println!("routed {} -> {}", agent.domain_under(&settings.certs.mongo_domain), target);
        }
        RouteCommand::Remove { agent } => {
            routes
                .remove_route(&agent)
                .await
                .with_context(|| format!("removing routes for agent '{}'", agent))?;
            println!("removed routes for {}", agent);
        }
    }
    Ok(())
}

fn build_pki(settings: &Settings) -> anyhow::Result<(Arc<CertificateAuthority>, Arc<AgentCertIssuer>)> {
    let authority = Arc::new(
        CertificateAuthority::ensure(&settings.certs.dir, &settings.certs.organization)
            .context("ensuring certificate authority")?,
    );
    let issuer = Arc::new(AgentCertIssuer::new(
        authority.clone(),
        settings.certs.mongo_domain.clone(),
    ));
    Ok((authority, issuer))
}

fn build_wildcard(settings: &Settings) -> anyhow::Result<Arc<WildcardCertManager>> {
    let provider = dns::create_provider(&settings.dns).context("creating DNS provider")?;
    let storage = Arc::new(AcmeStorage::new(&settings.certs.dir));
    Ok(Arc::new(WildcardCertManager::new(
        settings.acme.clone(),
        storage,
        provider,
    )))
}

fn build_routes(
    settings: &Settings,
    reloader: Arc<ProxyReloader>,
) -> anyhow::Result<(RouteManager, Arc<RouteCache>)> {
    let api: Arc<dyn DataplaneApi> = Arc::new(
        HttpDataplaneClient::new(&settings.dataplane).context("creating dataplane client")?,
    );
    let coordinator =
        TransactionCoordinator::new(api.clone(), settings.dataplane.backup_dir.clone());
    let cache = Arc::new(RouteCache::new());
    let manager = RouteManager::new(
        api,
        coordinator,
        cache.clone(),
        reloader,
        settings.dataplane.http_frontend.clone(),
        settings.acme.public_domain.clone(),
        settings.certs.mongo_domain.clone(),
    );
    Ok((manager, cache))
}
