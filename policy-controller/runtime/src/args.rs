use crate::{
    admission::Admission,
    core::AliasTable,
    reconcile::{stats as reconcile_stats, KubeStore, Metrics, Params, Reconciler},
    stats,
};
use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "egress-policy",
    about = "Enforces pod egress allowlists with network policies"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "egress=info,warn",
        env = "EGRESS_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// A YAML file mapping hostnames to the IPs that back them.
    #[clap(long, env = "EGRESS_HOST_ALIASES")]
    host_aliases: Option<PathBuf>,

    /// The maximum number of attempts to apply an FQDNNetworkPolicy.
    #[clap(long, default_value = "3")]
    fqdn_policy_attempts: u32,

    /// The unit of linear backoff between FQDNNetworkPolicy attempts.
    #[clap(long, default_value = "1000")]
    fqdn_policy_backoff_ms: u64,

    /// How long to wait for an FQDNNetworkPolicy to be materialized.
    #[clap(long, default_value = "10000")]
    fqdn_confirm_timeout_ms: u64,

    /// Bounds the handling of each admission request. Should be shorter than
    /// the webhook's configured timeout.
    #[clap(long, default_value = "25000")]
    admission_deadline_ms: u64,

    #[clap(long, default_value = "1000")]
    stats_queue_capacity: usize,

    #[clap(long, default_value = "50")]
    stats_send_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            host_aliases,
            fqdn_policy_attempts,
            fqdn_policy_backoff_ms,
            fqdn_confirm_timeout_ms,
            admission_deadline_ms,
            stats_queue_capacity,
            stats_send_timeout_ms,
        } = self;

        ensure!(
            fqdn_policy_attempts > 0,
            "--fqdn-policy-attempts must be at least 1"
        );

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("egress_policy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // Loaded after the runtime so that failures are logged.
        let aliases = match host_aliases {
            Some(path) => AliasTable::load(&path)
                .with_context(|| format!("loading host aliases from {}", path.display()))?,
            None => {
                info!("No host aliases configured");
                AliasTable::default()
            }
        };

        let (stats_tx, stats_rx) = reconcile_stats::channel(
            stats_queue_capacity,
            Duration::from_millis(stats_send_timeout_ms),
            metrics.stats_dropped(),
        );
        tokio::spawn(
            stats::run(stats_rx, runtime.shutdown_handle()).instrument(info_span!("stats")),
        );

        let params = Params {
            fqdn_attempts: fqdn_policy_attempts,
            fqdn_backoff: Duration::from_millis(fqdn_policy_backoff_ms),
            confirm_timeout: Duration::from_millis(fqdn_confirm_timeout_ms),
            deadline: Duration::from_millis(admission_deadline_ms),
        };
        let reconciler = Reconciler::new(
            KubeStore::new(runtime.client()),
            Arc::new(aliases),
            params,
            stats_tx,
            metrics,
        );

        let runtime = runtime.spawn_server(move || Admission::new(reconciler.clone()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
