/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

use std::process;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use covenant_config::Config;
use covenant_secrets::SecretsProvider;

use agbot::commands::{Command, EventSender};
use agbot::exchange::{ExchangeClient, HttpExchangeClient};
use agbot::handler::ConsumerProtocolHandler;
use agbot::objects::{
    CssObjectPolicyManager, NodeSearch, ObjectPolicy, ObjectPolicyManager, RescanQueue,
};
use agbot::protocol::BasicProtocol;
use agbot::store::{AgreementStore, MemoryAgreementStore, PostgresAgreementStore};
use agbot::transport::ExchangeMessenger;
use agbot::work::run_agreement_worker;
use agbot::AgbotError;

const SERVICE_NAME: &str = "agbot";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("fatal: failed to load config: {e}");
            process::exit(1);
        }
    };

    let _telemetry_guard = covenant_telemetry::init_telemetry(
        SERVICE_NAME,
        &config.agbot.partition,
        &config.telemetry,
    )
    .unwrap_or_else(|e| {
        eprintln!("fatal: telemetry init failed: {e}");
        process::exit(1);
    });

    info!(
        service = SERVICE_NAME,
        version = SERVICE_VERSION,
        partition = %config.agbot.partition,
        "starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal: agbot failed");
        process::exit(1);
    }

    info!("shutdown complete");
}

async fn run(config: Arc<Config>) -> Result<(), AgbotError> {
    // Secrets provider
    let secrets: Arc<dyn SecretsProvider> =
        Arc::from(covenant_secrets::create_provider(&config.secrets)?);

    let exchange_token = secrets.get(&config.agbot.token_key).await?;

    let db: Arc<dyn AgreementStore> = if config.postgres.host.is_empty() {
        warn!("no postgres host configured, using the in-memory store (single instance, non-durable)");
        Arc::new(MemoryAgreementStore::new())
    } else {
        let pg_password = secrets.get(&config.postgres.password_key).await?;
        let pg_url = format!(
            "postgres://{}:{}@{}:{}/{}",
            config.postgres.user,
            pg_password,
            config.postgres.host,
            config.postgres.port,
            config.postgres.database,
        );
        let pool = PgPoolOptions::new()
            .min_connections(config.postgres.min_connections)
            .max_connections(config.postgres.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&pg_url)
            .await?;
        info!("postgres pool connected");

        PostgresAgreementStore::ensure_schema(&pool).await?;
        Arc::new(PostgresAgreementStore::new(pool, &config.agbot.partition))
    };

    // Exchange client and collaborators
    let exchange = Arc::new(HttpExchangeClient::new(
        &config.exchange.url,
        &config.agbot.id,
        &exchange_token,
        Duration::from_secs(config.exchange.request_timeout_secs),
    )?);
    let protocol = Arc::new(BasicProtocol::new());
    let messenger = Arc::new(ExchangeMessenger::new(
        Arc::clone(&config),
        Arc::clone(&exchange) as Arc<dyn ExchangeClient>,
    ));

    let obj_mgr: Arc<dyn ObjectPolicyManager> = if config.exchange.css_url.is_empty() {
        warn!("no object store URL configured, object placement is disabled");
        Arc::new(DisabledObjectPolicyManager)
    } else {
        Arc::new(CssObjectPolicyManager::new(
            &config.exchange.css_url,
            &config.agbot.id,
            &exchange_token,
        )?)
    };

    let node_search = Arc::new(RescanQueue::new());
    let (events, mut event_rx) = EventSender::new(config.agbot.agreement_queue_size);

    let handler = Arc::new(ConsumerProtocolHandler::new(
        Arc::clone(&config),
        db,
        exchange,
        protocol,
        messenger,
        obj_mgr,
        Arc::clone(&node_search) as Arc<dyn NodeSearch>,
        secrets,
        events.clone(),
    ));

    // Event drain: downstream subsystems subscribe here; until they do,
    // progress is at least visible in the log.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!(event = ?event, "agreement event");
        }
    });

    // Hand pending rescans to the node-search subsystem on the
    // governance cadence.
    {
        let rescans = Arc::clone(&node_search);
        let interval_s = config.agbot.process_governance_interval_s.max(1);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(interval_s));
            loop {
                tick.tick().await;
                for (org, policy_name) in rescans.drain().await {
                    info!(org = %org, policy_name = %policy_name, "policy rescan requested");
                }
            }
        });
    }

    let (command_tx, command_rx) = mpsc::channel::<Command>(config.agbot.agreement_queue_size);

    let mut worker_handles = Vec::new();
    for worker_id in 0..config.agbot.agreement_workers {
        worker_handles.push(tokio::spawn(run_agreement_worker(
            worker_id,
            Arc::clone(&handler),
        )));
    }
    let dispatcher = tokio::spawn(Arc::clone(&handler).run(command_rx));

    info!(
        workers = config.agbot.agreement_workers,
        "agbot ready, waiting for commands"
    );

    covenant_runtime::shutdown_signal().await;
    info!("shutdown requested, stopping protocol");
    if command_tx.send(Command::StopProtocol).await.is_err() {
        warn!("dispatcher already stopped");
    }

    if let Err(e) = dispatcher.await {
        warn!(error = %e, "dispatcher join failed");
    }
    for handle in worker_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker join failed");
        }
    }

    if events.dropped_events() > 0 {
        warn!(
            dropped = events.dropped_events(),
            "events were dropped on the full event channel"
        );
    }

    Ok(())
}

/// Stand-in used when no object store is configured; placement requests
/// are answered with nothing to do.
struct DisabledObjectPolicyManager;

#[async_trait::async_trait]
impl ObjectPolicyManager for DisabledObjectPolicyManager {
    async fn object_policies_for_service(
        &self,
        _org: &str,
        _service_id: &str,
    ) -> Result<Vec<ObjectPolicy>, AgbotError> {
        Ok(Vec::new())
    }

    async fn add_node_destination(
        &self,
        _policy: &ObjectPolicy,
        _node_id: &str,
    ) -> Result<(), AgbotError> {
        Ok(())
    }

    async fn remove_node_destination(
        &self,
        _policy: &ObjectPolicy,
        _node_id: &str,
    ) -> Result<(), AgbotError> {
        Ok(())
    }
}
