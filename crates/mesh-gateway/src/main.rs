mod console;
mod logging;
mod services;
mod udp;

use anyhow::Result;
use mesh_core::{
    GatewayBridge, GatewayState, InboundEvent, MeshError, MeshNode, MeshTransport, MessageKind,
    NodeIdentity, RandomIdGenerator,
};
use shared::{Config, GatewayMode};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use console::ConsoleCommand;
use services::HttpGatewayServices;
use udp::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_from_env();
    tracing::info!("Starting mesh gateway");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let identity = match &config.node.private_key_hex {
        Some(secret) => NodeIdentity::from_hex(secret)?,
        None => {
            tracing::warn!("MESH_PRIVATE_KEY not set, using an ephemeral identity");
            NodeIdentity::generate()
        }
    };

    let transport: Arc<dyn MeshTransport> =
        Arc::new(UdpTransport::bind(&config.node.listen_addr, &config.node.peers).await?);
    let ids = Arc::new(RandomIdGenerator::new());
    let node = Arc::new(MeshNode::new(&config, identity, transport, ids.clone()));

    let services = Arc::new(HttpGatewayServices::new(&config.gateway)?);
    let bridge = Arc::new(GatewayBridge::new(config.gateway.clone(), services, ids));
    let gateway_state = Arc::new(RwLock::new(bridge.initial_state()));

    if config.gateway.mode == GatewayMode::Gateway {
        let mut state = gateway_state.write().await;
        let update = bridge.activate(std::mem::take(&mut *state)).await;
        *state = update.state;
        match update.outcome {
            Ok(()) => tracing::info!("Gateway mode active"),
            Err(e) => tracing::error!(error = %e, "Gateway activation failed, staying in client mode"),
        }
        node.set_gateway_advertised(state.is_relaying());
    }

    if let Err(e) = node.announce_key(None).await {
        tracing::warn!(error = %e, "Initial key announcement failed");
    }

    let mut tasks = node.start_background_tasks();
    tasks.push(node.start_announcer());
    tasks.push(bridge.start_janitor(gateway_state.clone()));
    tracing::info!(tasks = tasks.len(), "Background tasks started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = node.receive_next() => {
                handle_event(event, &bridge, &gateway_state).await;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_line(&line, &node, &bridge, &gateway_state).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "Console input closed");
                    stdin_open = false;
                }
            },
        }
    }

    for task in tasks {
        task.stop().await;
    }

    let mut state = gateway_state.write().await;
    if state.is_relaying() {
        *state = bridge.deactivate(std::mem::take(&mut *state));
        node.set_gateway_advertised(false);
    }
    tracing::info!(summary = ?state.summary(), "Mesh gateway stopped");
    Ok(())
}

async fn handle_event(
    event: Result<InboundEvent, MeshError>,
    bridge: &GatewayBridge,
    gateway_state: &RwLock<GatewayState>,
) {
    match event {
        Ok(InboundEvent::Delivered(delivered)) => {
            tracing::info!(
                msg_id = %delivered.message.msg_id,
                from = %delivered.message.from,
                channel = ?delivered.channel,
                kind = ?delivered.message.kind,
                "Message delivered"
            );

            if matches!(delivered.message.kind, MessageKind::Cashu | MessageKind::BtcTx) {
                let mut state = gateway_state.write().await;
                let update = bridge
                    .handle_incoming_lora_message(
                        std::mem::take(&mut *state),
                        &delivered.message,
                        &delivered.plaintext,
                    )
                    .await;
                *state = update.state;

                match (update.job_id, update.outcome) {
                    (Some(job_id), Ok(())) => tracing::info!(job_id = %job_id, "Relay job completed"),
                    (job_id, Err(e)) => tracing::warn!(job_id = ?job_id, error = %e, "Relay job failed"),
                    (None, Ok(())) => {}
                }
            }
        }
        Ok(InboundEvent::KeyAnnounced {
            node_id,
            pinned,
            is_gateway,
            ..
        }) => {
            if !pinned {
                tracing::warn!(node_id = %node_id, "Ignoring key announcement that conflicts with the pinned key");
                return;
            }
            let mut state = gateway_state.write().await;
            *state = bridge.record_peer(std::mem::take(&mut *state), node_id, is_gateway);
        }
        Ok(InboundEvent::ForeignForum { msg_id }) => {
            tracing::debug!(msg_id = %msg_id, "Broadcast for a forum this node has not joined")
        }
        Ok(other) => tracing::debug!(event = ?other, "Inbound event"),
        Err(MeshError::AuthenticationFailure) => {
            tracing::warn!("Inbound message failed authentication, possible tampering")
        }
        Err(e) => tracing::warn!(error = %e, "Failed to process inbound frame"),
    }
}

async fn handle_line(
    line: &str,
    node: &MeshNode,
    bridge: &GatewayBridge,
    gateway_state: &RwLock<GatewayState>,
) {
    let command = match console::parse_line(line) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid console command");
            return;
        }
    };

    match command {
        ConsoleCommand::Pay { kind, payload } => {
            let mut state = gateway_state.write().await;
            let update = bridge
                .submit_payment(std::mem::take(&mut *state), kind, payload, |gateway, payload| async move {
                    node.send_direct(gateway, &payload, kind).await.map(|_| ())
                })
                .await;
            *state = update.state;

            match update.outcome {
                Ok(()) => tracing::info!(job_id = ?update.job_id, kind = ?kind, "Payment submitted"),
                Err(e) => tracing::warn!(job_id = ?update.job_id, error = %e, "Payment submission failed"),
            }
        }
        ConsoleCommand::Announce => {
            if let Err(e) = node.announce_key(None).await {
                tracing::warn!(error = %e, "Key announcement failed");
            }
        }
        ConsoleCommand::Status => {
            let state = gateway_state.read().await;
            tracing::info!(summary = ?state.summary(), "Gateway status");
        }
    }
}
