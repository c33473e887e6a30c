pub mod admission;
pub mod channel;
pub mod config;
pub mod flags;
pub mod keepalive;
pub mod peer;
pub mod slot;
pub mod statistics;
pub mod supervisor;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use admission::AdmissionWorker;
use config::{Role, RuntimeConfig, StartupError};
use flags::Flag;
use peer::PeerHandler;
use slot::Slot;
use statistics::Counters;
use supervisor::Supervisor;

/// Binds every socket the instance needs, wires up slots and handlers
/// following the port-wiring rules, starts every worker, and runs the
/// supervisor loop until a termination signal arrives.
pub async fn run(config: Arc<RuntimeConfig>) -> Result<()> {
    let counters = Arc::new(Counters::default());
    let peers = config.peers as usize;
    let (reset_tx, reset_rx) = mpsc::channel::<usize>(peers.max(1));

    let slots: Arc<Vec<Arc<Slot>>> = Arc::new(
        (0..peers)
            .map(|index| Arc::new(Slot::new(index, config.tuning.packet_queue_size)))
            .collect(),
    );

    let (handlers, admission) = match config.role {
        Role::Server => {
            let built = build_server(&config, &slots, &counters, &reset_tx).await?;
            (built.0, Some((built.1, built.2, built.3)))
        }
        Role::Client => {
            let handlers = build_client(&config, &slots, &counters, &reset_tx).await?;
            (handlers, None)
        }
    };

    // Spawn every slot's workers before letting the admission worker past its
    // startup barrier, so relay workers are already blocking on their
    // keep-alive reads when the first peer datagram arrives.
    let worker_handles: Vec<Vec<JoinHandle<()>>> = handlers.iter().map(|h| h.start()).collect();

    let (admission_handle, admission_shutdown) = match admission {
        Some((handle, shutdown, ready)) => {
            ready.set();
            (Some(handle), Some(shutdown))
        }
        None => (None, None),
    };

    let supervisor = Supervisor::new(
        slots,
        handlers,
        worker_handles,
        admission_handle,
        admission_shutdown,
        counters,
        reset_rx,
    );
    supervisor.run().await
}

type ServerBuild = (Vec<Arc<PeerHandler>>, JoinHandle<()>, Arc<Flag>, Arc<Flag>);

async fn build_server(
    config: &Arc<RuntimeConfig>,
    slots: &Arc<Vec<Arc<Slot>>>,
    counters: &Arc<Counters>,
    reset_tx: &mpsc::Sender<usize>,
) -> Result<ServerBuild> {
    let admission_socket = Arc::new(
        bind(config.bind_ip, config.listen_port)
            .await
            .map_err(StartupError::AdmissionSocketBindFailed)?,
    );

    let mut handlers = Vec::with_capacity(slots.len());
    for (index, slot) in slots.iter().enumerate() {
        let destination_port = config.server_relay_base_port + index as u16;
        let destination = Arc::new(
            bind(config.bind_ip, destination_port)
                .await
                .map_err(|err| StartupError::DestinationSocketBindFailed(index, err))?,
        );

        handlers.push(PeerHandler::new(
            slot.clone(),
            Role::Server,
            admission_socket.clone(),
            destination,
            None,
            None,
            counters.clone(),
            reset_tx.clone(),
            config.tuning.clone(),
        ));
    }

    let ready = Arc::new(Flag::new());
    let shutdown = Arc::new(Flag::new());
    let admission_worker = AdmissionWorker::new(
        admission_socket,
        slots.clone(),
        counters.clone(),
        config.tuning.clone(),
    );

    let admission_handle = tokio::spawn(admission_worker.run(ready.clone(), shutdown.clone()));

    Ok((handlers, admission_handle, shutdown, ready))
}

async fn build_client(
    config: &Arc<RuntimeConfig>,
    slots: &Arc<Vec<Arc<Slot>>>,
    counters: &Arc<Counters>,
    reset_tx: &mpsc::Sender<usize>,
) -> Result<Vec<Arc<PeerHandler>>> {
    let mut handlers = Vec::with_capacity(slots.len());
    for (index, slot) in slots.iter().enumerate() {
        let source_port = config.client_relay_base_port + index as u16;
        let source = Arc::new(
            bind(config.bind_ip, source_port)
                .await
                .map_err(|err| StartupError::SourceSocketBindFailed(index, err))?,
        );
        let destination = Arc::new(
            bind(config.bind_ip, 0)
                .await
                .map_err(|err| StartupError::DestinationSocketBindFailed(index, err))?,
        );

        let endpoint_target =
            SocketAddrV4::new(config.destination_ip, config.destination_port + index as u16);
        let server_tunnel_target =
            SocketAddrV4::new(config.source_ip, config.server_relay_base_port + index as u16);

        handlers.push(PeerHandler::new(
            slot.clone(),
            Role::Client,
            source,
            destination,
            Some(endpoint_target),
            Some(server_tunnel_target),
            counters.clone(),
            reset_tx.clone(),
            config.tuning.clone(),
        ));
    }

    Ok(handlers)
}

async fn bind(ip: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    UdpSocket::bind((ip, port)).await
}
