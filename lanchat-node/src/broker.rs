//! Broker: runs the broadcast channel, the direct channel and directory liveness
//! under one cancellation token.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::Identity;
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastChannel;
use crate::config::Config;
use crate::direct::DirectServer;
use crate::directory::{Directory, HttpProbe};
use crate::log::Logger;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("bind multicast {group}:{port}: {source}")]
    BindBroadcast {
        group: Ipv4Addr,
        port: u16,
        source: std::io::Error,
    },
    #[error("bind session listener {addr}: {source}")]
    BindDirect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("liveness client: {0}")]
    Probe(#[from] reqwest::Error),
}

pub struct Broker {
    identity: Arc<Identity>,
    directory: Arc<Directory>,
    broadcast: BroadcastChannel,
    direct: DirectServer,
    probe: HttpProbe,
    probe_interval: Duration,
    log: Logger,
}

impl Broker {
    /// Bind both transports on the identity's port. Any bind failure is fatal.
    pub async fn bind(
        identity: Arc<Identity>,
        directory: Arc<Directory>,
        config: &Config,
        log: Logger,
    ) -> Result<Self, BrokerError> {
        let port = identity.port();
        let broadcast = BroadcastChannel::bind(
            config.multicast_addr,
            identity.clone(),
            directory.clone(),
            log.clone(),
        )
        .map_err(|source| BrokerError::BindBroadcast {
            group: config.multicast_addr,
            port,
            source,
        })?
        .with_heartbeat(config.heartbeat_interval());

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let direct = DirectServer::bind(addr, identity.clone(), directory.clone(), log.clone())
            .await
            .map_err(|source| BrokerError::BindDirect { addr, source })?
            .with_grace(config.shutdown_grace());

        let probe = HttpProbe::new(config.probe_timeout())?;
        Ok(Self::from_parts(
            identity,
            directory,
            broadcast,
            direct,
            probe,
            config.probe_interval(),
            log,
        ))
    }

    /// Assemble from already bound channels.
    pub fn from_parts(
        identity: Arc<Identity>,
        directory: Arc<Directory>,
        broadcast: BroadcastChannel,
        direct: DirectServer,
        probe: HttpProbe,
        probe_interval: Duration,
        log: Logger,
    ) -> Self {
        Self {
            identity,
            directory,
            broadcast,
            direct,
            probe,
            probe_interval,
            log,
        }
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Run until `cancel` fires and every task has observed it.
    pub async fn run(self, cancel: CancellationToken) {
        self.log.info(format!(
            "Broker: START {} ({})",
            self.identity.name(),
            self.identity.id()
        ));
        let directory = self.directory.clone();
        tokio::join!(
            self.broadcast.run(cancel.clone()),
            self.direct.run(cancel.clone()),
            directory.run_liveness(self.probe, self.probe_interval, cancel.clone()),
        );
        self.log.info("Broker: STOP".to_string());
    }
}
