//! Client facade wiring the relayer, history, expirer and both engines.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tandem_crypto::Crypto;
use tandem_transport::RelayTransport;

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::errors::{ClientError, SequenceError};
use crate::expirer::Expirer;
use crate::heartbeat::Heartbeat;
use crate::history::JsonRpcHistory;
use crate::messages::MessageTracker;
use crate::relayer::Relayer;
use crate::sequence::{
    EngineDeps, PendingSequence, ProposeParams, SequenceEngine, SequenceKind, Signal,
};
use crate::storage::KeyValueStorage;
use crate::uri::PairingUri;

/// External collaborators a client is built from.
#[derive(Clone)]
pub struct ClientDeps {
    pub crypto: Arc<dyn Crypto>,
    pub storage: Arc<dyn KeyValueStorage>,
    pub transport: Arc<dyn RelayTransport>,
    pub clock: Arc<dyn Clock>,
}

pub struct Client {
    config: ClientConfig,
    heartbeat: Heartbeat,
    relayer: Arc<Relayer>,
    history: Arc<JsonRpcHistory>,
    expirer: Arc<Expirer>,
    pairing: Arc<SequenceEngine>,
    session: Arc<SequenceEngine>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Restore persisted state, connect to the relay and start background
    /// tasks.
    pub async fn init(config: ClientConfig, deps: ClientDeps) -> Result<Self, ClientError> {
        config.validate()?;
        let key = config.storage_key();

        let history = Arc::new(JsonRpcHistory::new(deps.storage.clone(), &key));
        let expirer = Arc::new(Expirer::new(deps.storage.clone(), &key, deps.clock.clone()));
        let relayer = Arc::new(Relayer::new(
            deps.transport.clone(),
            deps.storage.clone(),
            &key,
            config.relayer_config(),
        ));
        history.init().await.map_err(SequenceError::from)?;
        expirer.init().await.map_err(SequenceError::from)?;

        let engine_deps = EngineDeps {
            crypto: deps.crypto.clone(),
            relayer: relayer.clone(),
            history: history.clone(),
            expirer: expirer.clone(),
            messages: Arc::new(MessageTracker::new()),
            storage: deps.storage.clone(),
            storage_key: key,
        };
        let pairing = Arc::new(SequenceEngine::new(
            SequenceKind::Pairing,
            config.engine_config(),
            &engine_deps,
            None,
        ));
        let session = Arc::new(SequenceEngine::new(
            SequenceKind::Session,
            config.engine_config(),
            &engine_deps,
            Some(pairing.clone()),
        ));
        pairing.init().await?;
        session.init().await?;

        // Receivers are taken before connecting so nothing is missed, but
        // nothing is spawned until the relay is up.
        let relay_events = relayer.events();
        let expirations = expirer.subscribe();
        let heartbeat = Heartbeat::new(config.heartbeat_interval());
        if let Err(e) = relayer.init(&heartbeat).await {
            if let Err(close) = relayer.shutdown().await {
                warn!(error = %close, "failed to close relay after failed init");
            }
            return Err(e.into());
        }

        let dispatcher = Arc::new(Dispatcher::new(&engine_deps, pairing.clone(), session.clone()));
        let dispatch = dispatcher.spawn(relay_events, expirations);
        let sweeper = expirer.spawn_sweeper(&heartbeat);
        heartbeat.start();

        info!(
            context = %config.context,
            controller = config.controller,
            pairings = pairing.settled().len(),
            sessions = session.settled().len(),
            "client ready"
        );
        Ok(Self {
            config,
            heartbeat,
            relayer,
            history,
            expirer,
            pairing,
            session,
            dispatcher,
            tasks: Mutex::new(vec![dispatch, sweeper]),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pairing(&self) -> &Arc<SequenceEngine> {
        &self.pairing
    }

    pub fn session(&self) -> &Arc<SequenceEngine> {
        &self.session
    }

    pub fn relayer(&self) -> &Arc<Relayer> {
        &self.relayer
    }

    pub fn history(&self) -> &Arc<JsonRpcHistory> {
        &self.history
    }

    pub fn expirer(&self) -> &Arc<Expirer> {
        &self.expirer
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Record a pairing proposal from an out-of-band URI.
    pub async fn pair(&self, uri: &str) -> Result<PendingSequence, ClientError> {
        let proposal = uri.parse::<PairingUri>()?.into_proposal();
        Ok(self.pairing.ingest_proposal(proposal).await?)
    }

    /// Propose a session over a settled pairing.
    pub async fn connect(
        &self,
        pairing_topic: &str,
        params: ProposeParams,
    ) -> Result<PendingSequence, ClientError> {
        let params = ProposeParams {
            signal: Some(Signal::Pairing {
                topic: pairing_topic.to_string(),
            }),
            ..params
        };
        Ok(self.session.propose(params).await?)
    }

    /// Stop background tasks and close the relay connection.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.abort_tasks();
        self.heartbeat.stop();
        self.relayer.shutdown().await?;
        info!(context = %self.config.context, "client shut down");
        Ok(())
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
