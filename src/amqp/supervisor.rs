use tokio::sync::{Mutex, MutexGuard};

use crate::amqp::configuration::QueueSettings;
use crate::amqp::topology::QueueTopology;
use crate::amqp::transport::{BrokerChannel, BrokerConnection, TransportFactory};
use crate::amqp::ConnectionFactory;

/// The channel type handed out by a supervisor built on top of `F`.
pub type ChannelOf<F> = <<F as TransportFactory>::Connection as BrokerConnection>::Channel;

/// Owner of the process-wide broker connection and channel.
///
/// Nothing is opened when the supervisor is created: the first call to
/// [`ConnectionSupervisor::ensure_connected`] connects, and every call makes sure the queue
/// topology for the requested queue exists.
/// Share it behind an `Arc` between [`Publisher`]s and [`Consumer`]s.
///
/// # Concurrency
///
/// There is a single shared channel. Connection management is serialized by an internal lock;
/// publishers additionally hold [`ConnectionSupervisor::publish_permit`] for the duration of a
/// publish, so that publishes from concurrent tasks reach the broker one at a time.
/// Subscriptions get channels of their own from
/// [`ConnectionSupervisor::open_subscription_channel`] and never touch the shared one.
///
/// [`Publisher`]: crate::publishers::Publisher
/// [`Consumer`]: crate::consumers::Consumer
pub struct ConnectionSupervisor<F: TransportFactory = ConnectionFactory> {
    factory: F,
    settings: QueueSettings,
    state: Mutex<State<F::Connection>>,
    publish_lock: Mutex<()>,
}

struct State<C: BrokerConnection> {
    session: Option<Session<C>>,
    shut_down: bool,
}

struct Session<C: BrokerConnection> {
    connection: C,
    channel: C::Channel,
}

/// Error returned when the broker connection or the queue topology cannot be set up.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to the RabbitMq broker")]
    Connect(#[source] anyhow::Error),
    #[error("Failed to declare the queue topology for `{queue}`")]
    Topology {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("The connection to RabbitMq has already been shut down")]
    ShutDown,
}

impl<F: TransportFactory> ConnectionSupervisor<F> {
    pub fn new(factory: F, settings: QueueSettings) -> Self {
        Self {
            factory,
            settings,
            state: Mutex::new(State {
                session: None,
                shut_down: false,
            }),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn queue_settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// The queue topology derived from `queue_name` and the configured suffixes.
    pub fn topology(&self, queue_name: &str) -> QueueTopology {
        QueueTopology::new(queue_name, &self.settings)
    }

    /// `true` if a connection and a channel are currently open.
    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|s| s.connection.is_open() && s.channel.is_open())
    }

    /// Make sure there is an open channel and that the topology for `queue_name` exists,
    /// then return the channel.
    ///
    /// - Opens a connection and a channel if there is none, or if the current ones are broken.
    /// - Checks passively that `queue_name` exists. If it does not, declares the terminal queue,
    ///   the delay queue and the main queue, in this order.
    ///
    /// Waits for [`ConnectionSupervisor::publish_permit`]: a passive check that fails closes the
    /// shared channel, so it cannot run while a publish is waiting for its confirmation.
    ///
    /// Connection failures are not retried here: wrap the call in a
    /// [`Backoff`](crate::backoff::Backoff) if you need that.
    #[tracing::instrument(name = "ensure_connected", skip(self))]
    pub async fn ensure_connected(
        &self,
        queue_name: &str,
    ) -> Result<ChannelOf<F>, ConnectionError> {
        let _permit = self.publish_permit().await;
        self.shared_channel(queue_name).await
    }

    /// [`ConnectionSupervisor::ensure_connected`] for callers already holding the publish permit.
    pub(crate) async fn shared_channel(
        &self,
        queue_name: &str,
    ) -> Result<ChannelOf<F>, ConnectionError> {
        let mut state = self.state.lock().await;
        let mut session = self.live_session(&mut state).await?;
        let topology = self.topology(queue_name);
        let outcome =
            Self::ensure_topology(&session.connection, &mut session.channel, &topology).await;
        let channel = session.channel.clone();
        state.session = Some(session);
        outcome.map(|()| channel)
    }

    /// Like [`ConnectionSupervisor::ensure_connected`], but returns a dedicated channel on the
    /// supervised connection instead of the shared one.
    ///
    /// The topology check runs on the new channel. The shared channel, and any publish in
    /// flight on it, is left alone.
    #[tracing::instrument(name = "open_subscription_channel", skip(self))]
    pub async fn open_subscription_channel(
        &self,
        queue_name: &str,
    ) -> Result<ChannelOf<F>, ConnectionError> {
        let mut state = self.state.lock().await;
        let session = self.live_session(&mut state).await?;
        let topology = self.topology(queue_name);
        let outcome: Result<ChannelOf<F>, ConnectionError> = async {
            let mut channel = session
                .connection
                .create_channel()
                .await
                .map_err(ConnectionError::Connect)?;
            Self::ensure_topology(&session.connection, &mut channel, &topology).await?;
            Ok(channel)
        }
        .await;
        state.session = Some(session);
        outcome
    }

    /// Serializes publishes on the shared channel. Hold the guard until the broker confirmed.
    pub async fn publish_permit(&self) -> MutexGuard<'_, ()> {
        self.publish_lock.lock().await
    }

    /// Close the channel, then the connection.
    ///
    /// Failures are logged and swallowed: shutting down never fails.
    /// Later calls to `ensure_connected` return [`ConnectionError::ShutDown`].
    #[tracing::instrument(name = "connection_shutdown", skip(self))]
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.shut_down = true;
        if let Some(session) = state.session.take() {
            session.close().await;
            tracing::info!("RabbitMQ connection closed");
        }
    }

    /// Take the current session out of `state`, reconnecting or repairing its channel first
    /// if needed. The caller puts it back.
    async fn live_session(
        &self,
        state: &mut State<F::Connection>,
    ) -> Result<Session<F::Connection>, ConnectionError> {
        if state.shut_down {
            return Err(ConnectionError::ShutDown);
        }

        let mut session = match state.session.take() {
            Some(session) if session.connection.is_open() => session,
            stale => {
                if let Some(stale) = stale {
                    tracing::warn!("RabbitMQ connection is broken, reconnecting");
                    stale.close().await;
                }
                self.open_session().await?
            }
        };
        if !session.channel.is_open() {
            tracing::warn!("RabbitMQ channel is broken, opening a new one");
            match session.connection.create_channel().await {
                Ok(channel) => session.channel = channel,
                Err(e) => {
                    session.close().await;
                    return Err(ConnectionError::Connect(e));
                }
            }
        }
        Ok(session)
    }

    async fn open_session(&self) -> Result<Session<F::Connection>, ConnectionError> {
        let connection = self
            .factory
            .connect()
            .await
            .map_err(ConnectionError::Connect)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(ConnectionError::Connect)?;
        tracing::info!("Connected to RabbitMQ");
        Ok(Session {
            connection,
            channel,
        })
    }

    /// Check the topology on `channel`, declaring it if missing.
    ///
    /// A failed passive check closes `channel`: it is replaced by a fresh one from
    /// `connection`, on which the declaration runs.
    async fn ensure_topology(
        connection: &F::Connection,
        channel: &mut ChannelOf<F>,
        topology: &QueueTopology,
    ) -> Result<(), ConnectionError> {
        if topology.exists(&*channel).await.is_ok() {
            return Ok(());
        }

        let topology_error = |source: anyhow::Error| ConnectionError::Topology {
            queue: topology.main_queue().to_owned(),
            source,
        };
        tracing::info!(
            queue = topology.main_queue(),
            "Queue not found, declaring its topology"
        );
        *channel = connection.create_channel().await.map_err(topology_error)?;
        topology.declare(&*channel).await.map_err(topology_error)
    }
}

impl<C: BrokerConnection> Session<C> {
    async fn close(self) {
        if self.channel.is_open() {
            if let Err(e) = self.channel.close().await {
                tracing::warn!(error = ?e, "Failed to close the RabbitMQ channel");
            }
        }
        if self.connection.is_open() {
            if let Err(e) = self.connection.close().await {
                tracing::warn!(error = ?e, "Failed to close the RabbitMQ connection");
            }
        }
    }
}
