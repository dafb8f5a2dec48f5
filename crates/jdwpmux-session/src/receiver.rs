use std::future::Future;
use std::ops::ControlFlow;

use futures_core::future::BoxFuture;
use jdwpmux_frame::Packet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, SessionError};
use crate::filter::FilterId;
use crate::shared::{Joined, SharedJdwpSession};

type Activation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// One subscriber to a [`SharedJdwpSession`].
///
/// Built with `with_*`/`on_activation`, then consumed by
/// [`PacketReceiver::receive`]. Until then, no packet is read and the
/// activation callback does not run.
pub struct PacketReceiver {
    session: SharedJdwpSession,
    name: String,
    activation: Option<Activation>,
    cancellation: Option<CancellationToken>,
    filter: Option<FilterId>,
}

impl PacketReceiver {
    pub(crate) fn new(session: SharedJdwpSession) -> Self {
        Self {
            session,
            name: "receiver".to_string(),
            activation: None,
            cancellation: None,
            filter: None,
        }
    }

    /// Name used in logs and in [`SessionError::ReceiverLagged`].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run `activation` once, after replay packets have been delivered and
    /// while live packets are already being queued for this receiver.
    ///
    /// It runs on its own task, concurrently with packet delivery, so it can
    /// send a command and let the handler see the reply.
    pub fn on_activation<F, Fut>(mut self, activation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.activation = Some(Box::new(move || Box::pin(activation())));
        self
    }

    /// Only deliver packets accepted by the session filter registered as `id`.
    /// Replay packets are filtered too.
    pub fn with_filter(mut self, id: FilterId) -> Self {
        self.filter = Some(id);
        self
    }

    /// Terminate with [`SessionError::Cancelled`] when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver replay packets, then live packets, to `handler` one at a time.
    ///
    /// Returns `Ok(Some(value))` when the handler breaks with a value and
    /// `Ok(None)` at end of stream. Handler errors, activation errors,
    /// cancellation and session failures are returned as errors.
    pub async fn receive<B, E, F, Fut>(self, mut handler: F) -> std::result::Result<Option<B>, E>
    where
        F: FnMut(Packet) -> Fut,
        Fut: Future<Output = std::result::Result<ControlFlow<B>, E>>,
        E: From<SessionError>,
    {
        let PacketReceiver {
            session,
            name,
            activation,
            cancellation,
            filter,
        } = self;
        let cancellation = cancellation.unwrap_or_default();
        let inner = session.inner;

        let (mut registration, replay) = match inner.register(&name, filter)? {
            Joined::Live {
                registration,
                replay,
            } => (registration, replay),
            Joined::Ended { replay, terminal } => {
                for packet in replay {
                    if let ControlFlow::Break(value) =
                        deliver(&cancellation, &mut handler, packet).await?
                    {
                        return Ok(Some(value));
                    }
                }
                return finish(terminal);
            }
        };

        trace!(receiver = %name, packets = replay.len(), "delivering replay packets");
        for packet in replay {
            if let ControlFlow::Break(value) = deliver(&cancellation, &mut handler, packet).await? {
                return Ok(Some(value));
            }
        }

        inner.start_pump();
        let mut activation = ActivationTask::spawn(activation);

        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    debug!(receiver = %name, "receiver cancelled");
                    return Err(SessionError::Cancelled.into());
                }
                result = activation.wait() => {
                    if let Err(err) = result {
                        debug!(receiver = %name, error = %err, "activation failed");
                        return Err(err.into());
                    }
                }
                next = registration.rx.recv() => match next {
                    Some(packet) => {
                        if let ControlFlow::Break(value) =
                            deliver(&cancellation, &mut handler, packet).await?
                        {
                            return Ok(Some(value));
                        }
                    }
                    None => return finish(registration.termination()),
                },
            }
        }
    }

    /// The first packet matching `predicate`, or `None` at end of stream.
    pub async fn receive_first<P>(self, mut predicate: P) -> Result<Option<Packet>>
    where
        P: FnMut(&Packet) -> bool,
    {
        self.receive(|packet| {
            let flow = if predicate(&packet) {
                ControlFlow::Break(packet)
            } else {
                ControlFlow::Continue(())
            };
            std::future::ready(Ok::<_, SessionError>(flow))
        })
        .await
    }

    /// Every packet up to and including the first one matching `predicate`.
    /// Stops early, without error, at end of stream.
    pub async fn receive_until<P>(self, mut predicate: P) -> Result<Vec<Packet>>
    where
        P: FnMut(&Packet) -> bool,
    {
        let mut packets = Vec::new();
        self.receive(|packet| {
            let done = predicate(&packet);
            packets.push(packet);
            let flow = if done {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            };
            std::future::ready(Ok::<_, SessionError>(flow))
        })
        .await?;
        Ok(packets)
    }

    /// Consume packets until end of stream.
    pub async fn receive_to_end(self) -> Result<()> {
        self.receive(|_packet| std::future::ready(Ok::<_, SessionError>(ControlFlow::<()>::Continue(()))))
            .await?;
        Ok(())
    }
}

async fn deliver<B, E, F, Fut>(
    cancellation: &CancellationToken,
    handler: &mut F,
    packet: Packet,
) -> std::result::Result<ControlFlow<B>, E>
where
    F: FnMut(Packet) -> Fut,
    Fut: Future<Output = std::result::Result<ControlFlow<B>, E>>,
    E: From<SessionError>,
{
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(SessionError::Cancelled.into()),
        result = handler(packet) => result,
    }
}

fn finish<B, E: From<SessionError>>(terminal: SessionError) -> std::result::Result<Option<B>, E> {
    if terminal.is_end_of_stream() {
        Ok(None)
    } else {
        Err(terminal.into())
    }
}

/// The activation callback of one receiver, aborted when the receiver ends.
struct ActivationTask {
    handle: Option<JoinHandle<Result<()>>>,
}

impl ActivationTask {
    fn spawn(activation: Option<Activation>) -> Self {
        Self {
            handle: activation.map(|activation| tokio::spawn(activation())),
        }
    }

    /// Resolves only if the activation failed; stays pending otherwise.
    async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        self.handle = None;
        match result {
            Ok(Ok(())) => std::future::pending().await,
            // The pump reports end of stream to the receiver itself.
            Ok(Err(err)) if err.is_end_of_stream() => std::future::pending().await,
            Ok(Err(err)) => Err(err),
            Err(join) => Err(join.into()),
        }
    }
}

impl Drop for ActivationTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
