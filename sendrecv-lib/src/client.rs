use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, error, info};

use crate::{
    error::SessionError,
    negotiation::{EarlyCandidatePolicy, EngineFactory, EventSender, NegotiationCoordinator},
    session::{Action, Event, Session, StateMachine},
    transport::{Connector, SignalingTransport},
};

fn ends_transport(event: &Event) -> bool {
    matches!(
        event,
        Event::TransportClosed | Event::TransportError(_) | Event::LivenessCheckFailed
    )
}

/// Runs one call attempt: a single event loop that owns the state machine,
/// the negotiation coordinator and the signaling transport.
pub struct Client {
    machine: StateMachine,
    coordinator: NegotiationCoordinator,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<Event>,
    close_timeout: Duration,
    fatal: Option<SessionError>,
}

impl Client {
    pub fn new(
        session: Session,
        factory: Arc<dyn EngineFactory>,
        policy: EarlyCandidatePolicy,
        close_timeout: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            machine: StateMachine::new(session),
            coordinator: NegotiationCoordinator::new(factory, events_tx.clone(), policy),
            events_tx,
            events_rx,
            close_timeout,
            fatal: None,
        }
    }

    /// For injecting events from outside the loop, e.g. a hangup on Ctrl-C.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Returns the first fatal error, or `Ok` when the session ended in an
    /// orderly way: we hung up and the server then closed the connection.
    pub async fn run<C: Connector>(mut self, connector: &C) -> Result<(), SessionError> {
        let mut transport: Option<C::Transport> = None;
        self.dispatch(Event::Connect, &mut transport);
        match connector.connect(self.events_tx.clone()).await {
            Ok(connected) => {
                transport = Some(connected);
                self.dispatch(Event::TransportOpened, &mut transport);
                self.dispatch(Event::Register, &mut transport);
            }
            Err(err) => {
                self.dispatch(Event::TransportError(format!("{:#}", err)), &mut transport);
            }
        }

        let mut transport_closed = transport.is_none();
        while !self.machine.is_torn_down() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            transport_closed |= ends_transport(&event);
            self.dispatch(event, &mut transport);
        }

        if !transport_closed {
            debug!("waiting for the signaling connection to close");
            let close_timeout = self.close_timeout;
            let drain = async {
                while let Some(event) = self.events_rx.recv().await {
                    let closed = ends_transport(&event);
                    self.dispatch(event, &mut transport);
                    if closed {
                        break;
                    }
                }
            };
            if timeout(close_timeout, drain).await.is_err() {
                debug!("signaling connection did not close in time");
            }
        }
        self.coordinator.wait_closed(self.close_timeout).await;

        info!("session ended in {:?}", self.machine.state());
        match self.fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn dispatch<T: SignalingTransport>(&mut self, event: Event, transport: &mut Option<T>) {
        let mut actions: VecDeque<Action> = self.machine.apply(event).into();
        while let Some(action) = actions.pop_front() {
            match action {
                Action::SendMessage(msg) => {
                    let result = match transport.as_mut() {
                        Some(transport) => transport.send(msg.encode()),
                        None => Err(anyhow::anyhow!("not connected")),
                    };
                    if let Err(err) = result {
                        actions = self
                            .machine
                            .apply(Event::TransportError(format!("{:#}", err)))
                            .into();
                    }
                }
                Action::StartNegotiation => self.coordinator.start(),
                Action::Negotiate(command) => {
                    if let Err(err) = self.coordinator.execute(command) {
                        actions = self.machine.apply(Event::Failed(err)).into();
                    }
                }
                Action::Teardown => {
                    self.coordinator.teardown();
                    if let Some(transport) = transport.as_mut() {
                        transport.close();
                    }
                }
                Action::Fatal(err) => {
                    error!("{}", err);
                    self.fatal.get_or_insert(err);
                }
            }
        }
    }
}
