//! Connection negotiation state machine. Host-driven: no I/O.
//! The owning connection feeds [`Input`]s and executes the returned [`Action`]s, feeding
//! the results of transport calls back in as further inputs.

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::identity::PeerId;
use crate::protocol::{
    AnswerPayload, CandidatePayload, ConnectionType, IceCandidate, IceConfig, OfferPayload,
    SessionDescription, SignalEnvelope, SignalKind,
};
use crate::transport::IceConnectionState;

/// Remote candidates held while no remote description is applied.
pub const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Originator,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AwaitingOffer,
    Answering,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub enum Input {
    /// Originator: begin negotiating.
    Start { data_only: bool },
    /// Answerer: the offer that created this connection.
    OfferReceived(OfferPayload),
    /// Answerer: local side accepted; local tracks are already attached.
    Accept,
    /// Result of `CreateOffer`/`CreateAnswer`, already applied locally.
    LocalDescription(SessionDescription),
    /// Result of `ApplyRemoteDescription`.
    RemoteDescriptionApplied,
    /// Inbound signaling envelope from the remote peer.
    Signal(SignalEnvelope),
    LocalCandidate(IceCandidate),
    IceState(IceConnectionState),
    /// A transport step failed. Terminal for this attempt.
    StepFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CreateOffer { receive_media: bool },
    CreateAnswer,
    ApplyRemoteDescription(SessionDescription),
    AddCandidate(IceCandidate),
    Signal {
        kind: SignalKind,
        payload: Value,
        immediate: bool,
    },
    IceStateChanged(IceConnectionState),
    Connected,
    Close { reason: String },
}

pub struct Negotiator {
    peer: PeerId,
    role: Role,
    state: NegotiationState,
    connection_type: ConnectionType,
    ice: IceConfig,
    offer: Option<OfferPayload>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    ice_completed: bool,
}

impl Negotiator {
    /// `ice` is advertised to the answerer inside the offer.
    pub fn originator(peer: PeerId, connection_type: ConnectionType, ice: IceConfig) -> Self {
        Self::new(peer, Role::Originator, NegotiationState::Idle, connection_type, ice)
    }

    pub fn answerer(peer: PeerId) -> Self {
        Self::new(
            peer,
            Role::Answerer,
            NegotiationState::AwaitingOffer,
            ConnectionType::Media,
            IceConfig::default(),
        )
    }

    fn new(
        peer: PeerId,
        role: Role,
        state: NegotiationState,
        connection_type: ConnectionType,
        ice: IceConfig,
    ) -> Self {
        Self {
            peer,
            role,
            state,
            connection_type,
            ice,
            offer: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            ice_completed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Move to `Closed`. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        true
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        match input {
            Input::Start { data_only } => self.on_start(data_only),
            Input::OfferReceived(offer) => self.on_offer(offer),
            Input::Accept => self.on_accept(),
            Input::LocalDescription(desc) => self.on_local_description(desc),
            Input::RemoteDescriptionApplied => self.on_remote_applied(),
            Input::Signal(env) => self.on_signal(env),
            Input::LocalCandidate(c) => self.on_local_candidate(c),
            Input::IceState(s) => self.on_ice_state(s),
            Input::StepFailed(reason) => {
                error!("negotiation with {} failed: {}", self.peer.short(), reason);
                self.fail(reason)
            }
        }
    }

    fn fail(&mut self, reason: String) -> Vec<Action> {
        self.close();
        vec![Action::Close { reason }]
    }

    fn on_start(&mut self, data_only: bool) -> Vec<Action> {
        if self.role != Role::Originator || self.state != NegotiationState::Idle {
            debug!("ignoring start in {:?}", self.state);
            return Vec::new();
        }
        if data_only {
            self.connection_type = ConnectionType::Data;
        }
        self.state = NegotiationState::Offering;
        vec![Action::CreateOffer {
            receive_media: !data_only,
        }]
    }

    fn on_offer(&mut self, offer: OfferPayload) -> Vec<Action> {
        if self.role != Role::Answerer || self.state != NegotiationState::AwaitingOffer {
            debug!("ignoring offer from {} in {:?}", self.peer.short(), self.state);
            return Vec::new();
        }
        self.connection_type = offer.connection_type;
        self.offer = Some(offer);
        Vec::new()
    }

    fn on_accept(&mut self) -> Vec<Action> {
        if self.state != NegotiationState::AwaitingOffer {
            return Vec::new();
        }
        match self.offer.take() {
            Some(offer) => {
                self.state = NegotiationState::Answering;
                vec![Action::ApplyRemoteDescription(offer.sdp)]
            }
            None => {
                warn!("accept without an offer from {}", self.peer.short());
                Vec::new()
            }
        }
    }

    fn on_local_description(&mut self, desc: SessionDescription) -> Vec<Action> {
        match self.state {
            NegotiationState::Offering => {
                self.state = NegotiationState::AwaitingAnswer;
                let payload = OfferPayload {
                    sdp: desc,
                    connection_type: self.connection_type,
                    config: Some(self.ice.clone()),
                };
                vec![signal(SignalKind::Offer, to_value(&payload), true)]
            }
            NegotiationState::Answering => {
                vec![signal(
                    SignalKind::Answer,
                    to_value(&AnswerPayload { sdp: desc }),
                    true,
                )]
            }
            _ => Vec::new(),
        }
    }

    fn on_remote_applied(&mut self) -> Vec<Action> {
        self.remote_applied = true;
        let mut actions = Vec::new();
        if self.state == NegotiationState::Answering {
            actions.push(Action::CreateAnswer);
        }
        if !self.pending_candidates.is_empty() {
            debug!(
                "replaying {} early candidates from {}",
                self.pending_candidates.len(),
                self.peer.short()
            );
        }
        actions.extend(self.pending_candidates.drain(..).map(Action::AddCandidate));
        actions
    }

    fn on_signal(&mut self, env: SignalEnvelope) -> Vec<Action> {
        match env.kind {
            SignalKind::Answer => {
                if self.state != NegotiationState::AwaitingAnswer || self.remote_applied {
                    debug!("ignoring answer from {} in {:?}", self.peer.short(), self.state);
                    return Vec::new();
                }
                match serde_json::from_value::<AnswerPayload>(env.payload) {
                    Ok(answer) => vec![Action::ApplyRemoteDescription(answer.sdp)],
                    Err(e) => self.fail(format!("malformed answer: {}", e)),
                }
            }
            SignalKind::Candidate => {
                let candidate = match serde_json::from_value::<CandidatePayload>(env.payload) {
                    Ok(p) => p.candidate,
                    Err(e) => {
                        warn!("malformed candidate from {}: {}", self.peer.short(), e);
                        return Vec::new();
                    }
                };
                if self.remote_applied {
                    return vec![Action::AddCandidate(candidate)];
                }
                if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                    warn!(
                        "dropping candidate from {}: no remote description yet",
                        self.peer.short()
                    );
                } else {
                    self.pending_candidates.push(candidate);
                }
                Vec::new()
            }
            SignalKind::Leave | SignalKind::Expire => {
                debug!("{} signalled {:?}", self.peer.short(), env.kind);
                self.fail(format!("remote {:?}", env.kind).to_lowercase())
            }
            SignalKind::Error | SignalKind::IdTaken | SignalKind::InvalidKey => {
                warn!("{} signalled {:?}: {}", self.peer.short(), env.kind, env.payload);
                Vec::new()
            }
            SignalKind::Offer | SignalKind::Heartbeat | SignalKind::Open => {
                debug!("ignoring {:?} from {}", env.kind, self.peer.short());
                Vec::new()
            }
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        if self.ice_completed || candidate.candidate.is_empty() {
            return Vec::new();
        }
        vec![signal(
            SignalKind::Candidate,
            to_value(&CandidatePayload { candidate }),
            false,
        )]
    }

    fn on_ice_state(&mut self, s: IceConnectionState) -> Vec<Action> {
        let mut actions = vec![Action::IceStateChanged(s)];
        if s == IceConnectionState::Completed {
            self.ice_completed = true;
        }
        if s.is_connected() && self.state != NegotiationState::Connected {
            self.state = NegotiationState::Connected;
            actions.push(Action::Connected);
        } else if s.is_terminal() {
            debug!("ice {} with {}, closing", s.as_str(), self.peer.short());
            actions.extend(self.fail(format!("ice {}", s.as_str())));
        } else if s == IceConnectionState::Disconnected {
            debug!("ice disconnected with {}", self.peer.short());
        }
        actions
    }
}

fn signal(kind: SignalKind, payload: Value, immediate: bool) -> Action {
    Action::Signal {
        kind,
        payload,
        immediate,
    }
}

fn to_value<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}
