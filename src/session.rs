//! Lifecycle of one file transfer between this endpoint and one counterpart.
//!
//! ```text
//! Idle -> Requesting (initiator) / Receiving (responder)
//!      -> Rejected | Accepted -> Connecting -> Transferring -> Completed | Failed
//! ```
//!
//! Every non-idle, non-terminal state can fall to `Failed`. Terminal states
//! go back to `Idle` through [`TransferSession::reset`]. The type does no I/O;
//! the client feeds it events and acts on the results.

use std::fmt;

use log::debug;

use crate::error::{Error, Result};
use crate::messages::{ConnectionId, FileMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issued the request; becomes the offerer and sends the bytes.
    Initiator,
    /// Received the request; becomes the answerer and receives the bytes.
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PeerGone,
    Declined,
    Handshake(String),
    Transport(String),
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PeerGone => write!(f, "peer gone"),
            FailureReason::Declined => write!(f, "peer declined"),
            FailureReason::Handshake(e) => write!(f, "handshake failure: {}", e),
            FailureReason::Transport(e) => write!(f, "transport error: {}", e),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<Error> for FailureReason {
    fn from(error: Error) -> Self {
        match error {
            Error::PeerGone => FailureReason::PeerGone,
            Error::Declined => FailureReason::Declined,
            Error::Cancelled => FailureReason::Cancelled,
            Error::HandshakeFailure(e) => FailureReason::Handshake(e),
            Error::TransportError(e) => FailureReason::Transport(e),
            other => FailureReason::Transport(other.to_string()),
        }
    }
}

/// How a failed session is reported to callers that want a `Result`.
impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::PeerGone => Error::PeerGone,
            FailureReason::Declined => Error::Declined,
            FailureReason::Handshake(e) => Error::HandshakeFailure(e),
            FailureReason::Transport(e) => Error::TransportError(e),
            FailureReason::Cancelled => Error::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Requesting,
    Receiving,
    Rejected,
    Accepted,
    Connecting,
    Transferring,
    Completed,
    Failed(FailureReason),
}

impl SessionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Requesting => "requesting",
            SessionStatus::Receiving => "receiving",
            SessionStatus::Rejected => "rejected",
            SessionStatus::Accepted => "accepted",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Transferring => "transferring",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Rejected | SessionStatus::Completed | SessionStatus::Failed(_)
        )
    }
}

/// Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: ConnectionId,
    pub to: ConnectionId,
    pub file: FileMeta,
}

/// Progress of the offer/answer exchange. Candidates are counted separately
/// because they flow independently of the descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationState {
    pub local_description_sent: bool,
    pub remote_description_received: bool,
    pub candidates_sent: u32,
    pub candidates_applied: u32,
}

#[derive(Debug, Clone)]
pub struct TransferSession {
    request: TransferRequest,
    role: Role,
    status: SessionStatus,
    transferred_bytes: u64,
    negotiation: NegotiationState,
}

impl TransferSession {
    /// `Idle -> Requesting`.
    pub fn outbound(request: TransferRequest) -> Result<Self> {
        Self::start(request, Role::Initiator)
    }

    /// `Idle -> Receiving`.
    pub fn inbound(request: TransferRequest) -> Result<Self> {
        Self::start(request, Role::Responder)
    }

    fn start(request: TransferRequest, role: Role) -> Result<Self> {
        request.file.validate()?;
        let status = match role {
            Role::Initiator => SessionStatus::Requesting,
            Role::Responder => SessionStatus::Receiving,
        };
        Ok(TransferSession {
            request,
            role,
            status,
            transferred_bytes: 0,
            negotiation: NegotiationState::default(),
        })
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn negotiation(&self) -> &NegotiationState {
        &self.negotiation
    }

    pub fn counterpart(&self) -> ConnectionId {
        match self.role {
            Role::Initiator => self.request.to,
            Role::Responder => self.request.from,
        }
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.request.file.size
    }

    pub fn is_offerer(&self) -> bool {
        self.role == Role::Initiator
    }

    /// Neither idle nor terminal.
    pub fn is_active(&self) -> bool {
        self.status != SessionStatus::Idle && !self.status.is_terminal()
    }

    fn transition(&mut self, to: SessionStatus) {
        debug!(
            "Session with {}: {} -> {}",
            self.counterpart(),
            self.status.name(),
            to.name()
        );
        self.status = to;
    }

    fn invalid(&self, event: &'static str) -> Error {
        Error::InvalidTransition {
            state: self.status.name(),
            event,
        }
    }

    /// Responder: `Receiving -> Accepted`.
    pub fn accept(&mut self) -> Result<()> {
        match (self.role, &self.status) {
            (Role::Responder, SessionStatus::Receiving) => {
                self.transition(SessionStatus::Accepted);
                Ok(())
            }
            _ => Err(self.invalid("accept")),
        }
    }

    /// Responder: `Receiving -> Rejected`.
    pub fn reject(&mut self) -> Result<()> {
        match (self.role, &self.status) {
            (Role::Responder, SessionStatus::Receiving) => {
                self.transition(SessionStatus::Rejected);
                Ok(())
            }
            _ => Err(self.invalid("reject")),
        }
    }

    /// Initiator: `Requesting -> Accepted`.
    pub fn peer_accepted(&mut self) -> Result<()> {
        match (self.role, &self.status) {
            (Role::Initiator, SessionStatus::Requesting) => {
                self.transition(SessionStatus::Accepted);
                Ok(())
            }
            _ => Err(self.invalid("observe accept")),
        }
    }

    /// A `transfer-reject` from the counterpart. For the initiator this is a
    /// decline; for a responder still deciding, the request was withdrawn.
    pub fn peer_rejected(&mut self) -> Result<()> {
        match (self.role, &self.status) {
            (Role::Initiator, SessionStatus::Requesting) => {
                self.transition(SessionStatus::Failed(FailureReason::Declined));
                Ok(())
            }
            (Role::Responder, SessionStatus::Receiving) => {
                self.transition(SessionStatus::Failed(FailureReason::Cancelled));
                Ok(())
            }
            _ => Err(self.invalid("observe reject")),
        }
    }

    /// Our description went out: the offer for the offerer, the answer for
    /// the answerer. `Accepted -> Connecting`.
    pub fn local_description_sent(&mut self) -> Result<()> {
        if self.status != SessionStatus::Accepted {
            return Err(self.invalid("send description"));
        }
        self.negotiation.local_description_sent = true;
        self.transition(SessionStatus::Connecting);
        Ok(())
    }

    /// The counterpart's description arrived. The answerer receives the offer
    /// while `Accepted`; the offerer receives the answer while `Connecting`.
    pub fn remote_description_received(&mut self) -> Result<()> {
        let expected = if self.is_offerer() {
            SessionStatus::Connecting
        } else {
            SessionStatus::Accepted
        };
        if self.status != expected || self.negotiation.remote_description_received {
            return Err(self.invalid("receive description"));
        }
        self.negotiation.remote_description_received = true;
        Ok(())
    }

    fn negotiating(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Accepted | SessionStatus::Connecting | SessionStatus::Transferring
        )
    }

    pub fn candidate_sent(&mut self) -> Result<()> {
        if !self.negotiating() {
            return Err(self.invalid("send candidate"));
        }
        self.negotiation.candidates_sent += 1;
        Ok(())
    }

    pub fn candidate_applied(&mut self) -> Result<()> {
        if !self.negotiating() {
            return Err(self.invalid("apply candidate"));
        }
        self.negotiation.candidates_applied += 1;
        Ok(())
    }

    /// `Connecting -> Transferring`.
    pub fn channel_open(&mut self) -> Result<()> {
        if self.status != SessionStatus::Connecting {
            return Err(self.invalid("open channel"));
        }
        self.transition(SessionStatus::Transferring);
        Ok(())
    }

    /// Account `bytes` more bytes. Returns `true` once the transfer completed,
    /// which happens exactly when the running total reaches `total_bytes`.
    pub fn record_progress(&mut self, bytes: u64) -> Result<bool> {
        if self.status != SessionStatus::Transferring {
            return Err(self.invalid("record progress"));
        }
        let transferred = self.transferred_bytes.saturating_add(bytes);
        if transferred > self.total_bytes() {
            return Err(Error::TransportError(format!(
                "{} bytes exceed declared size {}",
                transferred,
                self.total_bytes()
            )));
        }
        self.transferred_bytes = transferred;
        if transferred == self.total_bytes() {
            self.transition(SessionStatus::Completed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Force `Failed`. Returns `false` when the session is idle or already
    /// terminal, in which case nothing changes.
    pub fn fail(&mut self, reason: FailureReason) -> bool {
        if !self.is_active() {
            return false;
        }
        self.transition(SessionStatus::Failed(reason));
        true
    }

    /// Terminal state -> `Idle`. Returns `false` if there was nothing to reset.
    pub fn reset(&mut self) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        self.transition(SessionStatus::Idle);
        true
    }
}
