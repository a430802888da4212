//! The state machine behind one presentment session.
//!
//! The UI observes [`PresentmentModel::watch_state`] and answers prompts with
//! [`PresentmentModel::document_selected`] and [`PresentmentModel::consent_reviewed`]. The
//! protocol flow runs as a task owned by the session and waits on those answers.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;

use crate::config::PresentmentConfig;
use crate::definitions::session::SessionData;
use crate::presentment::error::{Error, Outcome};
use crate::presentment::mechanism::PresentmentMechanism;
use crate::presentment::source::{
    DocumentInfo, MdocCredential, MdocRequest, PresentmentSource, TrustPoint,
};
use crate::presentment::{digital_credentials, mdoc};
use crate::transport::{SharedTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Idle,
    Connecting,
    WaitingForSource,
    Processing,
    WaitingForDocumentSelection,
    WaitingForConsent,
    Completed,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Idle => "IDLE",
            StateKind::Connecting => "CONNECTING",
            StateKind::WaitingForSource => "WAITING_FOR_SOURCE",
            StateKind::Processing => "PROCESSING",
            StateKind::WaitingForDocumentSelection => "WAITING_FOR_DOCUMENT_SELECTION",
            StateKind::WaitingForConsent => "WAITING_FOR_CONSENT",
            StateKind::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

/// What the consent prompt shows.
#[derive(Debug, Clone)]
pub struct ConsentData {
    pub document: DocumentInfo,
    pub request: MdocRequest,
    pub trust_point: Option<TrustPoint>,
}

/// Session state. Prompt data only exists while its prompt is showing.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Connecting,
    WaitingForSource,
    Processing,
    WaitingForDocumentSelection {
        available_documents: Vec<DocumentInfo>,
    },
    WaitingForConsent(ConsentData),
    Completed {
        error: Option<Arc<Error>>,
    },
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Idle => StateKind::Idle,
            State::Connecting => StateKind::Connecting,
            State::WaitingForSource => StateKind::WaitingForSource,
            State::Processing => StateKind::Processing,
            State::WaitingForDocumentSelection { .. } => StateKind::WaitingForDocumentSelection,
            State::WaitingForConsent(_) => StateKind::WaitingForConsent,
            State::Completed { .. } => StateKind::Completed,
        }
    }
}

/// How the user dismissed the presentment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissType {
    /// Tell the reader with a session termination status, then close.
    Click,
    /// Use transport-specific termination, then close.
    LongClick,
    /// Close without telling the reader.
    DoubleClick,
}

enum Prompt {
    Picker {
        candidates: Vec<Arc<dyn MdocCredential>>,
        reply: oneshot::Sender<Option<Arc<dyn MdocCredential>>>,
    },
    Consent {
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Default)]
struct Session {
    mechanism: Option<PresentmentMechanism>,
    source: Option<Arc<dyn PresentmentSource>>,
    /// Every task belonging to the session. Dropping it cancels them.
    scope: Option<JoinSet<()>>,
    prompt: Option<Prompt>,
    /// Bumped whenever a session starts or is reset, so delayed work can tell it is stale.
    generation: u64,
}

struct Shared {
    config: PresentmentConfig,
    session: Mutex<Session>,
    state: watch::Sender<State>,
    dismissable: watch::Sender<bool>,
    num_requests_served: watch::Sender<usize>,
}

/// Handle to a presentment session. Clones share the session.
#[derive(Clone)]
pub struct PresentmentModel {
    shared: Arc<Shared>,
}

impl Default for PresentmentModel {
    fn default() -> Self {
        Self::new(PresentmentConfig::default())
    }
}

impl PresentmentModel {
    pub fn new(config: PresentmentConfig) -> Self {
        PresentmentModel {
            shared: Arc::new(Shared {
                config,
                session: Mutex::new(Session::default()),
                state: watch::channel(State::Idle).0,
                dismissable: watch::channel(true).0,
                num_requests_served: watch::channel(0).0,
            }),
        }
    }

    pub fn config(&self) -> &PresentmentConfig {
        &self.shared.config
    }

    pub fn state(&self) -> State {
        self.shared.state.borrow().clone()
    }

    pub fn state_kind(&self) -> StateKind {
        self.shared.state.borrow().kind()
    }

    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.shared.state.subscribe()
    }

    /// Whether the UI should offer to cancel.
    pub fn dismissable(&self) -> bool {
        *self.shared.dismissable.borrow()
    }

    pub fn watch_dismissable(&self) -> watch::Receiver<bool> {
        self.shared.dismissable.subscribe()
    }

    pub fn set_dismissable(&self, dismissable: bool) {
        self.shared.dismissable.send_replace(dismissable);
    }

    pub fn num_requests_served(&self) -> usize {
        *self.shared.num_requests_served.borrow()
    }

    pub fn watch_num_requests_served(&self) -> watch::Receiver<usize> {
        self.shared.num_requests_served.subscribe()
    }

    /// The error the session completed with.
    pub fn error(&self) -> Option<Arc<Error>> {
        match &*self.shared.state.borrow() {
            State::Completed { error } => error.clone(),
            _ => None,
        }
    }

    /// How the session ended, once completed.
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.shared.state.borrow() {
            State::Completed { error } => Some(Outcome::of(error.as_deref())),
            _ => None,
        }
    }

    fn set_state(&self, state: State) {
        let previous = self.state_kind();
        tracing::debug!("presentment: {previous} -> {}", state.kind());
        self.shared.state.send_replace(state);
    }

    fn require(&self, expected: StateKind) -> Result<(), Error> {
        let actual = self.state_kind();
        if actual != expected {
            tracing::error!("presentment expected state {expected}, was {actual}");
            return Err(Error::IllegalState { expected, actual });
        }
        Ok(())
    }

    /// Starts a session. The caller is establishing a connection.
    pub fn set_connecting(&self) -> Result<(), Error> {
        let mut session = self.shared.session.lock();
        self.require(StateKind::Idle)?;
        session.generation += 1;
        session.scope = Some(JoinSet::new());
        self.set_state(State::Connecting);
        Ok(())
    }

    /// Hands the session the mechanism to answer over. The session owns it from now on.
    pub fn set_mechanism(&self, mechanism: PresentmentMechanism) -> Result<(), Error> {
        let mut session = self.shared.session.lock();
        self.require(StateKind::Connecting)?;
        tracing::info!("presenting over {mechanism:?}");
        session.mechanism = Some(mechanism);
        self.set_state(State::WaitingForSource);
        Ok(())
    }

    /// Provides the credentials and policy, and starts answering requests.
    pub fn set_source(&self, source: Arc<dyn PresentmentSource>) -> Result<(), Error> {
        let mut session = self.shared.session.lock();
        self.require(StateKind::WaitingForSource)?;
        let mechanism = session.mechanism.clone().ok_or(Error::IllegalState {
            expected: StateKind::WaitingForSource,
            actual: StateKind::Connecting,
        })?;
        session.source = Some(source.clone());
        self.set_state(State::Processing);
        let model = self.clone();
        session
            .scope
            .get_or_insert_with(JoinSet::new)
            .spawn(async move { model.run(mechanism, source).await });
        Ok(())
    }

    async fn run(self, mechanism: PresentmentMechanism, source: Arc<dyn PresentmentSource>) {
        let result = match &mechanism {
            PresentmentMechanism::Mdoc(mechanism) => {
                mdoc::mdoc_presentment(&self, mechanism, source.as_ref()).await
            }
            PresentmentMechanism::DigitalCredentials(mechanism) => {
                digital_credentials::digital_credentials_presentment(
                    &self,
                    mechanism,
                    source.as_ref(),
                )
                .await
            }
        };
        if let Err(e) = &result {
            tracing::error!("presentment failed: {e}");
        }
        self.set_completed(result.err()).await;
    }

    /// Asks the user which of `candidates` to present. Returns `None` if they picked none.
    ///
    /// The candidates must come from distinct documents.
    pub async fn show_credential_picker(
        &self,
        candidates: Vec<Arc<dyn MdocCredential>>,
    ) -> Result<Option<Arc<dyn MdocCredential>>, Error> {
        let answer = {
            let mut session = self.shared.session.lock();
            self.require(StateKind::Processing)?;
            {
                let mut seen = HashSet::new();
                for candidate in &candidates {
                    if !seen.insert(candidate.document_id()) {
                        tracing::error!("{} offered twice", candidate.document_id());
                        return Err(Error::DuplicateDocuments(
                            candidate.document_id().to_string(),
                        ));
                    }
                }
            }
            let available_documents = candidates
                .iter()
                .map(|candidate| DocumentInfo::of(candidate.as_ref()))
                .collect();
            let (reply, answer) = oneshot::channel();
            session.prompt = Some(Prompt::Picker { candidates, reply });
            self.set_state(State::WaitingForDocumentSelection {
                available_documents,
            });
            answer
        };
        answer.await.map_err(|_| Error::Cancelled)
    }

    /// The user's answer to the credential picker, `None` to present nothing.
    pub fn document_selected(&self, document_id: Option<&str>) -> Result<(), Error> {
        let mut session = self.shared.session.lock();
        self.require(StateKind::WaitingForDocumentSelection)?;
        let Some(Prompt::Picker { candidates, reply }) = session.prompt.take() else {
            return Err(Error::IllegalState {
                expected: StateKind::WaitingForDocumentSelection,
                actual: StateKind::Processing,
            });
        };
        let selected = match document_id {
            None => None,
            Some(document_id) => {
                let found = candidates
                    .iter()
                    .find(|candidate| candidate.document_id() == document_id)
                    .cloned();
                if found.is_none() {
                    session.prompt = Some(Prompt::Picker { candidates, reply });
                    return Err(Error::UnknownDocument(document_id.to_string()));
                }
                found
            }
        };
        tracing::info!("document selected: {document_id:?}");
        self.set_state(State::Processing);
        if reply.send(selected).is_err() {
            tracing::warn!("credential picker answered after the presentment moved on");
        }
        Ok(())
    }

    /// Asks the user to approve sending `credential` in answer to `request`.
    pub async fn show_consent_prompt(
        &self,
        credential: Arc<dyn MdocCredential>,
        request: MdocRequest,
        trust_point: Option<TrustPoint>,
    ) -> Result<bool, Error> {
        let answer = {
            let mut session = self.shared.session.lock();
            self.require(StateKind::Processing)?;
            let (reply, answer) = oneshot::channel();
            session.prompt = Some(Prompt::Consent { reply });
            self.set_state(State::WaitingForConsent(ConsentData {
                document: DocumentInfo::of(credential.as_ref()),
                request,
                trust_point,
            }));
            answer
        };
        answer.await.map_err(|_| Error::Cancelled)
    }

    pub fn consent_reviewed(&self, consent_obtained: bool) -> Result<(), Error> {
        let mut session = self.shared.session.lock();
        self.require(StateKind::WaitingForConsent)?;
        let Some(Prompt::Consent { reply }) = session.prompt.take() else {
            return Err(Error::IllegalState {
                expected: StateKind::WaitingForConsent,
                actual: StateKind::Processing,
            });
        };
        tracing::info!("consent obtained: {consent_obtained}");
        self.set_state(State::Processing);
        if reply.send(consent_obtained).is_err() {
            tracing::warn!("consent given after the presentment moved on");
        }
        Ok(())
    }

    /// Counts a response sent to the reader.
    pub fn request_served(&self) {
        self.shared.num_requests_served.send_modify(|served| *served += 1);
    }

    /// Ends the session, releasing the mechanism. Calling it again has no effect.
    ///
    /// The session's tasks are cancelled once the configured grace period has passed.
    pub async fn set_completed(&self, error: Option<Error>) {
        let (mechanism, generation) = {
            let mut session = self.shared.session.lock();
            if self.state_kind() == StateKind::Completed {
                tracing::warn!("presentment already completed, ignoring {error:?}");
                return;
            }
            (self.complete_locked(&mut session, error), session.generation)
        };
        self.release(mechanism).await;
        self.cancel_scope_after_grace(generation);
    }

    fn complete_locked(
        &self,
        session: &mut Session,
        error: Option<Error>,
    ) -> Option<PresentmentMechanism> {
        match &error {
            None => tracing::info!("presentment completed"),
            Some(error) => tracing::info!("presentment completed: {error}"),
        }
        session.prompt = None;
        self.shared.dismissable.send_replace(false);
        self.set_state(State::Completed {
            error: error.map(Arc::new),
        });
        session.mechanism.take()
    }

    /// Closes the mechanism on its own task, so cancelling the caller can't interrupt it.
    async fn release(&self, mechanism: Option<PresentmentMechanism>) {
        let Some(mechanism) = mechanism else {
            return;
        };
        if let Err(e) = tokio::spawn(async move { mechanism.close().await }).await {
            tracing::warn!("closing presentment mechanism failed: {e}");
        }
    }

    fn cancel_scope_after_grace(&self, generation: u64) {
        let grace = self.shared.config.completion_grace();
        let mut session = self.shared.session.lock();
        if session.generation != generation {
            return;
        }
        let model = self.clone();
        if let Some(scope) = session.scope.as_mut() {
            scope.spawn(async move {
                tokio::time::sleep(grace).await;
                model.cancel_scope(generation);
            });
        }
    }

    fn cancel_scope(&self, generation: u64) {
        let scope = {
            let mut session = self.shared.session.lock();
            if session.generation != generation {
                return;
            }
            session.scope.take()
        };
        tracing::debug!("cancelling presentment tasks");
        drop(scope);
    }

    /// The user cancelled the presentment. The reader is told according to `dismiss_type`, on a
    /// best-effort basis, and the session completes with [`Error::Cancelled`].
    pub async fn dismiss(&self, dismiss_type: DismissType) {
        let (mechanism, generation) = {
            let mut session = self.shared.session.lock();
            match self.state_kind() {
                StateKind::Idle | StateKind::Completed => {
                    tracing::warn!("nothing to dismiss in state {}", self.state_kind());
                    return;
                }
                _ => {}
            }
            tracing::info!("presentment dismissed with {dismiss_type:?}");
            (
                self.complete_locked(&mut session, Some(Error::Cancelled)),
                session.generation,
            )
        };
        if let Some(PresentmentMechanism::Mdoc(mdoc)) = &mechanism {
            notify_termination(&mdoc.transport, dismiss_type).await;
        }
        self.release(mechanism).await;
        self.cancel_scope_after_grace(generation);
    }

    /// Returns to `Idle` from any state, cancelling the session's tasks and releasing the
    /// mechanism.
    pub async fn reset(&self) {
        let (mechanism, scope) = {
            let mut session = self.shared.session.lock();
            session.generation += 1;
            session.prompt = None;
            session.source = None;
            let mechanism = session.mechanism.take();
            let scope = session.scope.take();
            self.set_state(State::Idle);
            self.shared.dismissable.send_replace(true);
            self.shared.num_requests_served.send_replace(0);
            (mechanism, scope)
        };
        drop(scope);
        self.release(mechanism).await;
    }
}

async fn notify_termination(transport: &SharedTransport, dismiss_type: DismissType) {
    match dismiss_type {
        DismissType::Click => send_termination_status(transport).await,
        DismissType::LongClick => match transport.send_message(&[]).await {
            Ok(()) => {}
            Err(TransportError::TerminationUnsupported) => {
                tracing::debug!("no transport-specific termination, sending status instead");
                send_termination_status(transport).await;
            }
            Err(e) => tracing::warn!("unable to send transport-specific termination: {e}"),
        },
        DismissType::DoubleClick => tracing::info!("closing without telling the reader"),
    }
}

async fn send_termination_status(transport: &SharedTransport) {
    use coset::CborSerializable;

    let message = match SessionData::termination().to_vec() {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("unable to encode session termination: {e}");
            return;
        }
    };
    if let Err(e) = transport.send_message(&message).await {
        tracing::warn!("unable to send session termination: {e}");
    }
}
