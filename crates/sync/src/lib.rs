//! Request coordination and live invalidation for the vitrine admin console.
//!
//! Screens of the console (product editor, order list and detail, notification inbox)
//! all follow the same pattern: load remote state, keep it fresh when the server pushes
//! a change, and submit writes without double-posting. This crate provides the pieces:
//! * [`FetchGuard`]: single-flight loads per logical key with stale-result dropping
//! * [`MutationSubmitter`]: one pending write per entity, normalized outcomes
//! * [`LiveSubscriber`]: one reconnecting push connection per session, fanned out to subscriptions
//! * [`ViewCoordinator`]: per-screen state machine tying the three together
//!
//! The REST API and the live transport are collaborators supplied by the caller through
//! [`Resource`], plain closures, and [`LiveTransport`].

#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod key;
pub mod live;
pub mod submit;
mod task;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{LiveConfig, SyncConfig};
pub use coordinator::{LoadReport, MutationStatus, NavigationSignal, RefreshTrigger, Resource, ViewCoordinator, ViewPhase, ViewState};
pub use error::{ApiError, ConfigError, LiveError, SessionError, ValidationErrors};
pub use guard::{FetchGuard, FetchOutcome, Fetched};
pub use key::{EntityId, ResourceKey, ResourceKind};
pub use live::{ConnectOutcome, EventFilter, EventKind, LinkStatus, LiveStream, LiveSubscriber, LiveTransport, PushEvent, Subscription, WireMessage};
pub use submit::{MutationKind, MutationOutcome, MutationReceipt, MutationSubmitter, MutationTicket, PendingMutation};
pub use token::{AbortSignal, RequestToken};
