#![forbid(unsafe_code)]

use cohort_domain::{EntityKey, EntityKind, ParticipantId};
use thiserror::Error;

/// Failures reported by dispatcher and registry handles.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
	/// The dispatcher's mailbox is closed; it is terminating or gone.
	#[error("dispatcher for {0} terminated")]
	Terminated(EntityKey),

	#[error("dispatcher registry is closed")]
	RegistryClosed,

	#[error("participant {0} has no open channel")]
	ParticipantNotFound(ParticipantId),

	#[error("cannot move a channel from a {from} to a {to}")]
	KindMismatch { from: EntityKind, to: EntityKind },
}
