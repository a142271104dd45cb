use thiserror::Error;

use crate::message::{BlockPresenceType, WantType};

/// Errors raised while validating input at the boundary of the exchange.
///
/// The engine itself assumes well formed identifiers and peers, so these only
/// surface from the parsing helpers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Error while parsing cid: {0}")]
    Cid(#[from] cid::Error),
    #[error("Invalid peer id {input:?}: {reason}")]
    PeerId { input: String, reason: String },
    #[error("Invalid block presence type {0}")]
    InvalidBlockPresenceType(#[from] num_enum::TryFromPrimitiveError<BlockPresenceType>),
    #[error("Invalid want type {0}")]
    InvalidWantType(#[from] num_enum::TryFromPrimitiveError<WantType>),
}
