//! §6 authentication: token verification and the handshake origin gate.

pub mod gate;
pub mod token;

pub use gate::OriginGate;
pub use token::{Identity, TokenVerifier};
