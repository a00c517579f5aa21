//! VAU Transport — encrypted request channel between clients and the VAU
//!
//! - **envelope**: fixed binary layout of the outer request
//! - **inner**: decrypted request and response formats
//! - **protocol**: server side decrypt/encrypt with HSM key derivation
//! - **client**: client side request builder and response reader

pub mod client;
pub mod envelope;
pub mod inner;
pub mod protocol;

pub use client::ClientTeeProtocol;
pub use envelope::{OuterEnvelope, COORDINATE_LENGTH, FIXED_LENGTH};
pub use inner::{InnerRequest, InnerResponse, INNER_VERSION, RESPONSE_KEY_LENGTH};
pub use protocol::{OuterResponse, TeeProtocol, OUTER_RESPONSE_CONTENT_TYPE, OUTER_VERSION};
