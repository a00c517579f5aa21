//! ERP VAU Core — secure transport and HSM key management
//!
//! The trusted execution environment of an e-prescription backend receives
//! end-to-end encrypted requests, derives the content keys through an HSM and
//! answers with responses encrypted under a client chosen key. Alongside, it
//! validates VSDM presence proofs submitted by pharmacies.

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod health;
pub mod hsm;
pub mod tee;
pub mod vsdm;

pub use config::VauConfig;
pub use context::VauContext;
pub use error::{HttpStatus, Result, VauError};
pub use health::HealthReport;
pub use hsm::{HsmFactory, HsmSessionPool, PoolSession};
pub use tee::{InnerRequest, InnerResponse, OuterResponse, TeeProtocol};
pub use vsdm::{ProofValidator, VsdmKey, VsdmProof};
