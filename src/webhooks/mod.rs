//! Webhook payload handling: signature verification and envelope extraction.

pub mod envelope;
pub mod signature;

pub use envelope::{PartialEnvelope, SUBJECT_WEBHOOK_RECEIVED, WebhookReceived};
pub use signature::{SignatureError, SignatureHeader, compute_signature, sign, verify};
