//! The Master-Connection Protocol Engine: the chunk server's single
//! long-lived connection to the metadata master, its frame dispatch
//! table, registration-version negotiation, heartbeat/timeout handling,
//! and structure-log (changelog) sink.

pub mod connection;
pub mod outbound;
pub mod registration;
pub mod state;
pub mod structlog;

pub use connection::MasterConnection;
pub use outbound::OutputQueue;
pub use registration::{select_registration_version, RegistrationVersion};
pub use state::ConnectionState;
pub use structlog::ChangelogSink;
