// TURN module: relay credentials and the embedded relay
//
// Credentials follow the TURN REST convention so that the HTTP API and the
// embedded relay (webrtc-rs `turn`) agree on every username they see.

pub mod config;
pub mod credentials;
pub mod server;


// Re-export commonly used types
pub use config::RelayConfig;
pub use credentials::{Credential, CredentialError, CredentialMinter, RelayAuthenticator, SharedSecret};
pub use server::RelayServer;
