pub mod broker;
pub mod claims;
pub mod entra;
pub mod graph;
pub mod session;

pub use broker::{TokenBroker, TokenProvider, TokenStrategy};
pub use entra::EntraClient;
pub use graph::GraphClient;
pub use session::{AuthenticatedIdentity, DelegationMode, IdentityService, IdentitySession};
