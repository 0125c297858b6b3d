pub mod credentials;
pub mod mock;
pub mod ops;
pub mod sse;
pub mod transport;

pub use credentials::CredentialProvider;
pub use mock::{Decision, MockApi, MockSubscription};
pub use ops::{Machine, SpawnOutcome, SpawnRequest};
pub use sse::{SseEventStream, SseLineBuffer};
pub use transport::{ClientConfig, HapiClient};
