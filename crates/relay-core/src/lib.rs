pub mod api;
pub mod content;
pub mod errors;
pub mod ids;
pub mod output;
pub mod session;

pub use api::{EventByteStream, HapiApi};
pub use errors::RelayError;
pub use ids::{MachineId, RequestId, SessionId};
pub use output::OutputLevel;
