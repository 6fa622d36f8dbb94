//! Client-side synchronization for chat conversations: cached sessions, optimistic sends,
//! history reconciliation, push delivery and the polling fallback behind it.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod polling;
pub mod push;
pub mod reconcile;
pub mod scheduler;
pub mod status;
pub mod transport;
pub mod view_model;

pub use config::{load_config, EngineConfig};
pub use engine::{ConversationEngine, EngineDependencies, EngineEvent, Surface};
pub use error::{DispatchError, PushError, TransportError};
pub use push::{PushChannelClient, PushState, WebSocketTransport};
pub use transport::{AssistantApi, DirectChatApi};
pub use view_model::{ConversationView, SessionSummary};
