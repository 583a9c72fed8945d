pub use crate::infrastructure::events::{
    CoordinatorEvent, EventBus, EventEnvelope, SessionErrorPayload, SessionLifecyclePayload,
};
