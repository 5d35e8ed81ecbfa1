use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Pub/sub session the publisher talks through.
///
/// Both calls must return promptly; a transport that cannot send right away
/// reports an error instead of blocking.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;

    fn subscribe(&self, topic: &str) -> Result<(), PublishError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        (**self).publish(topic, payload)
    }

    fn subscribe(&self, topic: &str) -> Result<(), PublishError> {
        (**self).subscribe(topic)
    }
}
