use std::result;

pub type Result<T> = result::Result<T, ConsumerError>;

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("invalid consumer config: {0}")]
    InvalidConfig(String),
    #[error("pedantic mode: {0}")]
    Pedantic(String),
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("stream already exists: {0}")]
    StreamAlreadyExists(String),
    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),
    #[error("consumer already exists: {0}")]
    ConsumerAlreadyExists(String),
    #[error("filtered consumer not unique on work-queue stream (overlaps consumer {0:?})")]
    WorkQueueNotUnique(String),
    #[error("priority policy requires priority groups")]
    PriorityPolicyWithoutGroup,
    #[error("empty priority group name")]
    EmptyGroupName,
    #[error("invalid priority group name: {0:?}")]
    InvalidGroupName(String),
    #[error("unknown priority group: {0:?}")]
    InvalidPriorityGroup(String),
    #[error("exceeded max waiting requests ({0})")]
    MaxWaitingExceeded(usize),
    #[error("consumer is closed")]
    Closed,
}
