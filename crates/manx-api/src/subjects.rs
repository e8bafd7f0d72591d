// Subject hierarchy for consumer API requests and advisories.

pub const API_CONSUMER_CREATE_PREFIX: &str = "$JS.API.CONSUMER.CREATE";
pub const API_CONSUMER_DURABLE_CREATE_PREFIX: &str = "$JS.API.CONSUMER.DURABLE.CREATE";
pub const API_CONSUMER_MSG_NEXT_PREFIX: &str = "$JS.API.CONSUMER.MSG.NEXT";
pub const API_CONSUMER_UNPIN_PREFIX: &str = "$JS.API.CONSUMER.UNPIN";
pub const ADVISORY_CONSUMER_PREFIX: &str = "$JS.EVENT.ADVISORY.CONSUMER";

pub const ADVISORY_KIND_PINNED: &str = "PINNED";
pub const ADVISORY_KIND_UNPINNED: &str = "UNPINNED";
pub const ADVISORY_KIND_MAX_DELIVERIES: &str = "MAX_DELIVERIES";
pub const ADVISORY_KIND_TERMINATED: &str = "TERMINATED";
pub const ADVISORY_KIND_PENDING_DROPPED: &str = "PENDING_DROPPED";

/// Create subject for an ephemeral consumer.
pub fn consumer_create(stream: &str, consumer: &str) -> String {
    format!("{API_CONSUMER_CREATE_PREFIX}.{stream}.{consumer}")
}

/// Create subject for a durable consumer.
pub fn consumer_durable_create(stream: &str, consumer: &str) -> String {
    format!("{API_CONSUMER_DURABLE_CREATE_PREFIX}.{stream}.{consumer}")
}

/// Pull-next subject for a consumer.
pub fn msg_next(stream: &str, consumer: &str) -> String {
    format!("{API_CONSUMER_MSG_NEXT_PREFIX}.{stream}.{consumer}")
}

pub fn unpin(stream: &str, consumer: &str) -> String {
    format!("{API_CONSUMER_UNPIN_PREFIX}.{stream}.{consumer}")
}

pub fn advisory(kind: &str, stream: &str, consumer: &str) -> String {
    format!("{ADVISORY_CONSUMER_PREFIX}.{kind}.{stream}.{consumer}")
}
