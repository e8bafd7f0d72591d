// Header names and status values carried on delivered messages and
// status-only replies.

pub const PIN_ID: &str = "Nats-Pin-Id";
pub const STATUS: &str = "Status";
pub const DESCRIPTION: &str = "Description";

pub const STATUS_BAD_REQUEST: &str = "400";
pub const STATUS_NO_MESSAGES: &str = "404";
pub const STATUS_REQUEST_TIMEOUT: &str = "408";
pub const STATUS_CONFLICT: &str = "409";
pub const STATUS_WRONG_PIN: &str = "423";

pub const DESC_NO_MESSAGES: &str = "No Messages";
pub const DESC_REQUEST_TIMEOUT: &str = "Request Timeout";
pub const DESC_CONSUMER_DELETED: &str = "Consumer Deleted";
pub const DESC_WRONG_PIN: &str = "Wrong Pin Id";
pub const DESC_GROUP_MISSING: &str = "Bad Request - Priority Group missing";
pub const DESC_INVALID_GROUP: &str = "Bad Request - Invalid Priority Group";
pub const DESC_NOT_PINNED_CONSUMER: &str = "Bad Request - Not a Pinned Client Priority consumer";
pub const DESC_NOT_OVERFLOW_CONSUMER: &str = "Bad Request - Not a Overflow Priority consumer";
pub const DESC_PRIORITY_NOT_SUPPORTED: &str = "Bad Request - Not a Priority consumer";
pub const DESC_MAX_DELIVERIES: &str = "Maximum Deliveries Exceeded";

pub fn exceeded_max_request_batch(cap: u64) -> String {
    format!("Exceeded MaxRequestBatch of {cap}")
}
