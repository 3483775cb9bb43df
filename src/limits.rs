use std::time::Duration;

/// Longest service or category name, in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Longest service or category description, in bytes.
pub const MAX_DESCRIPTION_LEN: usize = 2048;

/// Longest cancellation reason, in bytes.
pub const MAX_REASON_LEN: usize = 1024;

/// Longest review comment, in bytes.
pub const MAX_COMMENT_LEN: usize = 4096;

/// Longest opaque photo token accepted from the media store.
pub const MAX_PHOTO_REF_LEN: usize = 512;

/// A service must fit inside a single calendar day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 12 * 60;

/// Upper bound on concurrently open review drafts.
pub const MAX_OPEN_DRAFTS: usize = 10_000;

/// Upper bound on `top_services_by_category` page size.
pub const MAX_TOP_SERVICES: usize = 100;

/// How long a single notification send may take before it counts as failed.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
