//! Request pipeline: admission control, deduplication of concurrent reads,
//! and the interceptor chain that attaches credentials and recovers from
//! overload and authorization failures.

pub mod client;
pub mod dedup;
pub mod descriptor;
pub mod queue;

pub use client::{ApiClient, ApiResponse, Attempt, TokenRefresher};
pub use dedup::DedupCache;
pub use descriptor::RequestDescriptor;
pub use queue::RequestQueue;

use tokio::task::JoinError;

use crate::error::ApiError;

/// Map the failure of a spawned request task back onto the pipeline's
/// error type. A panic inside the request is re-raised in the caller.
pub(crate) fn task_failure(err: JoinError) -> ApiError {
    if err.is_panic() {
        std::panic::resume_unwind(err.into_panic());
    }
    ApiError::Disposed
}
