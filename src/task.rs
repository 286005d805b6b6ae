//! Work item descriptor and execution.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::context::{CallerContext, ContextGuard};

/// Opaque user payload, passed through to the job verbatim and handed back
/// to panic subscribers.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Boxed work-item callable. Receives the pool's cancellation token and
/// the payload supplied at submission.
pub type Job = Box<dyn FnOnce(&CancelToken, Option<&UserData>) + Send + 'static>;

/// Report delivered to panic subscribers when a work item escapes.
#[derive(Clone)]
pub struct WorkItemPanic {
    /// Rendered panic payload.
    pub message: String,
    /// The payload supplied at submission, if any.
    pub user_data: Option<UserData>,
}

impl std::fmt::Debug for WorkItemPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemPanic")
            .field("message", &self.message)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

/// An inert descriptor of one submitted callable. Immutable after
/// construction; consumed exactly once by the executing worker.
pub(crate) struct WorkItem {
    job: Job,
    user_data: Option<UserData>,
    token: CancelToken,
    context: Option<CallerContext>,
}

impl WorkItem {
    pub(crate) fn new(
        job: Job,
        user_data: Option<UserData>,
        token: CancelToken,
        context: Option<CallerContext>,
    ) -> Self {
        WorkItem {
            job,
            user_data,
            token,
            context,
        }
    }

    /// Runs the callable, restoring any captured caller context around it.
    ///
    /// Returns a panic report if the callable escaped; the caller routes it
    /// to subscribers. The worker itself never unwinds.
    pub(crate) fn execute(self) -> Option<WorkItemPanic> {
        let WorkItem {
            job,
            user_data,
            token,
            context,
        } = self;

        let _guard = context.map(|ctx| ContextGuard::install(Some(ctx)));
        let outcome = catch_unwind(AssertUnwindSafe(|| job(&token, user_data.as_ref())));

        match outcome {
            Ok(()) => None,
            Err(payload) => Some(WorkItemPanic {
                message: panic_message(&*payload),
                user_data,
            }),
        }
    }
}

/// Renders a panic payload into a message string.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
