//! Causal resolution of the current execution context.
//!
//! The agent needs to answer "which invocation owns the code running right
//! now" without threading a context parameter through every function. The
//! host runtime exposes no continuation-creation hook to piggyback on, so
//! ownership is carried in tokio task-local storage instead:
//!
//! - [`ExecutionContextManager::run_with_context`] installs a context for the
//!   causal duration of a future. Everything awaited inside it, however
//!   deeply nested, resolves that context.
//! - A detached task created with `tokio::spawn` starts a new causal chain
//!   and resolves the sentinel context. Spawn boundaries are the one place a
//!   handle must be carried explicitly; wrap the spawned future with
//!   [`ContextFutureExt::with_execution_context`] to keep ownership.
//! - [`ExecutionContextManager::get`] never fails and never blocks. Unowned
//!   code gets the inert sentinel, so instrumentation in shared libraries is
//!   always safe to call.
//!
//! # Example
//!
//! ```
//! use lambda_apm_agent::context::{ExecutionContext, InvocationRequest};
//! use lambda_apm_agent::context_manager::{ContextFutureExt, ExecutionContextManager};
//! use lambda_apm_agent::listener::SpanListenerRegistry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let context = ExecutionContext::new(
//!     Arc::new(SpanListenerRegistry::new()),
//!     InvocationRequest::default(),
//!     Duration::from_millis(200),
//!     false,
//! );
//!
//! let transaction_id = context.transaction_id();
//! ExecutionContextManager::run_with_context(context.clone(), async move {
//!     // Arbitrarily deep awaits still resolve the owning context.
//!     let current = ExecutionContextManager::get();
//!     assert_eq!(current.transaction_id(), transaction_id);
//!
//!     // Detached work keeps ownership only when wrapped.
//!     let handle = tokio::spawn(
//!         async { ExecutionContextManager::get().transaction_id() }
//!             .with_execution_context(ExecutionContextManager::get()),
//!     );
//!     assert_eq!(handle.await.unwrap(), transaction_id);
//! })
//! .await;
//! # }
//! ```

use crate::context::ExecutionContext;
use crate::logger::Logger;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use tokio::task::futures::TaskLocalFuture;

static LOGGER: Logger = Logger::const_new("context_manager");

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<Arc<ExecutionContext>>;
}

/// Entry points for installing and resolving the current context.
///
/// This is a namespace, not a value: all state lives in task-local storage.
#[derive(Debug)]
pub struct ExecutionContextManager;

impl ExecutionContextManager {
    /// Run `future` with `context` installed as the causally current context.
    ///
    /// Scopes nest: an inner `run_with_context` shadows the outer context and
    /// the outer one is restored when the inner future completes.
    pub async fn run_with_context<F>(context: Arc<ExecutionContext>, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_CONTEXT.scope(RefCell::new(context), future).await
    }

    /// The context owning the current causal chain, or the sentinel when no
    /// chain owns it. Never panics, never blocks.
    pub fn get() -> Arc<ExecutionContext> {
        CURRENT_CONTEXT
            .try_with(|cell| cell.borrow().clone())
            .unwrap_or_else(|_| ExecutionContext::empty())
    }

    /// Like [`ExecutionContextManager::get`], but `None` outside any scope.
    pub fn try_get() -> Option<Arc<ExecutionContext>> {
        CURRENT_CONTEXT
            .try_with(|cell| cell.borrow().clone())
            .ok()
    }

    /// Replace the current scope's context for the remainder of the scope.
    ///
    /// Outside any scope this is a no-op; there is nowhere to put it.
    pub fn set(context: Arc<ExecutionContext>) {
        let replaced = CURRENT_CONTEXT.try_with(|cell| {
            *cell.borrow_mut() = context;
        });
        if replaced.is_err() {
            LOGGER.debug("set() called outside any context scope; ignoring");
        }
    }
}

/// Carries a context across an explicit task boundary.
pub trait ContextFutureExt: Future + Sized {
    /// Make `context` the current context for this future, independent of
    /// which task polls it. This is how ownership crosses `tokio::spawn`.
    fn with_execution_context(
        self,
        context: Arc<ExecutionContext>,
    ) -> TaskLocalFuture<RefCell<Arc<ExecutionContext>>, Self> {
        CURRENT_CONTEXT.scope(RefCell::new(context), self)
    }
}

impl<F: Future + Sized> ContextFutureExt for F {}
