//! obscore-context
//!
//! Process-local propagation of a small trace metadata bag across
//! asynchronous boundaries within one logical request.
//!
//! Rust has no implicit task-local propagation comparable to an
//! `AsyncLocalStorage`; this crate uses `tokio::task_local!` for the common
//! case (a future polled to completion within one task sees its parent's
//! context automatically) and exposes `spawn` as the explicit primitive for
//! the one case that isn't automatic: handing work to a brand new task.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// Well-known `TraceContext` keys. Any other key is carried as an "extra".
pub mod keys {
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
    pub const PARENT_SPAN_ID: &str = "parent_span_id";
    pub const REQUEST_ID: &str = "request_id";
    pub const USER_ID: &str = "user_id";
    pub const SESSION_ID: &str = "session_id";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const SERVICE: &str = "service";
    pub const ENVIRONMENT: &str = "environment";
    pub const VERSION: &str = "version";
}

/// Open string-to-string trace metadata bag bound to one logical request.
///
/// `BTreeMap` rather than `HashMap` so that two contexts with the same
/// entries always serialize identically, which matters once this gets
/// merged into a `LogRecord`'s metadata.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext(BTreeMap<String, String>);

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` on top of `self`; `other`'s keys win on conflict.
    /// Used both for nested `run` (child extends parent) and for folding
    /// per-emit metadata over the ambient trace context.
    pub fn merged_with(&self, other: &TraceContext) -> TraceContext {
        let mut out = self.0.clone();
        for (k, v) in &other.0 {
            out.insert(k.clone(), v.clone());
        }
        TraceContext(out)
    }

    fn merge_in(&mut self, other: &TraceContext) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

tokio::task_local! {
    static CURRENT: RefCell<TraceContext>;
}

/// Returns the context bound to the current logical task, or an empty map
/// if none is bound. Never panics, never blocks.
pub fn current() -> TraceContext {
    CURRENT
        .try_with(|cell| cell.borrow().clone())
        .unwrap_or_default()
}

/// Merge `metadata` into the currently bound context without creating a new
/// scope. Typical use: middleware that learns the authenticated user id
/// partway through a request already bound by an outer `run`. A no-op if no
/// context is currently bound (there is nothing to amend).
pub fn set(metadata: TraceContext) {
    let _ = CURRENT.try_with(|cell| cell.borrow_mut().merge_in(&metadata));
}

/// Bind a new context, extending whatever is already bound (child keys
/// override parent keys), for the duration of a synchronous closure.
pub fn run<F, R>(metadata: TraceContext, work: F) -> R
where
    F: FnOnce() -> R,
{
    let merged = current().merged_with(&metadata);
    CURRENT.sync_scope(RefCell::new(merged), work)
}

/// Bind a new context, extending whatever is already bound, for the
/// duration of an asynchronous unit of work. Any further work the future
/// awaits within its own dynamic extent sees the merged context
/// automatically; work handed off to a new task does not (use [`spawn`]).
pub async fn run_async<F>(metadata: TraceContext, work: F) -> F::Output
where
    F: Future,
{
    let merged = current().merged_with(&metadata);
    CURRENT.scope(RefCell::new(merged), work).await
}

/// Explicit propagation primitive for work spawned onto a new task: captures
/// the calling task's current context and re-binds it inside the spawned
/// task, since `tokio::task_local!` does not cross a `tokio::spawn` boundary
/// on its own.
pub fn spawn<F>(work: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let ctx = current();
    tokio::spawn(CURRENT.scope(RefCell::new(ctx), work))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_context_is_empty() {
        assert!(current().is_empty());
    }

    #[test]
    fn run_binds_for_sync_extent_and_unbinds_after() {
        let mut md = TraceContext::new();
        md.insert(keys::TRACE_ID, "t1");
        let seen = run(md, || current().get(keys::TRACE_ID).map(str::to_string));
        assert_eq!(seen.as_deref(), Some("t1"));
        assert!(current().is_empty());
    }

    #[test]
    fn nested_run_extends_parent_and_child_overrides() {
        let mut parent = TraceContext::new();
        parent.insert(keys::TRACE_ID, "t1");
        parent.insert(keys::REQUEST_ID, "r1");

        run(parent, || {
            let mut child = TraceContext::new();
            child.insert(keys::REQUEST_ID, "r2");
            run(child, || {
                let ctx = current();
                assert_eq!(ctx.get(keys::TRACE_ID), Some("t1"));
                assert_eq!(ctx.get(keys::REQUEST_ID), Some("r2"));
            });
            // parent scope restored
            assert_eq!(current().get(keys::REQUEST_ID), Some("r1"));
        });
    }

    #[test]
    fn set_amends_without_new_scope() {
        let mut md = TraceContext::new();
        md.insert(keys::TRACE_ID, "t1");
        run(md, || {
            let mut extra = TraceContext::new();
            extra.insert(keys::USER_ID, "u1");
            set(extra);
            let ctx = current();
            assert_eq!(ctx.get(keys::TRACE_ID), Some("t1"));
            assert_eq!(ctx.get(keys::USER_ID), Some("u1"));
        });
    }

    #[test]
    fn set_outside_any_scope_is_a_noop() {
        let mut extra = TraceContext::new();
        extra.insert(keys::USER_ID, "u1");
        set(extra);
        assert!(current().is_empty());
    }

    #[tokio::test]
    async fn run_async_propagates_across_await_points() {
        let mut md = TraceContext::new();
        md.insert(keys::REQUEST_ID, "r1");
        let seen = run_async(md, async {
            tokio::task::yield_now().await;
            current().get(keys::REQUEST_ID).map(str::to_string)
        })
        .await;
        assert_eq!(seen.as_deref(), Some("r1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_logical_requests_see_independent_contexts() {
        let mut a = TraceContext::new();
        a.insert(keys::REQUEST_ID, "a");
        let mut b = TraceContext::new();
        b.insert(keys::REQUEST_ID, "b");

        let ta = tokio::spawn(run_async(a, async {
            tokio::task::yield_now().await;
            current().get(keys::REQUEST_ID).map(str::to_string)
        }));
        let tb = tokio::spawn(run_async(b, async {
            tokio::task::yield_now().await;
            current().get(keys::REQUEST_ID).map(str::to_string)
        }));

        assert_eq!(ta.await.unwrap().as_deref(), Some("a"));
        assert_eq!(tb.await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn spawn_propagates_to_a_new_task() {
        let mut md = TraceContext::new();
        md.insert(keys::TRACE_ID, "t1");
        let seen = run_async(md, async {
            spawn(async { current().get(keys::TRACE_ID).map(str::to_string) })
                .await
                .unwrap()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("t1"));
    }

    #[test]
    fn work_spawned_before_run_is_unaffected() {
        // A context bound after a closure is already running does not
        // retroactively affect it; this is implicit in `run`'s signature
        // (the closure runs entirely inside the dynamic extent or not at
        // all) but we assert the plain sequencing case for documentation.
        assert!(current().is_empty());
        let mut md = TraceContext::new();
        md.insert(keys::TRACE_ID, "t1");
        run(md, || {});
        assert!(current().is_empty());
    }
}
