//! Closure-variable context for revived step functions.
//!
//! When a step reference with captured variables is revived on the step side,
//! the handler establishes the variables in a task-local scope around the
//! step body; the body reads them back with [`current_closure_vars`].

use std::future::Future;

use crate::value::Value;

tokio::task_local! {
    static CLOSURE_VARS: Value;
}

/// Runs a future with the given closure variables visible to
/// [`current_closure_vars`] for its duration.
pub async fn with_closure_vars<F>(vars: Value, fut: F) -> F::Output
where
    F: Future,
{
    CLOSURE_VARS.scope(vars, fut).await
}

/// The closure variables of the current step invocation, if any were carried
/// across the boundary.
#[must_use]
pub fn current_closure_vars() -> Option<Value> {
    CLOSURE_VARS.try_with(|vars| vars.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_vars_visible_inside_scope() {
        assert!(current_closure_vars().is_none());

        let vars = Value::object([("base", Value::from(10.0))]);
        let seen = with_closure_vars(vars.clone(), async move {
            current_closure_vars()
        })
        .await;

        assert_eq!(seen, Some(vars));
        assert!(current_closure_vars().is_none());
    }

    #[tokio::test]
    async fn scopes_nest_innermost_wins() {
        let outer = Value::from("outer");
        let inner = Value::from("inner");

        let seen = with_closure_vars(outer.clone(), async move {
            let nested = with_closure_vars(inner.clone(), async move {
                current_closure_vars()
            })
            .await;
            (nested, current_closure_vars())
        })
        .await;

        assert_eq!(seen.0, Some(Value::from("inner")));
        assert_eq!(seen.1, Some(outer));
    }
}
