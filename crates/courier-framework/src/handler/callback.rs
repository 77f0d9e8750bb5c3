//! Axum-style callbacks.
//!
//! [`Callback`] is implemented for every async function whose parameters
//! implement [`FromContext`] and whose return type implements
//! [`HandlerReturn`]:
//!
//! ```rust,ignore
//! async fn ask_name(msg: Message, bot: BoxedBot) -> anyhow::Result<State> {
//!     bot.send_message(msg.chat.id, "What's your name?").await?;
//!     Ok(State::new("NAME"))
//! }
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::CallbackContext;
use crate::error::{BoxError, CallbackError, DispatchError, DispatchResult};
use crate::extractor::FromContext;
use crate::transition::{State, Transition};

// ============================================================================
// HandlerReturn - Interpret callback return values
// ============================================================================

/// Types a callback may return.
///
/// The value becomes a [`Transition`] for the surrounding conversation, or an
/// error for the error-handler chain.
pub trait HandlerReturn: Send + 'static {
    fn into_transition(self) -> DispatchResult<Transition>;
}

/// `()` keeps the current state.
impl HandlerReturn for () {
    fn into_transition(self) -> DispatchResult<Transition> {
        Ok(Transition::Stay)
    }
}

impl HandlerReturn for Transition {
    fn into_transition(self) -> DispatchResult<Transition> {
        Ok(self)
    }
}

impl HandlerReturn for State {
    fn into_transition(self) -> DispatchResult<Transition> {
        Ok(Transition::To(self))
    }
}

/// `None` keeps the current state.
impl HandlerReturn for Option<State> {
    fn into_transition(self) -> DispatchResult<Transition> {
        Ok(self.map_or(Transition::Stay, Transition::To))
    }
}

/// `Err` is wrapped in [`CallbackError::Failed`].
impl<T, E> HandlerReturn for Result<T, E>
where
    T: HandlerReturn,
    E: Into<BoxError> + Send + 'static,
{
    fn into_transition(self) -> DispatchResult<Transition> {
        match self {
            Ok(value) => value.into_transition(),
            Err(e) => Err(DispatchError::callback(e)),
        }
    }
}

// ============================================================================
// Callback Trait
// ============================================================================

/// An async function usable as a handler callback.
///
/// Implemented automatically for functions taking 0-12 [`FromContext`]
/// parameters and returning a [`HandlerReturn`].
#[async_trait]
pub trait Callback<T>: Clone + Send + Sync + 'static {
    /// Extracts the parameters from `ctx` and runs the function.
    async fn call(self, ctx: Arc<CallbackContext>) -> DispatchResult<Transition>;
}

/// A type-erased callback that can be stored in collections.
pub type BoxedCallback = Arc<
    dyn Fn(Arc<CallbackContext>) -> BoxFuture<'static, DispatchResult<Transition>> + Send + Sync,
>;

/// Convert a callback function into a boxed callback.
pub fn into_callback<F, T>(f: F) -> BoxedCallback
where
    F: Callback<T>,
    T: 'static,
{
    Arc::new(move |ctx| f.clone().call(ctx))
}

/// Runs a boxed callback, converting a panic into [`CallbackError::Panicked`].
pub async fn invoke(
    callback: &BoxedCallback,
    ctx: Arc<CallbackContext>,
) -> DispatchResult<Transition> {
    let fut = callback(ctx);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::Panicked(panic_message(payload.as_ref())).into()),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Callback implementations for functions (Axum-style)
// ============================================================================

/// Macro to generate Callback implementations for functions with different arities.
macro_rules! impl_callback {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_variables)]
        #[async_trait]
        impl<F, Fut, Res, $($ty,)*> Callback<($($ty,)*)> for F
        where
            F: FnOnce($($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: HandlerReturn,
            $( $ty: FromContext + Send + 'static, )*
        {
            async fn call(self, ctx: Arc<CallbackContext>) -> DispatchResult<Transition> {
                $(
                    let $ty = $ty::from_context(&ctx)?;
                )*

                (self)($($ty,)*).await.into_transition()
            }
        }
    };
}

impl_callback!();
impl_callback!(T1);
impl_callback!(T1, T2);
impl_callback!(T1, T2, T3);
impl_callback!(T1, T2, T3, T4);
impl_callback!(T1, T2, T3, T4, T5);
impl_callback!(T1, T2, T3, T4, T5, T6);
impl_callback!(T1, T2, T3, T4, T5, T6, T7);
impl_callback!(T1, T2, T3, T4, T5, T6, T7, T8);
impl_callback!(T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_callback!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);
impl_callback!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11);
impl_callback!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12);
