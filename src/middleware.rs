//! Middleware pipeline for message handlers
//!
//! A middleware receives the handler it wraps and returns a new handler.
//! Composition is right-to-left construction with left-to-right execution:
//! the first middleware listed is the outermost wrapper and observes the
//! message first. Middlewares must forward the message unchanged unless
//! explicitly designed to transform.

use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Future returned by a message handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Shared asynchronous message handler.
pub type MessageHandler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// A handler-transforming layer.
pub trait Middleware: Send + Sync {
    /// Wrap `next`, returning the new handler.
    fn wrap(&self, next: MessageHandler) -> MessageHandler;
}

/// Compose `handler` with `middlewares`; the first middleware listed becomes
/// the outermost wrapper.
pub fn compose(handler: MessageHandler, middlewares: &[&dyn Middleware]) -> MessageHandler {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware.wrap(next))
}

/// Built-in middleware that logs the subject and headers of every delivered
/// message at debug verbosity, tagged with a source and environment label.
///
/// The labels are explicit constructor arguments; the middleware holds no
/// shared mutable state.
#[derive(Debug, Clone)]
pub struct LogMiddleware {
    source: String,
    env: String,
}

impl LogMiddleware {
    pub fn new(source: impl Into<String>, env: impl Into<String>) -> Self {
        LogMiddleware {
            source: source.into(),
            env: env.into(),
        }
    }
}

impl Middleware for LogMiddleware {
    fn wrap(&self, next: MessageHandler) -> MessageHandler {
        let source = self.source.clone();
        let env = self.env.clone();
        Arc::new(move |msg: Message| {
            debug!(
                target: "wirebus::middleware",
                name = %source,
                env = %env,
                subject = %msg.subject,
                headers = ?msg.headers,
                "processing message"
            );
            next(msg)
        })
    }
}
