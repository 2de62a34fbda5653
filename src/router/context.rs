use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::pool::Recycle;
use crate::router::{Handler, HandlerResult};
use crate::Envelope;

/// Per-delivery state handed to middleware and handlers.
///
/// A context walks a linear cursor over its chain. [`Context::next`] runs
/// the remaining chain from the cursor on; an error stops the chain and is
/// returned to whoever called `next`. Middleware that never calls `next`
/// still lets the chain continue after it returns, unless it calls
/// [`Context::abort`].
#[derive(Default)]
pub struct Context {
    message: Option<Arc<Envelope>>,
    handlers: Vec<Arc<dyn Handler>>,
    cursor: usize,
}

impl Context {
    pub(crate) fn reset(
        &mut self,
        message: Arc<Envelope>,
        handlers: impl IntoIterator<Item = Arc<dyn Handler>>,
    ) {
        self.message = Some(message);
        self.handlers.clear();
        self.handlers.extend(handlers);
        self.cursor = 0;
    }

    /// Run the rest of the chain.
    pub fn next(&mut self) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            while let Some(handler) = self.handlers.get(self.cursor).cloned() {
                self.cursor += 1;
                handler.call(self).await?;
            }
            Ok(())
        })
    }

    /// Skip every handler after the current one.
    pub fn abort(&mut self) {
        self.cursor = self.handlers.len();
    }

    /// The delivered envelope.
    pub fn message(&self) -> Option<&Envelope> {
        self.message.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        self.message().map_or(&[], |m| m.payload.as_slice())
    }

    pub fn topic(&self) -> &str {
        self.message().map_or("", |m| m.topic.as_str())
    }

    pub fn handler_name(&self) -> &str {
        self.message().map_or("", |m| m.handler.as_str())
    }
}

impl Recycle for Context {
    fn recycle(&mut self) {
        self.message = None;
        self.handlers.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::envelope::Policy;

    fn handler<F>(f: F) -> Arc<dyn Handler>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, HandlerResult> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn recorder(log: &Arc<Mutex<Vec<usize>>>, n: usize) -> Arc<dyn Handler> {
        let log = log.clone();
        handler(move |_ctx| {
            log.lock().unwrap().push(n);
            Box::pin(async { Ok(()) })
        })
    }

    fn message() -> Arc<Envelope> {
        Arc::new(Envelope::new("t", "h", b"body".to_vec(), Policy::default()))
    }

    #[tokio::test]
    async fn next_runs_whole_chain_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = Context::default();
        ctx.reset(message(), [recorder(&log, 1), recorder(&log, 2), recorder(&log, 3)]);

        ctx.next().await.unwrap();
        ctx.next().await.unwrap();

        assert_eq!(log.lock().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn abort_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = handler(|ctx| {
            ctx.abort();
            Box::pin(async { Ok(()) })
        });
        let mut ctx = Context::default();
        ctx.reset(message(), [recorder(&log, 1), stop, recorder(&log, 2)]);

        ctx.next().await.unwrap();

        assert_eq!(log.lock().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn recycle_clears_message_and_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = Context::default();
        ctx.reset(message(), [recorder(&log, 1)]);
        assert_eq!(ctx.payload(), b"body");
        assert_eq!(ctx.topic(), "t");

        ctx.recycle();

        assert!(ctx.message().is_none());
        assert_eq!(ctx.payload(), b"");
        assert!(ctx.handlers.is_empty());
    }
}
