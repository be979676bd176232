//! Repeat-until-stopped driving of single-shot operations.
//!
//! The library never loops or spawns on its own. Blocking operations such as
//! [`Server::handle`](crate::socket::Server::handle),
//! [`Controller::run`](crate::pubsub::Controller::run) or
//! [`SubscriberReceiver::receive_once`](crate::pubsub::SubscriberReceiver::receive_once) are
//! handed to a [`Driver`], which repeats them on the caller's thread until they stop or the
//! driver's [`CancellationToken`] fires.
//!
//! # Key Components
//!
//! - [`Operation`]: One iteration of repeated work, returning a [`Flow`].
//! - [`Handler`]: Exception and cleanup callbacks attached to a run.
//! - [`Operator`]: The default [`Driver`], with an optional delay between iterations.
//! - [`ThreadPool`]: Fixed worker pool for hosts that drive many connections.
mod pool;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, trace};

pub use pool::ThreadPool;

/// Whether a repeated operation wants another iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Shared stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub trait Operation {
    type Error;

    fn run_once(&mut self) -> Result<Flow, Self::Error>;
}

impl<F, E> Operation for F
where
    F: FnMut() -> Result<Flow, E>,
{
    type Error = E;

    fn run_once(&mut self) -> Result<Flow, E> {
        self()
    }
}

type ExceptionCallback<'a, E> = Box<dyn FnMut(&E) -> Flow + 'a>;

/// Callbacks for one run of an operation.
///
/// Without an exception callback, an error stops the run.
pub struct Handler<'a, E> {
    exception: Option<ExceptionCallback<'a, E>>,
    cleanup: Option<Box<dyn FnOnce() + 'a>>,
}

impl<E> Default for Handler<'_, E> {
    fn default() -> Self {
        Self {
            exception: None,
            cleanup: None,
        }
    }
}

impl<'a, E> Handler<'a, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with every error; its result decides whether the run continues.
    pub fn on_exception<F>(mut self, f: F) -> Self
    where
        F: FnMut(&E) -> Flow + 'a,
    {
        self.exception = Some(Box::new(f));
        self
    }

    /// Called once after a run ends, however it ended.
    pub fn on_cleanup<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + 'a,
    {
        self.cleanup = Some(Box::new(f));
        self
    }

    fn exception(&mut self, error: &E) -> Flow {
        match self.exception.as_mut() {
            Some(f) => f(error),
            None => Flow::Stop,
        }
    }

    fn cleanup(&mut self) {
        if let Some(f) = self.cleanup.take() {
            f();
        }
    }
}

/// Scheduler the host injects to repeat operations.
pub trait Driver {
    /// Performs a single iteration unless cancelled.
    fn run_once<O: Operation>(&self, operation: &mut O, handler: &mut Handler<'_, O::Error>)
    -> Flow;

    /// Repeats until the operation stops or the driver is cancelled, then runs cleanup.
    fn run_until_cancelled<O: Operation>(&self, operation: &mut O, handler: Handler<'_, O::Error>);
}

#[derive(Debug, Clone, Default)]
pub struct Operator {
    token: CancellationToken,
    delay: Option<Duration>,
}

impl Operator {
    pub fn new(token: CancellationToken) -> Self {
        Self { token, delay: None }
    }

    /// Pause between iterations.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Driver for Operator {
    fn run_once<O: Operation>(
        &self,
        operation: &mut O,
        handler: &mut Handler<'_, O::Error>,
    ) -> Flow {
        if self.token.is_cancelled() {
            return Flow::Stop;
        }
        match operation.run_once() {
            Ok(flow) => flow,
            Err(e) => handler.exception(&e),
        }
    }

    fn run_until_cancelled<O: Operation>(
        &self,
        operation: &mut O,
        mut handler: Handler<'_, O::Error>,
    ) {
        let mut iterations: u64 = 0;
        while self.run_once(operation, &mut handler) == Flow::Continue {
            iterations += 1;
            trace!("operator iteration {iterations} complete");
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
        }
        debug!("operator stopped after {iterations} iterations");
        handler.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn runs_until_operation_stops() {
        let mut count = 0;
        let mut op = || -> Result<Flow, ()> {
            count += 1;
            Ok(if count == 3 { Flow::Stop } else { Flow::Continue })
        };
        let cleaned = Cell::new(false);

        let handler = Handler::new().on_cleanup(|| cleaned.set(true));
        Operator::default().run_until_cancelled(&mut op, handler);

        assert_eq!(count, 3);
        assert!(cleaned.get());
    }

    #[test]
    fn cancelled_operator_does_nothing() {
        let operator = Operator::default();
        operator.cancel();
        let mut calls = 0;
        let mut op = || -> Result<Flow, ()> {
            calls += 1;
            Ok(Flow::Continue)
        };

        assert_eq!(operator.run_once(&mut op, &mut Handler::new()), Flow::Stop);
        assert_eq!(calls, 0);
    }

    #[test]
    fn exception_handler_decides() {
        let errors = Cell::new(0);
        let mut calls = 0;
        let mut op = || -> Result<Flow, &'static str> {
            calls += 1;
            if calls < 4 { Err("boom") } else { Ok(Flow::Stop) }
        };
        let handler = Handler::new().on_exception(|e: &&str| {
            assert_eq!(*e, "boom");
            errors.set(errors.get() + 1);
            Flow::Continue
        });

        Operator::default().run_until_cancelled(&mut op, handler);
        assert_eq!(errors.get(), 3);
    }

    #[test]
    fn error_without_handler_stops() {
        let mut op = || -> Result<Flow, ()> { Err(()) };
        assert_eq!(
            Operator::default().run_once(&mut op, &mut Handler::new()),
            Flow::Stop
        );
    }

    #[test]
    fn cancel_from_operation() {
        let operator = Operator::default();
        let token = operator.token().clone();
        let mut calls = 0;
        let mut op = || -> Result<Flow, ()> {
            calls += 1;
            token.cancel();
            Ok(Flow::Continue)
        };

        operator.run_until_cancelled(&mut op, Handler::new());
        assert_eq!(calls, 1);
    }
}
