//! Single-flight request sharing
//!
//! Instruments are slow and some queries are rate-sensitive. A
//! [`ResponseShare`] lets any number of concurrent callers wait on one
//! execution of an operation instead of each starting their own.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::protocol::ProtocolError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, ProtocolError>>>;
type Operation<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, ProtocolError>> + Send + Sync>;

struct InFlight<T> {
    generation: u64,
    result: SharedResult<T>,
}

/// Coalesces concurrent calls into one execution of an operation
///
/// Callers that arrive while an execution is outstanding receive its
/// result. Once it settles the next caller starts a fresh execution; no
/// result is kept beyond that.
pub struct ResponseShare<T: Clone> {
    operation: Operation<T>,
    in_flight: Arc<Mutex<Option<InFlight<T>>>>,
    generation: AtomicU64,
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T> ResponseShare<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap an operation; it runs only when a caller finds nothing in flight
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProtocolError>> + Send + 'static,
    {
        Self {
            operation: Box::new(move || operation().boxed()),
            in_flight: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Join the execution in flight, or start one
    pub async fn execute(&self) -> Result<T, ProtocolError> {
        let result = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(in_flight) => {
                    trace!(generation = in_flight.generation, "joining shared execution");
                    in_flight.result.clone()
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    trace!(generation, "starting shared execution");
                    let shared = self.start(generation);
                    *slot = Some(InFlight {
                        generation,
                        result: shared.clone(),
                    });
                    shared
                }
            }
        };
        result.await
    }

    /// Whether an execution is currently outstanding
    pub fn is_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    fn start(&self, generation: u64) -> SharedResult<T> {
        let operation = (self.operation)();
        let in_flight = Arc::clone(&self.in_flight);
        async move {
            let result = match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(generation, %message, "shared operation panicked");
                    Err(ProtocolError::OperationPanicked(message))
                }
            };
            // Settled: the next caller starts over
            let mut slot = lock(&in_flight);
            if matches!(slot.as_ref(), Some(current) if current.generation == generation) {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
