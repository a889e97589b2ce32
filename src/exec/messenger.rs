//! Typed publish/subscribe bus with buffered delivery
//!
//! Subscribers register per event type. `send_now` delivers synchronously
//! on the calling thread; `send_buffered` queues the event and notifies the
//! nominated main-thread context through the submit callback, which is
//! expected to call [`Messenger::flush`] from its own thread. Buffered
//! events preserve per-producer causal order.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type SubmitTask = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    subscribers: HashMap<TypeId, Vec<Handler>>,
    buffer: Vec<Box<dyn Any + Send>>,
    submit: Option<SubmitTask>,
}

/// The event bus
#[derive(Default)]
pub struct Messenger {
    inner: Mutex<Inner>,
}

impl Messenger {
    /// Create a bus with no subscribers
    pub fn new() -> Arc<Messenger> {
        Arc::new(Messenger::default())
    }

    /// Nominate the main-thread context: `submit` is invoked after every
    /// buffered send and must schedule a [`flush`](Self::flush) call
    pub fn set_submit_task(&self, submit: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().submit = Some(Arc::new(submit));
    }

    /// Subscribe to events of type `T`
    pub fn listen<T: Any>(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        let handler: Handler = Arc::new(move |any| {
            if let Some(event) = any.downcast_ref::<T>() {
                handler(event);
            }
        });
        self.inner
            .lock()
            .subscribers
            .entry(TypeId::of::<T>())
            .or_default()
            .push(handler);
    }

    fn handlers_for(&self, type_id: TypeId) -> Vec<Handler> {
        self.inner
            .lock()
            .subscribers
            .get(&type_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver synchronously on the calling thread, bypassing the buffer
    pub fn send_now<T: Any + Send>(&self, event: T) {
        // Handlers run without the lock so they can publish in turn
        for handler in self.handlers_for(TypeId::of::<T>()) {
            handler(&event);
        }
    }

    /// Queue the event for delivery on the nominated main thread
    pub fn send_buffered<T: Any + Send>(&self, event: T) {
        let submit = {
            let mut inner = self.inner.lock();
            inner.buffer.push(Box::new(event));
            inner.submit.clone()
        };
        if let Some(submit) = submit {
            submit();
        }
    }

    /// Deliver every buffered event in order; subscribers run on the
    /// calling thread
    pub fn flush(&self) {
        let buffered = std::mem::take(&mut self.inner.lock().buffer);
        for event in buffered {
            let type_id = (*event).type_id();
            for handler in self.handlers_for(type_id) {
                handler(event.as_ref());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Ping(u32);
    struct Pong;

    #[test]
    fn send_now_is_synchronous() {
        let messenger = Messenger::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        messenger.listen(move |Ping(n)| {
            seen2.fetch_add(*n as usize, Ordering::SeqCst);
        });
        messenger.send_now(Ping(5));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn buffered_events_wait_for_flush() {
        let messenger = Messenger::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        messenger.listen(move |Ping(_)| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        messenger.send_buffered(Ping(1));
        messenger.send_buffered(Ping(2));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        messenger.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn submit_task_fires_on_buffered_send() {
        let messenger = Messenger::new();
        let scheduled = Arc::new(AtomicUsize::new(0));
        let scheduled2 = Arc::clone(&scheduled);
        messenger.set_submit_task(move || {
            scheduled2.fetch_add(1, Ordering::SeqCst);
        });
        messenger.send_buffered(Pong);
        assert_eq!(scheduled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_dispatch_by_type() {
        let messenger = Messenger::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let pings2 = Arc::clone(&pings);
        messenger.listen(move |Ping(_)| {
            pings2.fetch_add(1, Ordering::SeqCst);
        });
        messenger.send_now(Pong);
        assert_eq!(pings.load(Ordering::SeqCst), 0);
    }
}
