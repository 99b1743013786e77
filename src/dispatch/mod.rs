//! Dispatcher: runs handlers on a bounded worker pool.
//!
//! Every handler bound to an event's channel runs, in registration order,
//! inside one invocation on a blocking thread. Yields are folded as they
//! arrive; interim statuses and the final reply are posted back to the
//! runtime as [`DispatchEvent`]s on a single channel, so their order is the
//! order the handlers produced them.

pub mod debounce;
pub mod fold;
pub mod handler;
pub mod reply;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::event::{ChannelKey, TypedEvent};
use debounce::Debouncer;
use fold::{FoldKind, ReplyFold, Step};

pub use handler::{
    Binding, Component, Debounce, Handled, Handler, HandlerError, HandlerResult, Invocation, Yield,
    YieldStream,
};
pub use reply::StatusReply;

/// Default worker pool size.
pub const DEFAULT_NUM_WORKERS: usize = 25;

type Sections = Arc<HashMap<String, HashMap<String, String>>>;

/// An event on its way through the dispatcher.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Arc<TypedEvent>,
    /// Second visit after a deferral.
    pub deferred: bool,
    /// Test-action submission id; such deliveries are never acked or replied to.
    pub test_id: Option<u64>,
}

impl Delivery {
    pub fn new(event: Arc<TypedEvent>) -> Self {
        Self {
            event,
            deferred: false,
            test_id: None,
        }
    }

    pub fn for_test(event: Arc<TypedEvent>, test_id: u64) -> Self {
        Self {
            test_id: Some(test_id),
            ..Self::new(event)
        }
    }
}

#[derive(Debug)]
pub enum DispatchEvent {
    Interim { delivery: Delivery, reply: StatusReply },
    Finished { delivery: Delivery, reply: StatusReply },
    DebounceElapsed { key: String, generation: u64 },
}

struct Bound {
    component: String,
    binding: Binding,
}

enum RunOutcome {
    Done,
    Deferred(Option<Duration>),
}

pub struct Dispatcher {
    channels: HashMap<ChannelKey, Vec<Bound>>,
    pool: Arc<Semaphore>,
    events: mpsc::UnboundedSender<DispatchEvent>,
    debouncer: Debouncer,
    include_stack_trace: bool,
    sections: Sections,
}

impl Dispatcher {
    pub fn new(
        num_workers: usize,
        include_stack_trace: bool,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        Self {
            channels: HashMap::new(),
            pool: Arc::new(Semaphore::new(num_workers.max(1))),
            debouncer: Debouncer::new(events.clone()),
            events,
            include_stack_trace,
            sections: Arc::default(),
        }
    }

    /// App sections handed to handlers through [`Invocation::section`].
    pub fn set_sections(&mut self, sections: HashMap<String, HashMap<String, String>>) {
        self.sections = Arc::new(sections);
    }

    /// Bindings replace any already held under the component's name.
    pub fn add_component(&mut self, component: &Component) {
        self.remove_component(component.name());
        for binding in component.bindings() {
            self.channels
                .entry(binding.channel.clone())
                .or_default()
                .push(Bound {
                    component: component.name().to_string(),
                    binding: binding.clone(),
                });
        }
    }

    pub fn remove_component(&mut self, name: &str) {
        self.channels.retain(|_, bound| {
            bound.retain(|b| b.component != name);
            !bound.is_empty()
        });
    }

    pub fn handles(&self, channel: &ChannelKey) -> bool {
        self.channels.contains_key(channel)
    }

    fn handlers_for(&self, channel: &ChannelKey) -> Vec<Arc<dyn Handler>> {
        self.channels
            .get(channel)
            .map(|bound| bound.iter().map(|b| b.binding.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Route a delivery to its handlers. Returns false when nothing is bound
    /// to its channel.
    pub fn dispatch(&mut self, delivery: Delivery) -> bool {
        let channel = delivery.event.channel();
        let Some(bound) = self.channels.get(&channel) else {
            warn!(channel = %channel, event = %delivery.event, "No handler bound to channel");
            return false;
        };

        if !delivery.deferred {
            let debounced = bound.iter().find_map(|b| {
                let debounce = b.binding.debounce.as_ref()?;
                let key = debounce.key_for(&format!("{}.{}", b.component, channel), &delivery.event)?;
                Some((key, debounce.clone()))
            });
            if let Some((key, debounce)) = debounced {
                for discarded in self.debouncer.submit(key, delivery, &debounce) {
                    info!(event = %discarded.event, "Debounce discarded event");
                    let reply = ReplyFold::new(FoldKind::for_event(&discarded.event)).finish();
                    let _ = self.events.send(DispatchEvent::Finished {
                        delivery: discarded,
                        reply,
                    });
                }
                return true;
            }
        }

        let handlers = self.handlers_for(&channel);
        self.spawn(delivery, handlers);
        true
    }

    pub fn on_debounce_elapsed(&mut self, key: &str, generation: u64) {
        for delivery in self.debouncer.elapsed(key, generation) {
            let handlers = self.handlers_for(&delivery.event.channel());
            if handlers.is_empty() {
                warn!(event = %delivery.event, "Handler unregistered while debounced");
                continue;
            }
            self.spawn(delivery, handlers);
        }
    }

    fn spawn(&self, mut delivery: Delivery, handlers: Vec<Arc<dyn Handler>>) {
        let pool = self.pool.clone();
        let events = self.events.clone();
        let sections = self.sections.clone();
        let include_stack_trace = self.include_stack_trace;

        tokio::spawn(async move {
            loop {
                let Ok(permit) = pool.clone().acquire_owned().await else {
                    return;
                };
                let job = Job {
                    delivery: delivery.clone(),
                    handlers: handlers.clone(),
                    sections: sections.clone(),
                    include_stack_trace,
                    events: events.clone(),
                };
                let outcome = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    job.run()
                })
                .await;

                match outcome {
                    Ok(RunOutcome::Done) => return,
                    Ok(RunOutcome::Deferred(delay)) => {
                        let delay = delay.unwrap_or_else(random_defer_delay);
                        info!(event = %delivery.event, delay = ?delay, "Event deferred");
                        tokio::time::sleep(delay).await;
                        delivery.deferred = true;
                    }
                    Err(e) => {
                        error!(event = %delivery.event, error = %e, "Worker task failed");
                        let _ = events.send(DispatchEvent::Finished {
                            delivery,
                            reply: StatusReply::failure(format!("worker: <{e}>")),
                        });
                        return;
                    }
                }
            }
        });
    }
}

/// 0.5 s plus up to one second of jitter.
fn random_defer_delay() -> Duration {
    Duration::from_secs_f64(0.5 + rand::random::<f64>())
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    format!("panic: <{message}>")
}

/// One invocation, run on a blocking thread.
struct Job {
    delivery: Delivery,
    handlers: Vec<Arc<dyn Handler>>,
    sections: Sections,
    include_stack_trace: bool,
    events: mpsc::UnboundedSender<DispatchEvent>,
}

impl Job {
    fn emit(&self, event: DispatchEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, text: String) -> RunOutcome {
        error!(event = %self.delivery.event, error = %text, "Handler failed");
        self.emit(DispatchEvent::Finished {
            delivery: self.delivery.clone(),
            reply: StatusReply::failure(text),
        });
        RunOutcome::Done
    }

    fn run(self) -> RunOutcome {
        let invocation = Invocation::new(
            self.delivery.event.clone(),
            self.delivery.deferred,
            self.sections.clone(),
        );
        let mut fold = ReplyFold::new(FoldKind::for_event(&self.delivery.event));

        for handler in &self.handlers {
            let handled = match catch_unwind(AssertUnwindSafe(|| handler.handle(&invocation))) {
                Ok(Ok(handled)) => handled,
                Ok(Err(err)) => return self.fail(err.reply_text(self.include_stack_trace)),
                Err(panic) => return self.fail(panic_text(panic)),
            };
            let mut stream = match handled {
                Handled::Defer(delay) if !self.delivery.deferred => {
                    return RunOutcome::Deferred(delay)
                }
                Handled::Defer(_) => {
                    debug!(event = %self.delivery.event, "Deferral already used, continuing");
                    continue;
                }
                Handled::Stream(stream) => stream,
            };
            loop {
                let next = match catch_unwind(AssertUnwindSafe(|| stream.next())) {
                    Ok(next) => next,
                    Err(panic) => return self.fail(panic_text(panic)),
                };
                let Some(value) = next else { break };
                match fold.push(value) {
                    Step::Interim(text) => self.emit(DispatchEvent::Interim {
                        delivery: self.delivery.clone(),
                        reply: StatusReply::interim(text),
                    }),
                    Step::Failed(text) => return self.fail(text),
                    Step::Quiet => {}
                }
            }
        }

        self.emit(DispatchEvent::Finished {
            delivery: self.delivery.clone(),
            reply: fold.finish(),
        });
        RunOutcome::Done
    }
}
