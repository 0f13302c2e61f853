use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use quarrel_core::error::{QuarrelError, Result};
use quarrel_core::routing::Route;
use quarrel_core::traits::{AgentChannel, AgentConnector};
use quarrel_core::types::AgentSlot;

enum Script {
    /// Served in order; the final entry repeats forever.
    Sequence(Vec<String>),
    /// A fresh value on every sample, so output never stabilizes.
    NeverSettles,
}

/// An in-memory agent whose output follows a fixed script.
///
/// Records every prompt and route it receives so tests can assert on
/// what the engine dispatched.
pub struct ScriptedChannel {
    script: Script,
    snapshot: String,
    fail_submit: bool,
    fail_samples: bool,
    samples: AtomicUsize,
    snapshots: AtomicUsize,
    prepares: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    routes: Mutex<Vec<Route>>,
}

impl ScriptedChannel {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            snapshot: "<html><body>scripted</body></html>".to_string(),
            fail_submit: false,
            fail_samples: false,
            samples: AtomicUsize::new(0),
            snapshots: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
        }
    }

    /// Always outputs `text`.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::with_script(Script::Sequence(vec![text.into()]))
    }

    /// Outputs each entry in turn, then holds the last one.
    pub fn sequence<I, S>(samples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Sequence(samples.into_iter().map(Into::into).collect()))
    }

    /// Output changes on every sample.
    pub fn never_settles() -> Self {
        Self::with_script(Script::NeverSettles)
    }

    /// Content returned by `snapshot()`.
    pub fn with_snapshot(mut self, content: impl Into<String>) -> Self {
        self.snapshot = content.into();
        self
    }

    /// Reject every `submit` call.
    pub fn failing_submit(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    /// Reject every `sample` call.
    pub fn failing_samples(mut self) -> Self {
        self.fail_samples = true;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn samples_taken(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    pub fn snapshots_taken(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    /// Every prompt submitted so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Routes used for each submit, in order.
    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().unwrap().clone()
    }
}

impl AgentChannel for ScriptedChannel {
    fn prepare(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn submit(&self, route: Route, prompt: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail_submit {
                return Err(QuarrelError::channel("scripted", "submit rejected"));
            }
            self.routes.lock().unwrap().push(route);
            self.prompts.lock().unwrap().push(prompt);
            Ok(())
        })
    }

    fn sample(&self, _route: Route) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let n = self.samples.fetch_add(1, Ordering::SeqCst);
            if self.fail_samples {
                return Err(QuarrelError::channel("scripted", "sample rejected"));
            }
            Ok(match self.script {
                Script::Sequence(ref items) => items
                    .get(n)
                    .or_else(|| items.last())
                    .cloned()
                    .unwrap_or_default(),
                Script::NeverSettles => format!("partial output #{}", n),
            })
        })
    }

    fn snapshot(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        })
    }
}

/// Hands out pre-built [`ScriptedChannel`]s by slot index.
///
/// Slots without a registered channel get a channel that outputs their own
/// name. Every `connect` call is recorded with the address it was given.
#[derive(Default)]
pub struct ScriptedConnector {
    channels: Mutex<HashMap<usize, Arc<ScriptedChannel>>>,
    connects: Mutex<Vec<(usize, String)>>,
    refuse: bool,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose every `connect` fails.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn with_channel(self, index: usize, channel: Arc<ScriptedChannel>) -> Self {
        self.channels.lock().unwrap().insert(index, channel);
        self
    }

    /// `(slot index, address)` for every `connect` call, in order.
    pub fn connects(&self) -> Vec<(usize, String)> {
        self.connects.lock().unwrap().clone()
    }
}

impl AgentConnector for ScriptedConnector {
    fn connect(&self, slot: &AgentSlot) -> Result<Arc<dyn AgentChannel>> {
        if self.refuse {
            return Err(QuarrelError::channel(&slot.name, "connection refused"));
        }
        self.connects
            .lock()
            .unwrap()
            .push((slot.index, slot.endpoint_address.clone()));
        let channel = self
            .channels
            .lock()
            .unwrap()
            .entry(slot.index)
            .or_insert_with(|| Arc::new(ScriptedChannel::fixed(slot.name.clone())))
            .clone();
        Ok(channel)
    }
}
