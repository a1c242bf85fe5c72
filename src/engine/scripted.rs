//! Scripted engine for exercising the bridge without a model.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{ChatRequest, EngineError, EngineLoader, Generation, InferenceEngine, StreamToken};
use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// Streams the request back word by word
    Echo,
    LoadError,
    LoadPanic,
    SubmitError,
    SubmitPanic,
    /// Streams one word, then reports an error
    GenerationError,
    /// Streams one word, then the worker panics
    GenerationPanic,
    /// Streams until stopped
    Endless,
    /// Echoes, but the engine panics when the session drops it
    DropPanic,
}

/// Counters shared between a test and the engines it loads.
#[derive(Debug, Default)]
pub(crate) struct Probe {
    pub submissions: AtomicUsize,
    pub stopped: AtomicUsize,
}

pub(crate) struct ScriptedLoader {
    behavior: Behavior,
    probe: Arc<Probe>,
}

impl ScriptedLoader {
    pub fn new(behavior: Behavior) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        (
            Self {
                behavior,
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl EngineLoader for ScriptedLoader {
    fn load(&self, _config: &SessionConfig) -> Result<Box<dyn InferenceEngine>, EngineError> {
        match self.behavior {
            Behavior::LoadError => Err(EngineError::ModelLoad("corrupt weights".to_string())),
            Behavior::LoadPanic => panic!("allocator gave up while mapping weights"),
            behavior => Ok(Box::new(ScriptedEngine {
                behavior,
                probe: Arc::clone(&self.probe),
            })),
        }
    }
}

struct ScriptedEngine {
    behavior: Behavior,
    probe: Arc<Probe>,
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        if self.behavior == Behavior::DropPanic {
            panic!("engine teardown failed");
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn submit(&self, request: &ChatRequest) -> Result<Generation, EngineError> {
        match self.behavior {
            Behavior::SubmitError => {
                return Err(EngineError::WorkerError("task queue closed".to_string()))
            }
            Behavior::SubmitPanic => panic!("submission corrupted engine state"),
            _ => {}
        }
        self.probe.submissions.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let behavior = self.behavior;
        let words: Vec<String> = request
            .payload()
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let worker_stop = Arc::clone(&stop);
        let probe = Arc::clone(&self.probe);

        thread::spawn(move || {
            let pause = || thread::sleep(Duration::from_millis(2));
            match behavior {
                Behavior::GenerationError => {
                    let _ = tx.send(StreamToken::Token("partial".to_string()));
                    pause();
                    let _ = tx.send(StreamToken::Error("kv cache overflow".to_string()));
                }
                Behavior::GenerationPanic => {
                    let _ = tx.send(StreamToken::Token("partial".to_string()));
                    pause();
                    panic!("decode kernel fault");
                }
                Behavior::Endless => loop {
                    if worker_stop.load(Ordering::Relaxed) {
                        probe.stopped.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    let _ = tx.send(StreamToken::Token("tick ".to_string()));
                    pause();
                },
                _ => {
                    for word in words {
                        if worker_stop.load(Ordering::Relaxed) || tx.send(StreamToken::Token(word)).is_err() {
                            return;
                        }
                        pause();
                    }
                    let _ = tx.send(StreamToken::Done);
                }
            }
        });

        Ok(Generation::new(rx, stop))
    }
}
