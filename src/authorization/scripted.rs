use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::errors::SystemError;
use super::gate::SystemAuthorizer;

struct Script {
    preflight: Result<bool, SystemError>,
    prompts: VecDeque<Result<bool, SystemError>>,
    prompt_count: usize,
}

/// Authorizer that answers from a script instead of the OS.
///
/// A granted prompt flips later preflights to granted, as the host does.
/// An exhausted prompt queue answers "denied".
pub struct ScriptedAuthorizer {
    script: Mutex<Script>,
}

impl ScriptedAuthorizer {
    pub fn new(preflight: Result<bool, SystemError>) -> Self {
        Self {
            script: Mutex::new(Script {
                preflight,
                prompts: VecDeque::new(),
                prompt_count: 0,
            }),
        }
    }

    pub fn with_prompt(self, answer: Result<bool, SystemError>) -> Self {
        self.lock().prompts.push_back(answer);
        self
    }

    pub fn set_preflight(&self, preflight: Result<bool, SystemError>) {
        self.lock().preflight = preflight;
    }

    pub fn prompt_count(&self) -> usize {
        self.lock().prompt_count
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SystemAuthorizer for ScriptedAuthorizer {
    async fn preflight(&self) -> Result<bool, SystemError> {
        self.lock().preflight.clone()
    }

    async fn request_capability(&self) -> Result<bool, SystemError> {
        let mut script = self.lock();
        script.prompt_count += 1;
        let answer = script.prompts.pop_front().unwrap_or(Ok(false));
        if matches!(answer, Ok(true)) {
            script.preflight = Ok(true);
        }
        answer
    }
}
