// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{CommandOutput, CommandRunner, ExecutionError};

#[derive(Debug)]
struct Responder {
    prefix: Vec<String>,
    output: CommandOutput,
    once: bool,
}

#[derive(Debug, Default)]
struct State {
    responders: Vec<Responder>,
    calls: Vec<Vec<String>>,
}

/// A fake implementation of [crate::CommandRunner].
///
/// Records every command line it is asked to run and answers with
/// scripted outputs, matched by argument prefix in the order they were
/// registered. Unmatched commands succeed with empty output.
#[derive(Clone, Debug, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<State>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, prefix: &[&str], output: CommandOutput, once: bool) {
        self.state().responders.push(Responder {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            output,
            once,
        });
    }

    /// Answer every command starting with `prefix` with `output`.
    pub fn respond(&self, prefix: &[&str], output: CommandOutput) -> &Self {
        self.push(prefix, output, false);
        self
    }

    /// Answer the next command starting with `prefix` with `output`.
    pub fn respond_once(&self, prefix: &[&str], output: CommandOutput) -> &Self {
        self.push(prefix, output, true);
        self
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state().calls.clone()
    }

    /// Command lines run so far that start with `prefix`.
    pub fn calls_starting_with(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        self.state()
            .calls
            .iter()
            .filter(|call| starts_with(call, prefix))
            .cloned()
            .collect()
    }
}

fn starts_with(call: &[String], prefix: &[&str]) -> bool {
    call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b)
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn output(&self, argv: &[&str]) -> Result<CommandOutput, ExecutionError> {
        let mut state = self.state();
        let call: Vec<String> = argv.iter().map(|s| s.to_string()).collect();

        let found = state.responders.iter().position(|r| {
            let prefix: Vec<&str> = r.prefix.iter().map(String::as_str).collect();
            starts_with(&call, &prefix)
        });

        state.calls.push(call);

        let output = match found {
            Some(idx) if state.responders[idx].once => state.responders.remove(idx).output,
            Some(idx) => state.responders[idx].output.clone(),
            None => CommandOutput::ok(""),
        };

        Ok(output)
    }
}
