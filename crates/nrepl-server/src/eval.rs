// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Collaborator interfaces for the language engine
//!
//! The server never executes code itself. It hands source text and a
//! snapshot of the session's context to an [`Evaluator`], and answers
//! completion/documentation queries through an [`Introspector`]. Both are
//! synchronous; the dispatcher runs them on the blocking thread pool.

use thiserror::Error;

/// Namespace used when neither the request nor the session names one
pub const DEFAULT_NAMESPACE: &str = "user";

/// Snapshot of a session's evaluation context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalContext {
    pub session_id: Option<String>,
    pub namespace: Option<String>,
}

impl EvalContext {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }
}

/// Successful evaluation: printed value plus the namespace it left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOutput {
    pub value: String,
    pub ns: String,
}

/// Failure reported by a collaborator
///
/// `class` names the kind of failure (e.g. `ArithmeticException`) and ends up
/// in the `ex` and `root-ex` reply fields.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct EvalError {
    pub class: String,
    pub message: String,
}

impl EvalError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

pub trait Evaluator: Send + Sync {
    /// Evaluate `code` in `context`
    fn eval(&self, code: &str, context: &EvalContext) -> Result<EvalOutput, EvalError>;

    /// Evaluate the whole content of a file
    fn load_and_eval(&self, file: &str, context: &EvalContext) -> Result<EvalOutput, EvalError> {
        self.eval(file, context)
    }
}

/// A single completion candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub candidate: String,
    pub kind: String,
    pub namespace: String,
    pub doc: String,
}

/// Documentation lookup result; absent fields are omitted from the reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolInfo {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub arglists: Option<String>,
    pub doc: Option<String>,
    pub file: Option<String>,
    pub line: Option<i64>,
}

impl SymbolInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Argument lists per arity, for editor hints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eldoc {
    pub arglists: Vec<Vec<String>>,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub doc: Option<String>,
}

pub trait Introspector: Send + Sync {
    fn complete(
        &self,
        prefix: &str,
        namespace: &str,
        context: &EvalContext,
    ) -> Result<Vec<Completion>, EvalError>;

    fn info(
        &self,
        symbol: &str,
        namespace: &str,
        context: &EvalContext,
    ) -> Result<Option<SymbolInfo>, EvalError>;

    fn eldoc(
        &self,
        symbol: &str,
        namespace: &str,
        context: &EvalContext,
    ) -> Result<Option<Eldoc>, EvalError>;
}
