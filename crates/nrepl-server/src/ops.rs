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

/// nREPL operation catalog and dispatch
use crate::codec::{Dict, Value};
use crate::connection::ResponseWriter;
use crate::error::{NReplError, Result};
use crate::eval::{
    Completion, Eldoc, EvalContext, EvalError, Evaluator, Introspector, SymbolInfo,
};
use crate::message::{Request, Response};
use crate::session::{Session, SessionStore};
use lazy_static::lazy_static;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Describe,
    Clone,
    Eval,
    Close,
    LsSessions,
    Interrupt,
    LoadFile,
    Stdin,
    Complete,
    Info,
    Eldoc,
}

impl Op {
    pub const ALL: [Op; 11] = [
        Op::Describe,
        Op::Clone,
        Op::Eval,
        Op::Close,
        Op::LsSessions,
        Op::Interrupt,
        Op::LoadFile,
        Op::Stdin,
        Op::Complete,
        Op::Info,
        Op::Eldoc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Op::Describe => "describe",
            Op::Clone => "clone",
            Op::Eval => "eval",
            Op::Close => "close",
            Op::LsSessions => "ls-sessions",
            Op::Interrupt => "interrupt",
            Op::LoadFile => "load-file",
            Op::Stdin => "stdin",
            Op::Complete => "complete",
            Op::Info => "info",
            Op::Eldoc => "eldoc",
        }
    }
}

impl FromStr for Op {
    type Err = NReplError;

    fn from_str(s: &str) -> Result<Self> {
        Op::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| NReplError::UnknownOperation(s.to_string()))
    }
}

fn empty_dict() -> Value {
    Value::Dict(Dict::new())
}

fn dict_of(entries: &[(&str, Value)]) -> Value {
    Value::Dict(
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
    )
}

lazy_static! {
    static ref DESCRIBE_OPS: Value = Value::Dict(
        Op::ALL
            .into_iter()
            .map(|op| (op.name().to_string(), empty_dict()))
            .collect()
    );
    static ref DESCRIBE_VERSIONS: Value = dict_of(&[
        (
            "nrepl",
            dict_of(&[
                ("major", Value::from("0")),
                ("minor", Value::from("8")),
                ("incremental", Value::from("1")),
            ]),
        ),
        (
            "nrepl-server",
            dict_of(&[("version-string", Value::from(env!("CARGO_PKG_VERSION")))]),
        ),
    ]);
}

/// The session a request is dispatched against
///
/// `id` is what replies carry. `session` is `None` when the client addressed
/// an id the store does not know; such requests run in a default context and
/// nothing is written back.
struct Target {
    id: String,
    session: Option<Arc<Session>>,
}

impl Target {
    fn context(&self) -> EvalContext {
        match &self.session {
            Some(session) => session.context(),
            None => EvalContext {
                session_id: Some(self.id.clone()),
                namespace: None,
            },
        }
    }

    fn set_namespace(&self, namespace: &str) {
        if let Some(session) = &self.session {
            session.set_namespace(namespace);
        }
    }
}

/// Run a collaborator call on the blocking pool
async fn run_blocking<C, T, F>(collaborator: &Arc<C>, call: F) -> std::result::Result<T, EvalError>
where
    C: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&C) -> std::result::Result<T, EvalError> + Send + 'static,
{
    let collaborator = Arc::clone(collaborator);
    match tokio::task::spawn_blocking(move || call(collaborator.as_ref())).await {
        Ok(result) => result,
        Err(err) => Err(EvalError::new("panic", err.to_string())),
    }
}

fn error_response(id: &str, session: &str, err: &EvalError) -> Response {
    Response::new(id, session)
        .with("ex", err.class.as_str())
        .with("root-ex", err.class.as_str())
        .with("err", format!("{}\n", err.message))
}

fn completion_value(completion: Completion) -> Value {
    dict_of(&[
        ("candidate", Value::String(completion.candidate)),
        ("type", Value::String(completion.kind)),
        ("ns", Value::String(completion.namespace)),
        ("doc", Value::String(completion.doc)),
    ])
}

fn info_response(response: Response, info: SymbolInfo) -> Response {
    response
        .with_opt("ns", info.namespace)
        .with_opt("name", info.name)
        .with_opt("arglists", info.arglists)
        .with_opt("doc", info.doc)
        .with_opt("file", info.file)
        .with_opt("line", info.line)
}

fn eldoc_response(response: Response, eldoc: Eldoc) -> Response {
    let arglists: Vec<Value> = eldoc.arglists.into_iter().map(Value::from).collect();
    response
        .with("eldoc", Value::List(arglists))
        .with("type", eldoc.kind)
        .with_opt("docstring", eldoc.doc)
        .with_opt("ns", eldoc.namespace)
        .with_opt("name", eldoc.name)
}

/// Maps an op to its handler
pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    evaluator: Arc<dyn Evaluator>,
    introspector: Arc<dyn Introspector>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        evaluator: Arc<dyn Evaluator>,
        introspector: Arc<dyn Introspector>,
    ) -> Self {
        Self {
            sessions,
            evaluator,
            introspector,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Handle one request, writing zero or more replies
    ///
    /// Returns the session id the connection should treat as current from
    /// now on: the new session after `clone`, otherwise `current_session`.
    pub async fn dispatch<W: AsyncWrite + Unpin>(
        &self,
        request: &Request,
        current_session: &str,
        writer: &mut ResponseWriter<W>,
    ) -> Result<String> {
        let id = request.id();
        let session_id = request.session().unwrap_or(current_session).to_string();
        let target = Target {
            session: self.sessions.get(&session_id),
            id: session_id,
        };
        let op_name = request.op().unwrap_or_default();

        debug!(
            op = op_name,
            id = %id,
            session = %target.id,
            length_prefixed = writer.is_length_prefixed(),
            "received op"
        );

        let op = match op_name.parse::<Op>() {
            Ok(op) => op,
            Err(err) => {
                warn!(id = %id, "{}", err);
                writer
                    .send(Response::new(id, target.id).status(&["done", "unknown-op"]))
                    .await?;
                return Ok(current_session.to_string());
            }
        };

        match op {
            Op::Clone => return self.clone_session(&id, &target, writer).await,
            Op::Describe => {
                let response = Response::new(&id, &target.id)
                    .with("ops", DESCRIBE_OPS.clone())
                    .with("versions", DESCRIBE_VERSIONS.clone())
                    .status(&["done"]);
                writer.send(response).await?;
            }
            Op::Eval => self.eval(request, &id, &target, writer).await?,
            Op::LoadFile => self.load_file(request, &id, &target, writer).await?,
            Op::LsSessions => {
                let response = Response::new(&id, &target.id)
                    .with("sessions", self.sessions.ids())
                    .status(&["done"]);
                writer.send(response).await?;
            }
            Op::Close | Op::Interrupt | Op::Stdin => {
                // Acknowledged only: sessions are retained, evals are not
                // cancellable and stdin is not forwarded
                writer
                    .send(Response::new(&id, &target.id).status(&["done"]))
                    .await?;
            }
            Op::Complete => self.complete(request, &id, &target, writer).await?,
            Op::Info => self.info(request, &id, &target, writer).await?,
            Op::Eldoc => self.eldoc(request, &id, &target, writer).await?,
        }

        Ok(current_session.to_string())
    }

    async fn clone_session<W: AsyncWrite + Unpin>(
        &self,
        id: &str,
        target: &Target,
        writer: &mut ResponseWriter<W>,
    ) -> Result<String> {
        let new_session = self.sessions.create_session();
        info!(session = %new_session, "created new session");

        let response = Response::new(id, &target.id)
            .with("new-session", new_session.as_str())
            .status(&["done"]);
        writer.send(response).await?;
        Ok(new_session)
    }

    async fn eval<W: AsyncWrite + Unpin>(
        &self,
        request: &Request,
        id: &str,
        target: &Target,
        writer: &mut ResponseWriter<W>,
    ) -> Result<()> {
        let code = request.str_field("code").unwrap_or_default().to_string();
        let mut context = target.context();
        if let Some(ns) = request.first_str(&["ns"]) {
            target.set_namespace(ns);
            context.namespace = Some(ns.to_string());
        }

        debug!(code = %code, ns = context.namespace_or_default(), "evaluating");
        match run_blocking(&self.evaluator, move |evaluator| evaluator.eval(&code, &context)).await
        {
            Ok(output) => {
                target.set_namespace(&output.ns);
                let response = Response::new(id, &target.id)
                    .with("value", output.value)
                    .with("ns", output.ns);
                writer.send(response).await?;
            }
            Err(err) => {
                warn!(id = %id, "eval error: {}", err);
                let response = error_response(id, &target.id, &err).status(&["eval-error"]);
                writer.send(response).await?;
            }
        }

        writer
            .send(Response::new(id, &target.id).status(&["done"]))
            .await
    }

    async fn load_file<W: AsyncWrite + Unpin>(
        &self,
        request: &Request,
        id: &str,
        target: &Target,
        writer: &mut ResponseWriter<W>,
    ) -> Result<()> {
        let file_path = request.first_str(&["file-path"]);
        info!(
            file_name = request.str_field("file-name"),
            file_path, "load file"
        );

        let mut content = request.str_field("file").unwrap_or_default().to_string();
        if content.is_empty() {
            if let Some(path) = file_path {
                match tokio::fs::read_to_string(path).await {
                    Ok(text) => content = text,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        let err = EvalError::new("IOException", err.to_string());
                        let response = error_response(id, &target.id, &err)
                            .status(&["eval-error", "done"]);
                        return writer.send(response).await;
                    }
                }
            }
        }

        if content.is_empty() {
            let response = Response::new(id, &target.id)
                .with("value", "nil")
                .status(&["done"]);
            return writer.send(response).await;
        }

        let context = target.context();
        let response = match run_blocking(&self.evaluator, move |evaluator| {
            evaluator.load_and_eval(&content, &context)
        })
        .await
        {
            Ok(output) => {
                target.set_namespace(&output.ns);
                Response::new(id, &target.id)
                    .with("value", output.value)
                    .with("ns", output.ns)
                    .status(&["done"])
            }
            Err(err) => {
                warn!(id = %id, "load file error: {}", err);
                error_response(id, &target.id, &err).status(&["eval-error", "done"])
            }
        };
        writer.send(response).await
    }

    /// Namespace for introspection: request `ns`, then the session's, then the default
    fn namespace_for(request: &Request, context: &EvalContext) -> String {
        request
            .first_str(&["ns"])
            .unwrap_or_else(|| context.namespace_or_default())
            .to_string()
    }

    async fn complete<W: AsyncWrite + Unpin>(
        &self,
        request: &Request,
        id: &str,
        target: &Target,
        writer: &mut ResponseWriter<W>,
    ) -> Result<()> {
        let prefix = request.completion_prefix();
        let context = target.context();
        let namespace = Self::namespace_for(request, &context);
        debug!(prefix = %prefix, ns = %namespace, "complete request");

        let completions = run_blocking(&self.introspector, move |introspector| {
            introspector.complete(&prefix, &namespace, &context)
        })
        .await
        .unwrap_or_else(|err| {
            warn!(id = %id, "complete error: {}", err);
            Vec::new()
        });

        let candidates: Vec<Value> = completions.into_iter().map(completion_value).collect();
        let response = Response::new(id, &target.id)
            .with("completions", Value::List(candidates))
            .status(&["done"]);
        writer.send(response).await
    }

    async fn info<W: AsyncWrite + Unpin>(
        &self,
        request: &Request,
        id: &str,
        target: &Target,
        writer: &mut ResponseWriter<W>,
    ) -> Result<()> {
        let symbol = request.first_str(&["sym", "symbol"]).unwrap_or_default().to_string();
        let context = target.context();
        let namespace = Self::namespace_for(request, &context);
        debug!(sym = %symbol, ns = %namespace, "info request");

        let found = run_blocking(&self.introspector, move |introspector| {
            introspector.info(&symbol, &namespace, &context)
        })
        .await
        .unwrap_or_else(|err| {
            warn!(id = %id, "info error: {}", err);
            None
        });

        let response = Response::new(id, &target.id);
        let response = match found {
            Some(info) if !info.is_empty() => info_response(response, info),
            _ => response,
        };
        writer.send(response.status(&["done"])).await
    }

    async fn eldoc<W: AsyncWrite + Unpin>(
        &self,
        request: &Request,
        id: &str,
        target: &Target,
        writer: &mut ResponseWriter<W>,
    ) -> Result<()> {
        let symbol = request.first_str(&["sym", "symbol"]).unwrap_or_default().to_string();
        let context = target.context();
        let namespace = Self::namespace_for(request, &context);
        debug!(sym = %symbol, ns = %namespace, "eldoc request");

        let found = run_blocking(&self.introspector, move |introspector| {
            introspector.eldoc(&symbol, &namespace, &context)
        })
        .await
        .unwrap_or_else(|err| {
            warn!(id = %id, "eldoc error: {}", err);
            None
        });

        let response = Response::new(id, &target.id);
        let response = match found {
            Some(eldoc) if !eldoc.arglists.is_empty() => {
                eldoc_response(response, eldoc).status(&["done"])
            }
            _ => response.status(&["no-eldoc"]),
        };
        writer.send(response).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
