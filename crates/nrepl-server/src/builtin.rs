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

//! A small Clojure-flavoured engine
//!
//! Enough of a language to drive the server end to end: integer arithmetic,
//! strings, `def`, `do`, `if`, `quote`, and namespace switching through `ns`
//! and `in-ns`. Vars are kept per namespace for the life of the engine and
//! are visible to every session.

use crate::eval::{
    Completion, Eldoc, EvalContext, EvalError, EvalOutput, Evaluator, Introspector, SymbolInfo,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::{Mutex, MutexGuard, PoisonError};

const CORE_NAMESPACE: &str = "clojure.core";

const SPECIAL_FORMS: &[&str] = &["def", "do", "if", "in-ns", "ns", "quote"];

/// Deepest form nesting the reader and the interpreter accept
const MAX_FORM_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Val {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    Keyword(String),
    List(Vec<Val>),
    Builtin(&'static str),
    Var { ns: String, name: String },
    Namespace(String),
}

impl Val {
    fn is_truthy(&self) -> bool {
        !matches!(self, Val::Nil | Val::Bool(false))
    }

    fn type_name(&self) -> &'static str {
        match self {
            Val::Nil => "nil",
            Val::Bool(_) => "java.lang.Boolean",
            Val::Int(_) => "java.lang.Long",
            Val::Str(_) => "java.lang.String",
            Val::Sym(_) => "clojure.lang.Symbol",
            Val::Keyword(_) => "clojure.lang.Keyword",
            Val::List(_) => "clojure.lang.PersistentList",
            Val::Builtin(_) => "clojure.lang.AFunction",
            Val::Var { .. } => "clojure.lang.Var",
            Val::Namespace(_) => "clojure.lang.Namespace",
        }
    }

    /// Text as `str` sees it: strings unquoted, nil empty
    fn to_plain(&self) -> String {
        match self {
            Val::Nil => String::new(),
            Val::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Nil => write!(f, "nil"),
            Val::Bool(b) => write!(f, "{}", b),
            Val::Int(i) => write!(f, "{}", i),
            Val::Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                write!(f, "\"")
            }
            Val::Sym(name) | Val::Keyword(name) => write!(f, "{}", name),
            Val::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Val::Builtin(name) => write!(f, "#function[{}/{}]", CORE_NAMESPACE, name),
            Val::Var { ns, name } => write!(f, "#'{}/{}", ns, name),
            Val::Namespace(name) => write!(f, "#namespace[{}]", name),
        }
    }
}

fn reader_error(message: impl Into<String>) -> EvalError {
    EvalError::new("ReaderException", message)
}

fn compiler_error(message: impl Into<String>) -> EvalError {
    EvalError::new("CompilerException", message)
}

fn arithmetic_error(message: impl Into<String>) -> EvalError {
    EvalError::new("ArithmeticException", message)
}

fn class_cast_error(value: &Val, target: &str) -> EvalError {
    EvalError::new(
        "ClassCastException",
        format!("{} cannot be cast to {}", value.type_name(), target),
    )
}

fn arity_error(count: usize, name: &str) -> EvalError {
    EvalError::new(
        "ArityException",
        format!(
            "Wrong number of args ({}) passed to: {}/{}",
            count, CORE_NAMESPACE, name
        ),
    )
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';' | ',' | '\'')
}

struct Reader<'a> {
    chars: Peekable<Chars<'a>>,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            depth: 0,
        }
    }

    fn read_all(mut self) -> Result<Vec<Val>, EvalError> {
        let mut forms = Vec::new();
        while let Some(form) = self.read_form()? {
            forms.push(form);
        }
        Ok(forms)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == ';' {
                while self.chars.next_if(|&c| c != '\n').is_some() {}
            } else if c.is_whitespace() || c == ',' {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    /// Next form, or `None` at end of input
    fn read_form(&mut self) -> Result<Option<Val>, EvalError> {
        self.skip_whitespace();
        let Some(c) = self.chars.next() else {
            return Ok(None);
        };

        let form = match c {
            '(' | '\'' => {
                if self.depth >= MAX_FORM_DEPTH {
                    return Err(reader_error(format!(
                        "Forms nested deeper than {} levels",
                        MAX_FORM_DEPTH
                    )));
                }
                self.depth += 1;
                let form = if c == '(' {
                    self.read_list()
                } else {
                    self.read_quoted()
                };
                self.depth -= 1;
                form?
            }
            ')' => return Err(reader_error("Unmatched delimiter: )")),
            '"' => self.read_string()?,
            c => self.read_atom(c)?,
        };
        Ok(Some(form))
    }

    fn read_quoted(&mut self) -> Result<Val, EvalError> {
        let quoted = self
            .read_form()?
            .ok_or_else(|| reader_error("EOF while reading"))?;
        Ok(Val::List(vec![Val::Sym("quote".to_string()), quoted]))
    }

    fn read_list(&mut self) -> Result<Val, EvalError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                None => return Err(reader_error("EOF while reading")),
                Some(')') => {
                    self.chars.next();
                    return Ok(Val::List(items));
                }
                Some(_) => {
                    if let Some(item) = self.read_form()? {
                        items.push(item);
                    }
                }
            }
        }
    }

    fn read_string(&mut self) -> Result<Val, EvalError> {
        let mut s = String::new();
        loop {
            match self.chars.next() {
                None => return Err(reader_error("EOF while reading string")),
                Some('"') => return Ok(Val::Str(s)),
                Some('\\') => match self.chars.next() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(c @ ('"' | '\\')) => s.push(c),
                    Some(c) => {
                        return Err(reader_error(format!("Unsupported escape character: \\{}", c)));
                    }
                    None => return Err(reader_error("EOF while reading string")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn read_atom(&mut self, first: char) -> Result<Val, EvalError> {
        let mut token = first.to_string();
        while let Some(c) = self.chars.next_if(|&c| !is_delimiter(c)) {
            token.push(c);
        }

        let digits = token.strip_prefix(['+', '-']).unwrap_or(&token);
        if digits.starts_with(|c: char| c.is_ascii_digit()) {
            return token
                .parse::<i64>()
                .map(Val::Int)
                .map_err(|_| EvalError::new("NumberFormatException", format!("Invalid number: {}", token)));
        }

        Ok(match token.as_str() {
            "nil" => Val::Nil,
            "true" => Val::Bool(true),
            "false" => Val::Bool(false),
            _ if token.starts_with(':') => Val::Keyword(token),
            _ => Val::Sym(token),
        })
    }
}

struct Builtin {
    name: &'static str,
    arglists: &'static [&'static [&'static str]],
    doc: &'static str,
    apply: fn(&[Val]) -> Result<Val, EvalError>,
}

impl Builtin {
    fn arglists_text(&self) -> String {
        let lists: Vec<String> = self
            .arglists
            .iter()
            .map(|args| format!("[{}]", args.join(" ")))
            .collect();
        format!("({})", lists.join(" "))
    }
}

const VARIADIC: &[&[&str]] = &[&[], &["x"], &["x", "y", "&", "more"]];
const COMPARISON: &[&[&str]] = &[&["x"], &["x", "y"], &["x", "y", "&", "more"]];

static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "+",
        arglists: VARIADIC,
        doc: "Returns the sum of nums. (+) returns 0.",
        apply: add,
    },
    Builtin {
        name: "-",
        arglists: &[&["x"], &["x", "y"], &["x", "y", "&", "more"]],
        doc: "If no ys are supplied, returns the negation of x, else subtracts the ys from x and returns the result.",
        apply: subtract,
    },
    Builtin {
        name: "*",
        arglists: VARIADIC,
        doc: "Returns the product of nums. (*) returns 1.",
        apply: multiply,
    },
    Builtin {
        name: "/",
        arglists: &[&["x"], &["x", "y"], &["x", "y", "&", "more"]],
        doc: "If no denominators are supplied, returns 1/numerator, else returns numerator divided by all of the denominators. Integer division truncates.",
        apply: divide,
    },
    Builtin {
        name: "inc",
        arglists: &[&["x"]],
        doc: "Returns a number one greater than num.",
        apply: inc,
    },
    Builtin {
        name: "dec",
        arglists: &[&["x"]],
        doc: "Returns a number one less than num.",
        apply: dec,
    },
    Builtin {
        name: "=",
        arglists: COMPARISON,
        doc: "Equality. Returns true if x equals y, false if not.",
        apply: equal,
    },
    Builtin {
        name: "<",
        arglists: COMPARISON,
        doc: "Returns non-nil if nums are in monotonically increasing order, otherwise false.",
        apply: less,
    },
    Builtin {
        name: ">",
        arglists: COMPARISON,
        doc: "Returns non-nil if nums are in monotonically decreasing order, otherwise false.",
        apply: greater,
    },
    Builtin {
        name: "str",
        arglists: &[&[], &["x"], &["x", "&", "ys"]],
        doc: "With no args, returns the empty string. With one arg x, returns x.toString(). (str nil) returns the empty string. With more than one arg, returns the concatenation of the str values of the args.",
        apply: str_concat,
    },
    Builtin {
        name: "list",
        arglists: &[&["&", "items"]],
        doc: "Creates a new list containing the items.",
        apply: list,
    },
];

fn builtin(name: &str) -> Option<&'static Builtin> {
    let name = name
        .strip_prefix(CORE_NAMESPACE)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(name);
    BUILTINS.iter().find(|b| b.name == name)
}

fn ints(args: &[Val]) -> Result<Vec<i64>, EvalError> {
    args.iter()
        .map(|arg| match arg {
            Val::Int(i) => Ok(*i),
            other => Err(class_cast_error(other, "java.lang.Number")),
        })
        .collect()
}

fn overflow() -> EvalError {
    arithmetic_error("integer overflow")
}

fn add(args: &[Val]) -> Result<Val, EvalError> {
    ints(args)?
        .into_iter()
        .try_fold(0i64, |acc, x| acc.checked_add(x).ok_or_else(overflow))
        .map(Val::Int)
}

fn subtract(args: &[Val]) -> Result<Val, EvalError> {
    let nums = ints(args)?;
    match nums.as_slice() {
        [] => Err(arity_error(0, "-")),
        [x] => x.checked_neg().map(Val::Int).ok_or_else(overflow),
        [first, rest @ ..] => rest
            .iter()
            .try_fold(*first, |acc, x| acc.checked_sub(*x).ok_or_else(overflow))
            .map(Val::Int),
    }
}

fn multiply(args: &[Val]) -> Result<Val, EvalError> {
    ints(args)?
        .into_iter()
        .try_fold(1i64, |acc, x| acc.checked_mul(x).ok_or_else(overflow))
        .map(Val::Int)
}

fn checked_div(x: i64, y: i64) -> Result<i64, EvalError> {
    if y == 0 {
        return Err(arithmetic_error("Divide by zero"));
    }
    x.checked_div(y).ok_or_else(overflow)
}

fn divide(args: &[Val]) -> Result<Val, EvalError> {
    let nums = ints(args)?;
    match nums.as_slice() {
        [] => Err(arity_error(0, "/")),
        [x] => checked_div(1, *x).map(Val::Int),
        [first, rest @ ..] => rest
            .iter()
            .try_fold(*first, |acc, x| checked_div(acc, *x))
            .map(Val::Int),
    }
}

fn single_int(args: &[Val], name: &str) -> Result<i64, EvalError> {
    match ints(args)?.as_slice() {
        [x] => Ok(*x),
        other => Err(arity_error(other.len(), name)),
    }
}

fn inc(args: &[Val]) -> Result<Val, EvalError> {
    single_int(args, "inc")?
        .checked_add(1)
        .map(Val::Int)
        .ok_or_else(overflow)
}

fn dec(args: &[Val]) -> Result<Val, EvalError> {
    single_int(args, "dec")?
        .checked_sub(1)
        .map(Val::Int)
        .ok_or_else(overflow)
}

fn equal(args: &[Val]) -> Result<Val, EvalError> {
    if args.is_empty() {
        return Err(arity_error(0, "="));
    }
    Ok(Val::Bool(args.windows(2).all(|pair| pair[0] == pair[1])))
}

fn monotonic(args: &[Val], name: &str, ordered: fn(i64, i64) -> bool) -> Result<Val, EvalError> {
    let nums = ints(args)?;
    if nums.is_empty() {
        return Err(arity_error(0, name));
    }
    Ok(Val::Bool(nums.windows(2).all(|pair| ordered(pair[0], pair[1]))))
}

fn less(args: &[Val]) -> Result<Val, EvalError> {
    monotonic(args, "<", |x, y| x < y)
}

fn greater(args: &[Val]) -> Result<Val, EvalError> {
    monotonic(args, ">", |x, y| x > y)
}

fn str_concat(args: &[Val]) -> Result<Val, EvalError> {
    Ok(Val::Str(args.iter().map(Val::to_plain).collect()))
}

fn list(args: &[Val]) -> Result<Val, EvalError> {
    Ok(Val::List(args.to_vec()))
}

type Namespaces = HashMap<String, BTreeMap<String, Val>>;

/// Evaluation state for one request
struct Interpreter<'a> {
    namespaces: &'a mut Namespaces,
    ns: String,
    depth: usize,
}

impl Interpreter<'_> {
    fn switch_namespace(&mut self, name: &str) {
        self.namespaces.entry(name.to_string()).or_default();
        self.ns = name.to_string();
    }

    fn resolve(&self, symbol: &str) -> Result<Val, EvalError> {
        let (ns, name) = match symbol.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => (ns, name),
            _ => (self.ns.as_str(), symbol),
        };

        if let Some(value) = self.namespaces.get(ns).and_then(|vars| vars.get(name)) {
            return Ok(value.clone());
        }
        if ns == self.ns || ns == CORE_NAMESPACE {
            if let Some(b) = builtin(name) {
                return Ok(Val::Builtin(b.name));
            }
        }
        Err(compiler_error(format!(
            "Unable to resolve symbol: {} in this context",
            symbol
        )))
    }

    fn eval(&mut self, form: &Val) -> Result<Val, EvalError> {
        match form {
            Val::Sym(symbol) => self.resolve(symbol),
            Val::List(items) if !items.is_empty() => {
                if self.depth >= MAX_FORM_DEPTH {
                    return Err(compiler_error(format!(
                        "Evaluation nested deeper than {} levels",
                        MAX_FORM_DEPTH
                    )));
                }
                self.depth += 1;
                let result = self.eval_list(items);
                self.depth -= 1;
                result
            }
            other => Ok(other.clone()),
        }
    }

    fn eval_list(&mut self, items: &[Val]) -> Result<Val, EvalError> {
        let args = &items[1..];
        if let Val::Sym(head) = &items[0] {
            match head.as_str() {
                "quote" => {
                    return match args {
                        [quoted] => Ok(quoted.clone()),
                        _ => Err(compiler_error("Wrong number of args passed to quote")),
                    };
                }
                "do" => {
                    let mut result = Val::Nil;
                    for form in args {
                        result = self.eval(form)?;
                    }
                    return Ok(result);
                }
                "if" => {
                    let (test, then, otherwise) = match args {
                        [test, then] => (test, then, None),
                        [test, then, otherwise] => (test, then, Some(otherwise)),
                        _ => return Err(compiler_error("Wrong number of args passed to if")),
                    };
                    return if self.eval(test)?.is_truthy() {
                        self.eval(then)
                    } else {
                        otherwise.map_or(Ok(Val::Nil), |form| self.eval(form))
                    };
                }
                "def" => {
                    let (name, init) = match args {
                        [Val::Sym(name), init] => (name, init),
                        [Val::Sym(_)] => return Err(compiler_error("def requires an init value")),
                        _ => return Err(compiler_error("First argument to def must be a Symbol")),
                    };
                    let value = self.eval(init)?;
                    self.namespaces
                        .entry(self.ns.clone())
                        .or_default()
                        .insert(name.clone(), value);
                    return Ok(Val::Var {
                        ns: self.ns.clone(),
                        name: name.clone(),
                    });
                }
                "ns" => {
                    return match args.first() {
                        Some(Val::Sym(name)) => {
                            self.switch_namespace(name);
                            Ok(Val::Nil)
                        }
                        _ => Err(compiler_error("ns requires a namespace symbol")),
                    };
                }
                "in-ns" => {
                    let target = match args {
                        [form] => self.eval(form)?,
                        _ => return Err(arity_error(args.len(), "in-ns")),
                    };
                    return match target {
                        Val::Sym(name) => {
                            self.switch_namespace(&name);
                            Ok(Val::Namespace(name))
                        }
                        other => Err(class_cast_error(&other, "clojure.lang.Symbol")),
                    };
                }
                _ => {}
            }
        }

        let function = self.eval(&items[0])?;
        let values = args
            .iter()
            .map(|form| self.eval(form))
            .collect::<Result<Vec<_>, _>>()?;

        match function {
            Val::Builtin(name) => match builtin(name) {
                Some(b) => (b.apply)(&values),
                None => Err(compiler_error(format!("Unknown function: {}", name))),
            },
            other => Err(class_cast_error(&other, "clojure.lang.IFn")),
        }
    }
}

/// In-process engine used by the `nrepl-server` binary
#[derive(Debug, Default)]
pub struct BuiltinEvaluator {
    namespaces: Mutex<Namespaces>,
}

impl BuiltinEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Namespaces> {
        self.namespaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn var_names(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .get(namespace)
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Evaluator for BuiltinEvaluator {
    fn eval(&self, code: &str, context: &EvalContext) -> Result<EvalOutput, EvalError> {
        let forms = Reader::new(code).read_all()?;

        let mut namespaces = self.lock();
        let mut interpreter = Interpreter {
            namespaces: &mut *namespaces,
            ns: String::new(),
            depth: 0,
        };
        interpreter.switch_namespace(context.namespace_or_default());

        let mut result = Val::Nil;
        for form in &forms {
            result = interpreter.eval(form)?;
        }

        Ok(EvalOutput {
            value: result.to_string(),
            ns: interpreter.ns,
        })
    }
}

impl Introspector for BuiltinEvaluator {
    fn complete(
        &self,
        prefix: &str,
        namespace: &str,
        _context: &EvalContext,
    ) -> Result<Vec<Completion>, EvalError> {
        let vars = self.var_names(namespace).into_iter().map(|name| Completion {
            candidate: name,
            kind: "var".to_string(),
            namespace: namespace.to_string(),
            doc: String::new(),
        });
        let functions = BUILTINS.iter().map(|b| Completion {
            candidate: b.name.to_string(),
            kind: "function".to_string(),
            namespace: CORE_NAMESPACE.to_string(),
            doc: b.doc.to_string(),
        });
        let specials = SPECIAL_FORMS.iter().map(|name| Completion {
            candidate: name.to_string(),
            kind: "special-form".to_string(),
            namespace: CORE_NAMESPACE.to_string(),
            doc: String::new(),
        });

        let mut completions: Vec<Completion> = vars
            .chain(functions)
            .chain(specials)
            .filter(|c| c.candidate.starts_with(prefix))
            .collect();
        // stable sort keeps the namespace's own var ahead of a core name it shadows
        completions.sort_by(|a, b| a.candidate.cmp(&b.candidate));
        completions.dedup_by(|a, b| a.candidate == b.candidate);
        Ok(completions)
    }

    fn info(
        &self,
        symbol: &str,
        namespace: &str,
        _context: &EvalContext,
    ) -> Result<Option<SymbolInfo>, EvalError> {
        if self.var_names(namespace).iter().any(|name| name == symbol) {
            return Ok(Some(SymbolInfo {
                namespace: Some(namespace.to_string()),
                name: Some(symbol.to_string()),
                ..SymbolInfo::default()
            }));
        }

        if let Some(b) = builtin(symbol) {
            return Ok(Some(SymbolInfo {
                namespace: Some(CORE_NAMESPACE.to_string()),
                name: Some(b.name.to_string()),
                arglists: Some(b.arglists_text()),
                doc: Some(b.doc.to_string()),
                ..SymbolInfo::default()
            }));
        }

        Ok(SPECIAL_FORMS
            .iter()
            .find(|name| **name == symbol)
            .map(|name| SymbolInfo {
                namespace: Some(CORE_NAMESPACE.to_string()),
                name: Some(name.to_string()),
                doc: Some("Special form".to_string()),
                ..SymbolInfo::default()
            }))
    }

    fn eldoc(
        &self,
        symbol: &str,
        _namespace: &str,
        _context: &EvalContext,
    ) -> Result<Option<Eldoc>, EvalError> {
        Ok(builtin(symbol).map(|b| Eldoc {
            arglists: b
                .arglists
                .iter()
                .map(|args| args.iter().map(|arg| arg.to_string()).collect())
                .collect(),
            kind: "function".to_string(),
            namespace: Some(CORE_NAMESPACE.to_string()),
            name: Some(b.name.to_string()),
            doc: Some(b.doc.to_string()),
        }))
    }
}
