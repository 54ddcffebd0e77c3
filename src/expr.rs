//! jq expressions over JSON documents
//!
//! [`Expr`] is the compiled form of a path, filter, value, label or transform
//! expression. It is validated once when configuration is loaded and then
//! evaluated any number of times, from any thread, against different
//! documents.
//!
//! The jq engine works on reference-counted values that cannot cross threads,
//! so every worker thread keeps its own compiled copy of each expression,
//! built on first use from the already validated source. Results are handed
//! out as plain [`serde_json::Value`]s.
//!
//! Evaluation is lazy: [`Expr::for_each`] pulls one result at a time and the
//! visitor decides whether to keep going. The deadline is checked before
//! every pull, so a runaway generator ends with [`EvalError::Timeout`].

use crate::error::{ConfigError, EvalError};
use jaq_interpret::error::Type;
use jaq_interpret::{Ctx, Filter, FilterT, ParseCtx, RcIter, Val};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

/// Source used when an expression is left empty.
pub const IDENTITY: &str = ".";

thread_local! {
    static FILTERS: RefCell<HashMap<Arc<str>, Rc<Filter>>> = RefCell::new(HashMap::new());
}

/// A validated jq expression.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Expr {
    code: Arc<str>,
}

impl Expr {
    /// Compile an expression; empty text is the identity `.`.
    pub fn compile(code: &str) -> Result<Self, ConfigError> {
        let code = if code.trim().is_empty() { IDENTITY } else { code };
        let filter = compile_filter(code).map_err(|reason| ConfigError::Expression {
            code: code.to_string(),
            reason,
        })?;

        let code: Arc<str> = Arc::from(code);
        FILTERS.with(|filters| {
            filters
                .borrow_mut()
                .insert(Arc::clone(&code), Rc::new(filter));
        });
        Ok(Self { code })
    }

    /// The identity expression `.`.
    pub fn identity() -> Self {
        Self {
            code: Arc::from(IDENTITY),
        }
    }

    /// Source text of the expression.
    pub fn as_str(&self) -> &str {
        &self.code
    }

    /// Evaluate against `input`, feeding every result to `visit` until the
    /// sequence is exhausted or `visit` breaks.
    pub fn for_each<F>(&self, input: &Value, deadline: Instant, mut visit: F)
    where
        F: FnMut(Result<Value, EvalError>) -> ControlFlow<()>,
    {
        let filter = match self.filter() {
            Ok(filter) => filter,
            Err(reason) => {
                let _ = visit(Err(EvalError::Failed(reason)));
                return;
            }
        };

        let inputs = RcIter::new(core::iter::empty());
        let mut results = filter.run((Ctx::new([], &inputs), Val::from(input.clone())));

        loop {
            if Instant::now() >= deadline {
                let _ = visit(Err(EvalError::Timeout));
                return;
            }
            let Some(item) = results.next() else {
                return;
            };
            // a single pull can run long, drop what arrives too late
            if Instant::now() >= deadline {
                let _ = visit(Err(EvalError::Timeout));
                return;
            }
            let item = item.map(Value::from).map_err(classify);
            if visit(item).is_break() {
                return;
            }
        }
    }

    /// First result only. `Ok(None)` when the expression yields nothing.
    pub fn first(&self, input: &Value, deadline: Instant) -> Result<Option<Value>, EvalError> {
        let mut first = Ok(None);
        self.for_each(input, deadline, |item| {
            first = item.map(Some);
            ControlFlow::Break(())
        });
        first
    }

    /// Every result, errors included, in the order the engine produced them.
    pub fn collect(&self, input: &Value, deadline: Instant) -> Vec<Result<Value, EvalError>> {
        let mut all = Vec::new();
        self.for_each(input, deadline, |item| {
            all.push(item);
            ControlFlow::Continue(())
        });
        all
    }

    fn filter(&self) -> Result<Rc<Filter>, String> {
        if let Some(filter) = FILTERS.with(|filters| filters.borrow().get(&*self.code).cloned()) {
            return Ok(filter);
        }

        let filter = Rc::new(compile_filter(&self.code)?);
        FILTERS.with(|filters| {
            filters
                .borrow_mut()
                .insert(Arc::clone(&self.code), Rc::clone(&filter));
        });
        Ok(filter)
    }
}

impl Default for Expr {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expr").field(&&*self.code).finish()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

fn compile_filter(code: &str) -> Result<Filter, String> {
    let mut defs = ParseCtx::new(Vec::new());
    defs.insert_natives(jaq_core::core());
    defs.insert_defs(jaq_std::std());

    let (main, errs) = jaq_parse::parse(code, jaq_parse::main());
    if let Some(err) = errs.first() {
        return Err(format!("jq query parse error {err:?}"));
    }
    let main = main.ok_or_else(|| "jq query parse error: empty program".to_string())?;

    let filter = defs.compile(main);
    if !defs.errs.is_empty() {
        return Err(format!(
            "jq query compile error: {} undefined symbol(s)",
            defs.errs.len()
        ));
    }
    Ok(filter)
}

/// Map engine errors onto [`EvalError`]. Iterating over null is what the
/// engine reports for `.missing[]`, which is how an absent path shows up.
/// Any other error on null is a real failure.
fn classify(err: jaq_interpret::Error) -> EvalError {
    match err {
        jaq_interpret::Error::Type(Val::Null, Type::Iter) => EvalError::NullIteration,
        other => EvalError::Failed(other.to_string()),
    }
}

/// Stringify a value for use as a label value.
///
/// Strings are used as is, null becomes `<nil>`, integral numbers print
/// without a fraction and everything else is JSON text. Floats switch to
/// exponent form (`1e+21`, `1e-05`) outside `1e-4 <= |f| < 1e21`.
pub fn label_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => crate::sanitize::NIL_TOKEN.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                n.to_string()
            } else {
                n.as_f64().map_or_else(|| n.to_string(), format_float)
            }
        }
        Some(other) => other.to_string(),
    }
}

fn format_float(f: f64) -> String {
    // shortest round-trip digits, e.g. "1.5e-7"
    let exp_form = format!("{f:e}");
    let Some((mantissa, exponent)) = exp_form.split_once('e') else {
        return f.to_string();
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return f.to_string();
    };
    if (-4..21).contains(&exponent) {
        f.to_string()
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}
