//! Tree-walking interpreter for workflow programs.
//!
//! Execution is cooperative: the wall-clock deadline is checked before every
//! statement and loop iteration, so a runaway workflow terminates with a
//! timeout instead of wedging its thread. The only handle into the kernel is
//! the bound `browser` API; there are no other globals beyond a small set of
//! pure builtins.

use super::api::BrowserApi;
use super::parser::{BinaryOp, BoolOpKind, Expr, Stmt, UnaryOp};
use crate::error::{KernelError, KernelResult};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Maximum number of elements `range()` will materialize.
const MAX_RANGE_LEN: i64 = 1_000_000;

/// A runtime value inside a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum WfValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<WfValue>),
    Dict(BTreeMap<String, WfValue>),
    /// Reference to a managed object, carried by id.
    Object(String),
    /// Handle to an open transaction, carried by tx id.
    Transaction(String),
    /// A dotted path into the bound API, e.g. `browser.Tab`.
    Api(String),
}

impl WfValue {
    pub fn truthy(&self) -> bool {
        match self {
            WfValue::None => false,
            WfValue::Bool(b) => *b,
            WfValue::Int(i) => *i != 0,
            WfValue::Float(f) => *f != 0.0,
            WfValue::Str(s) => !s.is_empty(),
            WfValue::List(items) => !items.is_empty(),
            WfValue::Dict(entries) => !entries.is_empty(),
            WfValue::Object(_) | WfValue::Transaction(_) | WfValue::Api(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WfValue::None => "None",
            WfValue::Bool(_) => "bool",
            WfValue::Int(_) => "int",
            WfValue::Float(_) => "float",
            WfValue::Str(_) => "str",
            WfValue::List(_) => "list",
            WfValue::Dict(_) => "dict",
            WfValue::Object(_) => "object",
            WfValue::Transaction(_) => "transaction",
            WfValue::Api(_) => "api",
        }
    }

    pub fn render(&self) -> String {
        match self {
            WfValue::None => "None".to_string(),
            WfValue::Bool(true) => "True".to_string(),
            WfValue::Bool(false) => "False".to_string(),
            WfValue::Int(i) => i.to_string(),
            WfValue::Float(f) => f.to_string(),
            WfValue::Str(s) => s.clone(),
            WfValue::List(items) => {
                let parts: Vec<String> = items.iter().map(WfValue::render).collect();
                format!("[{}]", parts.join(", "))
            }
            WfValue::Dict(entries) => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.render()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            WfValue::Object(id) => id.clone(),
            WfValue::Transaction(id) => id.clone(),
            WfValue::Api(path) => path.clone(),
        }
    }
}

/// Convert a workflow value to JSON for audit args and execution results.
pub fn to_json(value: &WfValue) -> JsonValue {
    match value {
        WfValue::None => JsonValue::Null,
        WfValue::Bool(b) => JsonValue::Bool(*b),
        WfValue::Int(i) => JsonValue::Number((*i).into()),
        WfValue::Float(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        WfValue::Str(s) => JsonValue::String(s.clone()),
        WfValue::List(items) => JsonValue::Array(items.iter().map(to_json).collect()),
        WfValue::Dict(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(k.clone(), to_json(v));
            }
            JsonValue::Object(map)
        }
        WfValue::Object(id) | WfValue::Transaction(id) => JsonValue::String(id.clone()),
        WfValue::Api(path) => JsonValue::String(path.clone()),
    }
}

/// Convert object data coming out of the kernel into workflow values.
pub fn from_json(value: &JsonValue) -> WfValue {
    match value {
        JsonValue::Null => WfValue::None,
        JsonValue::Bool(b) => WfValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                WfValue::Int(i)
            } else {
                WfValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => WfValue::Str(s.clone()),
        JsonValue::Array(items) => WfValue::List(items.iter().map(from_json).collect()),
        JsonValue::Object(map) => WfValue::Dict(
            map.iter()
                .map(|(k, v)| (k.clone(), from_json(v)))
                .collect(),
        ),
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(WfValue),
}

pub struct Interpreter<'a> {
    api: &'a BrowserApi,
    env: HashMap<String, WfValue>,
    deadline: Instant,
    timeout_secs: f64,
}

impl<'a> Interpreter<'a> {
    pub fn new(api: &'a BrowserApi, deadline: Instant, timeout_secs: f64) -> Self {
        let mut env = HashMap::new();
        env.insert("browser".to_string(), WfValue::Api("browser".to_string()));
        Self {
            api,
            env,
            deadline,
            timeout_secs,
        }
    }

    /// Run a program. The return value is an explicit top-level `return`,
    /// or the final value of a `__result__` binding if the workflow set one.
    pub fn run(&mut self, program: &[Stmt]) -> KernelResult<WfValue> {
        match self.exec_block(program)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(self
                .env
                .get("__result__")
                .cloned()
                .unwrap_or(WfValue::None)),
        }
    }

    fn check_deadline(&self) -> KernelResult<()> {
        if Instant::now() >= self.deadline {
            Err(KernelError::Timeout(self.timeout_secs))
        } else {
            Ok(())
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> KernelResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> KernelResult<Flow> {
        self.check_deadline()?;
        match stmt {
            // Imports survive validation only when they are not blocked,
            // which never happens; treat a slipped-through one as an error.
            Stmt::Import { module, .. } | Stmt::FromImport { module, .. } => Err(
                KernelError::Workflow(format!("module '{}' is not available", module)),
            ),
            Stmt::Assign { target, value, .. } => {
                let value = self.eval(value)?;
                self.env.insert(target.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::ExprStmt { expr, .. } => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                branches,
                else_body,
                ..
            } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(else_body)
            }
            Stmt::For {
                target, iter, body, ..
            } => {
                let items = match self.eval(iter)? {
                    WfValue::List(items) => items,
                    WfValue::Dict(entries) => {
                        entries.keys().map(|k| WfValue::Str(k.clone())).collect()
                    }
                    other => {
                        return Err(KernelError::Workflow(format!(
                            "cannot iterate over {}",
                            other.type_name()
                        )))
                    }
                };
                for item in items {
                    self.check_deadline()?;
                    self.env.insert(target.clone(), item);
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::While { cond, body, .. } => {
                while self.eval(cond)?.truthy() {
                    self.check_deadline()?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::With {
                expr,
                binding,
                body,
                ..
            } => self.exec_with(expr, binding.as_deref(), body),
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => WfValue::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Pass => Ok(Flow::Normal),
            Stmt::Break { .. } => Ok(Flow::Break),
            Stmt::Continue { .. } => Ok(Flow::Continue),
        }
    }

    /// `with` over a transaction handle gives the scoped guarantee: leaving
    /// the block without a commit aborts, and an error aborts before it
    /// propagates. Other values simply bind for the block.
    fn exec_with(
        &mut self,
        expr: &Expr,
        binding: Option<&str>,
        body: &[Stmt],
    ) -> KernelResult<Flow> {
        let value = self.eval(expr)?;
        if let Some(name) = binding {
            self.env.insert(name.to_string(), value.clone());
        }

        let tx_id = match &value {
            WfValue::Transaction(tx_id) => Some(tx_id.clone()),
            _ => None,
        };

        let result = self.exec_block(body);

        if let Some(tx_id) = tx_id {
            match &result {
                Ok(_) => {
                    if self.api.tx_is_active(&tx_id) {
                        self.api.tx_abort(&tx_id)?;
                    }
                }
                Err(_) => {
                    if self.api.tx_is_active(&tx_id) {
                        // Preserve the original error even if abort fails.
                        let _ = self.api.tx_abort(&tx_id);
                    }
                }
            }
        }
        result
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr) -> KernelResult<WfValue> {
        match expr {
            Expr::Str(s) => Ok(WfValue::Str(s.clone())),
            Expr::Int(i) => Ok(WfValue::Int(*i)),
            Expr::Float(f) => Ok(WfValue::Float(*f)),
            Expr::Bool(b) => Ok(WfValue::Bool(*b)),
            Expr::NoneLit => Ok(WfValue::None),
            Expr::Name(name) => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| KernelError::Workflow(format!("name '{}' is not defined", name))),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(WfValue::List(values))
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key_expr, value_expr) in entries {
                    let key = match self.eval(key_expr)? {
                        WfValue::Str(s) => s,
                        other => {
                            return Err(KernelError::Workflow(format!(
                                "dict keys must be strings, not {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, self.eval(value_expr)?);
                }
                Ok(WfValue::Dict(map))
            }
            Expr::Attr { object, name } => {
                let object = self.eval(object)?;
                self.eval_attr(object, name)
            }
            Expr::Subscript { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                self.eval_subscript(object, index)
            }
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs),
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(WfValue::Bool(!operand.truthy())),
                    UnaryOp::Neg => match operand {
                        WfValue::Int(i) => Ok(WfValue::Int(-i)),
                        WfValue::Float(f) => Ok(WfValue::Float(-f)),
                        other => Err(KernelError::Workflow(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.eval_binary(*op, left, right)
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left)?;
                match op {
                    BoolOpKind::And => {
                        if left.truthy() {
                            self.eval(right)
                        } else {
                            Ok(left)
                        }
                    }
                    BoolOpKind::Or => {
                        if left.truthy() {
                            Ok(left)
                        } else {
                            self.eval(right)
                        }
                    }
                }
            }
        }
    }

    fn eval_attr(&mut self, object: WfValue, name: &str) -> KernelResult<WfValue> {
        match object {
            // Crawling further into the API namespace; validity is decided
            // at call time.
            WfValue::Api(path) => Ok(WfValue::Api(format!("{}.{}", path, name))),
            WfValue::Object(id) => {
                if name == "id" {
                    return Ok(WfValue::Str(id));
                }
                let record = self.api.object_record(&id)?;
                match record.data.get(name) {
                    Some(value) => Ok(from_json(value)),
                    None => Err(KernelError::Workflow(format!(
                        "object {} has no attribute '{}'",
                        id, name
                    ))),
                }
            }
            WfValue::Transaction(tx_id) => {
                if name == "id" {
                    return Ok(WfValue::Str(tx_id));
                }
                Err(KernelError::Workflow(format!(
                    "transaction attribute '{}' must be called",
                    name
                )))
            }
            other => Err(KernelError::Workflow(format!(
                "{} has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }

    fn eval_subscript(&mut self, object: WfValue, index: WfValue) -> KernelResult<WfValue> {
        match (object, index) {
            (WfValue::List(items), WfValue::Int(i)) => {
                let len = items.len() as i64;
                let idx = if i < 0 { i + len } else { i };
                if idx < 0 || idx >= len {
                    return Err(KernelError::Workflow(format!(
                        "list index {} out of range",
                        i
                    )));
                }
                Ok(items[idx as usize].clone())
            }
            (WfValue::Dict(entries), WfValue::Str(key)) => entries
                .get(&key)
                .cloned()
                .ok_or_else(|| KernelError::Workflow(format!("key '{}' not found", key))),
            (WfValue::Str(s), WfValue::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let idx = if i < 0 { i + len } else { i };
                if idx < 0 || idx >= len {
                    return Err(KernelError::Workflow(format!(
                        "string index {} out of range",
                        i
                    )));
                }
                Ok(WfValue::Str(chars[idx as usize].to_string()))
            }
            (object, index) => Err(KernelError::Workflow(format!(
                "cannot index {} with {}",
                object.type_name(),
                index.type_name()
            ))),
        }
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        arg_exprs: &[Expr],
        kwarg_exprs: &[(String, Expr)],
    ) -> KernelResult<WfValue> {
        let mut args = Vec::with_capacity(arg_exprs.len());
        for arg in arg_exprs {
            args.push(self.eval(arg)?);
        }
        let mut kwargs = BTreeMap::new();
        for (name, expr) in kwarg_exprs {
            kwargs.insert(name.clone(), self.eval(expr)?);
        }

        // Builtins are bare names that are not shadowed by the environment.
        if let Expr::Name(name) = func {
            if !self.env.contains_key(name) {
                return self.call_builtin(name, args, kwargs);
            }
        }

        // Method call on a transaction handle.
        if let Expr::Attr { object, name } = func {
            let receiver = self.eval(object)?;
            if let WfValue::Transaction(tx_id) = receiver {
                return self.call_transaction_method(&tx_id, name, args);
            }
            let callee = self.eval_attr(receiver, name)?;
            return match callee {
                WfValue::Api(path) => self.api.call(&path, args, kwargs),
                other => Err(KernelError::Workflow(format!(
                    "{} is not callable",
                    other.type_name()
                ))),
            };
        }

        match self.eval(func)? {
            WfValue::Api(path) => self.api.call(&path, args, kwargs),
            other => Err(KernelError::Workflow(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_transaction_method(
        &mut self,
        tx_id: &str,
        method: &str,
        args: Vec<WfValue>,
    ) -> KernelResult<WfValue> {
        match method {
            "checkpoint" => {
                let name = match args.first() {
                    Some(WfValue::Str(name)) => name.clone(),
                    _ => {
                        return Err(KernelError::Workflow(
                            "checkpoint() takes a name string".into(),
                        ))
                    }
                };
                let cp_id = self.api.tx_checkpoint(tx_id, &name)?;
                Ok(WfValue::Str(cp_id))
            }
            "rollback" => {
                let name = match args.first() {
                    Some(WfValue::Str(name)) => name.clone(),
                    None => crate::transaction::INITIAL_CHECKPOINT.to_string(),
                    _ => {
                        return Err(KernelError::Workflow(
                            "rollback() takes a checkpoint name".into(),
                        ))
                    }
                };
                self.api.tx_rollback(tx_id, &name)?;
                Ok(WfValue::None)
            }
            "commit" => {
                self.api.tx_commit(tx_id)?;
                Ok(WfValue::None)
            }
            "abort" => {
                self.api.tx_abort(tx_id)?;
                Ok(WfValue::None)
            }
            other => Err(KernelError::Workflow(format!(
                "transaction has no method '{}'",
                other
            ))),
        }
    }

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<WfValue>,
        _kwargs: BTreeMap<String, WfValue>,
    ) -> KernelResult<WfValue> {
        match name {
            "print" => {
                let line = args
                    .iter()
                    .map(WfValue::render)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.api.workflow_print(&line);
                Ok(WfValue::None)
            }
            "len" => match args.first() {
                Some(WfValue::Str(s)) => Ok(WfValue::Int(s.chars().count() as i64)),
                Some(WfValue::List(items)) => Ok(WfValue::Int(items.len() as i64)),
                Some(WfValue::Dict(entries)) => Ok(WfValue::Int(entries.len() as i64)),
                other => Err(KernelError::Workflow(format!(
                    "len() does not accept {}",
                    other.map_or("nothing", |v| v.type_name())
                ))),
            },
            "str" => Ok(WfValue::Str(
                args.first().map(WfValue::render).unwrap_or_default(),
            )),
            "int" => match args.first() {
                Some(WfValue::Int(i)) => Ok(WfValue::Int(*i)),
                Some(WfValue::Float(f)) => Ok(WfValue::Int(*f as i64)),
                Some(WfValue::Bool(b)) => Ok(WfValue::Int(i64::from(*b))),
                Some(WfValue::Str(s)) => s
                    .trim()
                    .parse()
                    .map(WfValue::Int)
                    .map_err(|_| KernelError::Workflow(format!("invalid int literal: {}", s))),
                other => Err(KernelError::Workflow(format!(
                    "int() does not accept {}",
                    other.map_or("nothing", |v| v.type_name())
                ))),
            },
            "float" => match args.first() {
                Some(WfValue::Int(i)) => Ok(WfValue::Float(*i as f64)),
                Some(WfValue::Float(f)) => Ok(WfValue::Float(*f)),
                Some(WfValue::Str(s)) => s
                    .trim()
                    .parse()
                    .map(WfValue::Float)
                    .map_err(|_| KernelError::Workflow(format!("invalid float literal: {}", s))),
                other => Err(KernelError::Workflow(format!(
                    "float() does not accept {}",
                    other.map_or("nothing", |v| v.type_name())
                ))),
            },
            "bool" => Ok(WfValue::Bool(
                args.first().map(WfValue::truthy).unwrap_or(false),
            )),
            "list" => match args.into_iter().next() {
                None => Ok(WfValue::List(Vec::new())),
                Some(WfValue::List(items)) => Ok(WfValue::List(items)),
                Some(WfValue::Dict(entries)) => Ok(WfValue::List(
                    entries.keys().map(|k| WfValue::Str(k.clone())).collect(),
                )),
                Some(other) => Err(KernelError::Workflow(format!(
                    "list() does not accept {}",
                    other.type_name()
                ))),
            },
            "dict" => Ok(WfValue::Dict(BTreeMap::new())),
            "range" => {
                let (start, end, step) = match args.len() {
                    1 => (0, int_arg(&args[0], "range")?, 1),
                    2 => (int_arg(&args[0], "range")?, int_arg(&args[1], "range")?, 1),
                    3 => (
                        int_arg(&args[0], "range")?,
                        int_arg(&args[1], "range")?,
                        int_arg(&args[2], "range")?,
                    ),
                    n => {
                        return Err(KernelError::Workflow(format!(
                            "range() takes 1 to 3 arguments, got {}",
                            n
                        )))
                    }
                };
                if step == 0 {
                    return Err(KernelError::Workflow("range() step must not be zero".into()));
                }
                let span = if step > 0 {
                    (end - start).max(0)
                } else {
                    (start - end).max(0)
                };
                let count = (span + step.abs() - 1) / step.abs();
                if count > MAX_RANGE_LEN {
                    return Err(KernelError::Workflow(format!(
                        "range() of {} elements exceeds the limit of {}",
                        count, MAX_RANGE_LEN
                    )));
                }
                let mut items = Vec::with_capacity(count as usize);
                let mut v = start;
                while (step > 0 && v < end) || (step < 0 && v > end) {
                    items.push(WfValue::Int(v));
                    v += step;
                }
                Ok(WfValue::List(items))
            }
            "enumerate" => match args.into_iter().next() {
                Some(WfValue::List(items)) => Ok(WfValue::List(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| WfValue::List(vec![WfValue::Int(i as i64), item]))
                        .collect(),
                )),
                other => Err(KernelError::Workflow(format!(
                    "enumerate() does not accept {}",
                    other.map_or("nothing", |v| v.type_name())
                ))),
            },
            other => Err(KernelError::Workflow(format!(
                "name '{}' is not defined",
                other
            ))),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: WfValue, right: WfValue) -> KernelResult<WfValue> {
        use BinaryOp::*;
        match op {
            Eq => Ok(WfValue::Bool(left == right)),
            Ne => Ok(WfValue::Bool(left != right)),
            In | NotIn => {
                let contains = match (&left, &right) {
                    (item, WfValue::List(items)) => items.contains(item),
                    (WfValue::Str(key), WfValue::Dict(entries)) => entries.contains_key(key),
                    (WfValue::Str(needle), WfValue::Str(haystack)) => haystack.contains(needle),
                    (l, r) => {
                        return Err(KernelError::Workflow(format!(
                            "cannot test {} in {}",
                            l.type_name(),
                            r.type_name()
                        )))
                    }
                };
                Ok(WfValue::Bool(if op == In { contains } else { !contains }))
            }
            Lt | Le | Gt | Ge => {
                let ordering = match (&left, &right) {
                    (WfValue::Int(a), WfValue::Int(b)) => a.partial_cmp(b),
                    (WfValue::Str(a), WfValue::Str(b)) => a.partial_cmp(b),
                    (a, b) => numeric_pair(a, b).and_then(|(x, y)| x.partial_cmp(&y)),
                };
                let ordering = ordering.ok_or_else(|| {
                    KernelError::Workflow(format!(
                        "cannot compare {} and {}",
                        left.type_name(),
                        right.type_name()
                    ))
                })?;
                Ok(WfValue::Bool(match op {
                    Lt => ordering.is_lt(),
                    Le => ordering.is_le(),
                    Gt => ordering.is_gt(),
                    Ge => ordering.is_ge(),
                    _ => unreachable!(),
                }))
            }
            Add => match (left, right) {
                (WfValue::Str(a), WfValue::Str(b)) => Ok(WfValue::Str(a + &b)),
                (WfValue::List(mut a), WfValue::List(b)) => {
                    a.extend(b);
                    Ok(WfValue::List(a))
                }
                (WfValue::Int(a), WfValue::Int(b)) => Ok(WfValue::Int(a + b)),
                (a, b) => numeric_binop(&a, &b, "+", |x, y| x + y),
            },
            Sub => match (left, right) {
                (WfValue::Int(a), WfValue::Int(b)) => Ok(WfValue::Int(a - b)),
                (a, b) => numeric_binop(&a, &b, "-", |x, y| x - y),
            },
            Mul => match (left, right) {
                (WfValue::Int(a), WfValue::Int(b)) => Ok(WfValue::Int(a * b)),
                (a, b) => numeric_binop(&a, &b, "*", |x, y| x * y),
            },
            Div => {
                let (a, b) = numeric_pair(&left, &right).ok_or_else(|| {
                    KernelError::Workflow(format!(
                        "unsupported operands for /: {} and {}",
                        left.type_name(),
                        right.type_name()
                    ))
                })?;
                if b == 0.0 {
                    return Err(KernelError::Workflow("division by zero".into()));
                }
                Ok(WfValue::Float(a / b))
            }
            Mod => match (left, right) {
                (WfValue::Int(a), WfValue::Int(b)) => {
                    if b == 0 {
                        Err(KernelError::Workflow("division by zero".into()))
                    } else {
                        Ok(WfValue::Int(a.rem_euclid(b)))
                    }
                }
                (a, b) => Err(KernelError::Workflow(format!(
                    "unsupported operands for %: {} and {}",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }
}

fn int_arg(value: &WfValue, func: &str) -> KernelResult<i64> {
    match value {
        WfValue::Int(i) => Ok(*i),
        other => Err(KernelError::Workflow(format!(
            "{}() expects an int, got {}",
            func,
            other.type_name()
        ))),
    }
}

fn numeric_pair(a: &WfValue, b: &WfValue) -> Option<(f64, f64)> {
    let to_f = |v: &WfValue| match v {
        WfValue::Int(i) => Some(*i as f64),
        WfValue::Float(f) => Some(*f),
        _ => None,
    };
    Some((to_f(a)?, to_f(b)?))
}

fn numeric_binop(
    a: &WfValue,
    b: &WfValue,
    symbol: &str,
    f: impl Fn(f64, f64) -> f64,
) -> KernelResult<WfValue> {
    match numeric_pair(a, b) {
        Some((x, y)) => Ok(WfValue::Float(f(x, y))),
        None => Err(KernelError::Workflow(format!(
            "unsupported operands for {}: {} and {}",
            symbol,
            a.type_name(),
            b.type_name()
        ))),
    }
}
