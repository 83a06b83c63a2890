#![forbid(unsafe_code)]

use std::collections::HashMap;

use oath_ast::{Block, DeclKind, Expr, ExprKind, Span, Stmt};

use crate::error::{ErrorKind, SemanticError};
use crate::program::{DeclId, DeclTable};
use crate::symbols::{ScopeId, SymbolRef, SymbolTable};
use crate::types::Type;

/// Tracked state of one binding: which typestate interface it belongs to and
/// which state it is currently in. The state lives on the binding, not the
/// value; narrowing is a dataflow fact, not a type mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BindingState {
    interface: DeclId,
    state: String,
}

type Env = HashMap<String, BindingState>;

/// Flow-sensitive typestate checker. Walks each function body once,
/// narrowing tracked states along paths and intersecting them at merge
/// points; branches that leave a binding in different states are an error
/// unless they converge.
pub struct TypestateChecker<'a> {
    table: &'a DeclTable,
    symbols: &'a SymbolTable,
    errors: Vec<SemanticError>,
}

impl<'a> TypestateChecker<'a> {
    pub fn new(table: &'a DeclTable, symbols: &'a SymbolTable) -> Self {
        Self {
            table,
            symbols,
            errors: Vec::new(),
        }
    }

    pub fn check_unit(mut self) -> Vec<SemanticError> {
        for id in self.table.ids() {
            let entry = self.table.get(id);
            let DeclKind::Func(func) = &entry.ast.kind else {
                continue;
            };
            let Some(body) = &func.body else {
                continue;
            };

            let mut env: Env = HashMap::new();
            if let Type::Function { params, .. } = &entry.ty {
                for (p, ty) in func.params.iter().zip(params.iter()) {
                    if let Type::State {
                        interface, state, ..
                    } = ty
                    {
                        env.insert(
                            p.name.node.clone(),
                            BindingState {
                                interface: *interface,
                                state: state.clone(),
                            },
                        );
                    }
                }
            }
            let scope = entry.scope;
            self.walk_block(body, &mut env, scope);
        }
        self.errors
    }

    /// Walks a block; returns true when every path through it returns.
    fn walk_block(&mut self, block: &Block, env: &mut Env, scope: ScopeId) -> bool {
        let mut introduced: Vec<String> = Vec::new();
        let mut terminated = false;

        for stmt in &block.stmts {
            if terminated {
                break;
            }
            match stmt {
                Stmt::Let(l) => {
                    let state = self.walk_expr(&l.init, env, scope);
                    match state {
                        Some(s) => {
                            env.insert(l.name.node.clone(), s);
                            introduced.push(l.name.node.clone());
                        }
                        None => {
                            env.remove(&l.name.node);
                        }
                    }
                }
                Stmt::Assign(a) => {
                    let state = self.walk_expr(&a.expr, env, scope);
                    match state {
                        Some(s) => {
                            env.insert(a.target.node.clone(), s);
                        }
                        None => {
                            env.remove(&a.target.node);
                        }
                    }
                }
                Stmt::If(i) => {
                    self.walk_expr(&i.cond, env, scope);
                    let mut then_env = env.clone();
                    let then_done = self.walk_block(&i.then_block, &mut then_env, scope);
                    let mut else_env = env.clone();
                    let else_done = match &i.else_block {
                        Some(eb) => self.walk_block(eb, &mut else_env, scope),
                        None => false,
                    };
                    *env = self.merge(then_env, then_done, else_env, else_done, i.span);
                }
                Stmt::While(w) => {
                    self.walk_expr(&w.cond, env, scope);
                    let entry_env = env.clone();
                    let mut body_env = env.clone();
                    self.walk_block(&w.body, &mut body_env, scope);
                    // Back-edge: the loop body must leave every tracked
                    // binding in the state it entered with.
                    for (name, before) in &entry_env {
                        match body_env.get(name) {
                            Some(after) if after == before => {}
                            Some(after) => {
                                self.errors.push(SemanticError::new(
                                    ErrorKind::InvalidTransition,
                                    format!(
                                        "loop body leaves '{name}' in state '{}' but it entered in state '{}'",
                                        self.state_display(after),
                                        self.state_display(before)
                                    ),
                                    w.span,
                                ));
                                env.remove(name);
                            }
                            None => {
                                env.remove(name);
                            }
                        }
                    }
                }
                Stmt::Return(r) => {
                    if let Some(v) = &r.value {
                        self.walk_expr(v, env, scope);
                    }
                    terminated = true;
                }
                Stmt::Isolate(iso) => {
                    // Isolation bounds effects, not states; flow continues.
                    terminated = self.walk_block(&iso.body, env, scope) || terminated;
                }
                Stmt::Expr(e) => {
                    self.walk_expr(e, env, scope);
                }
            }
        }

        if let Some(tail) = &block.tail {
            if !terminated {
                self.walk_expr(tail, env, scope);
            }
        }

        for name in introduced {
            env.remove(&name);
        }
        terminated
    }

    /// Walks an expression, applying transitions, and returns the typestate
    /// the expression's value is in, if any.
    fn walk_expr(&mut self, expr: &Expr, env: &mut Env, scope: ScopeId) -> Option<BindingState> {
        match &expr.kind {
            ExprKind::Ident(id) => env.get(&id.node).cloned(),
            ExprKind::MethodCall { recv, method, args } => {
                for a in args {
                    self.walk_expr(a, env, scope);
                }
                if let ExprKind::Ident(recv_name) = &recv.kind {
                    if let Some(current) = env.get(&recv_name.node).cloned() {
                        return self.transition(
                            &recv_name.node,
                            &current,
                            &method.node,
                            method.span,
                            env,
                        );
                    }
                }
                self.walk_expr(recv, env, scope);
                None
            }
            ExprKind::Call { callee, args } => {
                for a in args {
                    self.walk_expr(a, env, scope);
                }
                // A constructor-like call: its declared return type may be a
                // state of a typestate interface.
                let path = oath_ast::callee_path(callee)?;
                let head = path.split('.').next()?;
                let resolved = self.symbols.resolve(head, scope).ok()?;
                if let SymbolRef::Local(id) = resolved {
                    if let Type::Function { ret, .. } = &self.table.get(id).ty {
                        if let Type::State {
                            interface, state, ..
                        } = ret.as_ref()
                        {
                            return Some(BindingState {
                                interface: *interface,
                                state: state.clone(),
                            });
                        }
                    }
                }
                None
            }
            ExprKind::Unary { expr, .. } | ExprKind::Cast { expr, .. } => {
                self.walk_expr(expr, env, scope);
                None
            }
            ExprKind::Binary { left, right, .. } => {
                self.walk_expr(left, env, scope);
                self.walk_expr(right, env, scope);
                None
            }
            ExprKind::Field { base, .. } => {
                self.walk_expr(base, env, scope);
                None
            }
            ExprKind::RecordLit { fields, .. } => {
                for (_, v) in fields {
                    self.walk_expr(v, env, scope);
                }
                None
            }
            ExprKind::ArrayLit(items) | ExprKind::TupleLit(items) => {
                for item in items {
                    self.walk_expr(item, env, scope);
                }
                None
            }
            ExprKind::ForAll { guard, body, .. } => {
                if let Some(g) = guard {
                    self.walk_expr(g, env, scope);
                }
                self.walk_expr(body, env, scope);
                None
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Decimal { .. }
            | ExprKind::Bool(_)
            | ExprKind::Str(_) => None,
        }
    }

    /// Applies one method call to a tracked binding: the method must exist in
    /// the current state, and the binding narrows to the declared return
    /// state (same state when unspecified).
    fn transition(
        &mut self,
        binding: &str,
        current: &BindingState,
        method: &str,
        span: Span,
        env: &mut Env,
    ) -> Option<BindingState> {
        let entry = self.table.get(current.interface);
        let DeclKind::Typestate(ts) = &entry.ast.kind else {
            return None;
        };
        let Some(state_decl) = ts.states.iter().find(|s| s.name.node == current.state) else {
            return None;
        };

        let Some(m) = state_decl.methods.iter().find(|m| m.name.node == method) else {
            let available: Vec<&str> = state_decl
                .methods
                .iter()
                .map(|m| m.name.node.as_str())
                .collect();
            self.errors.push(SemanticError::new(
                ErrorKind::InvalidTransition,
                format!(
                    "'{binding}' is in state '{}.{}', which has no method '{method}' (available: {})",
                    entry.name,
                    current.state,
                    available.join(", ")
                ),
                span,
            ));
            env.remove(binding);
            return None;
        };

        let next_state = m
            .next
            .as_ref()
            .map(|n| n.node.clone())
            .unwrap_or_else(|| current.state.clone());
        let next = BindingState {
            interface: current.interface,
            state: next_state,
        };
        env.insert(binding.to_string(), next.clone());
        Some(next)
    }

    /// Intersection of the two branch environments. Bindings left in
    /// different states by the branches are an error unless one branch never
    /// reaches the join.
    fn merge(
        &mut self,
        then_env: Env,
        then_done: bool,
        else_env: Env,
        else_done: bool,
        span: Span,
    ) -> Env {
        match (then_done, else_done) {
            (true, true) => return Env::new(),
            (true, false) => return else_env,
            (false, true) => return then_env,
            (false, false) => {}
        }

        let mut merged = Env::new();
        for (name, a) in &then_env {
            match else_env.get(name) {
                Some(b) if a == b => {
                    merged.insert(name.clone(), a.clone());
                }
                Some(b) => {
                    self.errors.push(SemanticError::new(
                        ErrorKind::InvalidTransition,
                        format!(
                            "'{name}' is in state '{}' after one branch but '{}' after the other",
                            self.state_display(a),
                            self.state_display(b)
                        ),
                        span,
                    ));
                }
                None => {}
            }
        }
        merged
    }

    fn state_display(&self, s: &BindingState) -> String {
        format!("{}.{}", self.table.get(s.interface).name, s.state)
    }
}
