#![forbid(unsafe_code)]

use miette::SourceSpan;

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

/// A fully parsed input: one or more compilation units, each a flat list of
/// declarations with their raw annotations still attached. The engine never
/// sees source text.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub units: Vec<Unit>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    pub name: String,
    pub decls: Vec<Decl>,
}

/// Opaque key/argument pair attached by the parser (`@pure`,
/// `@effects("network")`, `@requires(b != 0, "b must be non-zero")`, ...).
/// The engine interprets keys; the parser does not.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub span: Span,
    pub key: Ident,
    pub args: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decl {
    pub span: Span,
    pub name: Ident,
    pub annotations: Vec<Annotation>,
    pub kind: DeclKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeclKind {
    Var(VarDecl),
    Func(FuncDecl),
    Type(TypeDecl),
    Template(TemplateDecl),
    Instance(InstanceDecl),
    Typestate(TypestateDecl),
    Namespace(NamespaceDecl),
    Import(ImportDecl),
}

#[derive(Clone, Debug, PartialEq)]
pub struct VarDecl {
    pub mutable: bool,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FuncDecl {
    pub type_params: Vec<TypeParamDecl>,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub body: Option<Block>,
}

/// Named type declaration. `body` covers aliases and structural forms
/// (`type Percent = Int in 0..100`); `members` carries the methods of a
/// nominal type, which is what template instances and invariants attach to.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeDecl {
    pub type_params: Vec<TypeParamDecl>,
    pub body: Option<TypeExpr>,
    pub members: Vec<MemberDecl>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemberDecl {
    pub span: Span,
    pub name: Ident,
    pub annotations: Vec<Annotation>,
    /// Receiver taken mutably; such members are the mutation boundary for
    /// type invariants.
    pub mutates: bool,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub body: Option<Block>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeParamDecl {
    pub span: Span,
    pub name: Ident,
    pub bound: Option<TypeExpr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TemplateDecl {
    pub type_params: Vec<TypeParamDecl>,
    pub ops: Vec<TemplateOp>,
}

/// One required operation of a pattern template. A `default_body` makes the
/// operation inheritable by instances whose target does not override it.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateOp {
    pub span: Span,
    pub name: Ident,
    pub annotations: Vec<Annotation>,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub default_body: Option<Block>,
}

/// Binds a template to a target type declaration with concrete type
/// arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceDecl {
    pub template: Ident,
    pub args: Vec<TypeExpr>,
    pub target: Ident,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypestateDecl {
    pub states: Vec<StateDecl>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateDecl {
    pub span: Span,
    pub name: Ident,
    pub methods: Vec<StateMethod>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateMethod {
    pub span: Span,
    pub name: Ident,
    pub annotations: Vec<Annotation>,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    /// State the receiver transitions to; `None` stays in the current state.
    pub next: Option<Ident>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NamespaceDecl {
    pub decls: Vec<Decl>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImportDecl {
    pub path: Vec<Ident>,
    pub alias: Option<Ident>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeExpr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeExpr {
    pub span: Span,
    pub kind: TypeExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeExprKind {
    /// Possibly qualified name with type arguments (`Int`, `cache.Entry<K>`).
    Name {
        path: Vec<Ident>,
        args: Vec<TypeExpr>,
    },
    /// Numeric range refinement over a base (`Int in 0..100`).
    Range {
        base: Box<TypeExpr>,
        lo: Box<Expr>,
        hi: Box<Expr>,
    },
    /// Regex refinement over a base (`String matching "[a-z]+"`).
    Pattern {
        base: Box<TypeExpr>,
        pattern: Spanned<String>,
    },
    /// Enumerated-value refinement (`String oneOf "GET" | "POST"`).
    OneOf {
        base: Box<TypeExpr>,
        values: Vec<Expr>,
    },
    Array(Box<TypeExpr>),
    /// Length-indexed array; the length expression may be symbolic.
    DependentArray {
        elem: Box<TypeExpr>,
        len: Box<Expr>,
    },
    Map {
        key: Box<TypeExpr>,
        value: Box<TypeExpr>,
    },
    Tuple(Vec<TypeExpr>),
    Record(Vec<FieldDef>),
    Union(Vec<TypeExpr>),
    Intersection(Vec<TypeExpr>),
    Function {
        params: Vec<TypeExpr>,
        ret: Box<TypeExpr>,
        effects: Vec<Ident>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeExpr,
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub span: Span,
    pub stmts: Vec<Stmt>,
    pub tail: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Let(LetStmt),
    Assign(AssignStmt),
    If(IfStmt),
    While(WhileStmt),
    Return(ReturnStmt),
    Isolate(IsolateStmt),
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LetStmt {
    pub span: Span,
    pub name: Ident,
    pub mutable: bool,
    pub ty: Option<TypeExpr>,
    pub init: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignStmt {
    pub span: Span,
    pub target: Ident,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStmt {
    pub span: Span,
    pub cond: Expr,
    pub then_block: Block,
    pub else_block: Option<Block>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStmt {
    pub span: Span,
    pub cond: Expr,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStmt {
    pub span: Span,
    pub value: Option<Expr>,
}

/// Effect-isolation block: the interior may only perform operations whose
/// effect is within `effects`, independent of the enclosing declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct IsolateStmt {
    pub span: Span,
    pub effects: Vec<Ident>,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Ident(Ident),
    Int(i64),
    Float(f64),
    /// Exact scaled decimal: mantissa * 10^-scale.
    Decimal {
        mantissa: i128,
        scale: u32,
    },
    Bool(bool),
    Str(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Field {
        base: Box<Expr>,
        name: Ident,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        recv: Box<Expr>,
        method: Ident,
        args: Vec<Expr>,
    },
    RecordLit {
        name: Option<Ident>,
        fields: Vec<(Ident, Expr)>,
    },
    ArrayLit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    /// Explicit numeric conversion; Int/Float/Decimal never mix implicitly.
    Cast {
        expr: Box<Expr>,
        ty: TypeExpr,
    },
    /// Quantified property body: `forAll x: T where guard => body`.
    ForAll {
        binder: Ident,
        domain: TypeExpr,
        guard: Option<Box<Expr>>,
        body: Box<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,

    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    And,
    Or,
}

impl Expr {
    pub fn ident(span: Span, name: &str) -> Self {
        Expr {
            span,
            kind: ExprKind::Ident(Spanned::new(span, name.to_string())),
        }
    }

    pub fn int(span: Span, value: i64) -> Self {
        Expr {
            span,
            kind: ExprKind::Int(value),
        }
    }
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// Compact single-line rendering for diagnostics and guard messages.
pub fn render_expr(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Ident(id) => id.node.clone(),
        ExprKind::Int(n) => n.to_string(),
        ExprKind::Float(x) => x.to_string(),
        ExprKind::Decimal { mantissa, scale } => format!("{mantissa}e-{scale}"),
        ExprKind::Bool(b) => b.to_string(),
        ExprKind::Str(s) => format!("\"{s}\""),
        ExprKind::Unary { op, expr } => {
            let sym = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "!",
            };
            format!("{sym}{}", render_expr(expr))
        }
        ExprKind::Binary { left, op, right } => {
            format!("{} {} {}", render_expr(left), op.symbol(), render_expr(right))
        }
        ExprKind::Field { base, name } => format!("{}.{}", render_expr(base), name.node),
        ExprKind::Call { callee, args } => {
            let rendered: Vec<String> = args.iter().map(render_expr).collect();
            format!("{}({})", render_expr(callee), rendered.join(", "))
        }
        ExprKind::MethodCall { recv, method, args } => {
            let rendered: Vec<String> = args.iter().map(render_expr).collect();
            format!("{}.{}({})", render_expr(recv), method.node, rendered.join(", "))
        }
        ExprKind::RecordLit { name, fields } => {
            let rendered: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{}: {}", k.node, render_expr(v)))
                .collect();
            let head = name.as_ref().map(|n| n.node.as_str()).unwrap_or("");
            format!("{head}{{{}}}", rendered.join(", "))
        }
        ExprKind::ArrayLit(items) => {
            let rendered: Vec<String> = items.iter().map(render_expr).collect();
            format!("[{}]", rendered.join(", "))
        }
        ExprKind::TupleLit(items) => {
            let rendered: Vec<String> = items.iter().map(render_expr).collect();
            format!("({})", rendered.join(", "))
        }
        ExprKind::Cast { expr, .. } => format!("{} as _", render_expr(expr)),
        ExprKind::ForAll {
            binder,
            guard,
            body,
            ..
        } => {
            let guard = guard
                .as_ref()
                .map(|g| format!(" where {}", render_expr(g)))
                .unwrap_or_default();
            format!("forAll {}{guard} => {}", binder.node, render_expr(body))
        }
    }
}

/// Dotted rendering of a callee expression, used by diagnostics and by the
/// builtin-operation lookup (`net.fetch`, `fs.read`, ...).
pub fn callee_path(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(id) => Some(id.node.clone()),
        ExprKind::Field { base, name } => {
            callee_path(base).map(|b| format!("{}.{}", b, name.node))
        }
        _ => None,
    }
}
