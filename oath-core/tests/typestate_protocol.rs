/// Integration tests for typestate checking over the canonical
/// Disconnected/Connected protocol: legal narrowing, illegal calls, and
/// branch-merge behavior.
use oath_ast::{
    span, Block, Decl, DeclKind, Expr, ExprKind, FuncDecl, Ident, IfStmt, LetStmt, Param,
    Spanned, StateDecl, StateMethod, Stmt, TypeExpr, TypeExprKind, TypestateDecl, Unit,
};
use oath_core::{analyze_unit, EffectRegistry, EngineOptions, ErrorKind, GlobalIndex};

fn sp() -> oath_ast::Span {
    span(0, 0)
}

fn ident(name: &str) -> Ident {
    Spanned::new(sp(), name.to_string())
}

fn ty_path(path: &[&str]) -> TypeExpr {
    TypeExpr {
        span: sp(),
        kind: TypeExprKind::Name {
            path: path.iter().map(|s| ident(s)).collect(),
            args: Vec::new(),
        },
    }
}

fn method(name: &str, params: Vec<(&str, TypeExpr)>, next: Option<&str>) -> StateMethod {
    StateMethod {
        span: sp(),
        name: ident(name),
        annotations: Vec::new(),
        params: params
            .into_iter()
            .map(|(n, ty)| Param {
                span: sp(),
                name: ident(n),
                ty,
            })
            .collect(),
        ret: None,
        next: next.map(ident),
    }
}

/// `Connection` with `Disconnected { connect() -> Connected }` and
/// `Connected { send(String) -> Connected, disconnect() -> Disconnected }`.
fn connection() -> Decl {
    Decl {
        span: sp(),
        name: ident("Connection"),
        annotations: Vec::new(),
        kind: DeclKind::Typestate(TypestateDecl {
            states: vec![
                StateDecl {
                    span: sp(),
                    name: ident("Disconnected"),
                    methods: vec![method("connect", Vec::new(), Some("Connected"))],
                },
                StateDecl {
                    span: sp(),
                    name: ident("Connected"),
                    methods: vec![
                        method("send", vec![("data", ty_path(&["String"]))], Some("Connected")),
                        method("disconnect", Vec::new(), Some("Disconnected")),
                    ],
                },
            ],
        }),
    }
}

/// `open() -> Connection.Disconnected`, signature only.
fn open_ctor() -> Decl {
    Decl {
        span: sp(),
        name: ident("open"),
        annotations: Vec::new(),
        kind: DeclKind::Func(FuncDecl {
            type_params: Vec::new(),
            params: Vec::new(),
            ret: Some(ty_path(&["Connection", "Disconnected"])),
            body: None,
        }),
    }
}

fn driver(name: &str, params: Vec<(&str, TypeExpr)>, body: Block) -> Decl {
    Decl {
        span: sp(),
        name: ident(name),
        annotations: Vec::new(),
        kind: DeclKind::Func(FuncDecl {
            type_params: Vec::new(),
            params: params
                .into_iter()
                .map(|(n, ty)| Param {
                    span: sp(),
                    name: ident(n),
                    ty,
                })
                .collect(),
            ret: None,
            body: Some(body),
        }),
    }
}

fn block(stmts: Vec<Stmt>) -> Block {
    Block {
        span: sp(),
        stmts,
        tail: None,
    }
}

fn let_call(name: &str, callee: &str) -> Stmt {
    Stmt::Let(LetStmt {
        span: sp(),
        name: ident(name),
        mutable: false,
        ty: None,
        init: Expr {
            span: sp(),
            kind: ExprKind::Call {
                callee: Box::new(Expr::ident(sp(), callee)),
                args: Vec::new(),
            },
        },
    })
}

fn method_call(recv: &str, method: &str, args: Vec<Expr>) -> Stmt {
    Stmt::Expr(Expr {
        span: sp(),
        kind: ExprKind::MethodCall {
            recv: Box::new(Expr::ident(sp(), recv)),
            method: ident(method),
            args,
        },
    })
}

fn str_lit(s: &str) -> Expr {
    Expr {
        span: sp(),
        kind: ExprKind::Str(s.to_string()),
    }
}

fn analyze(u: &Unit) -> (oath_core::AnalyzedUnit, oath_core::DiagnosticSink) {
    analyze_unit(
        u,
        &GlobalIndex::new(),
        &EffectRegistry::default(),
        &EngineOptions::default(),
    )
}

fn error_kinds(sink: &oath_core::DiagnosticSink) -> Vec<ErrorKind> {
    sink.errors().map(|e| e.error.kind).collect()
}

#[test]
fn connect_then_send_narrows_to_connected() {
    let body = block(vec![
        let_call("c", "open"),
        method_call("c", "connect", Vec::new()),
        method_call("c", "send", vec![str_lit("ping")]),
    ]);
    let u = Unit {
        name: "m".to_string(),
        decls: vec![connection(), open_ctor(), driver("run", Vec::new(), body)],
    };
    let (_, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
}

#[test]
fn send_on_disconnected_is_an_invalid_transition() {
    let body = block(vec![
        let_call("c", "open"),
        method_call("c", "send", vec![str_lit("ping")]),
    ]);
    let u = Unit {
        name: "m".to_string(),
        decls: vec![connection(), open_ctor(), driver("run", Vec::new(), body)],
    };
    let (_, sink) = analyze(&u);
    assert_eq!(error_kinds(&sink), vec![ErrorKind::InvalidTransition]);
    let err = sink.errors().next().unwrap();
    assert!(err.error.message.contains("Disconnected"));
    assert!(err.error.message.contains("send"));
}

#[test]
fn state_typed_parameter_seeds_the_walk() {
    // send is available on a Connected-typed parameter without any prior
    // narrowing inside the body.
    let body = block(vec![method_call("c", "send", vec![str_lit("ping")])]);
    let u = Unit {
        name: "m".to_string(),
        decls: vec![
            connection(),
            driver(
                "push",
                vec![("c", ty_path(&["Connection", "Connected"]))],
                body,
            ),
        ],
    };
    let (_, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
}

#[test]
fn diverging_branches_poison_the_merge() {
    let body = block(vec![
        let_call("c", "open"),
        Stmt::If(IfStmt {
            span: sp(),
            cond: Expr::ident(sp(), "flag"),
            then_block: block(vec![method_call("c", "connect", Vec::new())]),
            else_block: None,
        }),
        method_call("c", "send", vec![str_lit("ping")]),
    ]);
    let u = Unit {
        name: "m".to_string(),
        decls: vec![
            connection(),
            open_ctor(),
            driver("run", vec![("flag", ty_path(&["Bool"]))], body),
        ],
    };
    let (_, sink) = analyze(&u);
    assert!(error_kinds(&sink).contains(&ErrorKind::InvalidTransition));
}

#[test]
fn converging_branches_are_fine() {
    let body = block(vec![
        let_call("c", "open"),
        Stmt::If(IfStmt {
            span: sp(),
            cond: Expr::ident(sp(), "flag"),
            then_block: block(vec![method_call("c", "connect", Vec::new())]),
            else_block: Some(block(vec![method_call("c", "connect", Vec::new())])),
        }),
        method_call("c", "send", vec![str_lit("ping")]),
    ]);
    let u = Unit {
        name: "m".to_string(),
        decls: vec![
            connection(),
            open_ctor(),
            driver("run", vec![("flag", ty_path(&["Bool"]))], body),
        ],
    };
    let (_, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
}

#[test]
fn returned_state_is_usable_as_its_own_binding() {
    let chain = Stmt::Let(LetStmt {
        span: sp(),
        name: ident("live"),
        mutable: false,
        ty: Some(ty_path(&["Connection", "Connected"])),
        init: Expr {
            span: sp(),
            kind: ExprKind::MethodCall {
                recv: Box::new(Expr::ident(sp(), "c")),
                method: ident("connect"),
                args: Vec::new(),
            },
        },
    });
    let body = block(vec![
        let_call("c", "open"),
        chain,
        method_call("live", "send", vec![str_lit("ping")]),
    ]);
    let u = Unit {
        name: "m".to_string(),
        decls: vec![connection(), open_ctor(), driver("run", Vec::new(), body)],
    };
    let (_, sink) = analyze(&u);
    assert!(!sink.has_errors(), "diagnostics: {:?}", sink.entries());
}

#[test]
fn using_a_returned_state_as_a_different_state_fails() {
    // connect() yields Connected; annotating the binding as Disconnected
    // must be rejected by the type stage.
    let wrong = Stmt::Let(LetStmt {
        span: sp(),
        name: ident("live"),
        mutable: false,
        ty: Some(ty_path(&["Connection", "Disconnected"])),
        init: Expr {
            span: sp(),
            kind: ExprKind::MethodCall {
                recv: Box::new(Expr::ident(sp(), "c")),
                method: ident("connect"),
                args: Vec::new(),
            },
        },
    });
    let body = block(vec![let_call("c", "open"), wrong]);
    let u = Unit {
        name: "m".to_string(),
        decls: vec![connection(), open_ctor(), driver("run", Vec::new(), body)],
    };
    let (_, sink) = analyze(&u);
    assert!(error_kinds(&sink).contains(&ErrorKind::TypeMismatch));
}
