/// End-to-end pipeline tests: serial ingestion of the global index,
/// parallel per-unit analysis, cross-unit effect propagation, and the
/// acceptance contract (rejected units produce no validated representation).
use oath_ast::{
    span, Annotation, Block, Decl, DeclKind, Expr, ExprKind, FuncDecl, Ident, ImportDecl,
    Program, Spanned, Stmt, TypeExpr, TypeExprKind, Unit, VarDecl,
};
use oath_core::{ErrorKind, Severity};
use oath_engine::Engine;

fn sp() -> oath_ast::Span {
    span(0, 0)
}

fn ident(name: &str) -> Ident {
    Spanned::new(sp(), name.to_string())
}

fn ty_name(name: &str) -> TypeExpr {
    TypeExpr {
        span: sp(),
        kind: TypeExprKind::Name {
            path: vec![ident(name)],
            args: Vec::new(),
        },
    }
}

fn str_lit(s: &str) -> Expr {
    Expr {
        span: sp(),
        kind: ExprKind::Str(s.to_string()),
    }
}

fn ann(key: &str, args: Vec<Expr>) -> Annotation {
    Annotation {
        span: sp(),
        key: ident(key),
        args,
    }
}

fn dotted_call(path: &[&str], args: Vec<Expr>) -> Expr {
    let mut callee = Expr::ident(sp(), path[0]);
    for seg in &path[1..] {
        callee = Expr {
            span: sp(),
            kind: ExprKind::Field {
                base: Box::new(callee),
                name: ident(seg),
            },
        };
    }
    Expr {
        span: sp(),
        kind: ExprKind::Call {
            callee: Box::new(callee),
            args,
        },
    }
}

fn func(name: &str, annotations: Vec<Annotation>, body: Option<Block>) -> Decl {
    Decl {
        span: sp(),
        name: ident(name),
        annotations,
        kind: DeclKind::Func(FuncDecl {
            type_params: Vec::new(),
            params: Vec::new(),
            ret: None,
            body,
        }),
    }
}

fn body_of(stmts: Vec<Stmt>) -> Block {
    Block {
        span: sp(),
        stmts,
        tail: None,
    }
}

fn import(path: &[&str]) -> Decl {
    Decl {
        span: sp(),
        name: ident(path.last().unwrap()),
        annotations: Vec::new(),
        kind: DeclKind::Import(ImportDecl {
            path: path.iter().map(|s| ident(s)).collect(),
            alias: None,
        }),
    }
}

/// `util.shout`: prints over the console effect.
fn util_unit(extra_annotations: Vec<Annotation>) -> Unit {
    let mut annotations = vec![ann("effects", vec![str_lit("console")])];
    annotations.extend(extra_annotations);
    Unit {
        name: "util".to_string(),
        decls: vec![func(
            "shout",
            annotations,
            Some(body_of(vec![Stmt::Expr(dotted_call(
                &["io", "println"],
                vec![str_lit("HEY")],
            ))])),
        )],
    }
}

fn app_unit(declares_console: bool) -> Unit {
    let annotations = if declares_console {
        vec![ann("effects", vec![str_lit("console")])]
    } else {
        Vec::new()
    };
    Unit {
        name: "app".to_string(),
        decls: vec![
            import(&["util", "shout"]),
            func(
                "main",
                annotations,
                Some(body_of(vec![Stmt::Expr(Expr {
                    span: sp(),
                    kind: ExprKind::Call {
                        callee: Box::new(Expr::ident(sp(), "shout")),
                        args: Vec::new(),
                    },
                })])),
            ),
        ],
    }
}

#[test]
fn cross_unit_effects_propagate_through_declared_sets() {
    let program = Program {
        units: vec![util_unit(Vec::new()), app_unit(false)],
    };
    let outcome = Engine::new().analyze(&program);

    assert!(outcome.units[0].accepted(), "util should pass");
    let app = &outcome.units[1];
    assert!(!app.accepted());
    assert!(app
        .diagnostics
        .iter()
        .any(|d| d.error.kind == ErrorKind::EffectViolation));
}

#[test]
fn declaring_the_propagated_effect_fixes_the_unit() {
    let program = Program {
        units: vec![util_unit(Vec::new()), app_unit(true)],
    };
    let outcome = Engine::new().analyze(&program);
    assert!(outcome.accepted(), "diagnostics: {:?}", outcome.errors().collect::<Vec<_>>());
}

#[test]
fn rejected_units_produce_no_validated_representation() {
    let bad = Unit {
        name: "bad".to_string(),
        decls: vec![Decl {
            span: sp(),
            name: ident("broken"),
            annotations: Vec::new(),
            kind: DeclKind::Var(VarDecl {
                mutable: false,
                ty: Some(ty_name("NoSuchType")),
                init: None,
            }),
        }],
    };
    let good = Unit {
        name: "good".to_string(),
        decls: vec![func("noop", Vec::new(), Some(body_of(Vec::new())))],
    };
    let program = Program {
        units: vec![bad, good],
    };
    let outcome = Engine::new().analyze(&program);

    assert!(!outcome.units[0].accepted());
    assert!(outcome.units[0].validated.is_none());
    assert!(!outcome.units[0].diagnostics.is_empty());

    // Units are independent: the broken neighbor doesn't poison this one.
    assert!(outcome.units[1].accepted());
    assert!(outcome.units[1].validated.is_some());
}

#[test]
fn warnings_never_block_acceptance() {
    let program = Program {
        units: vec![
            util_unit(vec![ann("deprecated", vec![str_lit("use whisper instead")])]),
            app_unit(true),
        ],
    };
    let outcome = Engine::new().analyze(&program);
    assert!(outcome.accepted());
    assert!(outcome
        .diagnostics()
        .any(|d| d.severity == Severity::Warning
            && d.error.kind == ErrorKind::DeprecatedAnnotation));
}

#[test]
fn outcomes_preserve_unit_order() {
    let units: Vec<Unit> = (0..8)
        .map(|i| Unit {
            name: format!("unit_{i}"),
            decls: vec![func("noop", Vec::new(), Some(body_of(Vec::new())))],
        })
        .collect();
    let program = Program { units };
    let outcome = Engine::new().analyze(&program);
    let names: Vec<&str> = outcome.units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(
        names,
        (0..8).map(|i| format!("unit_{i}")).collect::<Vec<_>>()
    );
}

#[test]
fn validated_units_carry_finalized_facts() {
    let program = Program {
        units: vec![util_unit(Vec::new())],
    };
    let outcome = Engine::new().analyze(&program);
    let validated = outcome.units[0].validated.as_ref().expect("accepted");
    let shout = validated
        .unit
        .table
        .iter()
        .find(|e| e.name == "shout")
        .expect("shout entry");
    assert!(shout.declared_effects.contains("console"));
    let observed = shout.observed_effects.as_ref().expect("observed set");
    assert!(observed.contains("console"));
    assert!(shout.ty.display().starts_with("fn()"));
}
